use std::sync::Arc;

use axum::extract::FromRef;
use common_audit::AuditSink;
use common_auth::JwtVerifier;

use crate::api_keys::ApiKeyService;
use crate::config::ServiceConfig;
use crate::metrics::AuthMetrics;
use crate::oauth::OAuthTokenService;
use crate::revocation::RevocationStore;
use crate::signing::SigningKeyManager;

#[derive(Clone)]
pub struct AppState {
    pub api_keys: Arc<ApiKeyService>,
    pub oauth: Arc<OAuthTokenService>,
    pub signing: Arc<SigningKeyManager>,
    pub verifier: Arc<JwtVerifier>,
    pub revocation: Arc<dyn RevocationStore>,
    pub audit: Arc<dyn AuditSink>,
    pub config: Arc<ServiceConfig>,
    pub metrics: Arc<AuthMetrics>,
}

impl FromRef<AppState> for Arc<JwtVerifier> {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

impl FromRef<AppState> for Arc<SigningKeyManager> {
    fn from_ref(state: &AppState) -> Self {
        state.signing.clone()
    }
}

impl FromRef<AppState> for Arc<ServiceConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}
