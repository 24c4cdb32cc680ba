#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use chrono::{Duration, Utc};
use common_audit::{AuditSink, MemoryAuditSink};
use common_auth::{JwtConfig, JwtVerifier};
use common_crypto::{DataEncryptionKey, KeyEnv};
use jsonwebtoken::{encode, Algorithm, Header};
use serde_json::json;
use uuid::Uuid;

use authz_service::api_keys::ApiKeyService;
use authz_service::config::ServiceConfig;
use authz_service::metrics::AuthMetrics;
use authz_service::oauth::{hash_client_secret, OAuthConfig, OAuthTokenService};
use authz_service::rate_limit::{InMemoryRateLimiter, RateLimiterEngine};
use authz_service::revocation::{InMemoryRevocationStore, RevocationBridge, RevocationStore};
use authz_service::signing::SigningKeyManager;
use authz_service::store::{
    InMemoryApiKeyStore, InMemoryOAuth2ClientStore, InMemorySigningKeyStore, OAuth2ClientRecord,
    OAuth2ClientStore, TenantContext,
};
use authz_service::{build_router, AppState};

pub const ISSUER: &str = "authz-core";
pub const AUDIENCE: &str = "platform";
pub const TENANT: &str = "tenant-1";

pub struct HarnessOptions {
    pub grace: Duration,
    pub rate_limit_per_client: i32,
    pub limiter: Option<Arc<dyn RateLimiterEngine>>,
    pub optional_auth: bool,
    pub revocation_fail_closed: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            grace: Duration::days(30),
            rate_limit_per_client: 10,
            limiter: None,
            optional_auth: false,
            revocation_fail_closed: false,
        }
    }
}

pub struct Harness {
    pub state: AppState,
    pub app: Router,
    pub clients: Arc<InMemoryOAuth2ClientStore>,
    pub revocation: Arc<InMemoryRevocationStore>,
    pub audit: MemoryAuditSink,
    pub signing: Arc<SigningKeyManager>,
}

pub async fn harness() -> Harness {
    harness_with(HarnessOptions::default()).await
}

/// Full service wired over in-memory stores: the same composition as main,
/// minus Postgres and Redis.
pub async fn harness_with(options: HarnessOptions) -> Harness {
    let limiter: Arc<dyn RateLimiterEngine> = options
        .limiter
        .unwrap_or_else(|| Arc::new(InMemoryRateLimiter::new()));
    let revocation = Arc::new(InMemoryRevocationStore::new());
    let audit = MemoryAuditSink::new();
    let clients = Arc::new(InMemoryOAuth2ClientStore::new());

    let signing = Arc::new(SigningKeyManager::new(
        Arc::new(InMemorySigningKeyStore::new()),
        DataEncryptionKey::generate(),
        options.grace,
    ));
    signing.ensure_active().await.expect("initial signing key");

    let jwt_config = JwtConfig::new(ISSUER, AUDIENCE)
        .with_revocation_fail_closed(options.revocation_fail_closed);
    let revocation_store: Arc<dyn RevocationStore> = revocation.clone();
    let verifier = Arc::new(
        JwtVerifier::builder(jwt_config)
            .with_store(signing.verification_store())
            .with_revocation(Arc::new(RevocationBridge(revocation_store.clone())))
            .build(),
    );

    let audit_sink: Arc<dyn AuditSink> = Arc::new(audit.clone());
    let api_keys = Arc::new(ApiKeyService::new(
        Arc::new(InMemoryApiKeyStore::new()),
        limiter.clone(),
        audit_sink.clone(),
        KeyEnv::Test,
    ));

    let oauth = Arc::new(OAuthTokenService::new(
        clients.clone(),
        limiter,
        signing.clone(),
        audit_sink.clone(),
        OAuthConfig {
            issuer: ISSUER.to_string(),
            audience: AUDIENCE.to_string(),
            token_ttl_seconds: 900,
            rate_limit_per_client: options.rate_limit_per_client,
        },
    ));

    let config = Arc::new(ServiceConfig {
        issuer: ISSUER.to_string(),
        audience: AUDIENCE.to_string(),
        token_ttl_seconds: 900,
        rate_limit_per_client: options.rate_limit_per_client,
        grace_days: 30,
        key_env: KeyEnv::Test,
        optional_auth: options.optional_auth,
        revocation_fail_closed: options.revocation_fail_closed,
        jwks_url: None,
        jwks_ttl_seconds: 300,
        audit_queue_capacity: 64,
        sweep_interval_seconds: 3600,
    });

    let state = AppState {
        api_keys,
        oauth,
        signing: signing.clone(),
        verifier,
        revocation: revocation_store,
        audit: audit_sink,
        config,
        metrics: Arc::new(AuthMetrics::new().expect("metrics")),
    };

    Harness {
        app: build_router(state.clone()),
        state,
        clients,
        revocation,
        audit,
        signing,
    }
}

/// Sign a bearer token with the harness's current signing key.
pub async fn mint_token(harness: &Harness, roles: &[&str], tenant: &str) -> String {
    let (_, signer) = harness.signing.get_active().await.expect("active signer");
    let now = Utc::now().timestamp();
    let claims = json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "sub": "user-ops",
        "tenant_id": tenant,
        "roles": roles,
        "iat": now,
        "nbf": now,
        "exp": now + 600,
        "jti": Uuid::new_v4().to_string(),
        "type": "user",
    });

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(signer.kid.clone());
    encode(&header, &claims, &signer.encoding_key).expect("sign test token")
}

pub async fn operator_token(harness: &Harness) -> String {
    mint_token(harness, &["operator"], TENANT).await
}

/// Provision an OAuth2 client; returns (client_id, plaintext secret).
pub async fn seed_client(harness: &Harness, scopes: &[&str]) -> (Uuid, String) {
    let secret = format!("secret-{}", Uuid::new_v4().simple());
    let record = OAuth2ClientRecord {
        client_id: Uuid::new_v4(),
        secret_hash: hash_client_secret(&secret).expect("hash secret"),
        name: "test-client".to_string(),
        tenant_id: TENANT.to_string(),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        created_at: Utc::now(),
        expires_at: None,
        revoked_at: None,
    };
    let ctx = TenantContext::new(TENANT);
    let created = harness
        .clients
        .create(&ctx, record)
        .await
        .expect("create client");
    (created.client_id, secret)
}
