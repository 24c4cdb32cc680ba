use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::claims::Claims;
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};
use crate::jwks::JwksClient;
use crate::principal::Principal;

/// Thread-safe store for decoding keys loaded from local signing keys or PEM
/// sources. Written by the signing-key manager, read lock-free per request.
#[derive(Clone, Default)]
pub struct InMemoryKeyStore {
    inner: Arc<RwLock<HashMap<String, DecodingKey>>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_key(&self, kid: impl Into<String>, key: DecodingKey) {
        let mut guard = self.inner.write().expect("rwlock poisoned");
        guard.insert(kid.into(), key);
    }

    pub fn insert_rsa_pem(&self, kid: impl Into<String>, pem: &[u8]) -> AuthResult<()> {
        let kid = kid.into();
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|err| AuthError::KeyParse(kid.clone(), err.to_string()))?;
        self.insert_key(kid, key);
        Ok(())
    }

    pub fn get(&self, kid: &str) -> Option<DecodingKey> {
        let guard = self.inner.read().expect("rwlock poisoned");
        guard.get(kid).cloned()
    }

    pub fn contains(&self, kid: &str) -> bool {
        let guard = self.inner.read().expect("rwlock poisoned");
        guard.contains_key(kid)
    }

    pub fn replace_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, DecodingKey)>,
    {
        let mut guard = self.inner.write().expect("rwlock poisoned");
        guard.clear();
        for (kid, key) in entries.into_iter() {
            guard.insert(kid, key);
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct RevocationCheckError(pub String);

/// Seam to the jti blacklist. The concrete store lives with the cache layer;
/// the verifier only needs a yes/no answer.
#[async_trait]
pub trait RevocationCheck: Send + Sync {
    async fn is_revoked(&self, jti: &str) -> Result<bool, RevocationCheckError>;
}

/// Verified token: the claims plus the Principal derived from them.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub claims: Claims,
    pub principal: Principal,
}

#[derive(Clone)]
pub struct JwtVerifier {
    config: JwtConfig,
    store: InMemoryKeyStore,
    jwks: Option<JwksClient>,
    revocation: Option<Arc<dyn RevocationCheck>>,
}

impl JwtVerifier {
    pub fn new(config: JwtConfig) -> Self {
        Self {
            config,
            store: InMemoryKeyStore::new(),
            jwks: None,
            revocation: None,
        }
    }

    pub fn builder(config: JwtConfig) -> JwtVerifierBuilder {
        JwtVerifierBuilder::new(config)
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    pub fn store(&self) -> &InMemoryKeyStore {
        &self.store
    }

    pub fn jwks_client(&self) -> Option<&JwksClient> {
        self.jwks.as_ref()
    }

    /// Parse, resolve the key by kid, verify the RS256 signature, and check
    /// claims. Does not consult the revocation store; `validate` does.
    pub async fn verify(&self, token: &str) -> AuthResult<Claims> {
        let header =
            decode_header(token).map_err(|err| AuthError::InvalidHeader(err.to_string()))?;

        // Only RS256 is ever acceptable. `none` never parses into Algorithm,
        // and an HMAC alg against our RSA keys is an algorithm-confusion
        // attempt, not a configuration problem.
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }
        let kid = match header.kid {
            Some(kid) if !kid.is_empty() => kid,
            _ => return Err(AuthError::MissingKeyId),
        };

        let key = self.resolve_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.config.leeway_seconds.into();
        validation.validate_exp = self.config.validate_expiry;
        validation.validate_nbf = self.config.validate_not_before;
        if !self.config.validate_expiry {
            validation.set_required_spec_claims::<&str>(&[]);
        }
        if self.config.validate_issuer {
            validation.set_issuer(&[self.config.issuer.clone()]);
        }
        if self.config.validate_audience {
            validation.set_audience(&[self.config.audience.clone()]);
        } else {
            validation.validate_aud = false;
        }

        let token_data = decode::<Value>(token, &key, &validation)?;
        let claims = Claims::try_from(token_data.claims)?;

        if self.config.validate_issued_at {
            if let Some(iat) = claims.issued_at {
                let horizon = Utc::now() + Duration::seconds(self.config.leeway_seconds.into());
                if iat > horizon {
                    return Err(AuthError::InvalidClaim("iat", iat.to_rfc3339()));
                }
            }
        }
        if self.config.require_jti && claims.jti.as_deref().unwrap_or_default().is_empty() {
            return Err(AuthError::InvalidClaim("jti", "missing".to_string()));
        }

        debug!(kid, "verified JWT successfully");
        Ok(claims)
    }

    /// Full validation pipeline: signature and claims, revocation lookup,
    /// agent-status gate, Principal construction.
    pub async fn validate(&self, token: &str) -> AuthResult<VerifiedToken> {
        let claims = self.verify(token).await?;

        if let (Some(revocation), Some(jti)) = (&self.revocation, claims.jti.as_deref()) {
            if !jti.is_empty() {
                match revocation.is_revoked(jti).await {
                    Ok(true) => return Err(AuthError::Revoked),
                    Ok(false) => {}
                    Err(err) if self.config.revocation_fail_closed => {
                        return Err(AuthError::RevocationUnavailable(err.to_string()));
                    }
                    Err(err) => {
                        warn!(error = %err, "Revocation store unavailable; accepting token");
                    }
                }
            }
        }

        if self.config.check_agent_status {
            if let Some(status) = claims.agent_status.as_deref() {
                if status != "active" {
                    return Err(AuthError::AgentInactive(status.to_string()));
                }
            }
        }

        let principal = claims.to_principal();
        Ok(VerifiedToken { claims, principal })
    }

    async fn resolve_key(&self, kid: &str) -> AuthResult<DecodingKey> {
        if let Some(key) = self.store.get(kid) {
            return Ok(key);
        }
        if let Some(jwks) = &self.jwks {
            return jwks.get_key(kid).await;
        }
        Err(AuthError::UnknownKeyId(kid.to_string()))
    }
}

pub struct JwtVerifierBuilder {
    config: JwtConfig,
    store: InMemoryKeyStore,
    jwks: Option<JwksClient>,
    revocation: Option<Arc<dyn RevocationCheck>>,
}

impl JwtVerifierBuilder {
    fn new(config: JwtConfig) -> Self {
        Self {
            config,
            store: InMemoryKeyStore::new(),
            jwks: None,
            revocation: None,
        }
    }

    pub fn with_store(mut self, store: InMemoryKeyStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_decoding_key(self, kid: impl Into<String>, key: DecodingKey) -> Self {
        self.store.insert_key(kid, key);
        self
    }

    pub fn with_rsa_pem(self, kid: impl Into<String>, pem: &[u8]) -> AuthResult<Self> {
        self.store.insert_rsa_pem(kid, pem)?;
        Ok(self)
    }

    pub fn with_jwks_client(mut self, client: JwksClient) -> Self {
        self.jwks = Some(client);
        self
    }

    pub fn with_revocation(mut self, revocation: Arc<dyn RevocationCheck>) -> Self {
        self.revocation = Some(revocation);
        self
    }

    pub fn build(self) -> JwtVerifier {
        JwtVerifier {
            config: self.config,
            store: self.store,
            jwks: self.jwks,
            revocation: self.revocation,
        }
    }
}
