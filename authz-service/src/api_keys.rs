use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common_audit::{AuditEvent, AuditEventType, AuditResultKind, AuditSink};
use common_auth::{Principal, PrincipalType};
use common_crypto::{generate_api_key, sha256_hex, validate_api_key_format, KeyEnv};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::rate_limit::RateLimiterEngine;
use crate::store::{ApiKeyListFilter, ApiKeyRecord, ApiKeyStore, StoreError, TenantContext};

/// Bound on the detached last-used-at update so a slow store cannot keep the
/// task alive indefinitely.
const LAST_USED_DEADLINE: Duration = Duration::from_secs(5);

const MAX_RATE_LIMIT_RPS: i32 = 10_000;
const DEFAULT_RATE_LIMIT_RPS: i32 = 100;

/// Characters of the plaintext safe to retain for audit identification.
const CREDENTIAL_PREFIX_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum ApiKeyError {
    #[error("API key format not recognized")]
    InvalidFormat,
    #[error("invalid API key")]
    InvalidKey,
    #[error("API key has been revoked")]
    Revoked,
    #[error("API key has expired")]
    Expired,
    #[error("rate limit of {limit} requests per second exceeded")]
    RateLimited { limit: i32 },
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiKeyError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiKeyError::InvalidFormat | ApiKeyError::InvalidKey => "invalid_api_key",
            ApiKeyError::Revoked => "api_key_revoked",
            ApiKeyError::Expired => "api_key_expired",
            ApiKeyError::RateLimited { .. } => "rate_limit_exceeded",
            ApiKeyError::Validation(_) => "invalid_request",
            ApiKeyError::Store(StoreError::NotFound) => "not_found",
            ApiKeyError::Store(_) => "store_unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateApiKeyRequest {
    pub name: String,
    pub agent_id: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub rate_limit_rps: Option<i32>,
    pub metadata: Option<Value>,
}

/// Create/rotate response pairing the persisted record with the plaintext.
/// The plaintext exists only in this value and is surfaced exactly once.
#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub record: ApiKeyRecord,
    pub plaintext: String,
}

pub struct ApiKeyService {
    store: Arc<dyn ApiKeyStore>,
    limiter: Arc<dyn RateLimiterEngine>,
    audit: Arc<dyn AuditSink>,
    key_env: KeyEnv,
}

impl ApiKeyService {
    pub fn new(
        store: Arc<dyn ApiKeyStore>,
        limiter: Arc<dyn RateLimiterEngine>,
        audit: Arc<dyn AuditSink>,
        key_env: KeyEnv,
    ) -> Self {
        Self {
            store,
            limiter,
            audit,
            key_env,
        }
    }

    pub async fn create(
        &self,
        ctx: &TenantContext,
        request: CreateApiKeyRequest,
    ) -> Result<CreatedApiKey, ApiKeyError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(ApiKeyError::Validation("name is required".to_string()));
        }
        let agent_id = request.agent_id.trim();
        if agent_id.is_empty() {
            return Err(ApiKeyError::Validation("agent_id is required".to_string()));
        }
        let rate_limit_rps = match request.rate_limit_rps {
            None => DEFAULT_RATE_LIMIT_RPS,
            Some(value) if value > 0 && value <= MAX_RATE_LIMIT_RPS => value,
            Some(value) => {
                return Err(ApiKeyError::Validation(format!(
                    "rate_limit_rps must be between 1 and {MAX_RATE_LIMIT_RPS}, got {value}"
                )))
            }
        };

        let plaintext = generate_api_key(self.key_env);
        let record = ApiKeyRecord {
            id: format!("key_{}", Uuid::new_v4().simple()),
            key_hash: sha256_hex(&plaintext),
            name: name.to_string(),
            agent_id: agent_id.to_string(),
            tenant_id: ctx.tenant_id.clone(),
            scopes: request.scopes,
            rate_limit_rps,
            created_at: Utc::now(),
            expires_at: request.expires_at,
            last_used_at: None,
            revoked_at: None,
            metadata: request.metadata.unwrap_or_else(|| json!({})),
        };

        let record = self.store.create(ctx, record).await?;
        self.emit(
            AuditEvent::new(
                AuditEventType::CredentialCreated,
                &record.agent_id,
                &record.tenant_id,
                AuditResultKind::Success,
            )
            .with_credential_prefix(credential_prefix(&plaintext))
            .with_details(json!({ "key_id": record.id, "name": record.name })),
        )
        .await;

        Ok(CreatedApiKey { record, plaintext })
    }

    /// Validation pipeline: format check, hash lookup, constant-time hash
    /// recheck, revocation/expiry, rate limit, detached last-used update,
    /// Principal.
    pub async fn validate(&self, plaintext: &str) -> Result<Principal, ApiKeyError> {
        if !validate_api_key_format(plaintext) {
            return Err(ApiKeyError::InvalidFormat);
        }

        let key_hash = sha256_hex(plaintext);
        let record = match self.store.get_by_hash(&key_hash).await {
            Ok(record) => record,
            Err(StoreError::NotFound) => return Err(ApiKeyError::InvalidKey),
            Err(err) => return Err(ApiKeyError::Store(err)),
        };

        // The index already matched, but recompare the stored hash in
        // constant time so a poisoned index cannot authenticate.
        if !common_crypto::constant_time_eq(record.key_hash.as_bytes(), key_hash.as_bytes()) {
            return Err(ApiKeyError::InvalidKey);
        }

        let now = Utc::now();
        if record.revoked_at.is_some() {
            self.audit_validation_failure(&record, plaintext, "revoked")
                .await;
            return Err(ApiKeyError::Revoked);
        }
        if record.expires_at.map_or(false, |at| at <= now) {
            self.audit_validation_failure(&record, plaintext, "expired")
                .await;
            return Err(ApiKeyError::Expired);
        }

        match self
            .limiter
            .allow(&format!("apikey:{}", record.id), record.rate_limit_rps)
            .await
        {
            Ok(decision) if !decision.allowed => {
                self.emit(
                    AuditEvent::new(
                        AuditEventType::RateLimitExceeded,
                        &record.agent_id,
                        &record.tenant_id,
                        AuditResultKind::Failure,
                    )
                    .with_credential_prefix(credential_prefix(plaintext)),
                )
                .await;
                return Err(ApiKeyError::RateLimited {
                    limit: decision.limit,
                });
            }
            Ok(_) => {}
            Err(err) => {
                // Key validation fails open when the limiter is unreachable.
                warn!(error = %err, key_id = %record.id, "Rate limiter unavailable; admitting request");
            }
        }

        self.spawn_last_used_update(record.id.clone(), now);

        self.emit(
            AuditEvent::new(
                AuditEventType::CredentialValidated,
                &record.agent_id,
                &record.tenant_id,
                AuditResultKind::Success,
            )
            .with_credential_prefix(credential_prefix(plaintext)),
        )
        .await;

        Ok(principal_for(&record))
    }

    pub async fn get(&self, ctx: &TenantContext, id: &str) -> Result<ApiKeyRecord, ApiKeyError> {
        Ok(self.store.get_by_id(ctx, id).await?)
    }

    pub async fn list(
        &self,
        ctx: &TenantContext,
        filter: &ApiKeyListFilter,
    ) -> Result<Vec<ApiKeyRecord>, ApiKeyError> {
        Ok(self.store.list(ctx, filter).await?)
    }

    pub async fn revoke(
        &self,
        ctx: &TenantContext,
        id: &str,
    ) -> Result<ApiKeyRecord, ApiKeyError> {
        let record = self.store.revoke(ctx, id).await?;
        self.emit(
            AuditEvent::new(
                AuditEventType::CredentialRevoked,
                &record.agent_id,
                &record.tenant_id,
                AuditResultKind::Success,
            )
            .with_details(json!({ "key_id": record.id })),
        )
        .await;
        Ok(record)
    }

    pub async fn delete(&self, ctx: &TenantContext, id: &str) -> Result<(), ApiKeyError> {
        Ok(self.store.delete(ctx, id).await?)
    }

    /// Create-new-then-revoke-old. The replacement inherits name, agent,
    /// scopes, expiry, and rate limit, and records where it came from.
    pub async fn rotate(
        &self,
        ctx: &TenantContext,
        id: &str,
    ) -> Result<CreatedApiKey, ApiKeyError> {
        let old = self.store.get_by_id(ctx, id).await?;
        if old.revoked_at.is_some() {
            return Err(ApiKeyError::Revoked);
        }

        let mut metadata = match old.metadata.clone() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        metadata.insert("rotated_from".to_string(), Value::from(old.id.clone()));

        let created = self
            .create(
                ctx,
                CreateApiKeyRequest {
                    name: old.name.clone(),
                    agent_id: old.agent_id.clone(),
                    scopes: old.scopes.clone(),
                    expires_at: old.expires_at,
                    rate_limit_rps: Some(old.rate_limit_rps),
                    metadata: Some(Value::Object(metadata)),
                },
            )
            .await?;

        self.revoke(ctx, &old.id).await?;
        Ok(created)
    }

    pub async fn sweep_expired(&self, older_than: DateTime<Utc>) -> Result<u64, ApiKeyError> {
        Ok(self.store.sweep_expired(older_than).await?)
    }

    fn spawn_last_used_update(&self, id: String, at: DateTime<Utc>) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let update = store.update_last_used(&id, at);
            match tokio::time::timeout(LAST_USED_DEADLINE, update).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, key_id = %id, "last-used update failed"),
                Err(_) => warn!(key_id = %id, "last-used update timed out"),
            }
        });
    }

    async fn audit_validation_failure(&self, record: &ApiKeyRecord, plaintext: &str, why: &str) {
        self.emit(
            AuditEvent::new(
                AuditEventType::CredentialValidated,
                &record.agent_id,
                &record.tenant_id,
                AuditResultKind::Failure,
            )
            .with_credential_prefix(credential_prefix(plaintext))
            .with_error(why),
        )
        .await;
    }

    async fn emit(&self, event: AuditEvent) {
        // Audit is best-effort; a full queue must not fail authentication.
        let _ = self.audit.record(event).await;
    }
}

fn credential_prefix(plaintext: &str) -> String {
    plaintext.chars().take(CREDENTIAL_PREFIX_LEN).collect()
}

fn principal_for(record: &ApiKeyRecord) -> Principal {
    let mut attributes = Map::new();
    attributes.insert("auth_method".to_string(), Value::from("api_key"));
    attributes.insert("key_id".to_string(), Value::from(record.id.clone()));

    Principal {
        id: record.agent_id.clone(),
        principal_type: PrincipalType::Agent,
        tenant_id: record.tenant_id.clone(),
        roles: Vec::new(),
        scopes: record.scopes.clone(),
        attributes,
    }
}
