use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::{
    InMemoryApiKeyStore, InMemoryOAuth2ClientStore, InMemoryRefreshTokenStore,
    InMemorySigningKeyStore,
};
pub use postgres::{PgApiKeyStore, PgOAuth2ClientStore, PgRefreshTokenStore, PgSigningKeyStore};

/// Request-scoped tenancy context. Every tenant-scoped read or write takes
/// one; the store filters rows to this tenant.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub tenant_id: String,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("hash already exists")]
    DuplicateHash,
    #[error("key hash must be 64 lowercase hex characters")]
    InvalidHash,
    #[error("tenant identifier required")]
    TenantRequired,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::DuplicateHash
            }
            _ => StoreError::Unavailable(value.to_string()),
        }
    }
}

/// Persistent record of an API key. The plaintext never appears here; only
/// the 64-char SHA-256 hex digest is stored.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub id: String,
    pub key_hash: String,
    pub name: String,
    pub agent_id: String,
    pub tenant_id: String,
    pub scopes: Vec<String>,
    pub rate_limit_rps: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub metadata: Value,
}

impl ApiKeyRecord {
    /// Valid ⇔ not revoked ∧ (no expiry ∨ expiry in the future).
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApiKeyListFilter {
    pub agent_id: Option<String>,
    pub include_revoked: bool,
    /// Restrict to currently valid keys (not revoked, not expired).
    pub only_active: bool,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OAuth2ClientRecord {
    pub client_id: Uuid,
    pub secret_hash: String,
    pub name: String,
    pub tenant_id: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl OAuth2ClientRecord {
    /// Active ⇔ not revoked ∧ not expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map_or(true, |at| at > now)
    }
}

/// Signing-key lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Pending,
    Active,
    Expired,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Pending => "pending",
            KeyStatus::Active => "active",
            KeyStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> StoreResult<Self> {
        match value {
            "pending" => Ok(KeyStatus::Pending),
            "active" => Ok(KeyStatus::Active),
            "expired" => Ok(KeyStatus::Expired),
            other => Err(StoreError::Unavailable(format!(
                "unknown signing key status '{other}'"
            ))),
        }
    }
}

/// Signing-key record. The private half is sealed with the process DEK and
/// is never present in plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKeyRecord {
    pub kid: String,
    pub private_key_enc: String,
    pub public_key_pem: String,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: KeyStatus,
}

impl SigningKeyRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == KeyStatus::Active && self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshTokenRecord {
    pub jti: Uuid,
    pub subject_id: Uuid,
    pub tenant_id: String,
    pub token_hash: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn create(&self, ctx: &TenantContext, record: ApiKeyRecord)
        -> StoreResult<ApiKeyRecord>;
    /// Hash lookup is global: at validation time the tenant is not yet known;
    /// it comes from the record itself.
    async fn get_by_hash(&self, key_hash: &str) -> StoreResult<ApiKeyRecord>;
    async fn get_by_id(&self, ctx: &TenantContext, id: &str) -> StoreResult<ApiKeyRecord>;
    async fn list(
        &self,
        ctx: &TenantContext,
        filter: &ApiKeyListFilter,
    ) -> StoreResult<Vec<ApiKeyRecord>>;
    async fn revoke(&self, ctx: &TenantContext, id: &str) -> StoreResult<ApiKeyRecord>;
    /// Best-effort timestamp update; never part of the request critical path.
    async fn update_last_used(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    async fn delete(&self, ctx: &TenantContext, id: &str) -> StoreResult<()>;
    /// Remove revoked or expired records whose terminal timestamp is older
    /// than the cutoff. Returns the number removed.
    async fn sweep_expired(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait OAuth2ClientStore: Send + Sync {
    async fn create(
        &self,
        ctx: &TenantContext,
        record: OAuth2ClientRecord,
    ) -> StoreResult<OAuth2ClientRecord>;
    /// Token-endpoint lookup; tenant scope comes from the stored record.
    async fn get(&self, client_id: Uuid) -> StoreResult<OAuth2ClientRecord>;
    async fn revoke(&self, ctx: &TenantContext, client_id: Uuid) -> StoreResult<()>;
}

#[async_trait]
pub trait SigningKeyStore: Send + Sync {
    async fn insert(&self, record: SigningKeyRecord) -> StoreResult<SigningKeyRecord>;
    /// Blue-green rotation as one atomic step: persist `record` as active,
    /// and stamp `expires_at` on every other active key that has none.
    async fn rotate(
        &self,
        record: SigningKeyRecord,
        grace_expires_at: DateTime<Utc>,
    ) -> StoreResult<SigningKeyRecord>;
    async fn get(&self, kid: &str) -> StoreResult<SigningKeyRecord>;
    /// All non-expired active keys: the current signer plus any still in
    /// their grace period.
    async fn get_all_active(&self, now: DateTime<Utc>) -> StoreResult<Vec<SigningKeyRecord>>;
    /// Mark active keys whose grace has elapsed as expired; returns count.
    async fn expire_due(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn create(&self, record: RefreshTokenRecord) -> StoreResult<RefreshTokenRecord>;
    /// Single-use consumption: the matching row is removed in the same
    /// transaction that reads it. Expired rows consume to `NotFound`.
    async fn consume(&self, token_hash: &[u8]) -> StoreResult<RefreshTokenRecord>;
    async fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

pub(crate) fn validate_key_hash(key_hash: &str) -> StoreResult<()> {
    let well_formed = key_hash.len() == 64
        && key_hash
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
    if well_formed {
        Ok(())
    } else {
        Err(StoreError::InvalidHash)
    }
}

pub(crate) fn require_tenant(ctx: &TenantContext) -> StoreResult<()> {
    if ctx.tenant_id.trim().is_empty() {
        Err(StoreError::TenantRequired)
    } else {
        Ok(())
    }
}
