use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    require_tenant, validate_key_hash, ApiKeyListFilter, ApiKeyRecord, ApiKeyStore, KeyStatus,
    OAuth2ClientRecord, OAuth2ClientStore, RefreshTokenRecord, RefreshTokenStore,
    SigningKeyRecord, SigningKeyStore, StoreError, StoreResult, TenantContext,
};

/// In-memory stores backing the test suites. They honor the same contracts
/// as the Postgres implementations, including tenant filtering and hash
/// uniqueness.
#[derive(Default)]
pub struct InMemoryApiKeyStore {
    records: Mutex<HashMap<String, ApiKeyRecord>>,
}

impl InMemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApiKeyStore for InMemoryApiKeyStore {
    async fn create(
        &self,
        ctx: &TenantContext,
        record: ApiKeyRecord,
    ) -> StoreResult<ApiKeyRecord> {
        require_tenant(ctx)?;
        validate_key_hash(&record.key_hash)?;
        let mut guard = self.records.lock().expect("mutex poisoned");
        if guard
            .values()
            .any(|existing| existing.key_hash == record.key_hash)
        {
            return Err(StoreError::DuplicateHash);
        }
        guard.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_by_hash(&self, key_hash: &str) -> StoreResult<ApiKeyRecord> {
        let guard = self.records.lock().expect("mutex poisoned");
        guard
            .values()
            .find(|record| record.key_hash == key_hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_by_id(&self, ctx: &TenantContext, id: &str) -> StoreResult<ApiKeyRecord> {
        require_tenant(ctx)?;
        let guard = self.records.lock().expect("mutex poisoned");
        guard
            .get(id)
            .filter(|record| record.tenant_id == ctx.tenant_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list(
        &self,
        ctx: &TenantContext,
        filter: &ApiKeyListFilter,
    ) -> StoreResult<Vec<ApiKeyRecord>> {
        require_tenant(ctx)?;
        let now = Utc::now();
        let guard = self.records.lock().expect("mutex poisoned");
        let mut records: Vec<ApiKeyRecord> = guard
            .values()
            .filter(|record| record.tenant_id == ctx.tenant_id)
            .filter(|record| {
                filter
                    .agent_id
                    .as_deref()
                    .map_or(true, |agent| record.agent_id == agent)
            })
            .filter(|record| filter.include_revoked || record.revoked_at.is_none())
            .filter(|record| !filter.only_active || record.is_valid(now))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        // Offset first, then limit (matching the SQL implementation).
        let offset = usize::try_from(filter.offset.max(0)).unwrap_or(usize::MAX);
        let page: Vec<ApiKeyRecord> = records.into_iter().skip(offset).collect();
        if filter.limit > 0 {
            Ok(page.into_iter().take(filter.limit as usize).collect())
        } else {
            Ok(page)
        }
    }

    async fn revoke(&self, ctx: &TenantContext, id: &str) -> StoreResult<ApiKeyRecord> {
        require_tenant(ctx)?;
        let mut guard = self.records.lock().expect("mutex poisoned");
        let record = guard
            .get_mut(id)
            .filter(|record| record.tenant_id == ctx.tenant_id)
            .ok_or(StoreError::NotFound)?;
        if record.revoked_at.is_none() {
            record.revoked_at = Some(Utc::now());
        }
        Ok(record.clone())
    }

    async fn update_last_used(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut guard = self.records.lock().expect("mutex poisoned");
        if let Some(record) = guard.get_mut(id) {
            record.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn delete(&self, ctx: &TenantContext, id: &str) -> StoreResult<()> {
        require_tenant(ctx)?;
        let mut guard = self.records.lock().expect("mutex poisoned");
        let matches = guard
            .get(id)
            .map_or(false, |record| record.tenant_id == ctx.tenant_id);
        if !matches {
            return Err(StoreError::NotFound);
        }
        guard.remove(id);
        Ok(())
    }

    async fn sweep_expired(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut guard = self.records.lock().expect("mutex poisoned");
        let before = guard.len();
        guard.retain(|_, record| {
            let terminal = record
                .revoked_at
                .or(record.expires_at)
                .filter(|at| *at <= older_than);
            terminal.is_none()
        });
        Ok((before - guard.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryOAuth2ClientStore {
    records: Mutex<HashMap<Uuid, OAuth2ClientRecord>>,
}

impl InMemoryOAuth2ClientStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OAuth2ClientStore for InMemoryOAuth2ClientStore {
    async fn create(
        &self,
        ctx: &TenantContext,
        record: OAuth2ClientRecord,
    ) -> StoreResult<OAuth2ClientRecord> {
        require_tenant(ctx)?;
        let mut guard = self.records.lock().expect("mutex poisoned");
        guard.insert(record.client_id, record.clone());
        Ok(record)
    }

    async fn get(&self, client_id: Uuid) -> StoreResult<OAuth2ClientRecord> {
        let guard = self.records.lock().expect("mutex poisoned");
        guard.get(&client_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn revoke(&self, ctx: &TenantContext, client_id: Uuid) -> StoreResult<()> {
        require_tenant(ctx)?;
        let mut guard = self.records.lock().expect("mutex poisoned");
        let record = guard
            .get_mut(&client_id)
            .filter(|record| record.tenant_id == ctx.tenant_id)
            .ok_or(StoreError::NotFound)?;
        if record.revoked_at.is_none() {
            record.revoked_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySigningKeyStore {
    records: Mutex<HashMap<String, SigningKeyRecord>>,
}

impl InMemorySigningKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SigningKeyStore for InMemorySigningKeyStore {
    async fn insert(&self, record: SigningKeyRecord) -> StoreResult<SigningKeyRecord> {
        let mut guard = self.records.lock().expect("mutex poisoned");
        guard.insert(record.kid.clone(), record.clone());
        Ok(record)
    }

    async fn rotate(
        &self,
        mut record: SigningKeyRecord,
        grace_expires_at: DateTime<Utc>,
    ) -> StoreResult<SigningKeyRecord> {
        let mut guard = self.records.lock().expect("mutex poisoned");
        for existing in guard.values_mut() {
            if existing.status == KeyStatus::Active && existing.expires_at.is_none() {
                existing.expires_at = Some(grace_expires_at);
            }
        }
        record.status = KeyStatus::Active;
        if record.activated_at.is_none() {
            record.activated_at = Some(Utc::now());
        }
        guard.insert(record.kid.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, kid: &str) -> StoreResult<SigningKeyRecord> {
        let guard = self.records.lock().expect("mutex poisoned");
        guard.get(kid).cloned().ok_or(StoreError::NotFound)
    }

    async fn get_all_active(&self, now: DateTime<Utc>) -> StoreResult<Vec<SigningKeyRecord>> {
        let guard = self.records.lock().expect("mutex poisoned");
        let mut keys: Vec<SigningKeyRecord> = guard
            .values()
            .filter(|record| record.is_active(now))
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.activated_at.cmp(&a.activated_at));
        Ok(keys)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut guard = self.records.lock().expect("mutex poisoned");
        let mut expired = 0;
        for record in guard.values_mut() {
            if record.status == KeyStatus::Active
                && record.expires_at.map_or(false, |at| at <= now)
            {
                record.status = KeyStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    records: Mutex<HashMap<Uuid, RefreshTokenRecord>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn create(&self, record: RefreshTokenRecord) -> StoreResult<RefreshTokenRecord> {
        let mut guard = self.records.lock().expect("mutex poisoned");
        guard.insert(record.jti, record.clone());
        Ok(record)
    }

    async fn consume(&self, token_hash: &[u8]) -> StoreResult<RefreshTokenRecord> {
        let mut guard = self.records.lock().expect("mutex poisoned");
        let jti = guard
            .values()
            .find(|record| record.token_hash == token_hash)
            .map(|record| record.jti)
            .ok_or(StoreError::NotFound)?;
        let record = guard.remove(&jti).ok_or(StoreError::NotFound)?;
        if record.expires_at <= Utc::now() {
            return Err(StoreError::NotFound);
        }
        Ok(record)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut guard = self.records.lock().expect("mutex poisoned");
        let before = guard.len();
        guard.retain(|_, record| record.expires_at > now);
        Ok((before - guard.len()) as u64)
    }
}
