use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{
    require_tenant, validate_key_hash, ApiKeyListFilter, ApiKeyRecord, ApiKeyStore, KeyStatus,
    OAuth2ClientRecord, OAuth2ClientStore, RefreshTokenRecord, RefreshTokenStore,
    SigningKeyRecord, SigningKeyStore, StoreError, StoreResult, TenantContext,
};

const API_KEY_COLUMNS: &str = "id, key_hash, name, agent_id, tenant_id, scopes, rate_limit_rps, \
                               created_at, expires_at, last_used_at, revoked_at, metadata";

#[derive(Clone)]
pub struct PgApiKeyStore {
    pool: PgPool,
}

impl PgApiKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyStore for PgApiKeyStore {
    async fn create(
        &self,
        ctx: &TenantContext,
        record: ApiKeyRecord,
    ) -> StoreResult<ApiKeyRecord> {
        require_tenant(ctx)?;
        validate_key_hash(&record.key_hash)?;

        let created = sqlx::query_as::<_, ApiKeyRecord>(&format!(
            "INSERT INTO api_keys ({API_KEY_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             RETURNING {API_KEY_COLUMNS}"
        ))
        .bind(&record.id)
        .bind(&record.key_hash)
        .bind(&record.name)
        .bind(&record.agent_id)
        .bind(&ctx.tenant_id)
        .bind(&record.scopes)
        .bind(record.rate_limit_rps)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.last_used_at)
        .bind(record.revoked_at)
        .bind(&record.metadata)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn get_by_hash(&self, key_hash: &str) -> StoreResult<ApiKeyRecord> {
        sqlx::query_as::<_, ApiKeyRecord>(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_hash = $1"
        ))
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn get_by_id(&self, ctx: &TenantContext, id: &str) -> StoreResult<ApiKeyRecord> {
        require_tenant(ctx)?;
        sqlx::query_as::<_, ApiKeyRecord>(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(id)
        .bind(&ctx.tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn list(
        &self,
        ctx: &TenantContext,
        filter: &ApiKeyListFilter,
    ) -> StoreResult<Vec<ApiKeyRecord>> {
        require_tenant(ctx)?;

        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE tenant_id = "
        ));
        query.push_bind(&ctx.tenant_id);
        if let Some(agent_id) = &filter.agent_id {
            query.push(" AND agent_id = ");
            query.push_bind(agent_id);
        }
        if !filter.include_revoked {
            query.push(" AND revoked_at IS NULL");
        }
        if filter.only_active {
            query.push(" AND revoked_at IS NULL AND (expires_at IS NULL OR expires_at > ");
            query.push_bind(Utc::now());
            query.push(")");
        }
        // Offset applies before limit, after all filters.
        query.push(" ORDER BY created_at DESC OFFSET ");
        query.push_bind(filter.offset.max(0));
        if filter.limit > 0 {
            query.push(" LIMIT ");
            query.push_bind(filter.limit);
        }

        let records = query
            .build_query_as::<ApiKeyRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn revoke(&self, ctx: &TenantContext, id: &str) -> StoreResult<ApiKeyRecord> {
        require_tenant(ctx)?;
        let updated = sqlx::query_as::<_, ApiKeyRecord>(&format!(
            "UPDATE api_keys SET revoked_at = NOW()
             WHERE id = $1 AND tenant_id = $2 AND revoked_at IS NULL
             RETURNING {API_KEY_COLUMNS}"
        ))
        .bind(id)
        .bind(&ctx.tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(record) => Ok(record),
            // Already revoked is a no-op; a missing row is NotFound.
            None => self.get_by_id(ctx, id).await,
        }
    }

    async fn update_last_used(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, ctx: &TenantContext, id: &str) -> StoreResult<()> {
        require_tenant(ctx)?;
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(&ctx.tenant_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn sweep_expired(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM api_keys
             WHERE (revoked_at IS NOT NULL AND revoked_at <= $1)
                OR (expires_at IS NOT NULL AND expires_at <= $1)",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

const OAUTH2_CLIENT_COLUMNS: &str =
    "client_id, secret_hash, name, tenant_id, scopes, created_at, expires_at, revoked_at";

#[derive(Clone)]
pub struct PgOAuth2ClientStore {
    pool: PgPool,
}

impl PgOAuth2ClientStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OAuth2ClientStore for PgOAuth2ClientStore {
    async fn create(
        &self,
        ctx: &TenantContext,
        record: OAuth2ClientRecord,
    ) -> StoreResult<OAuth2ClientRecord> {
        require_tenant(ctx)?;
        let created = sqlx::query_as::<_, OAuth2ClientRecord>(&format!(
            "INSERT INTO oauth2_clients ({OAUTH2_CLIENT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {OAUTH2_CLIENT_COLUMNS}"
        ))
        .bind(record.client_id)
        .bind(&record.secret_hash)
        .bind(&record.name)
        .bind(&ctx.tenant_id)
        .bind(&record.scopes)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.revoked_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn get(&self, client_id: Uuid) -> StoreResult<OAuth2ClientRecord> {
        sqlx::query_as::<_, OAuth2ClientRecord>(&format!(
            "SELECT {OAUTH2_CLIENT_COLUMNS} FROM oauth2_clients WHERE client_id = $1"
        ))
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn revoke(&self, ctx: &TenantContext, client_id: Uuid) -> StoreResult<()> {
        require_tenant(ctx)?;
        let result = sqlx::query(
            "UPDATE oauth2_clients SET revoked_at = NOW()
             WHERE client_id = $1 AND tenant_id = $2 AND revoked_at IS NULL",
        )
        .bind(client_id)
        .bind(&ctx.tenant_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

const SIGNING_KEY_COLUMNS: &str =
    "kid, private_key_enc, public_key_pem, algorithm, created_at, activated_at, expires_at, status";

fn signing_key_from_row(row: &PgRow) -> StoreResult<SigningKeyRecord> {
    let status: String = row.try_get("status")?;
    Ok(SigningKeyRecord {
        kid: row.try_get("kid")?,
        private_key_enc: row.try_get("private_key_enc")?,
        public_key_pem: row.try_get("public_key_pem")?,
        algorithm: row.try_get("algorithm")?,
        created_at: row.try_get("created_at")?,
        activated_at: row.try_get("activated_at")?,
        expires_at: row.try_get("expires_at")?,
        status: KeyStatus::parse(&status)?,
    })
}

#[derive(Clone)]
pub struct PgSigningKeyStore {
    pool: PgPool,
}

impl PgSigningKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SigningKeyStore for PgSigningKeyStore {
    async fn insert(&self, record: SigningKeyRecord) -> StoreResult<SigningKeyRecord> {
        let row = sqlx::query(&format!(
            "INSERT INTO signing_keys ({SIGNING_KEY_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {SIGNING_KEY_COLUMNS}"
        ))
        .bind(&record.kid)
        .bind(&record.private_key_enc)
        .bind(&record.public_key_pem)
        .bind(&record.algorithm)
        .bind(record.created_at)
        .bind(record.activated_at)
        .bind(record.expires_at)
        .bind(record.status.as_str())
        .fetch_one(&self.pool)
        .await?;
        signing_key_from_row(&row)
    }

    async fn rotate(
        &self,
        record: SigningKeyRecord,
        grace_expires_at: DateTime<Utc>,
    ) -> StoreResult<SigningKeyRecord> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE signing_keys SET expires_at = $1
             WHERE status = 'active' AND expires_at IS NULL",
        )
        .bind(grace_expires_at)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "INSERT INTO signing_keys ({SIGNING_KEY_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'active')
             RETURNING {SIGNING_KEY_COLUMNS}"
        ))
        .bind(&record.kid)
        .bind(&record.private_key_enc)
        .bind(&record.public_key_pem)
        .bind(&record.algorithm)
        .bind(record.created_at)
        .bind(record.activated_at)
        .bind(record.expires_at)
        .fetch_one(&mut *tx)
        .await?;
        let created = signing_key_from_row(&row)?;

        tx.commit().await?;
        Ok(created)
    }

    async fn get(&self, kid: &str) -> StoreResult<SigningKeyRecord> {
        let row = sqlx::query(&format!(
            "SELECT {SIGNING_KEY_COLUMNS} FROM signing_keys WHERE kid = $1"
        ))
        .bind(kid)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;
        signing_key_from_row(&row)
    }

    async fn get_all_active(&self, now: DateTime<Utc>) -> StoreResult<Vec<SigningKeyRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {SIGNING_KEY_COLUMNS} FROM signing_keys
             WHERE status = 'active' AND (expires_at IS NULL OR expires_at > $1)
             ORDER BY activated_at DESC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(signing_key_from_row).collect()
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE signing_keys SET status = 'expired'
             WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn create(&self, record: RefreshTokenRecord) -> StoreResult<RefreshTokenRecord> {
        let created = sqlx::query_as::<_, RefreshTokenRecord>(
            "INSERT INTO refresh_tokens (jti, subject_id, tenant_id, token_hash, issued_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING jti, subject_id, tenant_id, token_hash, issued_at, expires_at",
        )
        .bind(record.jti)
        .bind(record.subject_id)
        .bind(&record.tenant_id)
        .bind(&record.token_hash)
        .bind(record.issued_at)
        .bind(record.expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    async fn consume(&self, token_hash: &[u8]) -> StoreResult<RefreshTokenRecord> {
        let mut tx = self.pool.begin().await?;

        // Single-use: select and hard-delete inside one transaction so two
        // concurrent presenters cannot both succeed.
        let record = sqlx::query_as::<_, RefreshTokenRecord>(
            "SELECT jti, subject_id, tenant_id, token_hash, issued_at, expires_at
             FROM refresh_tokens WHERE token_hash = $1 FOR UPDATE",
        )
        .bind(token_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let record = match record {
            Some(record) => record,
            None => {
                tx.commit().await?;
                return Err(StoreError::NotFound);
            }
        };

        sqlx::query("DELETE FROM refresh_tokens WHERE jti = $1")
            .bind(record.jti)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if record.expires_at <= Utc::now() {
            return Err(StoreError::NotFound);
        }
        Ok(record)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
