use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_auth::{RevocationCheck, RevocationCheckError};
use redis::aio::ConnectionManager;
use thiserror::Error;

const KEY_PREFIX: &str = "blacklist:jwt";

#[derive(Debug, Error)]
pub enum RevocationError {
    #[error("revocation store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for RevocationError {
    fn from(value: redis::RedisError) -> Self {
        Self::Unavailable(value.to_string())
    }
}

/// Blacklist of token identifiers. Entries carry a TTL equal to the token's
/// remaining lifetime, so they vanish once the token would have expired
/// anyway.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), RevocationError>;
    async fn is_revoked(&self, jti: &str) -> Result<bool, RevocationError>;
    async fn revoke_batch(
        &self,
        entries: &HashMap<String, DateTime<Utc>>,
    ) -> Result<(), RevocationError>;
    async fn is_revoked_batch(
        &self,
        jtis: &[String],
    ) -> Result<HashMap<String, bool>, RevocationError>;
}

fn blacklist_key(jti: &str) -> String {
    format!("{KEY_PREFIX}:{jti}")
}

fn remaining_seconds(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Option<u64> {
    let remaining = (expires_at - now).num_seconds();
    if remaining <= 0 {
        None
    } else {
        Some(remaining as u64)
    }
}

#[derive(Clone)]
pub struct RedisRevocationStore {
    manager: ConnectionManager,
}

impl RedisRevocationStore {
    pub async fn connect(redis_url: &str) -> Result<Self, RevocationError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager))
    }

    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), RevocationError> {
        // An entry for an already-expired token would be dead on arrival.
        let Some(ttl) = remaining_seconds(expires_at, Utc::now()) else {
            return Ok(());
        };
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(blacklist_key(jti))
            .arg(1)
            .arg("EX")
            .arg(ttl)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool, RevocationError> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(blacklist_key(jti))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn revoke_batch(
        &self,
        entries: &HashMap<String, DateTime<Utc>>,
    ) -> Result<(), RevocationError> {
        let now = Utc::now();
        let mut pipe = redis::pipe();
        let mut any = false;
        for (jti, expires_at) in entries {
            if let Some(ttl) = remaining_seconds(*expires_at, now) {
                pipe.cmd("SET")
                    .arg(blacklist_key(jti))
                    .arg(1)
                    .arg("EX")
                    .arg(ttl)
                    .ignore();
                any = true;
            }
        }
        if !any {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn is_revoked_batch(
        &self,
        jtis: &[String],
    ) -> Result<HashMap<String, bool>, RevocationError> {
        if jtis.is_empty() {
            return Ok(HashMap::new());
        }
        let mut pipe = redis::pipe();
        for jti in jtis {
            pipe.cmd("EXISTS").arg(blacklist_key(jti));
        }
        let mut conn = self.manager.clone();
        let results: Vec<bool> = pipe.query_async(&mut conn).await?;
        Ok(jtis.iter().cloned().zip(results).collect())
    }
}

#[derive(Default)]
pub struct InMemoryRevocationStore {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn revoke(&self, jti: &str, expires_at: DateTime<Utc>) -> Result<(), RevocationError> {
        if expires_at <= Utc::now() {
            return Ok(());
        }
        let mut guard = self.entries.lock().expect("mutex poisoned");
        guard.insert(jti.to_string(), expires_at);
        Ok(())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool, RevocationError> {
        let now = Utc::now();
        let mut guard = self.entries.lock().expect("mutex poisoned");
        guard.retain(|_, expires_at| *expires_at > now);
        Ok(guard.contains_key(jti))
    }

    async fn revoke_batch(
        &self,
        entries: &HashMap<String, DateTime<Utc>>,
    ) -> Result<(), RevocationError> {
        for (jti, expires_at) in entries {
            self.revoke(jti, *expires_at).await?;
        }
        Ok(())
    }

    async fn is_revoked_batch(
        &self,
        jtis: &[String],
    ) -> Result<HashMap<String, bool>, RevocationError> {
        let mut result = HashMap::new();
        for jti in jtis {
            result.insert(jti.clone(), self.is_revoked(jti).await?);
        }
        Ok(result)
    }
}

/// Adapter exposing a RevocationStore to the JWT verifier.
#[derive(Clone)]
pub struct RevocationBridge(pub Arc<dyn RevocationStore>);

#[async_trait]
impl RevocationCheck for RevocationBridge {
    async fn is_revoked(&self, jti: &str) -> Result<bool, RevocationCheckError> {
        self.0
            .is_revoked(jti)
            .await
            .map_err(|err| RevocationCheckError(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn revoked_jti_is_reported_until_expiry() {
        let store = InMemoryRevocationStore::new();
        store
            .revoke("jti-1", Utc::now() + Duration::minutes(5))
            .await
            .expect("revoke");
        assert!(store.is_revoked("jti-1").await.expect("check"));
        assert!(!store.is_revoked("jti-2").await.expect("check"));
    }

    #[tokio::test]
    async fn revoking_an_expired_token_is_a_noop() {
        let store = InMemoryRevocationStore::new();
        store
            .revoke("jti-1", Utc::now() - Duration::seconds(1))
            .await
            .expect("revoke");
        assert!(!store.is_revoked("jti-1").await.expect("check"));
    }

    #[tokio::test]
    async fn batch_forms_match_single_calls() {
        let store = InMemoryRevocationStore::new();
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), Utc::now() + Duration::minutes(1));
        entries.insert("b".to_string(), Utc::now() - Duration::minutes(1));
        store.revoke_batch(&entries).await.expect("batch revoke");

        let checked = store
            .is_revoked_batch(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .expect("batch check");
        assert_eq!(checked.get("a"), Some(&true));
        assert_eq!(checked.get("b"), Some(&false));
        assert_eq!(checked.get("c"), Some(&false));
    }
}
