use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use common_auth::InMemoryKeyStore;
use common_crypto::{CryptoError, DataEncryptionKey};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::store::{KeyStatus, SigningKeyRecord, SigningKeyStore, StoreError};

const RSA_BITS: usize = 2048;
const ALGORITHM: &str = "RS256";

pub const DEFAULT_GRACE_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("failed to parse signing key '{0}'")]
    KeyParse(String),
    #[error("no active signing key available")]
    NoActiveKey,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The key currently used for issuance.
#[derive(Clone)]
pub struct CurrentSigner {
    pub kid: String,
    pub encoding_key: EncodingKey,
}

/// Owns the signing-key lifecycle: generation, blue-green rotation, expiry,
/// and the in-process caches of decrypted key material. Private PEMs exist
/// in memory only inside this type; at rest they are sealed with the DEK.
pub struct SigningKeyManager {
    store: Arc<dyn SigningKeyStore>,
    dek: DataEncryptionKey,
    grace: Duration,
    signers: RwLock<HashMap<String, EncodingKey>>,
    verification_keys: InMemoryKeyStore,
}

impl SigningKeyManager {
    pub fn new(store: Arc<dyn SigningKeyStore>, dek: DataEncryptionKey, grace: Duration) -> Self {
        Self {
            store,
            dek,
            grace,
            signers: RwLock::new(HashMap::new()),
            verification_keys: InMemoryKeyStore::new(),
        }
    }

    /// Store of public decoding keys, kept in sync with the active set. The
    /// JWT verifier shares this store and sees rotations without restarts.
    pub fn verification_store(&self) -> InMemoryKeyStore {
        self.verification_keys.clone()
    }

    /// Generate a fresh RSA-2048 pair and persist it as `pending`. The
    /// decrypted signer is cached so activation does not need to unseal.
    pub async fn generate(&self) -> Result<SigningKeyRecord, SigningError> {
        let (record, encoding_key) = self.build_key_material(KeyStatus::Pending, None).await?;
        let record = self.store.insert(record).await?;
        self.cache_signer(&record.kid, encoding_key);
        Ok(record)
    }

    /// Blue-green rotation in one transaction: the new key becomes the
    /// current signer immediately; every other active key gets
    /// `expires_at = now + grace` and keeps validating until then.
    pub async fn rotate(&self) -> Result<SigningKeyRecord, SigningError> {
        let now = Utc::now();
        let (record, encoding_key) = self
            .build_key_material(KeyStatus::Active, Some(now))
            .await?;
        let record = self.store.rotate(record, now + self.grace).await?;
        self.cache_signer(&record.kid, encoding_key);
        self.sync_verification_keys().await?;
        info!(kid = %record.kid, "Rotated signing keys");
        Ok(record)
    }

    /// The single current signer: the most recently activated key without an
    /// expiry, falling back to the earliest-expiring one during a full-grace
    /// interval.
    pub async fn get_active(&self) -> Result<(SigningKeyRecord, CurrentSigner), SigningError> {
        let active = self.store.get_all_active(Utc::now()).await?;
        let record = select_current(&active).ok_or(SigningError::NoActiveKey)?.clone();
        let encoding_key = self.signer_for(&record)?;
        Ok((
            record.clone(),
            CurrentSigner {
                kid: record.kid,
                encoding_key,
            },
        ))
    }

    /// All non-expired active keys (current signer plus in-grace keys).
    pub async fn get_all_active(&self) -> Result<Vec<SigningKeyRecord>, SigningError> {
        Ok(self.store.get_all_active(Utc::now()).await?)
    }

    /// Expire active keys whose grace has elapsed; prunes the caches. Run on
    /// a timer.
    pub async fn expire_old(&self) -> Result<u64, SigningError> {
        let expired = self.store.expire_due(Utc::now()).await?;
        if expired > 0 {
            self.sync_verification_keys().await?;
            info!(expired, "Expired signing keys past grace");
        }
        Ok(expired)
    }

    /// Make sure at least one active key exists; used at startup so the
    /// first token request never races initial provisioning.
    pub async fn ensure_active(&self) -> Result<(), SigningError> {
        if self.store.get_all_active(Utc::now()).await?.is_empty() {
            self.rotate().await?;
        } else {
            self.sync_verification_keys().await?;
        }
        Ok(())
    }

    /// Rebuild the public-key store from the active set and drop cached
    /// signers for keys that are no longer active.
    pub async fn sync_verification_keys(&self) -> Result<usize, SigningError> {
        let active = self.store.get_all_active(Utc::now()).await?;

        let mut decoding = Vec::with_capacity(active.len());
        for record in &active {
            let key = DecodingKey::from_rsa_pem(record.public_key_pem.as_bytes())
                .map_err(|_| SigningError::KeyParse(record.kid.clone()))?;
            decoding.push((record.kid.clone(), key));
        }
        let count = decoding.len();
        self.verification_keys.replace_all(decoding);

        let live: std::collections::HashSet<&str> =
            active.iter().map(|record| record.kid.as_str()).collect();
        let mut signers = self.signers.write().expect("rwlock poisoned");
        signers.retain(|kid, _| live.contains(kid.as_str()));

        Ok(count)
    }

    async fn build_key_material(
        &self,
        status: KeyStatus,
        activated_at: Option<DateTime<Utc>>,
    ) -> Result<(SigningKeyRecord, EncodingKey), SigningError> {
        // RSA keygen is CPU-bound; keep it off the async workers.
        let private = tokio::task::spawn_blocking(|| RsaPrivateKey::new(&mut OsRng, RSA_BITS))
            .await
            .map_err(|err| SigningError::KeyGeneration(err.to_string()))?
            .map_err(|err| SigningError::KeyGeneration(err.to_string()))?;

        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| SigningError::KeyGeneration(err.to_string()))?;
        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| SigningError::KeyGeneration(err.to_string()))?;

        let kid = Uuid::new_v4().to_string();
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|_| SigningError::KeyParse(kid.clone()))?;

        let record = SigningKeyRecord {
            kid,
            private_key_enc: self.dek.seal(private_pem.as_bytes())?,
            public_key_pem: public_pem,
            algorithm: ALGORITHM.to_string(),
            created_at: Utc::now(),
            activated_at,
            expires_at: None,
            status,
        };
        Ok((record, encoding_key))
    }

    /// Materialize the decrypted signer for a record, unsealing on first use.
    fn signer_for(&self, record: &SigningKeyRecord) -> Result<EncodingKey, SigningError> {
        if let Some(key) = self
            .signers
            .read()
            .expect("rwlock poisoned")
            .get(&record.kid)
        {
            return Ok(key.clone());
        }

        let pem = self.dek.open(&record.private_key_enc)?;
        let key = EncodingKey::from_rsa_pem(&pem)
            .map_err(|_| SigningError::KeyParse(record.kid.clone()))?;
        self.cache_signer(&record.kid, key.clone());
        Ok(key)
    }

    fn cache_signer(&self, kid: &str, key: EncodingKey) {
        let mut signers = self.signers.write().expect("rwlock poisoned");
        signers.insert(kid.to_string(), key);
    }
}

fn select_current(active: &[SigningKeyRecord]) -> Option<&SigningKeyRecord> {
    let unexpiring = active
        .iter()
        .filter(|record| record.expires_at.is_none())
        .max_by_key(|record| record.activated_at);
    if unexpiring.is_some() {
        return unexpiring;
    }
    active
        .iter()
        .filter(|record| record.expires_at.is_some())
        .min_by_key(|record| record.expires_at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kid: &str, activated: i64, expires: Option<i64>) -> SigningKeyRecord {
        SigningKeyRecord {
            kid: kid.to_string(),
            private_key_enc: String::new(),
            public_key_pem: String::new(),
            algorithm: ALGORITHM.to_string(),
            created_at: Utc::now(),
            activated_at: Some(
                DateTime::<Utc>::from_timestamp(activated, 0).expect("timestamp"),
            ),
            expires_at: expires
                .map(|at| DateTime::<Utc>::from_timestamp(at, 0).expect("timestamp")),
            status: KeyStatus::Active,
        }
    }

    #[test]
    fn current_signer_prefers_latest_unexpiring_key() {
        let keys = vec![
            record("old", 100, Some(1_000)),
            record("mid", 200, None),
            record("new", 300, None),
        ];
        assert_eq!(select_current(&keys).map(|r| r.kid.as_str()), Some("new"));
    }

    #[test]
    fn current_signer_falls_back_to_earliest_expiring() {
        let keys = vec![record("later", 100, Some(2_000)), record("sooner", 200, Some(1_000))];
        assert_eq!(
            select_current(&keys).map(|r| r.kid.as_str()),
            Some("sooner")
        );
    }

    #[test]
    fn no_keys_means_no_signer() {
        assert!(select_current(&[]).is_none());
    }
}
