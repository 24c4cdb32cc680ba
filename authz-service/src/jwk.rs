use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::SigningKeyRecord;

#[derive(Debug, Error)]
pub enum JwkError {
    #[error("failed to parse public key for kid '{0}': {1}")]
    KeyParse(String, String),
    #[error("JWK set must contain at least one key")]
    EmptySet,
    #[error("invalid JWK entry: {0}")]
    InvalidEntry(String),
}

/// RFC 7517 representation of one RSA signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkKey {
    pub kid: String,
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub n: String,
    pub e: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x5t: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<JwkKey>,
}

/// Convert a signing-key record's public half into a JWK. The modulus and
/// exponent are base64url (no padding) over their big-endian bytes.
pub fn jwk_from_record(record: &SigningKeyRecord) -> Result<JwkKey, JwkError> {
    let public = RsaPublicKey::from_public_key_pem(&record.public_key_pem)
        .map_err(|err| JwkError::KeyParse(record.kid.clone(), err.to_string()))?;
    let n = URL_SAFE_NO_PAD.encode(public.n().to_bytes_be());
    let e = URL_SAFE_NO_PAD.encode(public.e().to_bytes_be());
    let x5t = thumbprint(&n, &e);

    Ok(JwkKey {
        kid: record.kid.clone(),
        kty: "RSA".to_string(),
        use_: "sig".to_string(),
        alg: record.algorithm.clone(),
        n,
        e,
        x5t: Some(x5t),
    })
}

/// SHA-256 over the canonical JWK members in lexicographic order
/// (`{"e":…,"kty":"RSA","n":…}`), base64url-encoded.
fn thumbprint(n: &str, e: &str) -> String {
    let canonical = format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

impl JwkSet {
    pub fn from_records(records: &[SigningKeyRecord]) -> Result<Self, JwkError> {
        let keys = records
            .iter()
            .map(jwk_from_record)
            .collect::<Result<Vec<_>, _>>()?;
        let set = Self { keys };
        set.validate()?;
        Ok(set)
    }

    /// A publishable set has at least one key, and every entry carries a kid,
    /// RSA type, signing use, an algorithm, and both components.
    pub fn validate(&self) -> Result<(), JwkError> {
        if self.keys.is_empty() {
            return Err(JwkError::EmptySet);
        }
        for key in &self.keys {
            if key.kid.is_empty() {
                return Err(JwkError::InvalidEntry("missing kid".to_string()));
            }
            if key.kty != "RSA" {
                return Err(JwkError::InvalidEntry(format!(
                    "key '{}' has kty '{}'",
                    key.kid, key.kty
                )));
            }
            if key.use_ != "sig" {
                return Err(JwkError::InvalidEntry(format!(
                    "key '{}' has use '{}'",
                    key.kid, key.use_
                )));
            }
            if key.alg.is_empty() {
                return Err(JwkError::InvalidEntry(format!("key '{}' missing alg", key.kid)));
            }
            if key.n.is_empty() || key.e.is_empty() {
                return Err(JwkError::InvalidEntry(format!(
                    "key '{}' missing RSA components",
                    key.kid
                )));
            }
        }
        Ok(())
    }
}
