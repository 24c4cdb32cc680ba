use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};

/// Identity providers can be slow; bound the fetch so a hung endpoint cannot
/// stall a request indefinitely.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches a remote JWK Set and converts RSA signing keys into decoding keys.
/// Non-RSA and non-signing entries are dropped.
#[derive(Clone)]
pub struct JwksFetcher {
    client: Client,
    url: String,
}

impl JwksFetcher {
    pub fn new(url: impl Into<String>) -> AuthResult<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn fetch(&self) -> AuthResult<Vec<(String, DecodingKey)>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AuthError::JwksFetch(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let body: JwksResponse = response
            .json()
            .await
            .map_err(|err| AuthError::JwksDecode(err.to_string()))?;

        let mut keys = Vec::new();
        for key in body.keys.into_iter() {
            let kty = key.kty.clone().unwrap_or_else(|| "RSA".to_string());
            let use_ = key.use_.clone().unwrap_or_else(|| "sig".to_string());
            if kty != "RSA" || use_ != "sig" {
                debug!(kty = %kty, use_ = %use_, "Skipping non-RSA or non-signing JWKS entry");
                continue;
            }

            let kid = key.kid.ok_or(AuthError::JwksMissingKid)?;

            let modulus = key
                .n
                .ok_or_else(|| AuthError::JwksMissingComponents(kid.clone()))?;
            let exponent = key
                .e
                .ok_or_else(|| AuthError::JwksMissingComponents(kid.clone()))?;

            let decoding_key = DecodingKey::from_rsa_components(&modulus, &exponent)
                .map_err(|err| AuthError::KeyParse(kid.clone(), err.to_string()))?;
            keys.push((kid, decoding_key));
        }

        Ok(keys)
    }
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: Option<String>,
    #[serde(rename = "use")]
    use_: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

/// TTL-cached view over a remote JWK Set.
///
/// The initial fetch happens in `connect` and failure there is fatal. A
/// background refresher then runs at half the TTL; its errors are absorbed
/// because a subsequent miss retries synchronously.
#[derive(Clone)]
pub struct JwksClient {
    inner: Arc<JwksClientInner>,
}

struct JwksClientInner {
    fetcher: JwksFetcher,
    ttl: Duration,
    keys: RwLock<HashMap<String, DecodingKey>>,
    fetched_at: RwLock<Instant>,
}

impl JwksClient {
    pub async fn connect(url: impl Into<String>, ttl: Duration) -> AuthResult<Self> {
        Self::with_fetcher(JwksFetcher::new(url)?, ttl).await
    }

    pub async fn with_fetcher(fetcher: JwksFetcher, ttl: Duration) -> AuthResult<Self> {
        let keys = fetcher.fetch().await?;
        let inner = Arc::new(JwksClientInner {
            fetcher,
            ttl,
            keys: RwLock::new(keys.into_iter().collect()),
            fetched_at: RwLock::new(Instant::now()),
        });

        Self::spawn_refresher(Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    /// Cached key lookup. An unknown kid triggers one synchronous refresh if
    /// the cache is older than the TTL; a kid still missing afterwards means
    /// the token was signed by a key this JWKS does not publish.
    pub async fn get_key(&self, kid: &str) -> AuthResult<DecodingKey> {
        if let Some(key) = self.lookup(kid) {
            return Ok(key);
        }

        let stale = {
            let fetched_at = self.inner.fetched_at.read().expect("rwlock poisoned");
            fetched_at.elapsed() >= self.inner.ttl
        };
        if stale {
            if let Err(err) = self.refresh().await {
                warn!(error = %err, kid, "Synchronous JWKS refresh failed");
            }
            if let Some(key) = self.lookup(kid) {
                return Ok(key);
            }
        }

        Err(AuthError::UnknownKeyId(kid.to_string()))
    }

    pub async fn refresh(&self) -> AuthResult<usize> {
        let keys = self.inner.fetcher.fetch().await?;
        let count = keys.len();
        if count > 0 {
            let mut guard = self.inner.keys.write().expect("rwlock poisoned");
            *guard = keys.into_iter().collect();
        }
        *self.inner.fetched_at.write().expect("rwlock poisoned") = Instant::now();
        Ok(count)
    }

    pub fn url(&self) -> &str {
        self.inner.fetcher.url()
    }

    fn lookup(&self, kid: &str) -> Option<DecodingKey> {
        let guard = self.inner.keys.read().expect("rwlock poisoned");
        guard.get(kid).cloned()
    }

    fn spawn_refresher(inner: Weak<JwksClientInner>) {
        let period = match inner.upgrade() {
            Some(strong) => strong.ttl / 2,
            None => return,
        };
        let period = period.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(strong) = inner.upgrade() else {
                    break;
                };
                let client = JwksClient { inner: strong };
                match client.refresh().await {
                    Ok(count) => debug!(count, url = %client.url(), "Refreshed JWKS keys"),
                    Err(err) => warn!(error = %err, url = %client.url(), "Background JWKS refresh failed"),
                }
            }
        });
    }
}
