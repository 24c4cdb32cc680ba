use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use thiserror::Error;

/// Applied when a record carries a non-positive limit.
pub const DEFAULT_LIMIT_RPS: i32 = 100;

/// Counters live for two windows so a reader at a window boundary still sees
/// the previous second.
const COUNTER_TTL_SECONDS: i64 = 2;

const KEY_PREFIX: &str = "ratelimit";

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limiter unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for RateLimitError {
    fn from(value: redis::RedisError) -> Self {
        Self::Unavailable(value.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub current: i64,
    pub limit: i32,
}

/// Fixed one-second-window rate limiting. Callers choose fail-open or
/// fail-closed when `allow` errors; the limiter itself never guesses.
#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn allow(&self, id: &str, limit: i32) -> Result<RateDecision, RateLimitError>;
    async fn count(&self, id: &str) -> Result<i64, RateLimitError>;
    async fn reset(&self, id: &str) -> Result<(), RateLimitError>;
}

fn effective_limit(limit: i32) -> i32 {
    if limit <= 0 {
        DEFAULT_LIMIT_RPS
    } else {
        limit
    }
}

fn current_window() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn window_key(id: &str, window: u64) -> String {
    format!("{KEY_PREFIX}:{id}:{window}")
}

// ---------------- Redis implementation ----------------

/// Increment-and-expire must be one cache-side operation so that concurrent
/// callers to the same id observe a single linearizable counter.
const INCR_WITH_TTL: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

#[derive(Clone)]
pub struct RedisRateLimiter {
    manager: ConnectionManager,
    script: Script,
}

impl RedisRateLimiter {
    pub async fn connect(redis_url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::new(manager))
    }

    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            script: Script::new(INCR_WITH_TTL),
        }
    }
}

#[async_trait]
impl RateLimiterEngine for RedisRateLimiter {
    async fn allow(&self, id: &str, limit: i32) -> Result<RateDecision, RateLimitError> {
        let limit = effective_limit(limit);
        let key = window_key(id, current_window());
        let mut conn = self.manager.clone();
        let current: i64 = self
            .script
            .key(&key)
            .arg(COUNTER_TTL_SECONDS)
            .invoke_async(&mut conn)
            .await?;
        Ok(RateDecision {
            allowed: current <= limit as i64,
            current,
            limit,
        })
    }

    async fn count(&self, id: &str) -> Result<i64, RateLimitError> {
        let key = window_key(id, current_window());
        let mut conn = self.manager.clone();
        let current: Option<i64> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        Ok(current.unwrap_or(0))
    }

    async fn reset(&self, id: &str) -> Result<(), RateLimitError> {
        let key = window_key(id, current_window());
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
        Ok(())
    }
}

// ---------------- In-memory implementation (tests) ----------------

#[derive(Default)]
pub struct InMemoryRateLimiter {
    windows: Mutex<HashMap<String, (u64, i64)>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiterEngine for InMemoryRateLimiter {
    async fn allow(&self, id: &str, limit: i32) -> Result<RateDecision, RateLimitError> {
        let limit = effective_limit(limit);
        let window = current_window();
        let mut guard = self.windows.lock().expect("mutex poisoned");
        let entry = guard.entry(id.to_string()).or_insert((window, 0));
        if entry.0 != window {
            *entry = (window, 0);
        }
        entry.1 += 1;
        Ok(RateDecision {
            allowed: entry.1 <= limit as i64,
            current: entry.1,
            limit,
        })
    }

    async fn count(&self, id: &str) -> Result<i64, RateLimitError> {
        let window = current_window();
        let guard = self.windows.lock().expect("mutex poisoned");
        Ok(guard
            .get(id)
            .filter(|(start, _)| *start == window)
            .map(|(_, count)| *count)
            .unwrap_or(0))
    }

    async fn reset(&self, id: &str) -> Result<(), RateLimitError> {
        let mut guard = self.windows.lock().expect("mutex poisoned");
        guard.remove(id);
        Ok(())
    }
}

/// Limiter that always errors; used in tests to exercise fail-open and
/// fail-closed paths.
#[derive(Default)]
pub struct UnavailableRateLimiter;

#[async_trait]
impl RateLimiterEngine for UnavailableRateLimiter {
    async fn allow(&self, _id: &str, _limit: i32) -> Result<RateDecision, RateLimitError> {
        Err(RateLimitError::Unavailable("cache offline".to_string()))
    }

    async fn count(&self, _id: &str) -> Result<i64, RateLimitError> {
        Err(RateLimitError::Unavailable("cache offline".to_string()))
    }

    async fn reset(&self, _id: &str) -> Result<(), RateLimitError> {
        Err(RateLimitError::Unavailable("cache offline".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_limit_within_window() {
        let limiter = InMemoryRateLimiter::new();
        for n in 1..=3 {
            let decision = limiter.allow("agent-1", 3).await.expect("allow");
            assert!(decision.allowed, "request {n} should be admitted");
            assert_eq!(decision.current, n);
        }
        let decision = limiter.allow("agent-1", 3).await.expect("allow");
        assert!(!decision.allowed);
        assert_eq!(decision.current, 4);
    }

    #[tokio::test]
    async fn ids_do_not_share_counters() {
        let limiter = InMemoryRateLimiter::new();
        assert!(limiter.allow("a", 1).await.expect("allow").allowed);
        assert!(!limiter.allow("a", 1).await.expect("allow").allowed);
        assert!(limiter.allow("b", 1).await.expect("allow").allowed);
    }

    #[tokio::test]
    async fn non_positive_limit_uses_default() {
        let limiter = InMemoryRateLimiter::new();
        let decision = limiter.allow("agent-1", 0).await.expect("allow");
        assert_eq!(decision.limit, DEFAULT_LIMIT_RPS);
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn reset_clears_the_current_window() {
        let limiter = InMemoryRateLimiter::new();
        assert!(limiter.allow("a", 1).await.expect("allow").allowed);
        assert!(!limiter.allow("a", 1).await.expect("allow").allowed);
        limiter.reset("a").await.expect("reset");
        assert!(limiter.allow("a", 1).await.expect("allow").allowed);
    }
}
