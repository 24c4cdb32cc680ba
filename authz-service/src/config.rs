use anyhow::{Context, Result};
use common_crypto::KeyEnv;
use std::env;
use std::fs;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub issuer: String,
    pub audience: String,
    pub token_ttl_seconds: i64,
    pub rate_limit_per_client: i32,
    pub grace_days: i64,
    pub key_env: KeyEnv,
    /// Admit requests that present no credentials at all.
    pub optional_auth: bool,
    pub revocation_fail_closed: bool,
    pub jwks_url: Option<String>,
    pub jwks_ttl_seconds: u64,
    pub audit_queue_capacity: usize,
    pub sweep_interval_seconds: u64,
}

pub fn load_service_config() -> Result<ServiceConfig> {
    let issuer = env::var("JWT_ISSUER").context("JWT_ISSUER must be set")?;
    let audience = env::var("JWT_AUDIENCE").context("JWT_AUDIENCE must be set")?;

    let token_ttl_seconds = parsed_env("TOKEN_TTL_SECONDS").unwrap_or(900);
    let rate_limit_per_client = parsed_env("OAUTH_RATE_LIMIT_PER_CLIENT").unwrap_or(10);
    let grace_days = parsed_env("SIGNING_KEY_GRACE_DAYS").unwrap_or(30);

    let key_env = match env::var("API_KEY_ENV").as_deref() {
        Ok("test") => KeyEnv::Test,
        _ => KeyEnv::Live,
    };

    let optional_auth = bool_from_env("AUTH_OPTIONAL").unwrap_or(false);
    let revocation_fail_closed = bool_from_env("REVOCATION_FAIL_CLOSED").unwrap_or(false);

    let jwks_url = env::var("JWT_JWKS_URL").ok().filter(|url| !url.is_empty());
    let jwks_ttl_seconds = parsed_env("JWT_JWKS_TTL_SECONDS").unwrap_or(300u64).max(2);

    let audit_queue_capacity = parsed_env("AUDIT_QUEUE_CAPACITY").unwrap_or(1024usize);
    let sweep_interval_seconds = parsed_env("SWEEP_INTERVAL_SECONDS").unwrap_or(3600u64).max(60);

    Ok(ServiceConfig {
        issuer,
        audience,
        token_ttl_seconds,
        rate_limit_per_client,
        grace_days,
        key_env,
        optional_auth,
        revocation_fail_closed,
        jwks_url,
        jwks_ttl_seconds,
        audit_queue_capacity,
        sweep_interval_seconds,
    })
}

/// Read a secret either directly from `key` or, when `{key}_FILE` is set,
/// from the file it names. Keeps raw secrets out of process environments in
/// container deployments.
pub fn read_secret_env(key: &str) -> Result<Option<String>> {
    let file_var = format!("{key}_FILE");
    if let Ok(path) = env::var(&file_var) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {file_var} from {path}"))?;
        return Ok(Some(contents));
    }
    Ok(env::var(key).ok())
}

fn parsed_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn bool_from_env(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
