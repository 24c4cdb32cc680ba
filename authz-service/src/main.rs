use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use chrono::Duration as ChronoDuration;
use common_audit::PgAuditWriter;
use common_auth::{JwksClient, JwtConfig, JwtVerifier};
use common_crypto::DataEncryptionKey;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use authz_service::api_keys::ApiKeyService;
use authz_service::config::{load_service_config, read_secret_env};
use authz_service::metrics::AuthMetrics;
use authz_service::oauth::{OAuthConfig, OAuthTokenService};
use authz_service::rate_limit::RedisRateLimiter;
use authz_service::revocation::{RedisRevocationStore, RevocationBridge, RevocationStore};
use authz_service::signing::SigningKeyManager;
use authz_service::store::{
    ApiKeyStore, PgApiKeyStore, PgOAuth2ClientStore, PgRefreshTokenStore, PgSigningKeyStore,
    RefreshTokenStore,
};
use authz_service::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let config = Arc::new(load_service_config()?);

    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let db_pool = PgPool::connect(&database_url).await?;

    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let redis_client = redis::Client::open(redis_url.as_str())
        .with_context(|| format!("Invalid REDIS_URL {redis_url}"))?;
    let redis_manager = ConnectionManager::new(redis_client)
        .await
        .context("Failed to connect to Redis")?;

    let dek = read_secret_env("AUTHZ_DEK")?
        .context("AUTHZ_DEK must be set (base64-encoded 32-byte key)")?;
    let dek = DataEncryptionKey::from_base64(&dek).context("AUTHZ_DEK is not a valid key")?;

    let audit = Arc::new(PgAuditWriter::spawn(
        db_pool.clone(),
        config.audit_queue_capacity,
    ));

    let limiter = Arc::new(RedisRateLimiter::new(redis_manager.clone()));
    let revocation: Arc<dyn RevocationStore> =
        Arc::new(RedisRevocationStore::new(redis_manager));

    let api_key_store: Arc<dyn ApiKeyStore> = Arc::new(PgApiKeyStore::new(db_pool.clone()));
    let signing_store = Arc::new(PgSigningKeyStore::new(db_pool.clone()));
    let client_store = Arc::new(PgOAuth2ClientStore::new(db_pool.clone()));
    let refresh_store: Arc<dyn RefreshTokenStore> =
        Arc::new(PgRefreshTokenStore::new(db_pool.clone()));

    let signing = Arc::new(SigningKeyManager::new(
        signing_store,
        dek,
        ChronoDuration::days(config.grace_days),
    ));
    signing
        .ensure_active()
        .await
        .context("Failed to provision an active signing key")?;

    let verifier = build_jwt_verifier(&config, &signing, revocation.clone()).await?;

    let api_keys = Arc::new(ApiKeyService::new(
        api_key_store.clone(),
        limiter.clone(),
        audit.clone(),
        config.key_env,
    ));

    let oauth = Arc::new(OAuthTokenService::new(
        client_store,
        limiter,
        signing.clone(),
        audit.clone(),
        OAuthConfig {
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            token_ttl_seconds: config.token_ttl_seconds,
            rate_limit_per_client: config.rate_limit_per_client,
        },
    ));

    let state = AppState {
        api_keys,
        oauth,
        signing: signing.clone(),
        verifier,
        revocation,
        audit,
        config: config.clone(),
        metrics: Arc::new(AuthMetrics::new()?),
    };

    spawn_sweepers(
        signing,
        api_key_store,
        refresh_store,
        config.sweep_interval_seconds,
        config.grace_days,
    );

    let app = build_router(state);

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8086);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));

    info!(%addr, "starting authz-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn build_jwt_verifier(
    config: &authz_service::config::ServiceConfig,
    signing: &Arc<SigningKeyManager>,
    revocation: Arc<dyn RevocationStore>,
) -> anyhow::Result<Arc<JwtVerifier>> {
    let mut jwt_config = JwtConfig::new(config.issuer.clone(), config.audience.clone())
        .with_revocation_fail_closed(config.revocation_fail_closed);
    if let Ok(value) = env::var("JWT_LEEWAY_SECONDS") {
        if let Ok(leeway) = value.parse::<u32>() {
            jwt_config = jwt_config.with_leeway(leeway);
        }
    }

    let mut builder = JwtVerifier::builder(jwt_config)
        .with_store(signing.verification_store())
        .with_revocation(Arc::new(RevocationBridge(revocation)));

    // Tokens from a third-party issuer are validated against its published
    // JWKS; our own keys stay authoritative through the shared store.
    if let Some(url) = &config.jwks_url {
        info!(jwks_url = %url, "Configuring external JWKS client");
        let client =
            JwksClient::connect(url.clone(), Duration::from_secs(config.jwks_ttl_seconds))
                .await
                .map_err(anyhow::Error::from)?;
        builder = builder.with_jwks_client(client);
    }

    info!("JWT verifier initialised");
    Ok(Arc::new(builder.build()))
}

fn spawn_sweepers(
    signing: Arc<SigningKeyManager>,
    api_keys: Arc<dyn ApiKeyStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    interval_seconds: u64,
    grace_days: i64,
) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now();

            match signing.expire_old().await {
                Ok(0) => {}
                Ok(count) => info!(count, "Expired signing keys"),
                Err(err) => warn!(error = %err, "Signing-key expiry sweep failed"),
            }

            let cutoff = now - ChronoDuration::days(grace_days);
            match api_keys.sweep_expired(cutoff).await {
                Ok(0) => {}
                Ok(count) => info!(count, "Swept terminated API keys"),
                Err(err) => warn!(error = %err, "API-key sweep failed"),
            }

            match refresh_tokens.sweep_expired(now).await {
                Ok(0) => {}
                Ok(count) => info!(count, "Swept expired refresh tokens"),
                Err(err) => warn!(error = %err, "Refresh-token sweep failed"),
            }
        }
    });
}
