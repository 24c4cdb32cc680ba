use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use common_audit::{AuditEvent, AuditEventType, AuditResultKind, AuditSink};
use common_auth::scope_matches;
use jsonwebtoken::{encode, Algorithm, Header};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::rate_limit::RateLimiterEngine;
use crate::signing::{SigningError, SigningKeyManager};
use crate::store::{OAuth2ClientRecord, OAuth2ClientStore, StoreError};

/// RFC 6749 §4.4 client-credentials request, accepted as JSON or form body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub scope: String,
}

impl IntoResponse for TokenResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self).into_response();
        no_store_headers(response.headers_mut());
        response
    }
}

/// RFC 6749 §5.2 error body plus the transport status to carry it on.
#[derive(Debug)]
pub struct OAuthError {
    pub status: StatusCode,
    pub error: &'static str,
    pub description: Option<String>,
    pub retry_after: Option<u32>,
}

impl OAuthError {
    fn new(status: StatusCode, error: &'static str, description: impl Into<String>) -> Self {
        Self {
            status,
            error,
            description: Some(description.into()),
            retry_after: None,
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", description)
    }

    pub fn unsupported_grant_type() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            "only the client_credentials grant is supported",
        )
    }

    /// Absent, revoked, expired, and wrong-secret clients all collapse to
    /// this one answer.
    pub fn invalid_client() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "invalid_client",
            "client authentication failed",
        )
    }

    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_scope", description)
    }

    pub fn rate_limited(limit: i32) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            error: "invalid_request",
            description: Some(format!(
                "rate limit of {limit} requests per second exceeded"
            )),
            retry_after: Some(1),
        }
    }

    pub fn method_not_allowed() -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "invalid_request",
            "token requests must use POST",
        )
    }

    pub fn server_error(description: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "server_error", description)
    }
}

#[derive(Debug, Serialize)]
struct OAuthErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_description: Option<String>,
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let body = OAuthErrorBody {
            error: self.error,
            error_description: self.description,
        };
        let mut response = (self.status, Json(body)).into_response();
        no_store_headers(response.headers_mut());
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn no_store_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
}

/// Hash a client secret for storage. The work factor is the argon2 default,
/// tuned for a few hundred milliseconds per verification.
pub fn hash_client_secret(secret: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(secret.as_bytes(), &salt)?
        .to_string())
}

fn verify_client_secret(stored_hash: &str, presented: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(presented.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub issuer: String,
    pub audience: String,
    pub token_ttl_seconds: i64,
    pub rate_limit_per_client: i32,
}

#[derive(Serialize)]
struct AccessClaims<'a> {
    iss: &'a str,
    sub: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
    nbf: i64,
    jti: String,
    scope: String,
    tenant_id: &'a str,
    #[serde(rename = "type")]
    principal_type: &'static str,
}

pub struct OAuthTokenService {
    clients: Arc<dyn OAuth2ClientStore>,
    limiter: Arc<dyn RateLimiterEngine>,
    signing: Arc<SigningKeyManager>,
    audit: Arc<dyn AuditSink>,
    config: OAuthConfig,
}

impl OAuthTokenService {
    pub fn new(
        clients: Arc<dyn OAuth2ClientStore>,
        limiter: Arc<dyn RateLimiterEngine>,
        signing: Arc<SigningKeyManager>,
        audit: Arc<dyn AuditSink>,
        config: OAuthConfig,
    ) -> Self {
        Self {
            clients,
            limiter,
            signing,
            audit,
            config,
        }
    }

    pub async fn issue(&self, request: TokenRequest) -> Result<TokenResponse, OAuthError> {
        if request.grant_type.as_deref() != Some("client_credentials") {
            return Err(OAuthError::unsupported_grant_type());
        }

        let client_id = request
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("client_id is required"))?;
        let client_secret = request
            .client_secret
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("client_secret is required"))?;

        let client_uuid = Uuid::parse_str(client_id).map_err(|_| OAuthError::invalid_client())?;
        let client = match self.clients.get(client_uuid).await {
            Ok(client) => client,
            Err(StoreError::NotFound) => return Err(OAuthError::invalid_client()),
            Err(err) => return Err(OAuthError::server_error(err.to_string())),
        };
        if !client.is_active(Utc::now()) {
            return Err(OAuthError::invalid_client());
        }

        if !verify_client_secret(&client.secret_hash, client_secret) {
            self.emit(
                AuditEvent::new(
                    AuditEventType::LoginFailure,
                    client.client_id.to_string(),
                    &client.tenant_id,
                    AuditResultKind::Failure,
                )
                .with_error("client secret mismatch"),
            )
            .await;
            return Err(OAuthError::invalid_client());
        }

        let granted = self.granted_scopes(&client, request.scope.as_deref())?;

        // Token issuance fails closed when the limiter is unreachable.
        match self
            .limiter
            .allow(
                &format!("oauth:{}", client.client_id),
                self.config.rate_limit_per_client,
            )
            .await
        {
            Ok(decision) if !decision.allowed => {
                self.emit(
                    AuditEvent::new(
                        AuditEventType::RateLimitExceeded,
                        client.client_id.to_string(),
                        &client.tenant_id,
                        AuditResultKind::Failure,
                    ),
                )
                .await;
                return Err(OAuthError::rate_limited(decision.limit));
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, client_id = %client.client_id, "Rate limiter unavailable; refusing token request");
                return Err(OAuthError::server_error("rate limiter unavailable"));
            }
        }

        let scope = granted.join(" ");
        let response = self.sign_token(&client, &scope).await?;

        self.emit(
            AuditEvent::new(
                AuditEventType::TokenIssued,
                client.client_id.to_string(),
                &client.tenant_id,
                AuditResultKind::Success,
            )
            .with_details(json!({ "scope": scope })),
        )
        .await;

        Ok(response)
    }

    /// Requested scopes must all be covered by the client's grants. An empty
    /// request grants everything the client holds.
    fn granted_scopes(
        &self,
        client: &OAuth2ClientRecord,
        requested: Option<&str>,
    ) -> Result<Vec<String>, OAuthError> {
        let requested: Vec<&str> = requested
            .unwrap_or_default()
            .split_whitespace()
            .collect();
        if requested.is_empty() {
            return Ok(client.scopes.clone());
        }

        for scope in &requested {
            let covered = client
                .scopes
                .iter()
                .any(|granted| scope_matches(granted, scope));
            if !covered {
                return Err(OAuthError::invalid_scope(format!(
                    "scope '{scope}' is not granted to this client"
                )));
            }
        }
        Ok(requested.into_iter().map(str::to_owned).collect())
    }

    async fn sign_token(
        &self,
        client: &OAuth2ClientRecord,
        scope: &str,
    ) -> Result<TokenResponse, OAuthError> {
        let signer = match self.signing.get_active().await {
            Ok((_, signer)) => signer,
            Err(SigningError::NoActiveKey) => {
                return Err(OAuthError::server_error("no active signing key"))
            }
            Err(err) => return Err(OAuthError::server_error(err.to_string())),
        };

        let now = Utc::now();
        let expires_at = now + Duration::seconds(self.config.token_ttl_seconds);
        let claims = AccessClaims {
            iss: &self.config.issuer,
            sub: client.client_id.to_string(),
            aud: &self.config.audience,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            nbf: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            scope: scope.to_string(),
            tenant_id: &client.tenant_id,
            principal_type: "service",
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(signer.kid.clone());
        let access_token = encode(&header, &claims, &signer.encoding_key)
            .map_err(|err| OAuthError::server_error(format!("failed to sign token: {err}")))?;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_in: self.config.token_ttl_seconds,
            scope: scope.to_string(),
        })
    }

    async fn emit(&self, event: AuditEvent) {
        let _ = self.audit.record(event).await;
    }
}
