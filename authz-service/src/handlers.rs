use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use common_auth::{require_any_role, AuthContext, GuardError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::api_keys::{ApiKeyError, CreateApiKeyRequest};
use crate::app::AppState;
use crate::jwk::JwkSet;
use crate::oauth::{OAuthError, TokenRequest};
use crate::signing::SigningError;
use crate::store::{ApiKeyListFilter, ApiKeyRecord, SigningKeyRecord, StoreError, TenantContext};

const TOKEN_BODY_LIMIT: usize = 64 * 1024;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

/// Roles allowed to drive the signing-key lifecycle.
const OPERATOR_ROLES: &[&str] = &["operator", "admin"];

/// Envelope error: `{success: false, error: {code, message}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": { "code": self.code, "message": self.message },
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ApiKeyError> for ApiError {
    fn from(err: ApiKeyError) -> Self {
        let status = match &err {
            ApiKeyError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiKeyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiKeyError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ApiKeyError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiKeyError::Revoked | ApiKeyError::Expired => StatusCode::CONFLICT,
            ApiKeyError::InvalidFormat | ApiKeyError::InvalidKey => StatusCode::UNAUTHORIZED,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<SigningError> for ApiError {
    fn from(err: SigningError) -> Self {
        let status = match &err {
            SigningError::NoActiveKey => StatusCode::CONFLICT,
            SigningError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            SigningError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Signing errors can reference key material context; expose only a
        // stable code and a generic message.
        Self::new(status, "signing_key_error", err.to_string())
    }
}

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Unauthenticated => Self::new(
                StatusCode::UNAUTHORIZED,
                "missing_credentials",
                "Authentication required",
            ),
            GuardError::Forbidden { required } => Self::new(
                StatusCode::FORBIDDEN,
                "insufficient_role",
                format!("Required one of: {}", required.join(", ")),
            ),
        }
    }
}

fn envelope<T: Serialize>(data: T) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn ensure_operator(auth: &AuthContext) -> Result<(), ApiError> {
    require_any_role(Some(&auth.principal), OPERATOR_ROLES).map_err(ApiError::from)
}

// ---------------- API keys ----------------

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyBody {
    pub name: String,
    pub agent_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub rate_limit_rps: Option<i32>,
}

/// Listing/read view of a key record. Deliberately omits the hash; no read
/// path ever returns hash or plaintext material.
#[derive(Debug, Serialize)]
pub struct ApiKeyMetadata {
    pub id: String,
    pub name: String,
    pub agent_id: String,
    pub tenant_id: String,
    pub scopes: Vec<String>,
    pub rate_limit_rps: i32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl From<ApiKeyRecord> for ApiKeyMetadata {
    fn from(record: ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            agent_id: record.agent_id,
            tenant_id: record.tenant_id,
            scopes: record.scopes,
            rate_limit_rps: record.rate_limit_rps,
            created_at: record.created_at,
            expires_at: record.expires_at,
            last_used_at: record.last_used_at,
            revoked_at: record.revoked_at,
            metadata: record.metadata,
        }
    }
}

pub async fn create_api_key(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<CreateApiKeyBody>,
) -> Result<Response, ApiError> {
    let ctx = TenantContext::new(&auth.principal.tenant_id);
    let created = state
        .api_keys
        .create(
            &ctx,
            CreateApiKeyRequest {
                name: body.name,
                agent_id: body.agent_id,
                scopes: body.scopes,
                expires_at: body.expires_at,
                rate_limit_rps: body.rate_limit_rps,
                metadata: None,
            },
        )
        .await?;

    // The plaintext appears in this response and nowhere else.
    Ok(envelope(json!({
        "id": created.record.id,
        "key": created.plaintext,
        "name": created.record.name,
        "agent_id": created.record.agent_id,
        "scopes": created.record.scopes,
        "created_at": created.record.created_at,
        "expires_at": created.record.expires_at,
        "rate_limit_rps": created.record.rate_limit_rps,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListApiKeysParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub agent_id: Option<String>,
    pub active: Option<bool>,
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(params): Query<ListApiKeysParams>,
) -> Result<Response, ApiError> {
    let ctx = TenantContext::new(&auth.principal.tenant_id);
    let filter = ApiKeyListFilter {
        agent_id: params.agent_id,
        include_revoked: !params.active.unwrap_or(false),
        only_active: params.active.unwrap_or(false),
        limit: params
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE),
        offset: params.offset.unwrap_or(0).max(0),
    };
    let keys = state.api_keys.list(&ctx, &filter).await?;
    let keys: Vec<ApiKeyMetadata> = keys.into_iter().map(ApiKeyMetadata::from).collect();
    Ok(envelope(keys))
}

pub async fn get_api_key(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let ctx = TenantContext::new(&auth.principal.tenant_id);
    let record = state.api_keys.get(&ctx, &id).await?;
    Ok(envelope(ApiKeyMetadata::from(record)))
}

/// DELETE revokes; the row survives (revoked) until the sweep removes it.
pub async fn delete_api_key(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let ctx = TenantContext::new(&auth.principal.tenant_id);
    let record = state.api_keys.revoke(&ctx, &id).await?;
    Ok(envelope(ApiKeyMetadata::from(record)))
}

pub async fn rotate_api_key(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let ctx = TenantContext::new(&auth.principal.tenant_id);
    let created = state.api_keys.rotate(&ctx, &id).await?;
    Ok(envelope(json!({
        "id": created.record.id,
        "new_key": created.plaintext,
        "name": created.record.name,
        "created_at": created.record.created_at,
    })))
}

// ---------------- Signing keys ----------------

#[derive(Debug, Serialize)]
pub struct SigningKeyMetadata {
    pub kid: String,
    pub algorithm: String,
    pub status: &'static str,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<SigningKeyRecord> for SigningKeyMetadata {
    fn from(record: SigningKeyRecord) -> Self {
        Self {
            kid: record.kid,
            algorithm: record.algorithm,
            status: record.status.as_str(),
            created_at: record.created_at,
            activated_at: record.activated_at,
            expires_at: record.expires_at,
        }
    }
}

pub async fn rotate_signing_keys(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Response, ApiError> {
    ensure_operator(&auth)?;
    let rotated = match state.signing.rotate().await {
        Ok(record) => record,
        Err(err) => {
            state.metrics.key_rotation("failure");
            return Err(err.into());
        }
    };
    state.metrics.key_rotation("success");
    let active = state.signing.get_all_active().await?;

    Ok(Json(json!({
        "success": true,
        "new_key_id": rotated.kid,
        "activated_at": rotated.activated_at,
        "message": "signing keys rotated; previous keys remain valid until grace expires",
        "active_keys_count": active.len(),
    }))
    .into_response())
}

pub async fn expire_signing_keys(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Response, ApiError> {
    ensure_operator(&auth)?;
    let expired = state.signing.expire_old().await?;
    Ok(Json(json!({
        "success": true,
        "expired_count": expired,
        "message": "expired signing keys past their grace period",
    }))
    .into_response())
}

pub async fn list_signing_keys(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Response, ApiError> {
    ensure_operator(&auth)?;
    let keys = state.signing.get_all_active().await?;
    let keys: Vec<SigningKeyMetadata> = keys.into_iter().map(SigningKeyMetadata::from).collect();
    Ok(envelope(json!({ "keys": keys })))
}

// ---------------- Public endpoints ----------------

pub async fn jwks_document(State(state): State<AppState>) -> Result<Response, ApiError> {
    let active = state.signing.get_all_active().await?;
    let set = JwkSet::from_records(&active).map_err(|err| {
        warn!(error = %err, "Unable to build JWKS document");
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "jwks_unavailable",
            "no publishable signing keys",
        )
    })?;

    let mut response = Json(set).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    Ok(response)
}

pub async fn token_endpoint(State(state): State<AppState>, request: Request) -> Response {
    if request.method() != Method::POST {
        return OAuthError::method_not_allowed().into_response();
    }

    let (parts, body) = request.into_parts();
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let bytes = match axum::body::to_bytes(body, TOKEN_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(_) => return OAuthError::invalid_request("unreadable request body").into_response(),
    };

    let token_request: TokenRequest = if content_type.starts_with("application/json") {
        match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(_) => return OAuthError::invalid_request("malformed JSON body").into_response(),
        }
    } else {
        match serde_urlencoded::from_bytes(&bytes) {
            Ok(request) => request,
            Err(_) => return OAuthError::invalid_request("malformed form body").into_response(),
        }
    };

    match state.oauth.issue(token_request).await {
        Ok(response) => {
            state.metrics.token_request("success");
            response.into_response()
        }
        Err(err) => {
            state.metrics.token_request(err.error);
            err.into_response()
        }
    }
}

pub async fn health() -> &'static str {
    "ok"
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(response) => response,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}
