use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_auth::{parse_bearer, AuthContext, AuthError, API_KEY_HEADER};
use serde_json::json;

use crate::api_keys::ApiKeyError;
use crate::app::AppState;
use crate::store::StoreError;

/// Single entry point for request authentication. `X-API-Key` selects the
/// API-key path; otherwise the Authorization header must carry a bearer
/// token. On success an AuthContext lands in request extensions.
///
/// Optional mode admits requests with no credentials at all; presented but
/// malformed credentials are still rejected.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(value) = request.headers().get(API_KEY_HEADER) {
        let Ok(presented) = value.to_str() else {
            state.metrics.auth_attempt("api_key", "failure");
            return api_key_error_response(&ApiKeyError::InvalidFormat);
        };
        return match state.api_keys.validate(presented).await {
            Ok(principal) => {
                state.metrics.auth_attempt("api_key", "success");
                request.extensions_mut().insert(AuthContext {
                    principal,
                    claims: None,
                });
                next.run(request).await
            }
            Err(err) => {
                state.metrics.auth_attempt("api_key", "failure");
                api_key_error_response(&err)
            }
        };
    }

    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        let token = match parse_bearer(value) {
            Ok(token) => token,
            Err(err) => {
                state.metrics.auth_attempt("bearer", "failure");
                return err.into_response();
            }
        };
        return match state.verifier.validate(&token).await {
            Ok(verified) => {
                state.metrics.auth_attempt("bearer", "success");
                request.extensions_mut().insert(AuthContext {
                    principal: verified.principal,
                    claims: Some(verified.claims),
                });
                next.run(request).await
            }
            Err(err) => {
                state.metrics.auth_attempt("bearer", "failure");
                err.into_response()
            }
        };
    }

    if state.config.optional_auth {
        return next.run(request).await;
    }
    AuthError::MissingCredentials.into_response()
}

/// Translate API-key failures into the middleware's wire contract: 401 with
/// `WWW-Authenticate: Bearer` and a machine-readable code, 429 for rate
/// limiting, 503 when the store is down.
pub fn api_key_error_response(err: &ApiKeyError) -> Response {
    let status = match err {
        ApiKeyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ApiKeyError::Validation(_) => StatusCode::BAD_REQUEST,
        ApiKeyError::Store(StoreError::NotFound) => StatusCode::UNAUTHORIZED,
        ApiKeyError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNAUTHORIZED,
    };

    let body = json!({
        "error": err.code(),
        "message": err.to_string(),
    });
    let mut response = (status, Json(body)).into_response();
    if status == StatusCode::UNAUTHORIZED {
        response.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Bearer"),
        );
    }
    if matches!(err, ApiKeyError::RateLimited { .. }) {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
    }
    response
}
