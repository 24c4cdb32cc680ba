use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method};
use axum::routing::{any, get, post};
use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};

use crate::app::AppState;
use crate::handlers::{
    create_api_key, delete_api_key, expire_signing_keys, get_api_key, health, jwks_document,
    list_api_keys, list_signing_keys, metrics_endpoint, rotate_api_key, rotate_signing_keys,
    token_endpoint,
};
use crate::middleware::authenticate;

/// Assemble the HTTP surface. Everything under `/v1/auth/` except the JWKS
/// document goes through the authentication middleware; the token endpoint
/// and the JWKS document are reachable with no credentials.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/auth/keys/rotate", post(rotate_signing_keys))
        .route("/v1/auth/keys/expire", post(expire_signing_keys))
        .route("/v1/auth/keys", get(list_signing_keys))
        .route("/v1/auth/apikeys", post(create_api_key).get(list_api_keys))
        .route(
            "/v1/auth/apikeys/:id",
            get(get_api_key).delete(delete_api_key),
        )
        .route("/v1/auth/apikeys/:id/rotate", post(rotate_api_key))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            authenticate,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
        ]);

    Router::new()
        .merge(protected)
        // Any-method so non-POST requests get the RFC 6749 error body.
        .route("/v1/oauth/token", any(token_endpoint))
        .route("/v1/auth/.well-known/jwks.json", get(jwks_document))
        .route("/healthz", get(health))
        .route("/metrics", get(metrics_endpoint))
        .layer(cors)
        .with_state(state)
}
