mod support;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use authz_service::rate_limit::{
    RateDecision, RateLimitError, RateLimiterEngine, UnavailableRateLimiter,
};
use support::{harness, harness_with, seed_client, HarnessOptions, AUDIENCE, ISSUER, TENANT};

/// Counts per id without ever resetting, so rate-limit outcomes do not
/// depend on where the one-second window boundary falls during a slow
/// (argon2-bound) test run. Window semantics are covered by the limiter's
/// own unit tests.
#[derive(Default)]
struct CountingLimiter {
    counts: Mutex<HashMap<String, i64>>,
}

#[async_trait]
impl RateLimiterEngine for CountingLimiter {
    async fn allow(&self, id: &str, limit: i32) -> Result<RateDecision, RateLimitError> {
        let mut guard = self.counts.lock().expect("mutex poisoned");
        let current = guard.entry(id.to_string()).or_insert(0);
        *current += 1;
        Ok(RateDecision {
            allowed: *current <= limit as i64,
            current: *current,
            limit,
        })
    }

    async fn count(&self, id: &str) -> Result<i64, RateLimitError> {
        Ok(*self
            .counts
            .lock()
            .expect("mutex poisoned")
            .get(id)
            .unwrap_or(&0))
    }

    async fn reset(&self, id: &str) -> Result<(), RateLimitError> {
        self.counts.lock().expect("mutex poisoned").remove(id);
        Ok(())
    }
}

fn form_request(body: String) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/v1/oauth/token")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .expect("request")
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn client_credentials_happy_path() {
    let h = harness().await;
    let (client_id, secret) = seed_client(&h, &["read", "write"]).await;

    let response = h
        .app
        .clone()
        .oneshot(form_request(format!(
            "grant_type=client_credentials&client_id={client_id}&client_secret={secret}&scope=read"
        )))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok()),
        Some("no-store")
    );
    assert_eq!(
        response
            .headers()
            .get(header::PRAGMA)
            .and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );

    let body = response_json(response).await;
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["scope"], "read");
    assert!(body["expires_in"].as_i64().unwrap() > 0);

    // The token must verify under an active signing key, via the kid header.
    let token = body["access_token"].as_str().expect("access_token");
    let verified = h.state.verifier.validate(token).await.expect("verify");
    assert_eq!(verified.principal.id, client_id.to_string());
    assert_eq!(verified.principal.tenant_id, TENANT);
    assert_eq!(verified.principal.scopes, vec!["read"]);
    assert_eq!(verified.claims.issuer, ISSUER);
    assert!(verified.claims.audience.contains(&AUDIENCE.to_string()));

    let kid = jsonwebtoken::decode_header(token)
        .expect("header")
        .kid
        .expect("kid");
    let active = h.signing.get_all_active().await.expect("active keys");
    assert!(active.iter().any(|record| record.kid == kid));
}

#[tokio::test]
async fn empty_scope_grants_everything_the_client_holds() {
    let h = harness().await;
    let (client_id, secret) = seed_client(&h, &["read", "write"]).await;

    let response = h
        .app
        .clone()
        .oneshot(form_request(format!(
            "grant_type=client_credentials&client_id={client_id}&client_secret={secret}"
        )))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["scope"], "read write");
}

#[tokio::test]
async fn json_bodies_are_accepted() {
    let h = harness().await;
    let (client_id, secret) = seed_client(&h, &["read"]).await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/oauth/token")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "grant_type": "client_credentials",
                "client_id": client_id.to_string(),
                "client_secret": secret,
                "scope": "read",
            })
            .to_string(),
        ))
        .expect("request");

    let response = h.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn wrong_grant_type_is_unsupported() {
    let h = harness().await;
    let (client_id, secret) = seed_client(&h, &["read"]).await;

    let response = h
        .app
        .clone()
        .oneshot(form_request(format!(
            "grant_type=password&client_id={client_id}&client_secret={secret}"
        )))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn missing_credentials_are_invalid_request() {
    let h = harness().await;

    let response = h
        .app
        .clone()
        .oneshot(form_request(
            "grant_type=client_credentials&client_id=".to_string(),
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn unknown_revoked_and_wrong_secret_collapse_to_invalid_client() {
    let h = harness().await;
    let (client_id, secret) = seed_client(&h, &["read"]).await;

    // Unknown client id.
    let response = h
        .app
        .clone()
        .oneshot(form_request(format!(
            "grant_type=client_credentials&client_id={}&client_secret={secret}",
            uuid::Uuid::new_v4()
        )))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response_json(response).await["error"], "invalid_client");

    // Malformed client id parses to the same answer.
    let response = h
        .app
        .clone()
        .oneshot(form_request(format!(
            "grant_type=client_credentials&client_id=not-a-uuid&client_secret={secret}"
        )))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response_json(response).await["error"], "invalid_client");

    // Wrong secret.
    let response = h
        .app
        .clone()
        .oneshot(form_request(format!(
            "grant_type=client_credentials&client_id={client_id}&client_secret=wrong"
        )))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response_json(response).await["error"], "invalid_client");
}

#[tokio::test]
async fn scopes_outside_the_grant_are_rejected() {
    let h = harness().await;
    let (client_id, secret) = seed_client(&h, &["read"]).await;

    let response = h
        .app
        .clone()
        .oneshot(form_request(format!(
            "grant_type=client_credentials&client_id={client_id}&client_secret={secret}&scope=read%20admin"
        )))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"], "invalid_scope");
}

#[tokio::test]
async fn per_client_rate_limit_returns_429() {
    let h = harness_with(HarnessOptions {
        rate_limit_per_client: 2,
        limiter: Some(Arc::new(CountingLimiter::default())),
        ..HarnessOptions::default()
    })
    .await;
    let (client_id, secret) = seed_client(&h, &["read"]).await;

    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(form_request(format!(
                "grant_type=client_credentials&client_id={client_id}&client_secret={secret}&scope=read"
            )))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = h
        .app
        .clone()
        .oneshot(form_request(format!(
            "grant_type=client_credentials&client_id={client_id}&client_secret={secret}&scope=read"
        )))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
        Some("1")
    );
    let body = response_json(response).await;
    assert_eq!(body["error"], "invalid_request");
    assert!(body["error_description"]
        .as_str()
        .unwrap()
        .contains("rate limit"));
}

#[tokio::test]
async fn token_endpoint_fails_closed_when_limiter_is_down() {
    let h = harness_with(HarnessOptions {
        limiter: Some(Arc::new(UnavailableRateLimiter)),
        ..HarnessOptions::default()
    })
    .await;
    let (client_id, secret) = seed_client(&h, &["read"]).await;

    let response = h
        .app
        .clone()
        .oneshot(form_request(format!(
            "grant_type=client_credentials&client_id={client_id}&client_secret={secret}"
        )))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn non_post_methods_get_the_oauth_error_shape() {
    let h = harness().await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/v1/oauth/token")
        .body(Body::empty())
        .expect("request");
    let response = h.app.clone().oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    let body = response_json(response).await;
    assert_eq!(body["error"], "invalid_request");
}
