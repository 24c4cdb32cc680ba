mod support;

use authz_service::jwk::jwk_from_record;
use authz_service::oauth::TokenRequest;
use authz_service::store::KeyStatus;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use chrono::Duration;
use common_auth::AuthError;
use http_body_util::BodyExt;
use jsonwebtoken::DecodingKey;
use serde_json::Value;
use tower::ServiceExt;

use support::{harness, harness_with, seed_client, HarnessOptions};

async fn issue_token(h: &support::Harness, client_id: uuid::Uuid, secret: &str) -> String {
    let response = h
        .state
        .oauth
        .issue(TokenRequest {
            grant_type: Some("client_credentials".to_string()),
            client_id: Some(client_id.to_string()),
            client_secret: Some(secret.to_string()),
            scope: None,
        })
        .await
        .expect("issue token");
    response.access_token
}

#[tokio::test]
async fn tokens_survive_rotation_through_the_grace_period() {
    let h = harness().await;
    let (client_id, secret) = seed_client(&h, &["read"]).await;

    let token_before = issue_token(&h, client_id, &secret).await;
    h.signing.rotate().await.expect("rotate");
    let token_after = issue_token(&h, client_id, &secret).await;

    // Both the pre-rotation and post-rotation tokens verify: the old key is
    // in grace, the new key is the current signer.
    assert!(h.state.verifier.validate(&token_before).await.is_ok());
    assert!(h.state.verifier.validate(&token_after).await.is_ok());

    let kid_before = jsonwebtoken::decode_header(&token_before)
        .expect("header")
        .kid
        .expect("kid");
    let kid_after = jsonwebtoken::decode_header(&token_after)
        .expect("header")
        .kid
        .expect("kid");
    assert_ne!(kid_before, kid_after);

    let active = h.signing.get_all_active().await.expect("active");
    assert_eq!(active.len(), 2);
}

#[tokio::test]
async fn expired_grace_invalidates_old_tokens_only() {
    // Zero grace: superseded keys leave the active set immediately.
    let h = harness_with(HarnessOptions {
        grace: Duration::zero(),
        ..HarnessOptions::default()
    })
    .await;
    let (client_id, secret) = seed_client(&h, &["read"]).await;

    let token_before = issue_token(&h, client_id, &secret).await;
    h.signing.rotate().await.expect("rotate");
    let token_after = issue_token(&h, client_id, &secret).await;

    let err = h
        .state
        .verifier
        .validate(&token_before)
        .await
        .expect_err("old token must fail");
    assert!(matches!(err, AuthError::UnknownKeyId(_)));
    assert_eq!(err.code(), "signature_invalid");

    assert!(h.state.verifier.validate(&token_after).await.is_ok());

    let expired = h.signing.expire_old().await.expect("expire");
    assert_eq!(expired, 1);
}

#[tokio::test]
async fn rotation_never_leaves_zero_active_keys() {
    let h = harness().await;
    for _ in 0..3 {
        h.signing.rotate().await.expect("rotate");
        let active = h.signing.get_all_active().await.expect("active");
        assert!(!active.is_empty());
        // Exactly one key has no expiry: the current signer.
        let unexpiring = active
            .iter()
            .filter(|record| record.expires_at.is_none())
            .count();
        assert_eq!(unexpiring, 1);
    }
}

#[tokio::test]
async fn generated_keys_are_sealed_and_pending() {
    let h = harness().await;
    let record = h.signing.generate().await.expect("generate");

    assert_eq!(record.status, KeyStatus::Pending);
    assert_eq!(record.algorithm, "RS256");
    assert!(record.activated_at.is_none());
    // The stored private half is ciphertext, not PEM.
    assert!(!record.private_key_enc.contains("PRIVATE KEY"));
    assert!(record.public_key_pem.contains("BEGIN PUBLIC KEY"));
}

#[tokio::test]
async fn revoked_jti_is_rejected_until_reclaimed() {
    let h = harness().await;
    let (client_id, secret) = seed_client(&h, &["read"]).await;
    let token = issue_token(&h, client_id, &secret).await;

    let verified = h.state.verifier.validate(&token).await.expect("validate");
    let jti = verified.claims.jti.expect("jti");
    let expires_at = verified.claims.expires_at;

    use authz_service::revocation::RevocationStore;
    h.revocation
        .revoke(&jti, expires_at)
        .await
        .expect("revoke");

    let err = h
        .state
        .verifier
        .validate(&token)
        .await
        .expect_err("revoked token");
    assert!(matches!(err, AuthError::Revoked));
}

#[tokio::test]
async fn jwks_document_round_trips_active_keys() {
    let h = harness().await;
    h.signing.rotate().await.expect("rotate");

    let request = Request::builder()
        .method(Method::GET)
        .uri("/v1/auth/.well-known/jwks.json")
        .body(Body::empty())
        .expect("request");
    let response = h.app.clone().oneshot(request).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok()),
        Some("public, max-age=3600")
    );

    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect")
        .to_bytes();
    let body: Value = serde_json::from_slice(&bytes).expect("json");
    let keys = body["keys"].as_array().expect("keys array");
    assert_eq!(keys.len(), 2);

    let active = h.signing.get_all_active().await.expect("active");
    for entry in keys {
        assert_eq!(entry["kty"], "RSA");
        assert_eq!(entry["use"], "sig");
        assert_eq!(entry["alg"], "RS256");
        let kid = entry["kid"].as_str().expect("kid");
        let n = entry["n"].as_str().expect("n");
        let e = entry["e"].as_str().expect("e");
        assert!(!n.is_empty() && !e.is_empty());

        // Published components parse back into a decoding key, and match a
        // fresh conversion of the same record byte for byte.
        assert!(DecodingKey::from_rsa_components(n, e).is_ok());
        let record = active
            .iter()
            .find(|record| record.kid == kid)
            .expect("record for kid");
        let rebuilt = jwk_from_record(record).expect("jwk");
        assert_eq!(rebuilt.n, n);
        assert_eq!(rebuilt.e, e);
    }
}
