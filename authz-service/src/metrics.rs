use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct AuthMetrics {
    registry: Registry,
    auth_attempts: IntCounterVec,
    token_requests: IntCounterVec,
    key_rotations: IntCounterVec,
}

impl AuthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let auth_attempts = IntCounterVec::new(
            Opts::new(
                "authz_auth_attempts_total",
                "Count of authentication attempts grouped by method and outcome",
            ),
            &["method", "outcome"],
        )?;
        registry.register(Box::new(auth_attempts.clone()))?;

        let token_requests = IntCounterVec::new(
            Opts::new(
                "authz_token_requests_total",
                "Count of OAuth2 token requests grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(token_requests.clone()))?;

        let key_rotations = IntCounterVec::new(
            Opts::new(
                "authz_key_rotations_total",
                "Count of signing-key rotations grouped by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(key_rotations.clone()))?;

        Ok(Self {
            registry,
            auth_attempts,
            token_requests,
            key_rotations,
        })
    }

    pub fn auth_attempt(&self, method: &str, outcome: &str) {
        self.auth_attempts
            .with_label_values(&[method, outcome])
            .inc();
    }

    pub fn token_request(&self, outcome: &str) {
        self.token_requests.with_label_values(&[outcome]).inc();
    }

    pub fn key_rotation(&self, outcome: &str) {
        self.key_rotations.with_label_values(&[outcome]).inc();
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
