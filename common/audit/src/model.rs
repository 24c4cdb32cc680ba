use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The lifecycle moments the audit stream records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CredentialCreated,
    CredentialValidated,
    CredentialRevoked,
    TokenIssued,
    TokenRefreshed,
    TokenRevoked,
    LoginSuccess,
    LoginFailure,
    RateLimitExceeded,
    PermissionDenied,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::CredentialCreated => "credential_created",
            AuditEventType::CredentialValidated => "credential_validated",
            AuditEventType::CredentialRevoked => "credential_revoked",
            AuditEventType::TokenIssued => "token_issued",
            AuditEventType::TokenRefreshed => "token_refreshed",
            AuditEventType::TokenRevoked => "token_revoked",
            AuditEventType::LoginSuccess => "login_success",
            AuditEventType::LoginFailure => "login_failure",
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
            AuditEventType::PermissionDenied => "permission_denied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResultKind {
    Success,
    Failure,
    Error,
}

impl AuditResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResultKind::Success => "success",
            AuditResultKind::Failure => "failure",
            AuditResultKind::Error => "error",
        }
    }
}

/// One append-only audit record. The credential prefix identifies a
/// credential without disclosing it; no field ever carries plaintext or hash
/// material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub subject_id: String,
    pub tenant_id: String,
    pub credential_prefix: Option<String>,
    pub result: AuditResultKind,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        subject_id: impl Into<String>,
        tenant_id: impl Into<String>,
        result: AuditResultKind,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event_type,
            subject_id: subject_id.into(),
            tenant_id: tenant_id.into(),
            credential_prefix: None,
            result,
            ip_address: None,
            user_agent: None,
            details: None,
            error_message: None,
        }
    }

    pub fn with_credential_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.credential_prefix = Some(prefix.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit writer not running")]
    NotRunning,
    #[error("audit queue full; event dropped")]
    QueueFull,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("database error: {0}")]
    Database(String),
}

pub type AuditResult<T> = Result<T, AuditError>;
