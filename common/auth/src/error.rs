use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

/// Typed authentication failures. Messages never contain token material,
/// hashes, or key bytes; the kid is the only identifier that may surface.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization header missing")]
    MissingCredentials,
    #[error("authorization header malformed")]
    InvalidAuthorization,
    #[error("failed to decode token header: {0}")]
    InvalidHeader(String),
    #[error("token algorithm '{0}' is not accepted")]
    UnsupportedAlgorithm(String),
    #[error("token missing kid header")]
    MissingKeyId,
    #[error("no verification key available for kid '{0}'")]
    UnknownKeyId(String),
    #[error("token signature verification failed")]
    SignatureInvalid,
    #[error("token has expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
    #[error("token has been revoked")]
    Revoked,
    #[error("revocation store unavailable: {0}")]
    RevocationUnavailable(String),
    #[error("agent is not active (status '{0}')")]
    AgentInactive(String),
    #[error("invalid claim '{0}' with value '{1}'")]
    InvalidClaim(&'static str, String),
    #[error("malformed claim payload: {0}")]
    InvalidJson(String),
    #[error("token verification failed: {0}")]
    Verification(String),
    #[error("failed to parse decoding key for kid '{0}': {1}")]
    KeyParse(String, String),
    #[error("failed to fetch JWKS: {0}")]
    JwksFetch(String),
    #[error("failed to parse JWKS response: {0}")]
    JwksDecode(String),
    #[error("JWKS entry missing key id (kid)")]
    JwksMissingKid,
    #[error("JWKS key '{0}' missing required RSA components")]
    JwksMissingComponents(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match value.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidSignature => Self::SignatureInvalid,
            ErrorKind::InvalidIssuer => Self::InvalidClaim("iss", "mismatch".to_string()),
            ErrorKind::InvalidAudience => Self::InvalidClaim("aud", "mismatch".to_string()),
            ErrorKind::InvalidAlgorithm => Self::UnsupportedAlgorithm("unexpected".to_string()),
            _ => Self::Verification(value.to_string()),
        }
    }
}

impl AuthError {
    /// Machine-readable code for the response body. Expired and revoked get
    /// distinct codes so clients know whether to refresh or re-authenticate.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingCredentials => "missing_credentials",
            AuthError::InvalidAuthorization | AuthError::InvalidHeader(_) => "invalid_credentials",
            AuthError::Expired => "token_expired",
            AuthError::NotYetValid => "token_not_yet_valid",
            AuthError::Revoked => "token_revoked",
            AuthError::AgentInactive(_) => "agent_inactive",
            // Unknown kid is indistinguishable from a bad signature to callers.
            AuthError::UnsupportedAlgorithm(_)
            | AuthError::MissingKeyId
            | AuthError::UnknownKeyId(_)
            | AuthError::SignatureInvalid => "signature_invalid",
            AuthError::InvalidClaim(_, _) | AuthError::InvalidJson(_) | AuthError::Verification(_) => {
                "invalid_token"
            }
            AuthError::RevocationUnavailable(_) => "revocation_unavailable",
            AuthError::KeyParse(_, _)
            | AuthError::JwksFetch(_)
            | AuthError::JwksDecode(_)
            | AuthError::JwksMissingKid
            | AuthError::JwksMissingComponents(_) => "key_infrastructure",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::RevocationUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::KeyParse(_, _)
            | AuthError::JwksFetch(_)
            | AuthError::JwksDecode(_)
            | AuthError::JwksMissingKid
            | AuthError::JwksMissingComponents(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}
