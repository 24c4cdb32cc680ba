use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts};

use crate::claims::Claims;
use crate::error::{AuthError, AuthResult};
use crate::principal::Principal;

/// Header carrying an API-key credential. Presence of this header selects
/// the API-key authentication path regardless of any Authorization header.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Extract the token from an `Authorization` header. The value must be
/// exactly two tokens, the first being the literal `Bearer` (case-sensitive),
/// the second non-empty.
pub fn parse_bearer(value: &axum::http::HeaderValue) -> AuthResult<String> {
    let raw = value.to_str().map_err(|_| AuthError::InvalidAuthorization)?;

    let mut parts = raw.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthorization)?;
    let token = parts.next().ok_or(AuthError::InvalidAuthorization)?;
    if scheme != "Bearer" || token.is_empty() || parts.next().is_some() {
        return Err(AuthError::InvalidAuthorization);
    }

    Ok(token.to_owned())
}

/// Pull the bearer token out of request parts without verifying it.
pub fn bearer_from_parts(parts: &Parts) -> AuthResult<String> {
    let header_value = parts
        .headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingCredentials)?;
    parse_bearer(header_value)
}

/// The authenticated view of a request, populated by the authentication
/// middleware: always a Principal, plus the verified claims on the bearer
/// path.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: Principal,
    pub claims: Option<Claims>,
}

impl AuthContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.principal.has_role(role)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AuthError::MissingCredentials)
    }
}

/// Optional-mode variant: requests admitted without credentials extract
/// `None` instead of being rejected.
#[derive(Debug, Clone)]
pub struct MaybeAuthContext(pub Option<AuthContext>);

#[async_trait]
impl<S> FromRequestParts<S> for MaybeAuthContext
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<AuthContext>().cloned()))
    }
}
