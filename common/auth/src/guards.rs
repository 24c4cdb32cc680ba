use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::principal::Principal;

/// Role-gating failures. Missing authentication is a 401; an authenticated
/// principal lacking the role is a 403.
#[derive(Debug, Clone)]
pub enum GuardError {
    Unauthenticated,
    Forbidden { required: Vec<String> },
}

#[derive(Debug, Serialize)]
struct GuardBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            GuardError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "missing_credentials",
                "Authentication required".to_string(),
            ),
            GuardError::Forbidden { required } => (
                StatusCode::FORBIDDEN,
                "insufficient_role",
                if required.is_empty() {
                    "Insufficient role".to_string()
                } else {
                    format!("Insufficient role. Required one of: {}", required.join(", "))
                },
            ),
        };
        (status, Json(GuardBody { error, message })).into_response()
    }
}

pub fn require_role(principal: Option<&Principal>, role: &str) -> Result<(), GuardError> {
    require_any_role(principal, &[role])
}

pub fn require_any_role(principal: Option<&Principal>, allowed: &[&str]) -> Result<(), GuardError> {
    let principal = principal.ok_or(GuardError::Unauthenticated)?;
    if allowed.is_empty() || principal.has_any_role(allowed) {
        Ok(())
    } else {
        Err(GuardError::Forbidden {
            required: allowed.iter().map(|value| value.to_string()).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::PrincipalType;
    use serde_json::Map;

    fn operator() -> Principal {
        Principal {
            id: "agent-1".to_string(),
            principal_type: PrincipalType::Agent,
            tenant_id: "tenant-1".to_string(),
            roles: vec!["operator".to_string()],
            scopes: Vec::new(),
            attributes: Map::new(),
        }
    }

    #[test]
    fn missing_principal_is_unauthenticated() {
        assert!(matches!(
            require_role(None, "operator"),
            Err(GuardError::Unauthenticated)
        ));
    }

    #[test]
    fn wrong_role_is_forbidden() {
        let p = operator();
        assert!(matches!(
            require_role(Some(&p), "admin"),
            Err(GuardError::Forbidden { .. })
        ));
    }

    #[test]
    fn any_role_admits_on_first_match() {
        let p = operator();
        assert!(require_any_role(Some(&p), &["admin", "operator"]).is_ok());
    }
}
