use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AuthError, AuthResult};
use crate::principal::{Principal, PrincipalType};

/// Application-focused representation of verified JWT claims.
#[derive(Debug, Clone, Serialize)]
pub struct Claims {
    pub subject: String,
    pub tenant_id: String,
    pub roles: Vec<String>,
    pub scopes: Vec<String>,
    pub jti: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub issuer: String,
    pub audience: Vec<String>,
    pub agent_status: Option<String>,
    pub raw: Value,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|value| value == role)
    }

    /// Derive the request Principal. The token's `type` claim selects the
    /// principal kind; bearer tokens without one authenticate services.
    pub fn to_principal(&self) -> Principal {
        let principal_type = match self
            .raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("service")
        {
            "agent" => PrincipalType::Agent,
            "user" => PrincipalType::User,
            _ => PrincipalType::Service,
        };

        let mut attributes = Map::new();
        attributes.insert("auth_method".to_string(), Value::from("jwt"));
        if let Some(jti) = &self.jti {
            attributes.insert("jti".to_string(), Value::from(jti.clone()));
        }

        Principal {
            id: self.subject.clone(),
            principal_type,
            tenant_id: self.tenant_id.clone(),
            roles: self.roles.clone(),
            scopes: self.scopes.clone(),
            attributes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClaimsRepr {
    sub: String,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    scopes: Option<Vec<String>>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    jti: Option<String>,
    exp: i64,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
    iss: String,
    #[serde(default)]
    aud: Option<AudienceRepr>,
    #[serde(default)]
    agent_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AudienceRepr {
    Single(String),
    Many(Vec<String>),
}

impl TryFrom<ClaimsRepr> for Claims {
    type Error = AuthError;

    fn try_from(value: ClaimsRepr) -> AuthResult<Self> {
        let expires_at = timestamp(value.exp, "exp")?;
        let issued_at = value.iat.map(|iat| timestamp(iat, "iat")).transpose()?;
        let not_before = value.nbf.map(|nbf| timestamp(nbf, "nbf")).transpose()?;

        // `scopes` array wins; otherwise split the space-delimited `scope`.
        let scopes = match value.scopes {
            Some(scopes) => scopes,
            None => value
                .scope
                .as_deref()
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_owned)
                .collect(),
        };

        let audience = match value.aud {
            Some(AudienceRepr::Single(item)) => vec![item],
            Some(AudienceRepr::Many(items)) => items,
            None => Vec::new(),
        };

        Ok(Self {
            subject: value.sub,
            tenant_id: value.tenant_id.unwrap_or_default(),
            roles: value.roles,
            scopes,
            jti: value.jti,
            expires_at,
            issued_at,
            not_before,
            issuer: value.iss,
            audience,
            agent_status: value.agent_status,
            raw: Value::Null,
        })
    }
}

impl TryFrom<Value> for Claims {
    type Error = AuthError;

    fn try_from(value: Value) -> AuthResult<Self> {
        let repr: ClaimsRepr = serde_json::from_value(value.clone())
            .map_err(|err| AuthError::InvalidJson(err.to_string()))?;
        let mut claims = Claims::try_from(repr)?;
        claims.raw = value;
        Ok(claims)
    }
}

fn timestamp(value: i64, claim: &'static str) -> AuthResult<DateTime<Utc>> {
    Utc.timestamp_opt(value, 0)
        .single()
        .ok_or_else(|| AuthError::InvalidClaim(claim, value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_string_is_split_when_scopes_array_absent() {
        let claims = Claims::try_from(json!({
            "sub": "client-1",
            "tenant_id": "tenant-1",
            "iss": "authz",
            "exp": 4_102_444_800i64,
            "scope": "read write"
        }))
        .expect("claims");
        assert_eq!(claims.scopes, vec!["read", "write"]);
    }

    #[test]
    fn scopes_array_wins_over_scope_string() {
        let claims = Claims::try_from(json!({
            "sub": "client-1",
            "iss": "authz",
            "exp": 4_102_444_800i64,
            "scopes": ["admin"],
            "scope": "read write"
        }))
        .expect("claims");
        assert_eq!(claims.scopes, vec!["admin"]);
    }

    #[test]
    fn principal_carries_subject_tenant_and_jti() {
        let claims = Claims::try_from(json!({
            "sub": "client-1",
            "tenant_id": "tenant-9",
            "iss": "authz",
            "exp": 4_102_444_800i64,
            "jti": "token-1",
            "roles": ["auditor"],
            "scope": "read"
        }))
        .expect("claims");
        let principal = claims.to_principal();
        assert_eq!(principal.id, "client-1");
        assert_eq!(principal.tenant_id, "tenant-9");
        assert_eq!(principal.roles, vec!["auditor"]);
        assert_eq!(
            principal.attributes.get("jti").and_then(|v| v.as_str()),
            Some("token-1")
        );
        assert_eq!(
            principal
                .attributes
                .get("auth_method")
                .and_then(|v| v.as_str()),
            Some("jwt")
        );
    }

    #[test]
    fn audience_accepts_single_and_many() {
        let single = Claims::try_from(json!({
            "sub": "s", "iss": "i", "exp": 4_102_444_800i64, "aud": "svc"
        }))
        .expect("claims");
        assert_eq!(single.audience, vec!["svc"]);

        let many = Claims::try_from(json!({
            "sub": "s", "iss": "i", "exp": 4_102_444_800i64, "aud": ["a", "b"]
        }))
        .expect("claims");
        assert_eq!(many.audience, vec!["a", "b"]);
    }
}
