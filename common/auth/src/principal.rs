use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Discriminator for the authenticated-entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalType {
    Agent,
    User,
    Service,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::Agent => "agent",
            PrincipalType::User => "user",
            PrincipalType::Service => "service",
        }
    }
}

/// The authenticated-entity view attached to a request after successful
/// authentication. Created once per request and treated as immutable for the
/// request's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(rename = "type")]
    pub principal_type: PrincipalType,
    pub tenant_id: String,
    pub roles: Vec<String>,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|value| value == role)
    }

    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|role| self.has_role(role))
    }

    /// True when any granted scope covers `required`.
    pub fn has_scope(&self, required: &str) -> bool {
        self.scopes
            .iter()
            .any(|granted| scope_matches(granted, required))
    }
}

/// Scope matching rules: `*` grants everything; an exact grant matches
/// itself; `action:*` matches `action:anything` and the bare `action` (a
/// wildcard grant that excluded its own bare action would make `x` and `x:*`
/// disjoint in surprising ways).
pub fn scope_matches(granted: &str, required: &str) -> bool {
    if granted == "*" || granted == required {
        return true;
    }
    if let Some(prefix) = granted.strip_suffix(":*") {
        return required == prefix || required.starts_with(&format!("{prefix}:"));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal_with_scopes(scopes: &[&str]) -> Principal {
        Principal {
            id: "agent-1".to_string(),
            principal_type: PrincipalType::Agent,
            tenant_id: "tenant-1".to_string(),
            roles: vec!["operator".to_string()],
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            attributes: Map::new(),
        }
    }

    #[test]
    fn star_grants_everything() {
        let p = principal_with_scopes(&["*"]);
        assert!(p.has_scope("read:orders"));
        assert!(p.has_scope("deploy"));
    }

    #[test]
    fn wildcard_covers_prefix_and_bare_action() {
        assert!(scope_matches("deploy:*", "deploy:prod"));
        assert!(scope_matches("deploy:*", "deploy"));
        assert!(!scope_matches("deploy:*", "deployment"));
        assert!(!scope_matches("deploy:*", "read:orders"));
    }

    #[test]
    fn exact_match_only_without_wildcard() {
        let p = principal_with_scopes(&["read:orders"]);
        assert!(p.has_scope("read:orders"));
        assert!(!p.has_scope("read:invoices"));
        assert!(!p.has_scope("read"));
    }

    #[test]
    fn role_checks() {
        let p = principal_with_scopes(&[]);
        assert!(p.has_role("operator"));
        assert!(!p.has_role("admin"));
        assert!(p.has_any_role(&["admin", "operator"]));
        assert!(!p.has_any_role(&["admin", "auditor"]));
    }
}
