/// Runtime configuration for JWT verification.
///
/// Every claim check can be disabled individually so tests can exercise one
/// rule at a time; production deployments keep them all on.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Expected issuer claim (iss).
    pub issuer: String,
    /// Expected audience claim (aud).
    pub audience: String,
    /// Allowable clock skew in seconds when validating exp/nbf.
    pub leeway_seconds: u32,
    pub validate_issuer: bool,
    pub validate_audience: bool,
    pub validate_expiry: bool,
    pub validate_not_before: bool,
    pub validate_issued_at: bool,
    /// Require a non-empty jti claim (the revocation identity).
    pub require_jti: bool,
    /// Reject tokens whose agent_status claim is present and not "active".
    pub check_agent_status: bool,
    /// Deny when the revocation store cannot be reached. Default is to log
    /// and continue (availability over strictness).
    pub revocation_fail_closed: bool,
}

impl JwtConfig {
    /// Construct config with all checks enabled and a 30 second leeway.
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            leeway_seconds: 30,
            validate_issuer: true,
            validate_audience: true,
            validate_expiry: true,
            validate_not_before: true,
            validate_issued_at: true,
            require_jti: true,
            check_agent_status: true,
            revocation_fail_closed: false,
        }
    }

    /// Adjust the allowed leeway.
    pub fn with_leeway(mut self, seconds: u32) -> Self {
        self.leeway_seconds = seconds;
        self
    }

    pub fn with_revocation_fail_closed(mut self, enabled: bool) -> Self {
        self.revocation_fail_closed = enabled;
        self
    }
}
