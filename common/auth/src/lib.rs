pub mod claims;
pub mod config;
pub mod error;
pub mod extractors;
pub mod guards;
pub mod jwks;
pub mod principal;
pub mod verifier;

pub use claims::Claims;
pub use config::JwtConfig;
pub use error::{AuthError, AuthResult};
pub use extractors::{bearer_from_parts, parse_bearer, AuthContext, MaybeAuthContext, API_KEY_HEADER};
pub use guards::{require_any_role, require_role, GuardError};
pub use jwks::{JwksClient, JwksFetcher};
pub use principal::{scope_matches, Principal, PrincipalType};
pub use verifier::{
    InMemoryKeyStore, JwtVerifier, JwtVerifierBuilder, RevocationCheck, RevocationCheckError,
    VerifiedToken,
};
