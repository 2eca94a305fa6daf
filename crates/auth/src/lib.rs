//! `scribe-auth`: identity verification and job access policy.
//!
//! This crate is intentionally decoupled from HTTP and storage: it turns a
//! bearer credential into a verified [`Identity`] and answers "may this
//! identity see that job?".

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod roles;

pub use authorize::{AuthzError, Identity, authorize_job_access};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtValidator, TokenError};
pub use roles::Role;
