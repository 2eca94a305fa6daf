//! Bearer credential verification.
//!
//! Tokens are HS256-signed JWTs carrying [`JwtClaims`]. Signature checks are
//! delegated to `jsonwebtoken`; the time window is checked by
//! [`validate_claims`] against an explicit `now`, which keeps verification
//! deterministic in tests.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use thiserror::Error;

use crate::claims::{JwtClaims, TokenValidationError, validate_claims};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed or unsigned token: {0}")]
    Decode(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Claims(#[from] TokenValidationError),
}

/// Identity verifier: credential → verified claims.
pub trait JwtValidator: Send + Sync {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, TokenError>;
}

/// Shared-secret (HS256) validator.
pub struct Hs256JwtValidator {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl Hs256JwtValidator {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();

        // Expiry lives in our own claim names; `validate_claims` checks it.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation,
        }
    }

    /// Sign claims with the same secret (dev tooling and tests).
    pub fn issue(&self, claims: &JwtClaims) -> Result<String, TokenError> {
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &self.encoding,
        )?)
    }
}

impl core::fmt::Debug for Hs256JwtValidator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hs256JwtValidator").finish_non_exhaustive()
    }
}

impl JwtValidator for Hs256JwtValidator {
    fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<JwtClaims, TokenError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.decoding, &self.validation)?;
        validate_claims(&data.claims, now)?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use chrono::Duration;
    use scribe_core::{TenantId, UserId};

    fn claims() -> JwtClaims {
        let now = Utc::now();
        JwtClaims {
            sub: UserId::new(),
            tenant_id: TenantId::new(),
            roles: vec![Role::USER],
            issued_at: now - Duration::seconds(5),
            expires_at: now + Duration::minutes(10),
        }
    }

    #[test]
    fn issued_token_validates() {
        let validator = Hs256JwtValidator::new("secret");
        let claims = claims();
        let token = validator.issue(&claims).unwrap();

        let decoded = validator.validate(&token, Utc::now()).unwrap();
        assert_eq!(decoded, claims);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = Hs256JwtValidator::new("a").issue(&claims()).unwrap();
        let err = Hs256JwtValidator::new("b")
            .validate(&token, Utc::now())
            .unwrap_err();
        assert!(matches!(err, TokenError::Decode(_)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let validator = Hs256JwtValidator::new("secret");
        let token = validator.issue(&claims()).unwrap();
        let err = validator
            .validate(&token, Utc::now() + Duration::hours(1))
            .unwrap_err();
        assert!(matches!(err, TokenError::Claims(TokenValidationError::Expired)));
    }
}
