//! Session Credential Pre-check
//!
//! The seller validates the buyer's JWT. The client only decodes it locally,
//! without verifying the signature, to fail fast on a malformed or expired
//! credential before opening the channel.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims the client looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    /// Subject (buyer id).
    #[serde(default)]
    pub sub: String,
    /// Expiry timestamp (Unix seconds). Zero if absent.
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
}

/// Credential rejected before connecting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// No credential configured.
    #[error("no session credential")]
    Missing,
    /// Not a decodable JWT.
    #[error("invalid credential format: {0}")]
    InvalidFormat(String),
    /// Past its expiry.
    #[error("credential expired at {exp}")]
    Expired {
        /// Expiry claim.
        exp: u64,
    },
}

/// Decode `token` and check expiry against `now` (Unix seconds).
pub fn precheck_credential_at(token: &str, now: u64) -> Result<CredentialClaims, CredentialError> {
    if token.trim().is_empty() {
        return Err(CredentialError::Missing);
    }

    let header = decode_header(token).map_err(|e| CredentialError::InvalidFormat(e.to_string()))?;

    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.required_spec_claims = HashSet::new();
    validation.validate_exp = false;
    validation.validate_aud = false;

    let claims = decode::<CredentialClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| CredentialError::InvalidFormat(e.to_string()))?
        .claims;

    if claims.exp > 0 && now >= claims.exp {
        return Err(CredentialError::Expired { exp: claims.exp });
    }
    Ok(claims)
}

/// Decode `token` and check expiry against the system clock.
pub fn precheck_credential(token: &str) -> Result<CredentialClaims, CredentialError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    precheck_credential_at(token, now)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

    fn token(exp: u64) -> String {
        let claims = CredentialClaims {
            sub: "buyer-1".into(),
            exp,
            iat: 1_000,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"seller-only-secret"),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_credential_without_key() {
        let claims = precheck_credential_at(&token(5_000), 2_000).unwrap();
        assert_eq!(claims.sub, "buyer-1");
    }

    #[test]
    fn test_expired_credential() {
        assert_eq!(
            precheck_credential_at(&token(5_000), 5_000),
            Err(CredentialError::Expired { exp: 5_000 })
        );
    }

    #[test]
    fn test_no_expiry_claim_is_accepted() {
        assert!(precheck_credential_at(&token(0), u64::MAX).is_ok());
    }

    #[test]
    fn test_garbage_credential() {
        assert!(matches!(
            precheck_credential_at("not-a-jwt", 0),
            Err(CredentialError::InvalidFormat(_))
        ));
        assert_eq!(precheck_credential_at("  ", 0), Err(CredentialError::Missing));
    }
}
