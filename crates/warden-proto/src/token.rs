//! Short-lived signed access tokens.
//!
//! Every request carries an HS256 token over a shared secret. Validity is a
//! pure function of the signature and the `exp` claim against wall-clock
//! time at verification; the agent keeps no session state. The shared-secret
//! scheme is a known weakness of the protocol, kept as-is.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by a controller access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Opaque controller label.
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token missing or malformed")]
    Malformed,
    #[error("token has expired")]
    Expired,
    #[error("token verification failed: {0}")]
    Jwt(jsonwebtoken::errors::Error),
}

#[derive(Clone)]
pub struct TokenKeys {
    enc: EncodingKey,
    dec: DecodingKey,
    ttl: Duration,
}

impl TokenKeys {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            enc: EncodingKey::from_secret(secret.as_bytes()),
            dec: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    /// Signs a fresh token for `label`, returning it with its expiry.
    pub fn issue(&self, label: &str) -> (String, i64) {
        let issued_at = Utc::now();
        let claims = AccessClaims {
            sub: label.to_string(),
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl).timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.enc)
            .expect("sign access token");
        (token, claims.exp)
    }

    /// Verifies signature and expiry. Expiry is judged against wall-clock
    /// time now, with no leeway.
    pub fn verify(&self, token: &str) -> Result<AccessClaims, TokenError> {
        if token.trim().is_empty() {
            return Err(TokenError::Malformed);
        }
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<AccessClaims>(token, &self.dec, &validation).map_err(|err| {
            if matches!(err.kind(), ErrorKind::ExpiredSignature) {
                TokenError::Expired
            } else {
                TokenError::Jwt(err)
            }
        })?;
        Ok(data.claims)
    }
}
