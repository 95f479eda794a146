//! Per-request token verification.

use tracing::{debug, warn};
use warden_proto::token::{TokenError, TokenKeys};

/// The single externally visible failure text. Expired and mis-signed
/// tokens are deliberately indistinguishable to the caller.
pub const AUTH_FAILED_MESSAGE: &str = "Invalid or expired token.";

pub struct Authenticator {
    keys: TokenKeys,
}

impl Authenticator {
    pub fn new(keys: TokenKeys) -> Self {
        Self { keys }
    }

    pub fn verify(&self, token: &str) -> bool {
        match self.keys.verify(token) {
            Ok(claims) => {
                debug!(controller = %claims.sub, "token accepted");
                true
            }
            Err(TokenError::Expired) => {
                warn!("token expired");
                false
            }
            Err(err) => {
                warn!(error = %err, "token rejected");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expired_token_fails_even_when_signed_correctly() {
        let expired_keys = TokenKeys::new("secret", Duration::minutes(-5));
        let (token, _) = expired_keys.issue("controller");
        let auth = Authenticator::new(TokenKeys::new("secret", Duration::minutes(5)));
        assert!(!auth.verify(&token));
    }

    #[test]
    fn valid_token_passes_and_garbage_fails() {
        let keys = TokenKeys::new("secret", Duration::minutes(5));
        let auth = Authenticator::new(keys.clone());
        let (token, _) = keys.issue("controller");
        assert!(auth.verify(&token));
        assert!(!auth.verify("not-a-token"));
        assert!(!auth.verify(""));
    }
}
