//! Opaque bearer token encoding: `gt-<key>.<secret>`.
//!
//! The key is the public, database-indexable half (stored and logged
//! freely). The secret is never hashed: the whole `TokenData` blob
//! (including the secret) is sealed with the process [`Keyring`](crate::crypto::Keyring)
//! before it reaches the cache, and on lookup the decrypted secret is
//! compared to the presented one in constant time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::GatewayError;

const PREFIX: &str = "gt-";
const RAW_LEN: usize = 16;

/// The two halves of an opaque bearer token: `key` is the stable lookup
/// handle, `secret` is the random value whose hash is checked on use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSecret {
    pub key: String,
    pub secret: String,
}

impl TokenSecret {
    /// Generate a fresh random key/secret pair.
    pub fn generate() -> TokenSecret {
        TokenSecret {
            key: random_component(),
            secret: random_component(),
        }
    }

    /// Render as the wire format `gt-<key>.<secret>`.
    pub fn to_token_string(&self) -> String {
        format!("{PREFIX}{}.{}", self.key, self.secret)
    }

    /// Parse a bearer token string into its key/secret halves.
    pub fn parse(token: &str) -> Result<TokenSecret, GatewayError> {
        let rest = token
            .strip_prefix(PREFIX)
            .ok_or(GatewayError::InvalidToken)?;
        let (key, secret) = rest.split_once('.').ok_or(GatewayError::InvalidToken)?;
        if key.is_empty() || secret.is_empty() {
            return Err(GatewayError::InvalidToken);
        }
        Ok(TokenSecret {
            key: key.to_owned(),
            secret: secret.to_owned(),
        })
    }

    /// Constant-time comparison of this token's secret against the secret
    /// decrypted out of the stored `TokenData`. Length is checked first
    /// since `ct_eq` requires equal-length slices; a length mismatch is
    /// itself not secret-dependent (secrets are always 22 characters).
    pub fn verify(&self, stored_secret: &str) -> bool {
        let a = self.secret.as_bytes();
        let b = stored_secret.as_bytes();
        a.len() == b.len() && bool::from(a.ct_eq(b))
    }
}

fn random_component() -> String {
    let mut raw = [0u8; RAW_LEN];
    rand::rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_string_form() {
        let secret = TokenSecret::generate();
        let rendered = secret.to_token_string();
        assert!(rendered.starts_with("gt-"));
        let parsed = TokenSecret::parse(&rendered).unwrap();
        assert_eq!(parsed, secret);
    }

    #[test]
    fn verify_accepts_matching_secret_and_rejects_others() {
        let secret = TokenSecret::generate();
        assert!(secret.verify(&secret.secret));

        let other = TokenSecret::generate();
        assert!(!other.verify(&secret.secret));
    }

    #[test]
    fn parse_rejects_missing_prefix_or_separator() {
        assert!(TokenSecret::parse("abc.def").is_err());
        assert!(TokenSecret::parse("gt-missingseparator").is_err());
        assert!(TokenSecret::parse("gt-.nokey").is_err());
    }
}
