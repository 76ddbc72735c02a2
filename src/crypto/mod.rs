//! Symmetric encryption for the state cookie and cached token data.
//!
//! A keyring of AES-256-GCM keys, each tagged with a short `kid`. New
//! ciphertexts are always sealed under the first (newest) key; opening tries
//! every key in order so that rotating in a new key doesn't invalidate
//! cookies or cache entries sealed under an older one.

pub mod secret;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

use crate::error::GatewayError;

const NONCE_LEN: usize = 12;

struct KeyEntry {
    kid: String,
    cipher: Aes256Gcm,
}

/// Loaded from `session_secret_file`: one `<kid>:<base64-key>` line per key,
/// newest first.
pub struct Keyring {
    keys: Vec<KeyEntry>,
}

impl Keyring {
    pub fn load(path: &str) -> anyhow::Result<Keyring> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read session secret file {path}: {e}"))?;
        Keyring::parse(&contents)
    }

    fn parse(contents: &str) -> anyhow::Result<Keyring> {
        let mut keys = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (kid, encoded) = line
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("malformed session secret line: {line}"))?;
            let raw = STANDARD
                .decode(encoded.trim())
                .map_err(|e| anyhow::anyhow!("invalid base64 key for kid {kid}: {e}"))?;
            if raw.len() != 32 {
                anyhow::bail!("key for kid {kid} must be 32 bytes, got {}", raw.len());
            }
            let key = Key::<Aes256Gcm>::from_slice(&raw);
            keys.push(KeyEntry {
                kid: kid.to_string(),
                cipher: Aes256Gcm::new(key),
            });
        }
        if keys.is_empty() {
            anyhow::bail!("session secret file contained no keys");
        }
        Ok(Keyring { keys })
    }

    /// Generate a fresh random 32-byte key, base64-encoded, for operators
    /// bootstrapping a new `session_secret_file`.
    pub fn generate_key() -> String {
        let mut raw = [0u8; 32];
        OsRng.fill_bytes(&mut raw);
        STANDARD.encode(raw)
    }

    /// Seal `plaintext` under the newest key. Output is `<kid>.<base64 nonce||ciphertext>`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, GatewayError> {
        let entry = self
            .keys
            .first()
            .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("no encryption keys loaded")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = entry
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| GatewayError::Internal(anyhow::anyhow!("failed to seal payload")))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!("{}.{}", entry.kid, STANDARD.encode(combined)))
    }

    /// Open a sealed payload, trying each key in order until one's `kid`
    /// matches and decryption succeeds.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, GatewayError> {
        let (kid, encoded) = sealed
            .split_once('.')
            .ok_or_else(|| GatewayError::InvalidRequest("malformed sealed payload".into()))?;

        let entry = self
            .keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or(GatewayError::InvalidToken)?;

        let combined = STANDARD
            .decode(encoded)
            .map_err(|_| GatewayError::InvalidToken)?;
        if combined.len() < NONCE_LEN {
            return Err(GatewayError::InvalidToken);
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = entry
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| GatewayError::InvalidToken)?;

        tracing::debug!(kid = %entry.kid, "opened sealed payload");
        Ok(plaintext)
    }

    /// Seal a JSON-serializable value.
    pub fn seal_json<T: serde::Serialize>(&self, value: &T) -> Result<String, GatewayError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("failed to serialize payload: {e}")))?;
        self.seal(&bytes)
    }

    /// Open and deserialize a JSON value previously sealed with [`Keyring::seal_json`].
    pub fn open_json<T: serde::de::DeserializeOwned>(&self, sealed: &str) -> Result<T, GatewayError> {
        let bytes = self.open(sealed)?;
        serde_json::from_slice(&bytes).map_err(|_| GatewayError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keyring() -> Keyring {
        let k1 = Keyring::generate_key();
        let k2 = Keyring::generate_key();
        Keyring::parse(&format!("newkid:{k1}\noldkid:{k2}\n")).unwrap()
    }

    #[test]
    fn seal_and_open_roundtrip() {
        let keyring = test_keyring();
        let sealed = keyring.seal(b"hello world").unwrap();
        assert!(sealed.starts_with("newkid."));
        let opened = keyring.open(&sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn open_rejects_unknown_kid() {
        let keyring = test_keyring();
        let err = keyring.open("nosuchkid.AAAA").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidToken));
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let keyring = test_keyring();
        let mut sealed = keyring.seal(b"payload").unwrap();
        sealed.push('x');
        assert!(keyring.open(&sealed).is_err());
    }

    #[test]
    fn json_roundtrip() {
        let keyring = test_keyring();
        let sealed = keyring.seal_json(&vec!["a".to_string(), "b".to_string()]).unwrap();
        let value: Vec<String> = keyring.open_json(&sealed).unwrap();
        assert_eq!(value, vec!["a".to_string(), "b".to_string()]);
    }
}
