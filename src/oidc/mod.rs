//! OIDC issuer (C7): signs and serves identity assertions for downstream
//! relying parties, and re-signs an existing assertion for an internal
//! audience with a fresh `jti` and capped lifetime.
//!
//! The signing key is the site's one configured RSA keypair (`issuer.key_file`).
//! Unlike the cookie/cache [`Keyring`](crate::crypto::Keyring) there is no
//! rotation list here — rotating the signing key is an out-of-band
//! operation (publish the new key in the JWKS first, then switch) that this
//! crate does not automate, matching the source's single-key issuer.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::IssuerConfig;
use crate::error::{GatewayError, Result};
use crate::token::UserInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub scope: String,
    #[serde(rename = "isMemberOf", skip_serializing_if = "Vec::is_empty")]
    pub is_member_of: Vec<GroupClaim>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupClaim {
    pub name: String,
}

pub struct Issuer {
    config: IssuerConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    kid: String,
    jwk: serde_json::Value,
}

impl Issuer {
    pub fn load(config: IssuerConfig) -> anyhow::Result<Issuer> {
        let pem = std::fs::read_to_string(&config.key_file)
            .map_err(|e| anyhow::anyhow!("cannot read issuer key file {}: {e}", config.key_file))?;

        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| anyhow::anyhow!("invalid RSA private key in {}: {e}", config.key_file))?;

        let public_key = private_key.to_public_key();
        let n = public_key.n().to_bytes_be();
        let e = public_key.e().to_bytes_be();

        let mut hasher = Sha256::new();
        hasher.update(&n);
        let digest = hasher.finalize();
        let kid = URL_SAFE_NO_PAD.encode(&digest[..16]);

        let jwk = json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": kid,
            "n": URL_SAFE_NO_PAD.encode(&n),
            "e": URL_SAFE_NO_PAD.encode(&e),
        });

        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| anyhow::anyhow!("failed to load RSA signing key: {e}"))?;

        let public_key_der = public_key
            .to_pkcs1_der()
            .map_err(|e| anyhow::anyhow!("failed to encode public key: {e}"))?;
        let decoding_key = DecodingKey::from_rsa_der(public_key_der.as_bytes());

        Ok(Issuer {
            config,
            encoding_key,
            decoding_key,
            kid,
            jwk,
        })
    }

    /// `{"keys": [...]}` served at `/.well-known/jwks.json`.
    pub fn jwks(&self) -> serde_json::Value {
        json!({ "keys": [self.jwk.clone()] })
    }

    pub fn openid_configuration(&self, issuer_url: &str) -> serde_json::Value {
        json!({
            "issuer": self.config.iss,
            "jwks_uri": format!("{issuer_url}/.well-known/jwks.json"),
            "response_types_supported": ["code"],
            "subject_types_supported": ["public"],
            "id_token_signing_alg_values_supported": ["RS256"],
        })
    }

    /// Mint a fresh assertion for the configured default audience, from a
    /// session's scopes and user-info snapshot.
    pub fn mint_for_user(&self, user_info: &UserInfo, scopes: &BTreeSet<String>) -> Result<String> {
        let now = now_unix();
        let claims = Claims {
            iss: self.config.iss.clone(),
            aud: self.config.aud.clone(),
            sub: user_info.username.clone(),
            exp: now + self.config.exp_minutes.as_secs() as i64,
            iat: now,
            jti: Uuid::new_v4().to_string(),
            scope: join_scopes(scopes),
            is_member_of: user_info
                .groups
                .iter()
                .map(|g| GroupClaim { name: g.clone() })
                .collect(),
            uid: Some(user_info.uid),
            email: user_info.email.clone(),
            name: user_info.name.clone(),
        };
        self.sign(&claims)
    }

    /// Reissue an existing assertion for the internal audience: fresh
    /// `jti`, `aud` swapped to `aud_internal`, `sub`/`scope` preserved,
    /// `exp` capped to `exp_minutes` from now regardless of the original's
    /// remaining lifetime.
    pub fn reissue_internal(&self, original: &Claims) -> Result<String> {
        let now = now_unix();
        let claims = Claims {
            iss: self.config.iss.clone(),
            aud: self.config.aud_internal.clone(),
            sub: original.sub.clone(),
            exp: now + self.config.exp_minutes.as_secs() as i64,
            iat: now,
            jti: Uuid::new_v4().to_string(),
            scope: original.scope.clone(),
            is_member_of: original.is_member_of.clone(),
            uid: original.uid,
            email: original.email.clone(),
            name: original.name.clone(),
        };
        self.sign(&claims)
    }

    /// Validate a previously-minted assertion's signature and expiry, for
    /// callers that want to reissue it at the internal audience. Accepts
    /// either the default or the internal audience as the presented token's
    /// `aud`, since a caller may legitimately present a token we already
    /// reissued once.
    pub fn decode_own(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.config.aud, &self.config.aud_internal]);
        validation.set_issuer(&[&self.config.iss]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| GatewayError::InvalidToken)?;
        Ok(data.claims)
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("failed to sign JWT: {e}")))
    }
}

fn join_scopes(scopes: &BTreeSet<String>) -> String {
    scopes.iter().cloned().collect::<Vec<_>>().join(" ")
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePrivateKey;

    fn test_issuer() -> Issuer {
        let mut rng = rand_core_06::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate test RSA key");
        let pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .expect("encode test RSA key")
            .to_string();

        let path = std::env::temp_dir().join(format!("authgate-issuer-test-{}.pem", uuid::Uuid::new_v4()));
        std::fs::write(&path, pem).unwrap();

        let config = IssuerConfig {
            iss: "https://example.test".to_string(),
            aud: "https://example.test/aud".to_string(),
            aud_internal: "https://example.test/internal".to_string(),
            key_file: path.to_str().unwrap().to_string(),
            exp_minutes: std::time::Duration::from_secs(300),
        };
        let issuer = Issuer::load(config).expect("load test issuer");
        let _ = std::fs::remove_file(&path);
        issuer
    }

    fn test_user() -> UserInfo {
        UserInfo {
            username: "alice".to_string(),
            uid: 1000,
            groups: vec!["science".to_string()],
            email: Some("alice@example.test".to_string()),
            name: Some("Alice Example".to_string()),
        }
    }

    #[test]
    fn mint_then_decode_roundtrips_claims() {
        let issuer = test_issuer();
        let user = test_user();
        let scopes: BTreeSet<String> = ["read:all".to_string()].into_iter().collect();

        let jwt = issuer.mint_for_user(&user, &scopes).unwrap();
        let claims = issuer.decode_own(&jwt).unwrap();

        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.aud, "https://example.test/aud");
        assert_eq!(claims.scope, "read:all");
    }

    #[test]
    fn reissue_internal_swaps_audience_and_jti() {
        let issuer = test_issuer();
        let user = test_user();
        let scopes: BTreeSet<String> = ["read:all".to_string()].into_iter().collect();

        let jwt = issuer.mint_for_user(&user, &scopes).unwrap();
        let original_claims = issuer.decode_own(&jwt).unwrap();

        let reissued_jwt = issuer.reissue_internal(&original_claims).unwrap();
        let reissued_claims = issuer.decode_own(&reissued_jwt).unwrap();

        assert_eq!(reissued_claims.aud, "https://example.test/internal");
        assert_eq!(reissued_claims.sub, original_claims.sub);
        assert_ne!(reissued_claims.jti, original_claims.jti);
    }

    #[test]
    fn decode_own_rejects_tampered_signature() {
        let issuer = test_issuer();
        let user = test_user();
        let scopes: BTreeSet<String> = ["read:all".to_string()].into_iter().collect();

        let mut jwt = issuer.mint_for_user(&user, &scopes).unwrap();
        jwt.push('x');
        assert!(issuer.decode_own(&jwt).is_err());
    }
}
