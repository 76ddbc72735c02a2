//! Token store (C1): token key → encrypted `TokenData` in Redis, with TTL.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::crypto::Keyring;
use crate::error::Result;
use crate::token::TokenData;

const KEY_PREFIX: &str = "token:";

/// A single process-wide connection, auto-reconnecting on transient
/// failures (Redis's `ConnectionManager`) rather than a pool — every
/// operation here is a single round trip, so there is nothing to be gained
/// by checking connections in and out of a pool.
#[derive(Clone)]
pub struct TokenStore {
    conn: ConnectionManager,
    keyring: Arc<Keyring>,
}

impl TokenStore {
    pub async fn new(redis_url: &str, keyring: Arc<Keyring>) -> anyhow::Result<TokenStore> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(TokenStore { conn, keyring })
    }

    fn redis_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }

    /// Seals `data` and writes it with the given TTL. A zero TTL is rejected
    /// by Redis, so a token with no expiry is capped to `fallback_lifetime`.
    pub async fn put(&self, data: &TokenData, fallback_lifetime: Duration) -> Result<()> {
        let ttl = data
            .expires_at
            .map(|exp| (exp - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .filter(|d| !d.is_zero())
            .unwrap_or(fallback_lifetime);

        let sealed = self.keyring.seal_json(data)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(Self::redis_key(&data.key), sealed, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    /// A decryption failure (unknown/rotated-out key, corrupt payload) is
    /// treated the same as a cache miss: logged, never surfaced to callers.
    pub async fn get(&self, key: &str) -> Result<Option<TokenData>> {
        let mut conn = self.conn.clone();
        let sealed: Option<String> = conn.get(Self::redis_key(key)).await?;
        let Some(sealed) = sealed else {
            return Ok(None);
        };

        match self.keyring.open_json::<TokenData>(&sealed) {
            Ok(data) => {
                if data.is_expired() {
                    return Ok(None);
                }
                Ok(Some(data))
            }
            Err(err) => {
                tracing::warn!(token_key = %key, error = %err, "failed to open cached token data");
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::redis_key(key)).await?;
        Ok(())
    }
}
