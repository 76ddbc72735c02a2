//! Token manager (C3): the single authority that orchestrates C1 (cache)
//! and C2 (database) for every token lifecycle operation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::Config;
use crate::crypto::secret::TokenSecret;
use crate::error::{GatewayError, Result};
use crate::token::db::{HistoryFilters, HistoryPage, TokenDatabase};
use crate::token::store::TokenStore;
use crate::token::{
    validate_expires, validate_scopes, validate_token_name, validate_username, Token, TokenData,
    TokenInfo, TokenType, UserInfo,
};

/// The caller's own identity and scopes, established by C4/C5 before
/// reaching the manager. Used for every ACL check (`auth.username == owner`
/// or `admin:token`).
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub username: String,
    pub scopes: BTreeSet<String>,
    pub token_key: String,
    pub is_admin: bool,
}

impl AuthContext {
    fn require_owner_or_admin(&self, owner: &str) -> Result<()> {
        if self.username == owner || self.is_admin {
            return Ok(());
        }
        Err(GatewayError::PermissionDenied(
            "not the token owner and missing admin:token".into(),
        ))
    }
}

#[derive(Clone)]
pub struct TokenManager {
    store: Arc<TokenStore>,
    db: Arc<TokenDatabase>,
    config: Arc<Config>,
    username_regex: Arc<Regex>,
}

impl TokenManager {
    pub fn new(store: Arc<TokenStore>, db: Arc<TokenDatabase>, config: Arc<Config>) -> TokenManager {
        let username_regex = Arc::new(
            Regex::new(&config.username_regex).unwrap_or_else(|_| {
                Regex::new(r"^[a-z0-9](?:[a-z0-9._-]*[a-z0-9])?$").expect("fallback regex is valid")
            }),
        );
        TokenManager {
            store,
            db,
            config,
            username_regex,
        }
    }

    fn fallback_lifetime(&self) -> Duration {
        self.config.session_lifetime
    }

    fn validate_username(&self, value: &str) -> Result<()> {
        validate_username(value, &self.username_regex)
    }

    /// Union of the scopes mapped from each group the user belongs to, plus
    /// `admin:token` when the username is in the admin allow-list.
    pub async fn derive_session_scopes(&self, user_info: &UserInfo) -> Result<BTreeSet<String>> {
        let mut scopes = BTreeSet::new();
        for group in &user_info.groups {
            if let Some(mapped) = self.config.group_mapping.get(group) {
                scopes.extend(mapped.iter().cloned());
            }
        }
        if self.db.is_admin(&user_info.username).await? {
            scopes.insert("admin:token".to_string());
        }
        Ok(scopes)
    }

    async fn mint_and_store(
        &self,
        username: &str,
        token_type: TokenType,
        scopes: BTreeSet<String>,
        expires_at: Option<DateTime<Utc>>,
        parent_key: Option<String>,
        user_info: Option<UserInfo>,
        token_name: Option<&str>,
        service: Option<&str>,
        internal_fingerprint: Option<&str>,
        actor: &str,
        ip: Option<&str>,
    ) -> Result<Token> {
        let secret = TokenSecret::generate();
        let created_at = Utc::now();

        let token = Token {
            secret: secret.clone(),
            username: username.to_string(),
            token_type,
            scopes: scopes.clone(),
            created_at,
            expires_at,
            parent_key: parent_key.clone(),
        };

        self.db
            .insert_token(&token, token_name, service, internal_fingerprint, actor, ip)
            .await?;

        let data = TokenData {
            key: token.key().to_string(),
            secret: secret.secret.clone(),
            username: username.to_string(),
            token_type,
            scopes,
            created_at,
            expires_at,
            parent_key,
            user_info,
        };
        self.store.put(&data, self.fallback_lifetime()).await?;

        Ok(token)
    }

    pub async fn create_session_token(
        &self,
        user_info: UserInfo,
        ip: Option<&str>,
    ) -> Result<Token> {
        self.validate_username(&user_info.username)?;
        let scopes = self.derive_session_scopes(&user_info).await?;
        let expires_at = Some(Utc::now() + chrono_from_std(self.config.session_lifetime));
        let username = user_info.username.clone();
        self.mint_and_store(
            &username,
            TokenType::Session,
            scopes,
            expires_at,
            None,
            Some(user_info),
            None,
            None,
            None,
            &username,
            ip,
        )
        .await
    }

    pub async fn create_user_token(
        &self,
        auth: &AuthContext,
        owner: &str,
        name: &str,
        scopes: BTreeSet<String>,
        expires: Option<DateTime<Utc>>,
        ip: Option<&str>,
    ) -> Result<Token> {
        auth.require_owner_or_admin(owner)?;
        self.validate_username(owner)?;
        self.validate_username(&auth.username)?;
        validate_token_name(name)?;
        if let Some(exp) = expires {
            validate_expires(exp)?;
        }
        let creator_scopes = if auth.is_admin { None } else { Some(&auth.scopes) };
        validate_scopes(&scopes, &self.config.known_scopes, creator_scopes)?;

        self.mint_and_store(
            owner,
            TokenType::User,
            scopes,
            expires,
            None,
            None,
            Some(name),
            None,
            None,
            &auth.username,
            ip,
        )
        .await
    }

    pub async fn create_token_from_admin_request(
        &self,
        auth: &AuthContext,
        owner: &str,
        token_type: TokenType,
        name: Option<&str>,
        scopes: BTreeSet<String>,
        expires: Option<DateTime<Utc>>,
        ip: Option<&str>,
    ) -> Result<Token> {
        if !auth.is_admin {
            return Err(GatewayError::PermissionDenied("requires admin:token".into()));
        }
        self.validate_username(owner)?;
        if !matches!(token_type, TokenType::User | TokenType::Service) {
            return Err(GatewayError::InvalidRequest(
                "admin token creation only mints user or service tokens".into(),
            ));
        }
        if let Some(name) = name {
            validate_token_name(name)?;
        }
        if let Some(exp) = expires {
            validate_expires(exp)?;
        }
        validate_scopes(&scopes, &self.config.known_scopes, None)?;

        self.mint_and_store(
            owner, token_type, scopes, expires, None, None, name, None, None, &auth.username, ip,
        )
        .await
    }

    /// Idempotent per `parent.key`: returns the existing live notebook token
    /// if one exists, otherwise mints one with the parent's full scopes.
    pub async fn get_notebook_token(&self, parent: &TokenData, ip: Option<&str>) -> Result<Token> {
        if let Some(existing_key) = self.db.find_notebook_token_key(&parent.key).await? {
            if let Some(data) = self.store.get(&existing_key).await? {
                return Ok(token_from_data(&data));
            }
        }

        let expires_at = min_expiry(parent.expires_at, None);
        let minted = self
            .mint_and_store(
                &parent.username,
                TokenType::Notebook,
                parent.scopes.clone(),
                expires_at,
                Some(parent.key.clone()),
                parent.user_info.clone(),
                None,
                None,
                None,
                &parent.username,
                ip,
            )
            .await;

        match minted {
            Err(GatewayError::DuplicateTokenName) => {
                // Lost the race: another caller minted the notebook token for
                // this parent between our lookup and our insert. Re-select
                // the winner instead of surfacing the conflict.
                let winner_key = self
                    .db
                    .find_notebook_token_key(&parent.key)
                    .await?
                    .ok_or(GatewayError::DuplicateTokenName)?;
                let data = self
                    .store
                    .get(&winner_key)
                    .await?
                    .ok_or(GatewayError::DuplicateTokenName)?;
                Ok(token_from_data(&data))
            }
            other => other,
        }
    }

    /// Idempotent per `(parent.key, service, sorted(scopes))`.
    pub async fn get_internal_token(
        &self,
        parent: &TokenData,
        service: &str,
        scopes: BTreeSet<String>,
        ip: Option<&str>,
    ) -> Result<Token> {
        if !scopes.is_subset(&parent.scopes) {
            return Err(GatewayError::BadScopes(
                "delegated scopes must be a subset of the parent token's scopes".into(),
            ));
        }
        let fingerprint = scope_fingerprint(&scopes);

        if let Some(existing_key) = self
            .db
            .find_internal_token_key(&parent.key, service, &fingerprint)
            .await?
        {
            if let Some(data) = self.store.get(&existing_key).await? {
                return Ok(token_from_data(&data));
            }
        }

        let expires_at = min_expiry(parent.expires_at, None);
        let minted = self
            .mint_and_store(
                &parent.username,
                TokenType::Internal,
                scopes,
                expires_at,
                Some(parent.key.clone()),
                parent.user_info.clone(),
                None,
                Some(service),
                Some(&fingerprint),
                &parent.username,
                ip,
            )
            .await;

        match minted {
            Err(GatewayError::DuplicateTokenName) => {
                // Lost the race: another caller minted this (parent, service,
                // scopes) internal token first. Re-select the winner.
                let winner_key = self
                    .db
                    .find_internal_token_key(&parent.key, service, &fingerprint)
                    .await?
                    .ok_or(GatewayError::DuplicateTokenName)?;
                let data = self
                    .store
                    .get(&winner_key)
                    .await?
                    .ok_or(GatewayError::DuplicateTokenName)?;
                Ok(token_from_data(&data))
            }
            other => other,
        }
    }

    /// Resolves a presented bearer token to its cached data. Any failure —
    /// missing key, secret mismatch, expiry — returns `None`, never an error.
    pub async fn get_data(&self, token: &TokenSecret) -> Result<Option<TokenData>> {
        let Some(data) = self.store.get(&token.key).await? else {
            return Ok(None);
        };
        if !token.verify(&data.secret) {
            return Ok(None);
        }
        self.db.touch_last_used(&data.key).await?;
        Ok(Some(data))
    }

    /// Like [`TokenManager::get_data`] but trusts a key already known to be
    /// live (used by `/auth/api/v1/token-info`, which authenticates the
    /// caller via their own presented token first).
    pub async fn get_token_info_unchecked(&self, key: &str) -> Result<Option<TokenInfo>> {
        match self.db.get_token_info(key).await? {
            Some(info) => Ok(Some(info)),
            None => {
                tracing::warn!(token_key = %key, "token found in cache but not database");
                Ok(None)
            }
        }
    }

    pub async fn get_token_info(
        &self,
        key: &str,
        auth: &AuthContext,
        owner: &str,
    ) -> Result<Option<TokenInfo>> {
        auth.require_owner_or_admin(owner)?;
        let info = self.db.get_token_info(key).await?;
        Ok(info.filter(|i| i.username == owner))
    }

    pub async fn list_tokens(&self, auth: &AuthContext, owner: &str) -> Result<Vec<TokenInfo>> {
        auth.require_owner_or_admin(owner)?;
        self.db.list_tokens(owner).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn modify_token(
        &self,
        key: &str,
        auth: &AuthContext,
        owner: &str,
        name: Option<&str>,
        scopes: Option<BTreeSet<String>>,
        expires: Option<DateTime<Utc>>,
        no_expire: bool,
        ip: Option<&str>,
    ) -> Result<Option<TokenInfo>> {
        auth.require_owner_or_admin(owner)?;

        if let Some(name) = name {
            validate_token_name(name)?;
        }
        if let Some(scopes) = &scopes {
            let creator_scopes = if auth.is_admin { None } else { Some(&auth.scopes) };
            validate_scopes(scopes, &self.config.known_scopes, creator_scopes)?;
        }
        if let Some(exp) = expires {
            validate_expires(exp)?;
        }

        let new_expires = if no_expire {
            Some(None)
        } else {
            expires.map(Some)
        };

        let updated = self
            .db
            .modify_user_token(key, name, scopes.as_ref(), new_expires, &auth.username, ip)
            .await?;

        if let Some(info) = &updated {
            if info.username != owner {
                return Ok(None);
            }
            self.refresh_cache_after_edit(key).await?;
        }
        Ok(updated)
    }

    /// The cache holds a point-in-time copy of the token's metadata; after a
    /// successful edit, reseal it with the database's current values so
    /// `get_data` doesn't keep serving stale scopes/expiry until natural TTL.
    async fn refresh_cache_after_edit(&self, key: &str) -> Result<()> {
        let (Some(info), Some(mut data)) = (
            self.db.get_token_info(key).await?,
            self.store.get(key).await?,
        ) else {
            return Ok(());
        };
        data.scopes = info.scopes;
        data.expires_at = info.expires;
        self.store.put(&data, self.fallback_lifetime()).await?;
        Ok(())
    }

    pub async fn delete_token(
        &self,
        key: &str,
        auth: &AuthContext,
        owner: &str,
        ip: Option<&str>,
    ) -> Result<bool> {
        auth.require_owner_or_admin(owner)?;

        let Some(info) = self.db.get_token_info(key).await? else {
            return Ok(false);
        };
        if info.username != owner {
            return Ok(false);
        }

        let revoked_keys = self.db.revoke_token(key, &auth.username, ip).await?;
        for revoked_key in &revoked_keys {
            self.store.delete(revoked_key).await?;
        }
        Ok(!revoked_keys.is_empty())
    }

    pub async fn get_change_history(
        &self,
        auth: &AuthContext,
        filters: HistoryFilters,
    ) -> Result<HistoryPage> {
        if !auth.is_admin {
            return Err(GatewayError::PermissionDenied(
                "global change history requires admin:token".into(),
            ));
        }
        self.db.get_change_history(filters).await
    }

    pub async fn get_user_change_history(
        &self,
        auth: &AuthContext,
        owner: &str,
        filters: HistoryFilters,
    ) -> Result<HistoryPage> {
        auth.require_owner_or_admin(owner)?;
        let filters = HistoryFilters {
            username: Some(owner.to_string()),
            ..filters
        };
        self.db.get_change_history(filters).await
    }

    pub async fn admins(&self) -> Result<Vec<String>> {
        self.db.admins().await
    }

    pub async fn add_admin(&self, auth: &AuthContext, username: &str) -> Result<()> {
        if !auth.is_admin {
            return Err(GatewayError::PermissionDenied("requires admin:token".into()));
        }
        self.db.add_admin(username).await
    }

    pub async fn delete_admin(&self, auth: &AuthContext, username: &str) -> Result<bool> {
        if !auth.is_admin {
            return Err(GatewayError::PermissionDenied("requires admin:token".into()));
        }
        self.db.delete_admin(username).await
    }
}

fn token_from_data(data: &TokenData) -> Token {
    Token {
        secret: TokenSecret {
            key: data.key.clone(),
            secret: data.secret.clone(),
        },
        username: data.username.clone(),
        token_type: data.token_type,
        scopes: data.scopes.clone(),
        created_at: data.created_at,
        expires_at: data.expires_at,
        parent_key: data.parent_key.clone(),
    }
}

fn scope_fingerprint(scopes: &BTreeSet<String>) -> String {
    scopes.iter().cloned().collect::<Vec<_>>().join(",")
}

/// `expires ≤ parent.expires` when both are set.
fn min_expiry(
    parent_expires: Option<DateTime<Utc>>,
    requested: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (parent_expires, requested) {
        (Some(p), Some(r)) => Some(p.min(r)),
        (Some(p), None) => Some(p),
        (None, r) => r,
    }
}

fn chrono_from_std(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::seconds(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_expiry_caps_to_parent() {
        let now = Utc::now();
        let parent = now + chrono::Duration::days(1);
        let requested = now + chrono::Duration::days(2);
        assert_eq!(min_expiry(Some(parent), Some(requested)), Some(parent));
    }

    #[test]
    fn scope_fingerprint_is_order_independent() {
        let a: BTreeSet<String> = ["b", "a"].into_iter().map(String::from).collect();
        let b: BTreeSet<String> = ["a", "b"].into_iter().map(String::from).collect();
        assert_eq!(scope_fingerprint(&a), scope_fingerprint(&b));
    }

    #[test]
    fn username_regex_rejects_uppercase_and_leading_dash() {
        let pattern = Regex::new(r"^[a-z0-9](?:[a-z0-9._-]*[a-z0-9])?$").unwrap();
        assert!(validate_username("example", &pattern).is_ok());
        assert!(validate_username("-bad", &pattern).is_err());
        assert!(validate_username("Bad", &pattern).is_err());
    }
}
