//! Token data model shared by the cache (C1), database (C2), and manager (C3).

pub mod db;
pub mod manager;
pub mod store;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::secret::TokenSecret;
use crate::error::GatewayError;

/// Minimum lead time a caller must give when setting an expiry.
pub const MIN_EXPIRES_LEAD: chrono::Duration = chrono::Duration::seconds(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Session,
    User,
    Notebook,
    Internal,
    Service,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Session => "session",
            TokenType::User => "user",
            TokenType::Notebook => "notebook",
            TokenType::Internal => "internal",
            TokenType::Service => "service",
        }
    }
}

/// A snapshot of the upstream identity taken at session-token creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    pub uid: i64,
    pub groups: Vec<String>,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// A minted token: the bearer string plus the metadata needed to store it.
#[derive(Debug, Clone)]
pub struct Token {
    pub secret: TokenSecret,
    pub username: String,
    pub token_type: TokenType,
    pub scopes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub parent_key: Option<String>,
}

impl Token {
    pub fn key(&self) -> &str {
        &self.secret.key
    }

    pub fn to_token_string(&self) -> String {
        self.secret.to_token_string()
    }
}

/// Cached in C1, keyed by token key. Encrypted as a single opaque blob so a
/// decryption failure (bad/rotated-out key) can be treated uniformly as "not
/// found" rather than as a distinct error class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub key: String,
    pub secret: String,
    pub username: String,
    pub token_type: TokenType,
    pub scopes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub parent_key: Option<String>,
    pub user_info: Option<UserInfo>,
}

impl TokenData {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| exp <= Utc::now())
    }
}

/// Durable row shape from C2: everything in `TokenData` except the secret
/// and the user-info snapshot, plus the fields only the database tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token: String,
    pub username: String,
    pub token_type: TokenType,
    pub token_name: Option<String>,
    pub scopes: BTreeSet<String>,
    pub created: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub parent: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Create,
    Edit,
    Revoke,
    Expire,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Create => "create",
            HistoryAction::Edit => "edit",
            HistoryAction::Revoke => "revoke",
            HistoryAction::Expire => "expire",
        }
    }

    pub fn parse(s: &str) -> Option<HistoryAction> {
        match s {
            "create" => Some(HistoryAction::Create),
            "edit" => Some(HistoryAction::Edit),
            "revoke" => Some(HistoryAction::Revoke),
            "expire" => Some(HistoryAction::Expire),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenChangeHistoryEntry {
    pub token: String,
    pub username: String,
    pub token_type: TokenType,
    pub token_name: Option<String>,
    pub scopes: BTreeSet<String>,
    pub expires: Option<DateTime<Utc>>,
    pub actor: String,
    pub action: HistoryAction,
    pub event_time: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub old_token_name: Option<String>,
    pub old_scopes: Option<BTreeSet<String>>,
    pub old_expires: Option<DateTime<Utc>>,
}

/// Checks a username or actor against the configured username regex.
pub fn validate_username(value: &str, pattern: &regex::Regex) -> Result<(), GatewayError> {
    if !pattern.is_match(value) {
        return Err(GatewayError::InvalidRequest(format!(
            "'{value}' does not match the configured username pattern"
        )));
    }
    Ok(())
}

pub fn validate_token_name(name: &str) -> Result<(), GatewayError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || name.chars().count() > 64 {
        return Err(GatewayError::InvalidRequest(
            "token_name must be 1-64 non-whitespace characters".into(),
        ));
    }
    Ok(())
}

pub fn validate_expires(expires: DateTime<Utc>) -> Result<(), GatewayError> {
    if expires < Utc::now() + MIN_EXPIRES_LEAD {
        return Err(GatewayError::BadExpires(
            "expires must be at least 5 minutes in the future".into(),
        ));
    }
    Ok(())
}

/// Every requested scope must be in `known_scopes`; for non-admin creation
/// it must also be a subset of the creator's own scopes.
pub fn validate_scopes(
    requested: &BTreeSet<String>,
    known_scopes: &std::collections::BTreeMap<String, String>,
    creator_scopes: Option<&BTreeSet<String>>,
) -> Result<(), GatewayError> {
    for scope in requested {
        if !known_scopes.contains_key(scope) {
            return Err(GatewayError::BadScopes(format!("unknown scope '{scope}'")));
        }
    }
    if let Some(creator) = creator_scopes {
        if !requested.is_subset(creator) {
            return Err(GatewayError::BadScopes(
                "requested scopes exceed the creator's own scopes".into(),
            ));
        }
    }
    Ok(())
}
