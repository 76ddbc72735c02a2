use std::collections::BTreeSet;

use authgate::crypto::secret::TokenSecret;
use authgate::token::{Token, TokenType};
use chrono::Utc;

/// Build a test `Token` with sensible defaults, ready to hand to
/// `TokenDatabase::insert_token`.
pub fn make_token(username: &str, token_type: TokenType, scopes: &[&str]) -> Token {
    Token {
        secret: TokenSecret::generate(),
        username: username.to_owned(),
        token_type,
        scopes: scopes.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        created_at: Utc::now(),
        expires_at: None,
        parent_key: None,
    }
}

pub fn child_token(parent: &Token, token_type: TokenType, scopes: &[&str]) -> Token {
    let mut token = make_token(&parent.username, token_type, scopes);
    token.parent_key = Some(parent.key().to_owned());
    token
}
