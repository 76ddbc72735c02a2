//! Application state shared across every handler.

use std::sync::Arc;

use crate::config::Config;
use crate::crypto::Keyring;
use crate::oidc::Issuer;
use crate::provider::IdentityProvider;
use crate::token::manager::TokenManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<TokenManager>,
    pub keyring: Arc<Keyring>,
    pub provider: Arc<dyn IdentityProvider>,
    pub issuer: Arc<Issuer>,
    pub http: reqwest::Client,
}
