//! OAuth2/OIDC client of the upstream identity provider (C6's collaborator).
//!
//! `authgate` is a client of exactly one upstream provider at a time, chosen
//! by the `provider_kind` tag on [`crate::config::ProviderConfig`]. Both
//! implementations speak the same three-step dance: build an authorize URL,
//! exchange a code for an access token, and fetch the upstream user's
//! profile (translated into our own [`UserInfo`](crate::token::UserInfo)).

pub mod github;
pub mod oidc;

use async_trait::async_trait;

use crate::error::Result;
use crate::token::UserInfo;

/// An upstream identity provider: GitHub or a generic OpenID Connect issuer.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Build the URL the browser is redirected to at the start of login.
    fn authorize_url(&self, state: &str, redirect_uri: &str) -> String;

    /// Exchange an authorization code for an access token.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String>;

    /// Fetch the authenticated user's profile using the access token
    /// obtained from [`IdentityProvider::exchange_code`].
    async fn fetch_user_info(&self, access_token: &str) -> Result<UserInfo>;
}
