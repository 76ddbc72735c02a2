//! GitHub as the upstream identity provider.
//!
//! Same three-step dance as Discord in the teacher's `web/auth.rs`: build an
//! authorize URL, trade the code for an access token, then fetch the
//! profile. GitHub additionally requires a second call to list the user's
//! organization memberships, since `isMemberOf`/group scoping is driven by
//! team slugs rather than a single profile response.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::GithubProviderConfig;
use crate::error::{GatewayError, Result};
use crate::token::UserInfo;

const AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const USER_URL: &str = "https://api.github.com/user";
const EMAILS_URL: &str = "https://api.github.com/user/emails";
const ORGS_URL: &str = "https://api.github.com/user/orgs";

pub struct GithubProvider {
    config: GithubProviderConfig,
    http: reqwest::Client,
}

impl GithubProvider {
    pub fn new(config: GithubProviderConfig, http: reqwest::Client) -> GithubProvider {
        GithubProvider { config, http }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GithubUser {
    login: String,
    id: i64,
    name: Option<String>,
    email: Option<String>,
}

#[derive(Deserialize)]
struct GithubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

#[derive(Deserialize)]
struct GithubOrg {
    login: String,
}

#[async_trait]
impl super::IdentityProvider for GithubProvider {
    fn authorize_url(&self, state: &str, redirect_uri: &str) -> String {
        format!(
            "{AUTHORIZE_URL}?client_id={}&redirect_uri={}&scope=read:org,user:email&state={state}",
            self.config.client_id,
            urlencoding_encode(redirect_uri),
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String> {
        let response = self
            .http
            .post(TOKEN_URL)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::ProviderFailure(format!("GitHub token exchange: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::ProviderFailure(format!(
                "GitHub token exchange returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::ProviderFailure(format!("invalid token response: {e}")))?;
        Ok(token.access_token)
    }

    async fn fetch_user_info(&self, access_token: &str) -> Result<UserInfo> {
        let user: GithubUser = self
            .http
            .get(USER_URL)
            .bearer_auth(access_token)
            .header("User-Agent", "authgate")
            .send()
            .await
            .map_err(|e| GatewayError::ProviderFailure(format!("GitHub user profile: {e}")))?
            .json()
            .await
            .map_err(|e| GatewayError::ProviderFailure(format!("invalid GitHub user profile: {e}")))?;

        let email = match user.email {
            Some(email) => Some(email),
            None => fetch_primary_email(&self.http, access_token).await,
        };

        let orgs: Vec<GithubOrg> = self
            .http
            .get(ORGS_URL)
            .bearer_auth(access_token)
            .header("User-Agent", "authgate")
            .send()
            .await
            .map_err(|e| GatewayError::ProviderFailure(format!("GitHub org membership: {e}")))?
            .json()
            .await
            .unwrap_or_default();

        Ok(UserInfo {
            username: user.login.to_lowercase(),
            uid: user.id,
            groups: orgs.into_iter().map(|o| o.login).collect(),
            email,
            name: user.name,
        })
    }
}

async fn fetch_primary_email(http: &reqwest::Client, access_token: &str) -> Option<String> {
    let emails: Vec<GithubEmail> = http
        .get(EMAILS_URL)
        .bearer_auth(access_token)
        .header("User-Agent", "authgate")
        .send()
        .await
        .ok()?
        .json()
        .await
        .ok()?;
    emails
        .into_iter()
        .find(|e| e.primary && e.verified)
        .map(|e| e.email)
}

fn urlencoding_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
