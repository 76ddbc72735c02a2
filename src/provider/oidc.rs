//! A generic OpenID Connect issuer as the upstream identity provider.
//!
//! Endpoints are resolved once from the issuer's `/.well-known/openid-configuration`
//! document and cached for the life of the process (the document is
//! immutable after startup, same as every other piece of configuration).

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::config::OidcProviderConfig;
use crate::error::{GatewayError, Result};
use crate::token::UserInfo;

pub struct OidcProvider {
    config: OidcProviderConfig,
    http: reqwest::Client,
    discovery: OnceCell<Discovery>,
}

#[derive(Deserialize, Clone)]
struct Discovery {
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct OidcUserInfo {
    sub: String,
    preferred_username: Option<String>,
    name: Option<String>,
    email: Option<String>,
    #[serde(default, rename = "isMemberOf")]
    is_member_of: Vec<GroupClaim>,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Deserialize)]
struct GroupClaim {
    name: String,
}

impl OidcProvider {
    pub fn new(config: OidcProviderConfig, http: reqwest::Client) -> OidcProvider {
        OidcProvider {
            config,
            http,
            discovery: OnceCell::new(),
        }
    }

    async fn discovery(&self) -> Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                let url = format!(
                    "{}/.well-known/openid-configuration",
                    self.config.issuer.trim_end_matches('/')
                );
                self.http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| GatewayError::ProviderFailure(format!("OIDC discovery: {e}")))?
                    .json::<Discovery>()
                    .await
                    .map_err(|e| GatewayError::ProviderFailure(format!("invalid OIDC discovery document: {e}")))
            })
            .await
    }
}

#[async_trait]
impl super::IdentityProvider for OidcProvider {
    fn authorize_url(&self, state: &str, redirect_uri: &str) -> String {
        // The discovery document is already cached by the time `/login`
        // builds a redirect (fetched eagerly at startup); fall back to the
        // issuer's conventional path if it somehow isn't, rather than
        // blocking a synchronous method on a network call.
        let authorize_endpoint = self
            .discovery
            .get()
            .map(|d| d.authorization_endpoint.clone())
            .unwrap_or_else(|| format!("{}/authorize", self.config.issuer.trim_end_matches('/')));

        let mut scopes = vec!["openid".to_string(), "profile".to_string()];
        scopes.extend(self.config.scopes.iter().cloned());
        let scope = scopes.join(" ");

        format!(
            "{authorize_endpoint}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={state}",
            self.config.client_id,
            urlencoding_encode(redirect_uri),
            urlencoding_encode(&scope),
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<String> {
        let token_endpoint = self.discovery().await?.token_endpoint.clone();

        let response = self
            .http
            .post(&token_endpoint)
            .form(&[
                ("grant_type", "authorization_code"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::ProviderFailure(format!("OIDC token exchange: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::ProviderFailure(format!(
                "OIDC token exchange returned {}",
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
        let userinfo_endpoint = self.discovery().await?.userinfo_endpoint.clone();

        let info: OidcUserInfo = self
            .http
            .get(&userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| GatewayError::ProviderFailure(format!("OIDC userinfo: {e}")))?
            .json()
            .await
            .map_err(|e| GatewayError::ProviderFailure(format!("invalid OIDC userinfo response: {e}")))?;

        let uid = info
            .sub
            .parse::<i64>()
            .unwrap_or_else(|_| fnv1a_hash(&info.sub) as i64);

        let mut groups = info.groups;
        groups.extend(info.is_member_of.into_iter().map(|g| g.name));

        Ok(UserInfo {
            username: info.preferred_username.unwrap_or(info.sub),
            uid,
            groups,
            email: info.email,
            name: info.name,
        })
    }
}

/// Stable fallback numeric uid for providers whose `sub` isn't itself
/// numeric. `uid` is opaque to authgate beyond being returned verbatim in
/// identity headers, so any stable mapping suffices.
fn fnv1a_hash(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn urlencoding_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
