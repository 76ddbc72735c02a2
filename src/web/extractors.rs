//! Credential extraction (C4): turns an incoming request into at most one
//! opaque bearer token, and that token into a resolved [`AuthContext`].
//!
//! Precedence: state cookie, then `Authorization: Bearer`, then
//! `Authorization: Basic` (with GitHub's `x-oauth-basic` sentinel quirk).
//! A malformed `Authorization` header is `invalid_request`; an absent
//! credential is not an error at this layer — callers decide what to do
//! with `None`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum_extra::extract::CookieJar;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{GatewayError, Result};
use crate::state::AppState;
use crate::token::manager::AuthContext;
use crate::web::cookie::StateCookie;

const BASIC_AUTH_SENTINEL: &str = "x-oauth-basic";

/// Which part of the request the bearer token string was found in, carried
/// through for logging and for C5's distinction between cookie-based
/// browser sessions and bearer/basic API credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Cookie,
    Bearer,
    BasicUsername,
    BasicPassword,
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub source: CredentialSource,
    pub token: String,
}

/// Extract the single strongest-precedence credential from a request, or
/// `None` if none is present. `keyring` is needed to open the state cookie.
pub fn extract_credential(
    headers: &HeaderMap,
    jar: &CookieJar,
    keyring: &crate::crypto::Keyring,
) -> Result<Option<Credential>> {
    if let Some(state) = StateCookie::from_jar(jar, keyring) {
        if let Some(token) = state.session_token {
            return Ok(Some(Credential {
                source: CredentialSource::Cookie,
                token,
            }));
        }
    }

    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Ok(None);
    };
    let header = header
        .to_str()
        .map_err(|_| GatewayError::InvalidRequest("Authorization header is not valid UTF-8".into()))?;

    let (scheme, value) = header
        .split_once(' ')
        .ok_or_else(|| GatewayError::InvalidRequest("malformed Authorization header".into()))?;

    match scheme.to_ascii_lowercase().as_str() {
        "bearer" => {
            if value.is_empty() {
                return Err(GatewayError::InvalidRequest("empty bearer token".into()));
            }
            Ok(Some(Credential {
                source: CredentialSource::Bearer,
                token: value.to_string(),
            }))
        }
        "basic" => parse_basic(value).map(Some),
        other => Err(GatewayError::InvalidRequest(format!(
            "unsupported Authorization scheme '{other}'"
        ))),
    }
}

/// GitHub's convention for token-only Basic auth: either the username or the
/// password slot carries the sentinel `x-oauth-basic`, and the *other* slot
/// carries the actual token. If neither slot is the sentinel, the username
/// is treated as the token (logged, since this is an unusual client).
fn parse_basic(value: &str) -> Result<Credential> {
    let decoded = STANDARD
        .decode(value)
        .map_err(|_| GatewayError::InvalidRequest("invalid base64 in Basic credentials".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| GatewayError::InvalidRequest("Basic credentials are not valid UTF-8".into()))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| GatewayError::InvalidRequest("malformed Basic credentials".into()))?;

    if password == BASIC_AUTH_SENTINEL {
        return Ok(Credential {
            source: CredentialSource::BasicUsername,
            token: username.to_string(),
        });
    }
    if username == BASIC_AUTH_SENTINEL {
        return Ok(Credential {
            source: CredentialSource::BasicPassword,
            token: password.to_string(),
        });
    }

    tracing::info!("Basic auth credentials without x-oauth-basic sentinel, using username as token");
    Ok(Credential {
        source: CredentialSource::BasicUsername,
        token: username.to_string(),
    })
}

/// Resolves the caller's credential to a full [`AuthContext`], for handlers
/// that require an authenticated caller (the token-management API). Use
/// [`extract_credential`] directly in C5, which has its own challenge logic
/// on failure.
pub struct Authenticated(pub AuthContext);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Authenticated> {
        let jar = CookieJar::from_headers(&parts.headers);
        let credential = extract_credential(&parts.headers, &jar, &state.keyring)?
            .ok_or(GatewayError::InvalidToken)?;

        let secret = crate::crypto::secret::TokenSecret::parse(&credential.token)?;
        let data = state
            .manager
            .get_data(&secret)
            .await?
            .ok_or(GatewayError::InvalidToken)?;

        Ok(Authenticated(AuthContext {
            username: data.username,
            scopes: data.scopes,
            token_key: data.key,
            is_admin: data.scopes.contains("admin:token"),
        }))
    }
}

/// Like [`Authenticated`], for handlers that mutate state. When the caller
/// was resolved from the state cookie (a browser, not an API client using
/// `Authorization`), the request must also echo the cookie's CSRF token in
/// `X-CSRF-Token`; otherwise a stolen cookie alone would be enough to drive
/// the token-management API from a third-party page.
pub struct AuthenticatedMutation(pub AuthContext);

impl FromRequestParts<AppState> for AuthenticatedMutation {
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<AuthenticatedMutation> {
        let jar = CookieJar::from_headers(&parts.headers);
        let credential = extract_credential(&parts.headers, &jar, &state.keyring)?
            .ok_or(GatewayError::InvalidToken)?;

        if credential.source == CredentialSource::Cookie {
            let cookie_state = StateCookie::from_jar(&jar, &state.keyring).ok_or(GatewayError::InvalidToken)?;
            let presented = parts
                .headers
                .get("x-csrf-token")
                .and_then(|v| v.to_str().ok())
                .ok_or(GatewayError::InvalidToken)?;
            if presented != cookie_state.csrf {
                return Err(GatewayError::InvalidToken);
            }
        }

        let secret = crate::crypto::secret::TokenSecret::parse(&credential.token)?;
        let data = state
            .manager
            .get_data(&secret)
            .await?
            .ok_or(GatewayError::InvalidToken)?;

        Ok(AuthenticatedMutation(AuthContext {
            username: data.username,
            scopes: data.scopes,
            token_key: data.key,
            is_admin: data.scopes.contains("admin:token"),
        }))
    }
}

/// The client's real IP, honoring `config.proxies` as the set of trusted
/// reverse proxies allowed to set `X-Forwarded-For`. Falls back to the
/// socket peer address.
pub fn client_ip(headers: &HeaderMap, peer: std::net::IpAddr, proxies: &[String]) -> String {
    if !is_trusted_proxy(&peer, proxies) {
        return peer.to_string();
    }
    forwarded_for(headers)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| peer.to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<std::net::IpAddr> {
    let header = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = header.split(',').next()?.trim();
    first.parse().ok()
}

fn is_trusted_proxy(ip: &std::net::IpAddr, proxies: &[String]) -> bool {
    proxies.iter().any(|entry| match entry.split_once('/') {
        Some((addr, prefix)) => match (addr.parse::<std::net::IpAddr>(), prefix.parse::<u32>()) {
            (Ok(network), Ok(prefix_len)) => ip_in_cidr(ip, &network, prefix_len),
            _ => false,
        },
        None => entry.parse::<std::net::IpAddr>().as_ref() == Ok(ip),
    })
}

fn ip_in_cidr(ip: &std::net::IpAddr, network: &std::net::IpAddr, prefix_len: u32) -> bool {
    use std::net::IpAddr;
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
            (u32::from(*ip) & mask) == (u32::from(*net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let mask = if prefix_len == 0 { 0 } else { u128::MAX << (128 - prefix_len) };
            (u128::from(*ip) & mask) == (u128::from(*net) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_sentinel_in_password_slot_uses_username() {
        let encoded = STANDARD.encode("gt-k.s:x-oauth-basic");
        let cred = parse_basic(&encoded).unwrap();
        assert_eq!(cred.token, "gt-k.s");
        assert_eq!(cred.source, CredentialSource::BasicUsername);
    }

    #[test]
    fn basic_sentinel_in_username_slot_uses_password() {
        let encoded = STANDARD.encode("x-oauth-basic:gt-k.s");
        let cred = parse_basic(&encoded).unwrap();
        assert_eq!(cred.token, "gt-k.s");
        assert_eq!(cred.source, CredentialSource::BasicPassword);
    }

    #[test]
    fn basic_without_sentinel_falls_back_to_username() {
        let encoded = STANDARD.encode("gt-k.s:anything");
        let cred = parse_basic(&encoded).unwrap();
        assert_eq!(cred.token, "gt-k.s");
    }

    #[test]
    fn basic_requires_valid_base64() {
        assert!(parse_basic("not base64!!").is_err());
    }

    #[test]
    fn trusted_proxy_cidr_match() {
        let proxies = vec!["10.0.0.0/8".to_string()];
        let ip: std::net::IpAddr = "10.1.2.3".parse().unwrap();
        assert!(is_trusted_proxy(&ip, &proxies));
        let untrusted: std::net::IpAddr = "192.168.1.1".parse().unwrap();
        assert!(!is_trusted_proxy(&untrusted, &proxies));
    }
}
