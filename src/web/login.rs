//! Login state machine (C6): the browser-facing half of the OAuth2/OIDC
//! dance, `START -> AWAIT_CALLBACK -> DONE`.
//!
//! Grounded on the teacher's Discord login/callback pair in
//! `web/auth.rs`, generalized from its `OAuthStateStore` (a server-side
//! `DashMap`) to the sealed state cookie the spec calls for: CSRF `state`
//! and the return URL travel inside the same encrypted envelope as the
//! session token, so there is no server-side login state to garbage
//! collect or to lose on restart.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::CookieJar;
use rand::RngCore;
use serde::Deserialize;

use crate::error::{GatewayError, Result};
use crate::state::AppState;
use crate::web::cookie::{LoginState, StateCookie};

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    code: Option<String>,
    state: Option<String>,
    rd: Option<String>,
}

/// `GET /login`: dispatches on whether `code` is present to either start a
/// new login (redirect to the upstream provider) or complete one (exchange
/// the code, mint a session, redirect to the original destination).
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response> {
    let existing = StateCookie::from_jar(&jar, &state.keyring);

    match query.code {
        None => start_login(&state, &headers, &query, existing),
        Some(code) => {
            finish_login(&state, &headers, peer.ip(), &jar, &code, query.state.as_deref(), existing).await
        }
    }
}

/// `GET /logout`: clears the session cookie and returns to `after_logout_url`.
pub async fn logout(State(state): State<AppState>, headers: HeaderMap, jar: CookieJar) -> Response {
    let domain = external_host(&headers);
    let jar = jar.add(StateCookie::clear(&domain));
    (jar, Redirect::to(&state.config.after_logout_url)).into_response()
}

fn start_login(
    state: &AppState,
    headers: &HeaderMap,
    query: &LoginQuery,
    existing: Option<StateCookie>,
) -> Result<Response> {
    let return_url = query
        .rd
        .clone()
        .or_else(|| header_str(headers, "x-auth-request-redirect"))
        .ok_or_else(|| GatewayError::InvalidRequest("no return URL given for login".into()))?;

    let login_state = random_state();
    let mut cookie = existing.unwrap_or_else(StateCookie::fresh);
    cookie.login = Some(LoginState {
        state: login_state.clone(),
        return_url,
    });

    let domain = external_host(headers);
    let redirect_uri = callback_uri(state, headers);
    let authorize_url = state.provider.authorize_url(&login_state, &redirect_uri);

    let sealed = cookie.into_cookie(&state.keyring, &domain)?;
    let jar = CookieJar::new().add(sealed);
    Ok((jar, Redirect::to(&authorize_url)).into_response())
}

async fn finish_login(
    state: &AppState,
    headers: &HeaderMap,
    peer: std::net::IpAddr,
    jar: &CookieJar,
    code: &str,
    presented_state: Option<&str>,
    existing: Option<StateCookie>,
) -> Result<Response> {
    let Some(login) = existing.and_then(|c| c.login) else {
        return Err(GatewayError::PermissionDenied(
            "no login in progress".into(),
        ));
    };

    let Some(presented_state) = presented_state else {
        return Err(GatewayError::PermissionDenied("missing state parameter".into()));
    };
    if presented_state != login.state {
        return Err(GatewayError::PermissionDenied("state mismatch".into()));
    }

    let redirect_uri = callback_uri(state, headers);
    let access_token = state.provider.exchange_code(code, &redirect_uri).await?;
    let user_info = state.provider.fetch_user_info(&access_token).await?;

    let ip = crate::web::extractors::client_ip(headers, peer, &state.config.proxies);
    let token = state.manager.create_session_token(user_info, Some(&ip)).await?;

    let mut cookie = StateCookie::fresh();
    cookie.session_token = Some(token.to_token_string());

    let domain = external_host(headers);
    let sealed = cookie.into_cookie(&state.keyring, &domain)?;
    let response_jar = jar.clone().add(sealed);
    Ok((response_jar, Redirect::to(&login.return_url)).into_response())
}

/// 128-bit random value, base64url-encoded, used as the OAuth CSRF `state`.
fn random_state() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(str::to_string)
}

/// The externally visible host, used both as the cookie domain and to build
/// the OAuth callback URL. Trusts `Host` (and `X-Forwarded-Proto` for the
/// scheme) since this process always sits behind the ingress proxy that
/// terminates TLS.
fn external_host(headers: &HeaderMap) -> String {
    header_str(headers, header::HOST.as_str())
        .map(|h| h.split(':').next().unwrap_or(&h).to_string())
        .unwrap_or_else(|| "localhost".to_string())
}

fn callback_uri(state: &AppState, headers: &HeaderMap) -> String {
    let scheme = header_str(headers, "x-forwarded-proto").unwrap_or_else(|| "https".to_string());
    let host = header_str(headers, header::HOST.as_str()).unwrap_or_else(|| "localhost".to_string());
    format!("{scheme}://{host}{}/login", state.config.path_prefix)
}

/// `GET /auth/api/v1/login`: CSRF token plus the configured scope catalog,
/// consumed by the UI to prime its own state before it starts making
/// mutating API calls.
pub async fn login_info(State(state): State<AppState>, headers: HeaderMap, jar: CookieJar) -> Result<Response> {
    let cookie = StateCookie::from_jar(&jar, &state.keyring).unwrap_or_else(StateCookie::fresh);

    let username = match crate::web::extractors::extract_credential(&headers, &jar, &state.keyring)? {
        Some(credential) => {
            let secret = crate::crypto::secret::TokenSecret::parse(&credential.token)?;
            state.manager.get_data(&secret).await?.map(|data| data.username)
        }
        None => None,
    };

    let body = serde_json::json!({
        "csrf": cookie.csrf,
        "username": username,
        "scopes": state.config.known_scopes,
    });
    Ok(axum::Json(body).into_response())
}
