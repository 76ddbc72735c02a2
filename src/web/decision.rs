//! Decision engine (C5): the latency-critical `/auth` subrequest path that
//! NGINX's `auth_request` directive calls on every protected request.
//!
//! Grounded on the source's `handlers/auth.py`: same parameter names, same
//! precedence of failure modes, same AJAX-aware status upgrade, same
//! identity-header set. Expressed here as two axum handlers sharing a
//! `parse_auth_config` + challenge-building core instead of the source's
//! exception-driven control flow.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use axum_extra::extract::Query;
use serde::Deserialize;

use crate::crypto::secret::TokenSecret;
use crate::error::{GatewayError, Result};
use crate::state::AppState;
use crate::token::TokenData;
use crate::web::extractors::{client_ip, extract_credential};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfy {
    Any,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Bearer,
    Basic,
}

impl AuthType {
    fn as_str(self) -> &'static str {
        match self {
            AuthType::Bearer => "bearer",
            AuthType::Basic => "basic",
        }
    }
}

pub struct AuthConfig {
    scopes: BTreeSet<String>,
    satisfy: Satisfy,
    auth_type: AuthType,
}

#[derive(Debug, Deserialize)]
pub struct AuthQuery {
    #[serde(default)]
    scope: Vec<String>,
    satisfy: Option<String>,
    auth_type: Option<String>,
    notebook: Option<String>,
    delegate_to: Option<String>,
    #[serde(default)]
    delegate_scope: Vec<String>,
}

fn parse_auth_config(query: &AuthQuery) -> Result<AuthConfig> {
    if query.scope.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "scope parameter not set in the request".into(),
        ));
    }
    let satisfy = match query.satisfy.as_deref().unwrap_or("all") {
        "any" => Satisfy::Any,
        "all" => Satisfy::All,
        _ => {
            return Err(GatewayError::InvalidRequest(
                "satisfy parameter must be any or all".into(),
            ))
        }
    };
    let auth_type = match query.auth_type.as_deref().unwrap_or("bearer") {
        "bearer" => AuthType::Bearer,
        "basic" => AuthType::Basic,
        _ => {
            return Err(GatewayError::InvalidRequest(
                "auth_type parameter must be basic or bearer".into(),
            ))
        }
    };
    Ok(AuthConfig {
        scopes: query.scope.iter().cloned().collect(),
        satisfy,
        auth_type,
    })
}

/// NGINX's `auth_request` forwards the subrequest's original URI via these
/// headers; the core always logged it alongside the decision even though it
/// plays no role in the decision itself, so every decision log line here
/// carries an `auth_uri` field rather than dropping this context.
fn original_uri(headers: &HeaderMap) -> &str {
    headers
        .get("X-Original-URI")
        .or_else(|| headers.get("X-Original-URL"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
}

fn is_ajax(headers: &HeaderMap) -> bool {
    headers
        .get("X-Requested-With")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("xmlhttprequest"))
}

/// `<scheme> realm="<realm>"[, error="<error>"][, error_description="<desc>"][, scope="<scopes>"]`
fn build_challenge(
    auth_type: AuthType,
    realm: &str,
    error: Option<&str>,
    description: Option<&str>,
    scope: Option<&str>,
) -> HeaderValue {
    let mut challenge = format!("{} realm=\"{realm}\"", auth_type.as_str());
    if let Some(error) = error {
        challenge.push_str(&format!(", error=\"{error}\""));
    }
    if let Some(description) = description {
        challenge.push_str(&format!(", error_description=\"{description}\""));
    }
    if let Some(scope) = scope {
        challenge.push_str(&format!(", scope=\"{scope}\""));
    }
    HeaderValue::from_str(&challenge).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn joined(scopes: &BTreeSet<String>) -> String {
    scopes.iter().cloned().collect::<Vec<_>>().join(" ")
}

fn with_auth_headers(mut response: Response, challenge: HeaderValue) -> Response {
    response.headers_mut().insert(
        "Cache-Control",
        HeaderValue::from_static("no-cache, must-revalidate"),
    );
    response.headers_mut().insert("WWW-Authenticate", challenge);
    response
}

/// A 401 (403 for AJAX clients) with the challenge the source builds in
/// `unauthorized()`.
fn unauthorized(
    realm: &str,
    headers: &HeaderMap,
    auth: &AuthConfig,
    error: Option<&str>,
    description: &str,
) -> Response {
    let status = if is_ajax(headers) {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::UNAUTHORIZED
    };
    let challenge = build_challenge(auth.auth_type, realm, error, Some(description), None);
    with_auth_headers((status, description.to_string()).into_response(), challenge)
}

/// 403 with an `insufficient_scope` challenge naming the required scopes.
fn forbidden(realm: &str, auth: &AuthConfig) -> Response {
    let description = "Token missing required scope";
    let challenge = build_challenge(
        auth.auth_type,
        realm,
        Some("insufficient_scope"),
        None,
        Some(&joined(&auth.scopes)),
    );
    with_auth_headers(
        (StatusCode::FORBIDDEN, description.to_string()).into_response(),
        challenge,
    )
}

/// `GET /auth`: the NGINX `auth_request` subrequest endpoint.
pub async fn get_auth(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let realm = state.config.realm.clone();
    let auth_uri = original_uri(&headers).to_string();

    let auth_config = match parse_auth_config(&query) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };

    let credential = match extract_credential(&headers, &jar, &state.keyring) {
        Ok(c) => c,
        Err(_) => {
            let challenge = build_challenge(
                auth_config.auth_type,
                &realm,
                Some("invalid_request"),
                Some("malformed Authorization header"),
                None,
            );
            return with_auth_headers(StatusCode::BAD_REQUEST.into_response(), challenge);
        }
    };

    let Some(credential) = credential else {
        tracing::info!(%auth_uri, "no token found, returning unauthorized");
        return unauthorized(&realm, &headers, &auth_config, None, "Authentication required");
    };

    let secret = match TokenSecret::parse(&credential.token) {
        Ok(s) => s,
        Err(_) => {
            return unauthorized(&realm, &headers, &auth_config, Some("invalid_token"), "Invalid token");
        }
    };

    let data = match state.manager.get_data(&secret).await {
        Ok(Some(data)) => data,
        Ok(None) => {
            return unauthorized(&realm, &headers, &auth_config, Some("invalid_token"), "Invalid token");
        }
        Err(e) => return e.into_response(),
    };

    let authorized = match auth_config.satisfy {
        Satisfy::Any => auth_config.scopes.iter().any(|s| data.scopes.contains(s)),
        Satisfy::All => auth_config.scopes.is_subset(&data.scopes),
    };
    if !authorized {
        tracing::warn!(user = %data.username, %auth_uri, "token missing required scope");
        return forbidden(&realm, &auth_config);
    }

    tracing::info!(user = %data.username, %auth_uri, "token authorized");
    let ip = client_ip(&headers, peer.ip(), &state.config.proxies);

    match build_success(&state, &auth_config, &data, &query, &ip).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// `GET /auth/forbidden`: an uncached 403 error page NGINX routes to via
/// `error_page 403 = "/auth/forbidden?scope=..."`, so the browser never
/// caches the rejection.
pub async fn get_auth_forbidden(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    let auth_config = match parse_auth_config(&query) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };
    tracing::info!(auth_uri = %original_uri(&headers), "serving uncached 403 page");
    forbidden(&state.config.realm, &auth_config)
}

/// Applies `notebook=true` / `delegate_to=...` reissuance if requested, then
/// builds the identity-header response.
async fn build_success(
    state: &AppState,
    auth_config: &AuthConfig,
    data: &TokenData,
    query: &AuthQuery,
    ip: &str,
) -> Result<Response> {
    if query.notebook.as_deref() == Some("true") {
        let notebook = state.manager.get_notebook_token(data, Some(ip)).await?;
        let mut reissued = data.clone();
        reissued.scopes = notebook.scopes.clone();
        return Ok(finish_success(auth_config, &reissued, Some(notebook.to_token_string()), ip));
    }

    if let Some(service) = &query.delegate_to {
        let delegated: BTreeSet<String> = if query.delegate_scope.is_empty() {
            data.scopes.clone()
        } else {
            query
                .delegate_scope
                .iter()
                .filter(|s| data.scopes.contains(*s))
                .cloned()
                .collect()
        };
        let internal = state
            .manager
            .get_internal_token(data, service, delegated, Some(ip))
            .await?;
        let mut reissued = data.clone();
        reissued.scopes = internal.scopes.clone();
        return Ok(finish_success(auth_config, &reissued, Some(internal.to_token_string()), ip));
    }

    Ok(finish_success(auth_config, data, None, ip))
}

fn finish_success(auth_config: &AuthConfig, data: &TokenData, reissued_token: Option<String>, ip: &str) -> Response {
    let mut response = (StatusCode::OK, "ok").into_response();
    let headers = response.headers_mut();

    header_insert(headers, "X-Auth-Request-Client-Ip", ip);
    header_insert(headers, "X-Auth-Request-User", &data.username);
    if let Some(user_info) = &data.user_info {
        header_insert(headers, "X-Auth-Request-Uid", &user_info.uid.to_string());
        if let Some(email) = &user_info.email {
            header_insert(headers, "X-Auth-Request-Email", email);
        }
        if !user_info.groups.is_empty() {
            header_insert(headers, "X-Auth-Request-Groups", &user_info.groups.join(","));
        }
    }
    header_insert(headers, "X-Auth-Request-Token-Scopes", &joined(&data.scopes));
    header_insert(headers, "X-Auth-Request-Token-Scopes-Accepted", &joined(&auth_config.scopes));
    header_insert(
        headers,
        "X-Auth-Request-Token-Scopes-Satisfy",
        match auth_config.satisfy {
            Satisfy::Any => "any",
            Satisfy::All => "all",
        },
    );
    if let Some(token) = reissued_token {
        header_insert(headers, "X-Auth-Request-Token", &token);
    }

    response
}

fn header_insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_auth_config_requires_scope() {
        let query = AuthQuery {
            scope: vec![],
            satisfy: None,
            auth_type: None,
            notebook: None,
            delegate_to: None,
            delegate_scope: vec![],
        };
        assert!(parse_auth_config(&query).is_err());
    }

    #[test]
    fn parse_auth_config_rejects_bad_satisfy() {
        let query = AuthQuery {
            scope: vec!["read:all".into()],
            satisfy: Some("maybe".into()),
            auth_type: None,
            notebook: None,
            delegate_to: None,
            delegate_scope: vec![],
        };
        assert!(parse_auth_config(&query).is_err());
    }

    #[test]
    fn satisfy_any_passes_on_intersection() {
        let required: BTreeSet<String> = ["read:image".into(), "exec:admin".into()].into();
        let held: BTreeSet<String> = ["read:image".into()].into();
        assert!(required.iter().any(|s| held.contains(s)));
    }

    #[test]
    fn original_uri_falls_back_to_dash() {
        let headers = HeaderMap::new();
        assert_eq!(original_uri(&headers), "-");
    }

    #[test]
    fn original_uri_reads_x_original_uri() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Original-URI", HeaderValue::from_static("/protected/resource"));
        assert_eq!(original_uri(&headers), "/protected/resource");
    }

    #[test]
    fn challenge_matches_expected_shape() {
        let challenge = build_challenge(
            AuthType::Bearer,
            "example",
            Some("insufficient_scope"),
            None,
            Some("exec:admin read:image"),
        );
        assert_eq!(
            challenge.to_str().unwrap(),
            "bearer realm=\"example\", error=\"insufficient_scope\", scope=\"exec:admin read:image\""
        );
    }
}
