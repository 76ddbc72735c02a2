//! The token-management API: `/auth/api/v1/*`.
//!
//! Every handler here either authenticates the caller with
//! [`Authenticated`]/[`AuthenticatedMutation`] and lets [`AuthContext`]'s ACL
//! checks in C3 do the authorization, or (for the admin-mint endpoint) also
//! accepts the configured bootstrap token as a one-time way to seed an empty
//! admin set.

use std::collections::BTreeSet;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum_extra::extract::CookieJar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{GatewayError, Result};
use crate::state::AppState;
use crate::token::db::HistoryFilters;
use crate::token::manager::AuthContext;
use crate::token::TokenType;
use crate::web::extractors::{Authenticated, AuthenticatedMutation};

/// `GET /auth/api/v1/token-info`: metadata for the token that authenticated
/// this very request.
///
/// Deliberately uses [`crate::token::manager::TokenManager::get_token_info_unchecked`]
/// rather than the owner-checked path: the caller has just proven they hold
/// this exact token, so there is no separate owner to check against.
pub async fn token_info(State(state): State<AppState>, Authenticated(auth): Authenticated) -> Result<Response> {
    let info = state
        .manager
        .get_token_info_unchecked(&auth.token_key)
        .await?
        .ok_or_else(|| GatewayError::NotFound("token".into()))?;
    Ok(Json(info).into_response())
}

/// `GET /auth/api/v1/user-info`: the user-info snapshot captured when the
/// authenticating session was minted (absent for non-session tokens).
pub async fn user_info(State(state): State<AppState>, headers: HeaderMap, jar: CookieJar) -> Result<Response> {
    let credential = crate::web::extractors::extract_credential(&headers, &jar, &state.keyring)?
        .ok_or(GatewayError::InvalidToken)?;
    let secret = crate::crypto::secret::TokenSecret::parse(&credential.token)?;
    let data = state
        .manager
        .get_data(&secret)
        .await?
        .ok_or(GatewayError::InvalidToken)?;

    let body = serde_json::json!({
        "username": data.username,
        "user_info": data.user_info,
        "scopes": data.scopes,
    });
    Ok(Json(body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    token_name: String,
    #[serde(default)]
    scopes: Vec<String>,
    expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct NewTokenResponse {
    token: String,
    token_name: String,
    scopes: BTreeSet<String>,
    created: DateTime<Utc>,
    expires: Option<DateTime<Utc>>,
}

fn location(state: &AppState, owner: &str, key: &str) -> HeaderValue {
    let value = format!("{}/auth/api/v1/users/{owner}/tokens/{key}", state.config.path_prefix);
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// `POST /auth/api/v1/users/{username}/tokens`: mint a new `user` token.
pub async fn create_token(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    AuthenticatedMutation(auth): AuthenticatedMutation,
    Json(body): Json<CreateTokenRequest>,
) -> Result<Response> {
    let scopes: BTreeSet<String> = body.scopes.into_iter().collect();
    let token = state
        .manager
        .create_user_token(&auth, &owner, &body.token_name, scopes.clone(), body.expires, None)
        .await?;

    let response = NewTokenResponse {
        token: token.to_token_string(),
        token_name: body.token_name,
        scopes,
        created: token.created_at,
        expires: token.expires_at,
    };

    let mut resp = (StatusCode::CREATED, Json(response)).into_response();
    resp.headers_mut().insert(axum::http::header::LOCATION, location(&state, &owner, token.key()));
    Ok(resp)
}

/// `GET /auth/api/v1/users/{username}/tokens`.
pub async fn list_tokens(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Authenticated(auth): Authenticated,
) -> Result<Response> {
    let tokens = state.manager.list_tokens(&auth, &owner).await?;
    Ok(Json(tokens).into_response())
}

/// `GET /auth/api/v1/users/{username}/tokens/{key}`.
pub async fn get_token(
    State(state): State<AppState>,
    Path((owner, key)): Path<(String, String)>,
    Authenticated(auth): Authenticated,
) -> Result<Response> {
    let info = state
        .manager
        .get_token_info(&key, &auth, &owner)
        .await?
        .ok_or_else(|| GatewayError::NotFound("token".into()))?;
    Ok(Json(info).into_response())
}

fn deserialize_some<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    serde::Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct ModifyTokenRequest {
    token_name: Option<String>,
    scopes: Option<Vec<String>>,
    /// Three-valued: absent (no change), explicit `null` (clear the
    /// expiry), or a timestamp (set a new one).
    #[serde(default, deserialize_with = "deserialize_some")]
    expires: Option<Option<DateTime<Utc>>>,
}

/// `PATCH /auth/api/v1/users/{username}/tokens/{key}`. Mirrors the source's
/// quirk of returning `201` (not `200`) on a successful edit.
pub async fn modify_token(
    State(state): State<AppState>,
    Path((owner, key)): Path<(String, String)>,
    AuthenticatedMutation(auth): AuthenticatedMutation,
    Json(body): Json<ModifyTokenRequest>,
) -> Result<Response> {
    let scopes = body.scopes.map(|v| v.into_iter().collect::<BTreeSet<_>>());
    let (expires, no_expire) = match body.expires {
        None => (None, false),
        Some(None) => (None, true),
        Some(Some(dt)) => (Some(dt), false),
    };

    let info = state
        .manager
        .modify_token(&key, &auth, &owner, body.token_name.as_deref(), scopes, expires, no_expire, None)
        .await?
        .ok_or_else(|| GatewayError::NotFound("token".into()))?;

    Ok((StatusCode::CREATED, Json(info)).into_response())
}

/// `DELETE /auth/api/v1/users/{username}/tokens/{key}`.
pub async fn delete_token(
    State(state): State<AppState>,
    Path((owner, key)): Path<(String, String)>,
    AuthenticatedMutation(auth): AuthenticatedMutation,
) -> Result<StatusCode> {
    let deleted = state.manager.delete_token(&key, &auth, &owner, None).await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::NotFound("token".into()))
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    username: Option<String>,
    actor: Option<String>,
    key: Option<String>,
    token_type: Option<String>,
    ip_or_cidr: Option<String>,
    cursor: Option<String>,
    limit: Option<i64>,
}

fn parse_token_type(value: &str) -> Result<TokenType> {
    match value {
        "session" => Ok(TokenType::Session),
        "user" => Ok(TokenType::User),
        "notebook" => Ok(TokenType::Notebook),
        "internal" => Ok(TokenType::Internal),
        "service" => Ok(TokenType::Service),
        other => Err(GatewayError::InvalidRequest(format!("unknown token_type '{other}'"))),
    }
}

impl HistoryQuery {
    fn into_filters(self) -> Result<HistoryFilters> {
        Ok(HistoryFilters {
            since: self.since,
            until: self.until,
            username: self.username,
            actor: self.actor,
            key: self.key,
            token_type: self.token_type.as_deref().map(parse_token_type).transpose()?,
            ip_or_cidr: self.ip_or_cidr,
            cursor: self.cursor,
            limit: self.limit,
        })
    }
}

fn history_response(page: crate::token::db::HistoryPage, limited: bool) -> Response {
    let mut response = (StatusCode::OK, Json(page.entries)).into_response();
    let headers = response.headers_mut();
    if let Ok(count) = HeaderValue::from_str(&page.count.to_string()) {
        headers.insert("X-Total-Count", count);
    }
    if limited {
        let mut links = Vec::new();
        if let Some(next) = &page.next_cursor {
            links.push(format!("<?cursor={next}>; rel=\"next\""));
        }
        if let Some(prev) = &page.prev_cursor {
            links.push(format!("<?cursor={prev}>; rel=\"prev\""));
        }
        if !links.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&links.join(", ")) {
                headers.insert(axum::http::header::LINK, value);
            }
        }
    }
    response
}

/// `GET /auth/api/v1/users/{username}/tokens/{key}/change-history`.
pub async fn token_change_history(
    State(state): State<AppState>,
    Path((owner, key)): Path<(String, String)>,
    Authenticated(auth): Authenticated,
    Query(query): Query<HistoryQuery>,
) -> Result<Response> {
    let limited = query.limit.is_some();
    let mut filters = query.into_filters()?;
    filters.key = Some(key);
    let page = state.manager.get_user_change_history(&auth, &owner, filters).await?;
    Ok(history_response(page, limited))
}

/// `GET /auth/api/v1/users/{username}/token-change-history`.
pub async fn user_change_history(
    State(state): State<AppState>,
    Path(owner): Path<String>,
    Authenticated(auth): Authenticated,
    Query(query): Query<HistoryQuery>,
) -> Result<Response> {
    let limited = query.limit.is_some();
    let filters = query.into_filters()?;
    let page = state.manager.get_user_change_history(&auth, &owner, filters).await?;
    Ok(history_response(page, limited))
}

/// `GET /auth/api/v1/history/token-changes`: global history, admin-only.
pub async fn global_change_history(
    State(state): State<AppState>,
    Authenticated(auth): Authenticated,
    Query(query): Query<HistoryQuery>,
) -> Result<Response> {
    let limited = query.limit.is_some();
    let filters = query.into_filters()?;
    let page = state.manager.get_change_history(&auth, filters).await?;
    Ok(history_response(page, limited))
}

/// `GET /auth/api/v1/admins`.
pub async fn list_admins(State(state): State<AppState>, Authenticated(_auth): Authenticated) -> Result<Response> {
    let admins = state.manager.admins().await?;
    let body: Vec<_> = admins.into_iter().map(|username| serde_json::json!({ "username": username })).collect();
    Ok(Json(body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct AdminRequest {
    username: String,
}

/// `POST /auth/api/v1/admins`.
pub async fn add_admin(
    State(state): State<AppState>,
    AuthenticatedMutation(auth): AuthenticatedMutation,
    Json(body): Json<AdminRequest>,
) -> Result<StatusCode> {
    state.manager.add_admin(&auth, &body.username).await?;
    Ok(StatusCode::CREATED)
}

/// `DELETE /auth/api/v1/admins/{username}`.
pub async fn delete_admin(
    State(state): State<AppState>,
    Path(username): Path<String>,
    AuthenticatedMutation(auth): AuthenticatedMutation,
) -> Result<StatusCode> {
    if state.manager.delete_admin(&auth, &username).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::NotFound("admin".into()))
    }
}

#[derive(Debug, Deserialize)]
pub struct AdminCreateTokenRequest {
    username: String,
    token_type: String,
    token_name: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    expires: Option<DateTime<Utc>>,
}

/// `POST /auth/api/v1/tokens`: admin-minted `user`/`service` tokens. Also
/// the one endpoint that accepts the configured bootstrap token in place of
/// a real bearer credential, to seed an empty admin set
/// (`allow_bootstrap_token=true`).
pub async fn admin_create_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<AdminCreateTokenRequest>,
) -> Result<Response> {
    let auth = resolve_bootstrap_or_mutation(&state, &headers, &jar).await?;

    let token_type = match body.token_type.as_str() {
        "user" => TokenType::User,
        "service" => TokenType::Service,
        other => {
            return Err(GatewayError::InvalidRequest(format!(
                "admin token creation only mints user or service tokens, got '{other}'"
            )))
        }
    };

    let scopes: BTreeSet<String> = body.scopes.into_iter().collect();
    let token = state
        .manager
        .create_token_from_admin_request(&auth, &body.username, token_type, body.token_name.as_deref(), scopes.clone(), body.expires, None)
        .await?;

    let response = NewTokenResponse {
        token: token.to_token_string(),
        token_name: body.token_name.unwrap_or_default(),
        scopes,
        created: token.created_at,
        expires: token.expires_at,
    };

    let mut resp = (StatusCode::CREATED, Json(response)).into_response();
    resp.headers_mut().insert(axum::http::header::LOCATION, location(&state, &body.username, token.key()));
    Ok(resp)
}

/// Resolves the caller for `POST /auth/api/v1/tokens`: the configured
/// bootstrap token (if presented and configured) short-circuits to a
/// synthetic admin identity; otherwise this falls through to the normal
/// CSRF-checked authenticated-mutation path.
async fn resolve_bootstrap_or_mutation(state: &AppState, headers: &HeaderMap, jar: &CookieJar) -> Result<AuthContext> {
    if let Some(bootstrap) = &state.config.bootstrap_token {
        if let Some(presented) = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bearer ").or_else(|| v.strip_prefix("Bearer ")))
        {
            if presented == bootstrap {
                return Ok(AuthContext {
                    username: "<bootstrap>".to_string(),
                    scopes: ["admin:token".to_string()].into_iter().collect(),
                    token_key: "<bootstrap>".to_string(),
                    is_admin: true,
                });
            }
        }
    }

    let credential = crate::web::extractors::extract_credential(headers, jar, &state.keyring)?
        .ok_or(GatewayError::InvalidToken)?;
    if credential.source == crate::web::extractors::CredentialSource::Cookie {
        let cookie_state = crate::web::cookie::StateCookie::from_jar(jar, &state.keyring).ok_or(GatewayError::InvalidToken)?;
        let presented = headers
            .get("x-csrf-token")
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::InvalidToken)?;
        if presented != cookie_state.csrf {
            return Err(GatewayError::InvalidToken);
        }
    }
    let secret = crate::crypto::secret::TokenSecret::parse(&credential.token)?;
    let data = state.manager.get_data(&secret).await?.ok_or(GatewayError::InvalidToken)?;
    Ok(AuthContext {
        username: data.username,
        scopes: data.scopes.clone(),
        token_key: data.key,
        is_admin: data.scopes.contains("admin:token"),
    })
}
