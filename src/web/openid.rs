//! OIDC issuer (C7) HTTP surface.
//!
//! Only the metadata endpoints and the one handler that actually calls into
//! [`crate::oidc::Issuer`] from an authenticated session live here — per
//! the purpose statement, the full OpenID Connect authorization-code
//! provider flow (consent, client registration, `/auth/openid/authorize`)
//! is an external collaborator's concern; this crate's job ends at hashing
//! out the contract (mint/reissue) with the token manager.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum_extra::extract::CookieJar;
use serde::Deserialize;

use crate::error::{GatewayError, Result};
use crate::state::AppState;

/// `GET /.well-known/jwks.json`.
pub async fn jwks(State(state): State<AppState>) -> Response {
    Json(state.issuer.jwks()).into_response()
}

/// `GET /.well-known/openid-configuration`.
pub async fn openid_configuration(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let issuer_url = external_issuer_url(&state, &headers);
    Json(state.issuer.openid_configuration(&issuer_url)).into_response()
}

fn external_issuer_url(state: &AppState, headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}{}", state.config.path_prefix)
}

/// `GET /auth/openid/token`: mints an RS256 assertion for the caller's
/// current session, at the configured default audience.
pub async fn mint_token(State(state): State<AppState>, headers: HeaderMap, jar: CookieJar) -> Result<Response> {
    let credential = crate::web::extractors::extract_credential(&headers, &jar, &state.keyring)?
        .ok_or(GatewayError::InvalidToken)?;
    let secret = crate::crypto::secret::TokenSecret::parse(&credential.token)?;
    let data = state
        .manager
        .get_data(&secret)
        .await?
        .ok_or(GatewayError::InvalidToken)?;
    let user_info = data
        .user_info
        .ok_or_else(|| GatewayError::InvalidRequest("token has no user-info snapshot to assert".into()))?;

    let jwt = state.issuer.mint_for_user(&user_info, &data.scopes)?;
    Ok(Json(serde_json::json!({ "token": jwt })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ReissueRequest {
    token: String,
}

/// `POST /auth/openid/token`: validate a previously-minted assertion and
/// reissue it for the internal audience, with a fresh `jti` and a lifetime
/// capped at `issuer.exp_minutes` regardless of the original's remaining
/// lifetime. Used by internal relying parties that receive a
/// default-audience assertion from a browser-facing client and need to
/// forward a narrower one downstream.
pub async fn reissue_internal(
    State(state): State<AppState>,
    Json(body): Json<ReissueRequest>,
) -> Result<Response> {
    let claims = state.issuer.decode_own(&body.token)?;
    let jwt = state.issuer.reissue_internal(&claims)?;
    Ok(Json(serde_json::json!({ "token": jwt })).into_response())
}
