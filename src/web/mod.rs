//! HTTP surface: route table plus the per-request extractors and handlers
//! that implement C4 (credential extraction), C5 (the `/auth` decision
//! engine), C6 (the login state machine), the token-management API, and
//! C7's metadata endpoints.
//!
//! Grounded on the teacher's `web/routes.rs`: an explicit `Router` table
//! assembled once at startup and handed a cloned [`AppState`], with
//! `tower-http`'s trace/timeout/CORS layers wrapping the whole thing,
//! rather than the source's decorator-registered routes and ambient
//! per-request context.

pub mod api;
pub mod cookie;
pub mod decision;
pub mod extractors;
pub mod login;
pub mod openid;

use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the full application router. `/.well-known/*` is always served at
/// the true root regardless of `path_prefix`, since well-known URIs are
/// conventionally absolute; every other route lives under the prefix.
pub fn router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/auth", get(decision::get_auth))
        .route("/auth/forbidden", get(decision::get_auth_forbidden))
        .route("/login", get(login::login))
        .route("/logout", get(login::logout))
        .route("/auth/api/v1/login", get(login::login_info))
        .route("/auth/api/v1/token-info", get(api::token_info))
        .route("/auth/api/v1/user-info", get(api::user_info))
        .route(
            "/auth/api/v1/users/{username}/tokens",
            get(api::list_tokens).post(api::create_token),
        )
        .route(
            "/auth/api/v1/users/{username}/tokens/{key}",
            get(api::get_token).patch(api::modify_token).delete(api::delete_token),
        )
        .route(
            "/auth/api/v1/users/{username}/tokens/{key}/change-history",
            get(api::token_change_history),
        )
        .route(
            "/auth/api/v1/users/{username}/token-change-history",
            get(api::user_change_history),
        )
        .route("/auth/api/v1/history/token-changes", get(api::global_change_history))
        .route("/auth/api/v1/admins", get(api::list_admins).post(api::add_admin))
        .route("/auth/api/v1/admins/{username}", axum::routing::delete(api::delete_admin))
        .route("/auth/api/v1/tokens", axum::routing::post(api::admin_create_token))
        .route(
            "/auth/openid/token",
            get(openid::mint_token).post(openid::reissue_internal),
        )
        .with_state(state.clone());

    let well_known = Router::new()
        .route("/.well-known/jwks.json", get(openid::jwks))
        .route("/.well-known/openid-configuration", get(openid::openid_configuration))
        .with_state(state.clone());

    let prefix = state.config.path_prefix.clone();
    let app = if prefix.is_empty() {
        gated
    } else {
        Router::new().nest(&prefix, gated)
    };

    app.merge(well_known).layer((
        TraceLayer::new_for_http(),
        TimeoutLayer::new(Duration::from_secs(10)),
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    ))
}
