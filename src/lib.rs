//! `authgate`: an authentication and authorization gateway in the style of
//! Gafaelfawr — a single `/auth` decision endpoint for a reverse proxy, a
//! token-management API, an OIDC-based login flow, and an OIDC assertion
//! issuer for internal relying parties.
//!
//! Split into a library and a thin `main.rs` binary shell so integration
//! tests under `tests/` can exercise the database layer and the router
//! directly, the way the teacher's own `tests/` directory does against its
//! `banner` crate.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod formatter;
pub mod logging;
pub mod oidc;
pub mod provider;
pub mod state;
pub mod token;
pub mod web;
