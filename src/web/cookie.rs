//! The state cookie: an AEAD-sealed envelope (`crate::crypto::Keyring`)
//! carrying the browser's session token key, its CSRF token, and — only
//! while mid-login — the OAuth `state` and return URL.
//!
//! The envelope is a single opaque blob so there is exactly one cookie to
//! reason about across the whole login/logout/API lifecycle, matching the
//! source's single `gafaelfawr` session cookie.

use axum_extra::extract::cookie::{Cookie, SameSite};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::Keyring;

pub const COOKIE_NAME: &str = "gafaelfawr";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateCookie {
    /// The full bearer token string (`gt-<key>.<secret>`) for the active
    /// session, once login has completed.
    pub session_token: Option<String>,
    /// 128-bit random CSRF token, bound to the browser by this cookie.
    /// Mutating API calls must echo it back in `X-CSRF-Token`.
    pub csrf: String,
    /// Present only between `START` and `DONE` of the login state machine.
    pub login: Option<LoginState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginState {
    pub state: String,
    pub return_url: String,
}

impl StateCookie {
    /// A brand-new cookie with a fresh CSRF token and no session yet.
    pub fn fresh() -> StateCookie {
        StateCookie {
            session_token: None,
            csrf: random_csrf(),
            login: None,
        }
    }

    pub fn seal(&self, keyring: &Keyring) -> crate::error::Result<String> {
        keyring.seal_json(self)
    }

    /// Parse the `gafaelfawr` cookie out of a jar and open it. A missing
    /// cookie or a decryption failure are both treated as "no state" rather
    /// than an error — the caller starts a fresh session in either case.
    pub fn from_jar(jar: &axum_extra::extract::CookieJar, keyring: &Keyring) -> Option<StateCookie> {
        let raw = jar.get(COOKIE_NAME)?.value().to_string();
        match keyring.open_json::<StateCookie>(&raw) {
            Ok(cookie) => Some(cookie),
            Err(err) => {
                tracing::warn!(error = %err, "failed to open state cookie");
                None
            }
        }
    }

    /// Build the `Set-Cookie` value for this envelope, sealed and ready to
    /// attach to a response.
    pub fn into_cookie(self, keyring: &Keyring, domain: &str) -> crate::error::Result<Cookie<'static>> {
        let sealed = self.seal(keyring)?;
        Ok(build_cookie(sealed, domain))
    }

    /// A cookie that clears the session (used by `/logout`): same envelope
    /// shape but empty, with `Max-Age=0`.
    pub fn clear(domain: &str) -> Cookie<'static> {
        let mut cookie = build_cookie(String::new(), domain);
        cookie.set_max_age(Some(cookie::time::Duration::ZERO));
        cookie
    }
}

fn build_cookie(value: String, domain: &str) -> Cookie<'static> {
    Cookie::build((COOKIE_NAME, value))
        .domain(domain.to_owned())
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .build()
}

fn random_csrf() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keyring() -> Keyring {
        let key = Keyring::generate_key();
        let path = std::env::temp_dir().join(format!("authgate-cookie-test-{}.key", std::process::id()));
        std::fs::write(&path, format!("k1:{key}\n")).unwrap();
        let keyring = Keyring::load(path.to_str().unwrap()).unwrap();
        let _ = std::fs::remove_file(&path);
        keyring
    }

    #[test]
    fn roundtrips_through_seal_and_open() {
        let keyring = test_keyring();
        let mut cookie = StateCookie::fresh();
        cookie.session_token = Some("gt-k.s".to_string());
        let sealed = cookie.seal(&keyring).unwrap();
        let opened: StateCookie = keyring.open_json(&sealed).unwrap();
        assert_eq!(opened.session_token.as_deref(), Some("gt-k.s"));
        assert_eq!(opened.csrf, cookie.csrf);
    }

    #[test]
    fn fresh_cookies_get_distinct_csrf_tokens() {
        let a = StateCookie::fresh();
        let b = StateCookie::fresh();
        assert_ne!(a.csrf, b.csrf);
        assert_eq!(a.csrf.len(), 32);
    }
}
