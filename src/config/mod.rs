//! Configuration for authgate.
//!
//! Loaded with `figment`: a YAML file (path from `GAFAELFAWR_SETTINGS_PATH`)
//! merged under environment variables, following the teacher's `Env::raw()`
//! pattern. Duration-shaped fields accept either a bare integer (seconds) or
//! a unit-suffixed string, via the same `fundu`-backed deserializer the
//! teacher uses for its own duration fields.

use std::collections::BTreeMap;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};

pub const SETTINGS_PATH_VAR: &str = "GAFAELFAWR_SETTINGS_PATH";
pub const UI_PATH_VAR: &str = "GAFAELFAWR_UI_PATH";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Realm echoed in `WWW-Authenticate` challenges.
    pub realm: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Base path every route is nested under. Empty by default.
    #[serde(default)]
    pub path_prefix: String,

    pub database_url: String,
    pub redis_url: String,

    /// Path to a file holding one `<kid>:<base64-key>` pair per line, newest
    /// key first. The first key is used to seal new cookies/cache entries;
    /// all keys are tried in order when opening one.
    pub session_secret_file: String,

    /// Accepted only on `POST /auth/api/v1/tokens`, used to seed an empty
    /// admin set.
    pub bootstrap_token: Option<String>,

    /// CIDR blocks or bare addresses of trusted reverse proxies, used to
    /// pick the real client IP out of `X-Forwarded-For`.
    #[serde(default)]
    pub proxies: Vec<String>,

    pub after_logout_url: String,

    pub issuer: IssuerConfig,

    #[serde(flatten)]
    pub provider: ProviderConfig,

    pub known_scopes: BTreeMap<String, String>,

    #[serde(default)]
    pub group_mapping: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub initial_admins: Vec<String>,

    #[serde(default = "default_username_regex")]
    pub username_regex: String,

    #[serde(
        default = "default_session_lifetime",
        deserialize_with = "deserialize_duration"
    )]
    pub session_lifetime: Duration,

    /// Directory of static UI assets. Validated (must be set when any
    /// browser-facing page is expected to render) but never served by the
    /// core — the UI is an external collaborator.
    pub ui_path: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IssuerConfig {
    pub iss: String,
    pub aud: String,
    pub aud_internal: String,
    pub key_file: String,
    #[serde(
        default = "default_exp_minutes",
        deserialize_with = "deserialize_duration"
    )]
    pub exp_minutes: Duration,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "provider_kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Github(GithubProviderConfig),
    Oidc(OidcProviderConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubProviderConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OidcProviderConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_username_regex() -> String {
    r"^[a-z0-9](?:[a-z0-9._-]*[a-z0-9])?$".to_string()
}

fn default_session_lifetime() -> Duration {
    Duration::from_secs(14 * 24 * 3600)
}

fn default_exp_minutes() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Same duration parser shape as the teacher's: seconds by default, accepts
/// `ms`/`s`/`m` suffixes and multiple summed units ("10s 2m").
const DURATION_PARSER: DurationParser<'static> = DurationParser::builder()
    .time_units(&[TimeUnit::Second, TimeUnit::MilliSecond, TimeUnit::Minute])
    .parse_multiple(None)
    .allow_time_unit_delimiter()
    .disable_infinity()
    .disable_fraction()
    .disable_exponent()
    .default_unit(TimeUnit::Second)
    .build();

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Visitor;

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a duration string or number of seconds")
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            DURATION_PARSER
                .parse(value)
                .map_err(|e| serde::de::Error::custom(format!("invalid duration '{value}': {e}")))?
                .try_into()
                .map_err(|e| serde::de::Error::custom(format!("duration conversion error: {e}")))
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Duration::from_secs(value))
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if value < 0 {
                return Err(serde::de::Error::custom("duration cannot be negative"));
            }
            Ok(Duration::from_secs(value as u64))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

impl Config {
    pub fn load() -> anyhow::Result<Config> {
        let mut figment = Figment::new();

        if let Ok(path) = std::env::var(SETTINGS_PATH_VAR) {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed("GAFAELFAWR_").split("__"));

        let config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

        Ok(config)
    }
}
