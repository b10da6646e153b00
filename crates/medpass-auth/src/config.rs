//! Session core configuration.
//!
//! [`AuthConfig`] is plain serde data with sensible defaults. The binary
//! builds it from environment variables via [`AuthConfig::from_env`]; tests
//! construct it directly.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AuthError, Result};
use crate::guard::GuardConfig;

/// Default near-expiry window: refresh five minutes before the token dies.
pub const DEFAULT_REFRESH_WINDOW_SECS: i64 = 300;

/// Default HTTP timeout for exchange calls.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default lifetime of an unanswered provider redirect.
pub const DEFAULT_STATE_TTL_SECS: i64 = 600;

/// Upper bound for the refresh window and the redirect lifetime.
pub const MAX_DURATION_SECS: i64 = 7 * 24 * 3_600;

/// Upper bound for the HTTP timeout.
pub const MAX_HTTP_TIMEOUT_SECS: u64 = 3_600;

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Identity-provider (Google) authorization code settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub client_id: String,
    /// Only for confidential clients; public clients rely on PKCE alone.
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            redirect_uri: "http://127.0.0.1:8400/callback".to_string(),
            scopes: vec!["openid".into(), "email".into(), "profile".into()],
        }
    }
}

impl ProviderConfig {
    /// Whether provider sign-in can be offered at all.
    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// AuthConfig
// ---------------------------------------------------------------------------

/// Everything the session core needs at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// MedPASS API base URL, e.g. `https://api.medpass.example`.
    pub api_base_url: String,
    pub provider: ProviderConfig,
    /// Lead time before expiry at which access triggers a refresh.
    pub refresh_window_secs: i64,
    pub http_timeout_secs: u64,
    pub state_ttl_secs: i64,
    pub guard: GuardConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            provider: ProviderConfig::default(),
            refresh_window_secs: DEFAULT_REFRESH_WINDOW_SECS,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            state_ttl_secs: DEFAULT_STATE_TTL_SECS,
            guard: GuardConfig::default(),
        }
    }
}

impl AuthConfig {
    /// Build from process environment variables (see [`from_lookup`]).
    ///
    /// [`from_lookup`]: Self::from_lookup
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from a variable lookup, starting from defaults.
    ///
    /// Recognised variables: `MEDPASS_API_URL`, `MEDPASS_GOOGLE_CLIENT_ID`,
    /// `MEDPASS_GOOGLE_CLIENT_SECRET`, `MEDPASS_GOOGLE_AUTH_URL`,
    /// `MEDPASS_GOOGLE_TOKEN_URL`, `MEDPASS_REDIRECT_URI`,
    /// `MEDPASS_REFRESH_WINDOW_SECS`, `MEDPASS_HTTP_TIMEOUT_SECS`,
    /// `MEDPASS_PROTECTED_PREFIXES` (comma separated).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidConfig`] for unparsable numbers or a
    /// configuration that fails [`validate`](Self::validate).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MEDPASS_API_URL") {
            config.api_base_url = v;
        }
        if let Some(v) = get("MEDPASS_GOOGLE_CLIENT_ID") {
            config.provider.client_id = v;
        }
        if let Some(v) = get("MEDPASS_GOOGLE_CLIENT_SECRET") {
            config.provider.client_secret = Some(v);
        }
        if let Some(v) = get("MEDPASS_GOOGLE_AUTH_URL") {
            config.provider.auth_url = v;
        }
        if let Some(v) = get("MEDPASS_GOOGLE_TOKEN_URL") {
            config.provider.token_url = v;
        }
        if let Some(v) = get("MEDPASS_REDIRECT_URI") {
            config.provider.redirect_uri = v;
        }
        if let Some(v) = get("MEDPASS_REFRESH_WINDOW_SECS") {
            config.refresh_window_secs = parse_number("MEDPASS_REFRESH_WINDOW_SECS", &v)?;
        }
        if let Some(v) = get("MEDPASS_HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = parse_number("MEDPASS_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("MEDPASS_PROTECTED_PREFIXES") {
            config.guard.protected_prefixes = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the session core cannot work with.
    pub fn validate(&self) -> Result<()> {
        let api = Url::parse(&self.api_base_url).map_err(|e| AuthError::InvalidConfig {
            reason: format!("api_base_url {:?}: {e}", self.api_base_url),
        })?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(AuthError::InvalidConfig {
                reason: format!("api_base_url must be http(s), got {}", api.scheme()),
            });
        }
        if !(0..=MAX_DURATION_SECS).contains(&self.refresh_window_secs) {
            return Err(AuthError::InvalidConfig {
                reason: format!(
                    "refresh_window_secs must be between 0 and {MAX_DURATION_SECS}, got {}",
                    self.refresh_window_secs
                ),
            });
        }
        if !(1..=MAX_HTTP_TIMEOUT_SECS).contains(&self.http_timeout_secs) {
            return Err(AuthError::InvalidConfig {
                reason: format!(
                    "http_timeout_secs must be between 1 and {MAX_HTTP_TIMEOUT_SECS}, got {}",
                    self.http_timeout_secs
                ),
            });
        }
        if !(1..=MAX_DURATION_SECS).contains(&self.state_ttl_secs) {
            return Err(AuthError::InvalidConfig {
                reason: format!(
                    "state_ttl_secs must be between 1 and {MAX_DURATION_SECS}, got {}",
                    self.state_ttl_secs
                ),
            });
        }
        if self.provider.is_configured() {
            for (name, value) in [
                ("auth_url", &self.provider.auth_url),
                ("token_url", &self.provider.token_url),
                ("redirect_uri", &self.provider.redirect_uri),
            ] {
                Url::parse(value).map_err(|e| AuthError::InvalidConfig {
                    reason: format!("provider {name} {value:?}: {e}"),
                })?;
            }
        }
        Ok(())
    }

    // The accessors clamp so an unvalidated config still cannot overflow
    // chrono arithmetic.

    pub fn refresh_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_window_secs.clamp(0, MAX_DURATION_SECS))
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs.clamp(1, MAX_HTTP_TIMEOUT_SECS))
    }

    pub fn state_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.state_ttl_secs.clamp(1, MAX_DURATION_SECS))
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AuthError::InvalidConfig {
            reason: format!("{name}={value:?}: {e}"),
        })
}
