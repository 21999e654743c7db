//! Session manager configuration.
//!
//! Every option has a default; a config file only needs the options it
//! changes. camelCase option names, as used by browser clients, are accepted as
//! aliases so an existing options object can be dropped in as JSON.
//!
//! Configuration is stored at `~/.config/identity/config.json`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "identity";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Renew this long before the access token expires.
const DEFAULT_REFRESH_MARGIN_SECS: i64 = 30;

/// Proactive renewal only fires once expiry is this close (5 minutes).
const DEFAULT_RENEWAL_THRESHOLD_SECS: i64 = 5 * 60;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Credential endpoints relative to `base_url`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Login,
    Logout,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    #[serde(alias = "url", alias = "baseUrl")]
    pub base_url: String,
    #[serde(alias = "loginUrl", alias = "loginPath")]
    pub login_path: String,
    #[serde(alias = "logoutUrl", alias = "logoutPath")]
    pub logout_path: String,
    #[serde(alias = "refreshUrl", alias = "refreshPath")]
    pub refresh_path: String,
    /// Response body field holding the access token.
    #[serde(alias = "accessToken", alias = "accessTokenField")]
    pub access_token_field: String,
    /// Response body field holding the refresh token.
    #[serde(alias = "refreshToken", alias = "refreshTokenField")]
    pub refresh_token_field: String,
    /// Where a route guard sends users it could not authenticate.
    #[serde(alias = "unauthorizedRedirect", alias = "unauthorizedRedirectPath")]
    pub unauthorized_redirect_path: Option<String>,
    /// `redirect` query parameter sent with the initial authenticate call.
    #[serde(alias = "redirect", alias = "loginRedirectParam")]
    pub login_redirect_param: Option<String>,
    /// `scope` query parameter sent with the initial authenticate call.
    #[serde(alias = "scope", alias = "scopeParam")]
    pub scope_param: Option<String>,
    pub refresh_margin_secs: i64,
    pub renewal_threshold_secs: i64,
    pub request_timeout_secs: u64,
    /// Namespace for the persisted refresh token.
    pub storage_namespace: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/api".to_string(),
            login_path: "/login".to_string(),
            logout_path: "/logout".to_string(),
            refresh_path: "/refresh".to_string(),
            access_token_field: "token".to_string(),
            refresh_token_field: "refresh".to_string(),
            unauthorized_redirect_path: None,
            login_redirect_param: None,
            scope_param: None,
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            renewal_threshold_secs: DEFAULT_RENEWAL_THRESHOLD_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            storage_namespace: APP_NAME.to_string(),
        }
    }
}

impl IdentityConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Full URL of a credential endpoint.
    pub fn uri(&self, endpoint: Endpoint) -> String {
        let path = match endpoint {
            Endpoint::Login => &self.login_path,
            Endpoint::Logout => &self.logout_path,
            Endpoint::Refresh => &self.refresh_path,
        };
        self.resolve(path)
    }

    /// Join an API path onto `base_url`.
    pub fn resolve(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.is_empty() {
            base.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// Query parameters for the initial authenticate call.
    pub fn login_params(&self) -> Vec<(&'static str, &str)> {
        let mut params = Vec::new();
        if let Some(ref scope) = self.scope_param {
            params.push(("scope", scope.as_str()));
        }
        if let Some(ref redirect) = self.login_redirect_param {
            params.push(("redirect", redirect.as_str()));
        }
        params
    }

    /// How long before expiry the renewal timer fires. Capped at the renewal
    /// threshold, so a fired timer always finds the renewal due.
    pub fn refresh_margin(&self) -> Duration {
        seconds_or(self.refresh_margin_secs, DEFAULT_REFRESH_MARGIN_SECS).min(self.renewal_threshold())
    }

    pub fn renewal_threshold(&self) -> Duration {
        seconds_or(self.renewal_threshold_secs, DEFAULT_RENEWAL_THRESHOLD_SECS)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

/// Non-negative duration from a config value, falling back to `default`
/// when the value is out of range.
fn seconds_or(secs: i64, default: i64) -> Duration {
    Duration::try_seconds(secs)
        .unwrap_or_else(|| Duration::seconds(default))
        .max(Duration::zero())
}
