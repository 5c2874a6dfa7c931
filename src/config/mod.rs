//! Service configuration.
//!
//! Loaded from TOML (every section optional, every field defaulted), then
//! overridden from `SWITCHBOARD_*` environment variables, then validated.
//! Secrets are accepted from the environment only.

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::Deserialize;
use std::fmt;
use std::path::Path;

use crate::rate_limit::{Quota, RateLimits};

/// Complete Switchboard configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(skip)]
    pub secrets: Secrets,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// When false every request acts as the `default` user. When true the
    /// bearer token must match an entry of `SWITCHBOARD_USER_TOKENS`.
    #[serde(default)]
    pub auth_enabled: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            auth_enabled: false,
        }
    }
}

/// Credential database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "switchboard.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// OAuth flow configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Public base URL providers redirect back to.
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// Where the browser lands after a callback when the install named no target.
    #[serde(default = "default_return_url")]
    pub default_return_url: String,
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    #[serde(default = "default_state_cleanup_interval")]
    pub state_cleanup_interval_seconds: u64,
}

fn default_callback_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_return_url() -> String {
    "http://localhost:5173/settings/integrations".to_string()
}

fn default_state_ttl() -> i64 {
    600
}

fn default_state_cleanup_interval() -> u64 {
    300
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            callback_base_url: default_callback_base_url(),
            default_return_url: default_return_url(),
            state_ttl_seconds: default_state_ttl(),
            state_cleanup_interval_seconds: default_state_cleanup_interval(),
        }
    }
}

impl OAuthConfig {
    /// Provider-facing redirect URI registered with every OAuth client.
    pub fn callback_url(&self) -> String {
        format!(
            "{}/api/connections/oauth/callback",
            self.callback_base_url.trim_end_matches('/')
        )
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::seconds(self.state_ttl_seconds)
    }
}

/// Token refresh job configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Cadence of the external trigger; bounds the lookahead and deadline.
    #[serde(default = "default_trigger_interval")]
    pub trigger_interval_seconds: u64,
    #[serde(default = "default_lookahead")]
    pub lookahead_seconds: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_per_provider_concurrency")]
    pub per_provider_concurrency: usize,
    /// Timeout for every provider call (refresh, exchange, validation).
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,
    /// Transient failures tolerated before a connection moves to ERROR.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_soft_deadline")]
    pub soft_deadline_seconds: u64,
}

fn default_trigger_interval() -> u64 {
    900
}

fn default_lookahead() -> u64 {
    1200
}

fn default_max_concurrency() -> usize {
    8
}

fn default_per_provider_concurrency() -> usize {
    2
}

fn default_call_timeout() -> u64 {
    30
}

fn default_error_threshold() -> u32 {
    5
}

fn default_soft_deadline() -> u64 {
    600
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            trigger_interval_seconds: default_trigger_interval(),
            lookahead_seconds: default_lookahead(),
            max_concurrency: default_max_concurrency(),
            per_provider_concurrency: default_per_provider_concurrency(),
            call_timeout_seconds: default_call_timeout(),
            error_threshold: default_error_threshold(),
            soft_deadline_seconds: default_soft_deadline(),
        }
    }
}

impl RefreshConfig {
    pub fn lookahead(&self) -> Duration {
        Duration::seconds(self.lookahead_seconds as i64)
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn soft_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.soft_deadline_seconds)
    }
}

/// Per-user request limits, one quota per request kind
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    /// OAuth installs started per user per minute.
    #[serde(default = "default_install_per_minute")]
    pub install_per_user_per_minute: u64,
    /// API-key submissions per user per minute. Each one reaches the provider.
    #[serde(default = "default_api_key_per_minute")]
    pub api_key_per_user_per_minute: u64,
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_install_per_minute() -> u64 {
    30
}

fn default_api_key_per_minute() -> u64 {
    10
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            install_per_user_per_minute: default_install_per_minute(),
            api_key_per_user_per_minute: default_api_key_per_minute(),
        }
    }
}

impl RateLimitConfig {
    pub fn limits(&self) -> RateLimits {
        if !self.enabled {
            return RateLimits::default();
        }
        RateLimits {
            install: Some(Quota::per_minute(self.install_per_user_per_minute)),
            api_key: Some(Quota::per_minute(self.api_key_per_user_per_minute)),
        }
    }
}

/// Secrets read from the environment, never from the TOML file.
#[derive(Clone, Default)]
pub struct Secrets {
    /// Base64-encoded 32-byte AES key.
    pub encryption_key: Option<String>,
    /// Bearer secret for the cron endpoint. Unset rejects every call.
    pub cron_secret: Option<String>,
    /// `user_id:token` pairs, comma separated. Read when `server.auth_enabled`.
    pub user_tokens: Option<String>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<set>"))
            .field("cron_secret", &self.cron_secret.as_ref().map(|_| "<set>"))
            .field("user_tokens", &self.user_tokens.as_ref().map(|_| "<set>"))
            .finish()
    }
}

impl Config {
    /// Reads the TOML file if it exists, applies env overrides and validates.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            load_config(path)?
        } else {
            Config::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from environment variables, looked up via `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SWITCHBOARD_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(b) = lookup("SWITCHBOARD_AUTH_ENABLED").and_then(|v| v.parse::<bool>().ok()) {
            self.server.auth_enabled = b;
        }
        if let Some(v) = lookup("SWITCHBOARD_DB_PATH") {
            self.database.path = v;
        }
        if let Some(v) = lookup("SWITCHBOARD_CALLBACK_BASE_URL") {
            self.oauth.callback_base_url = v;
        }
        if let Some(v) = lookup("SWITCHBOARD_DEFAULT_RETURN_URL") {
            self.oauth.default_return_url = v;
        }
        if let Some(b) = lookup("SWITCHBOARD_RATE_LIMIT_ENABLED").and_then(|v| v.parse::<bool>().ok()) {
            self.rate_limit.enabled = b;
        }
        if let Some(n) = lookup("SWITCHBOARD_RATE_LIMIT_INSTALL_PER_MINUTE")
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.rate_limit.install_per_user_per_minute = n;
        }
        if let Some(n) = lookup("SWITCHBOARD_RATE_LIMIT_API_KEY_PER_MINUTE")
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.rate_limit.api_key_per_user_per_minute = n;
        }
        if let Some(n) = lookup("SWITCHBOARD_REFRESH_MAX_CONCURRENCY")
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.refresh.max_concurrency = n;
        }

        self.secrets.encryption_key = lookup("SWITCHBOARD_ENCRYPTION_KEY").filter(|v| !v.is_empty());
        self.secrets.cron_secret = lookup("SWITCHBOARD_CRON_SECRET").filter(|v| !v.is_empty());
        self.secrets.user_tokens = lookup("SWITCHBOARD_USER_TOKENS").filter(|v| !v.is_empty());
    }

    /// Rejects settings that would let tokens expire between refresh runs or
    /// let one run overlap the next.
    pub fn validate(&self) -> Result<()> {
        let refresh = &self.refresh;
        if refresh.lookahead_seconds < refresh.trigger_interval_seconds {
            bail!(
                "refresh.lookahead_seconds ({}) must be >= refresh.trigger_interval_seconds ({})",
                refresh.lookahead_seconds,
                refresh.trigger_interval_seconds
            );
        }
        if refresh.soft_deadline_seconds >= refresh.trigger_interval_seconds {
            bail!(
                "refresh.soft_deadline_seconds ({}) must be < refresh.trigger_interval_seconds ({})",
                refresh.soft_deadline_seconds,
                refresh.trigger_interval_seconds
            );
        }
        if refresh.max_concurrency == 0 || refresh.per_provider_concurrency == 0 {
            bail!("refresh concurrency limits must be at least 1");
        }
        if refresh.call_timeout_seconds == 0 {
            bail!("refresh.call_timeout_seconds must be at least 1");
        }
        if self.oauth.state_ttl_seconds <= 0 {
            bail!("oauth.state_ttl_seconds must be positive");
        }
        if self.oauth.state_cleanup_interval_seconds == 0 {
            bail!("oauth.state_cleanup_interval_seconds must be at least 1");
        }
        for (key, value) in [
            ("oauth.callback_base_url", &self.oauth.callback_base_url),
            ("oauth.default_return_url", &self.oauth.default_return_url),
        ] {
            let parsed = url::Url::parse(value)
                .with_context(|| format!("{} is not a valid URL: {}", key, value))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                bail!("{} must be an http(s) URL, got {}", key, value);
            }
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path))?;
    Ok(config)
}
