//! Timer that fires the Switchboard token refresh job.
//!
//! Calls `POST <switchboard>/api/cron/refresh-tokens` with the shared cron
//! secret on a fixed interval. A tick that fires while the previous call is
//! still running is skipped, not queued.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Trigger configuration, read from the environment.
#[derive(Clone)]
pub struct TriggerConfig {
    /// Switchboard base URL (e.g., "http://localhost:3000")
    pub base_url: String,
    pub cron_secret: String,
    pub interval: Duration,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for TriggerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerConfig")
            .field("base_url", &self.base_url)
            .field("cron_secret", &"<redacted>")
            .field("interval", &self.interval)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl TriggerConfig {
    /// `SWITCHBOARD_URL`, `SWITCHBOARD_CRON_SECRET` (required),
    /// `REFRESH_INTERVAL_SECONDS` (default 900), `REFRESH_TIMEOUT_SECONDS`
    /// (default 660).
    pub fn from_env<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup("SWITCHBOARD_URL").unwrap_or_else(|| "http://localhost:3000".to_string());
        let cron_secret = lookup("SWITCHBOARD_CRON_SECRET")
            .filter(|s| !s.is_empty())
            .context("SWITCHBOARD_CRON_SECRET is required")?;

        let seconds = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("{} must be a number of seconds", key)),
                None => Ok(default),
            }
        };
        let interval = seconds("REFRESH_INTERVAL_SECONDS", 900)?;
        let timeout = seconds("REFRESH_TIMEOUT_SECONDS", 660)?;
        if interval == 0 {
            bail!("REFRESH_INTERVAL_SECONDS must be at least 1");
        }

        Ok(Self {
            base_url,
            cron_secret,
            interval: Duration::from_secs(interval),
            request_timeout: Duration::from_secs(timeout),
        })
    }
}

/// Counts reported by the refresh job.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct JobSummary {
    pub candidates: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed_transient: usize,
    pub revoked: usize,
    pub escalated: usize,
    pub deferred: usize,
}

#[derive(Deserialize)]
struct TriggerResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    summary: Option<JobSummary>,
}

/// Fires one refresh job per call.
pub struct TriggerClient {
    endpoint: String,
    cron_secret: String,
    http_client: reqwest::Client,
}

impl TriggerClient {
    pub fn new(config: &TriggerConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            endpoint: format!(
                "{}/api/cron/refresh-tokens",
                config.base_url.trim_end_matches('/')
            ),
            cron_secret: config.cron_secret.clone(),
            http_client,
        })
    }

    /// Runs the job once and returns its summary.
    pub async fn trigger(&self) -> Result<JobSummary> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.cron_secret)
            .send()
            .await
            .context("Failed to reach Switchboard")?;

        let status = response.status();
        let body: TriggerResponse = response
            .json()
            .await
            .with_context(|| format!("Unexpected response from Switchboard (HTTP {})", status))?;

        if !status.is_success() || !body.success {
            bail!(
                "Refresh job failed (HTTP {}): {}",
                status,
                body.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        info!(
            message = body.message.as_deref().unwrap_or(""),
            "Refresh job completed"
        );
        Ok(body.summary.unwrap_or_default())
    }
}

/// Triggers the job every `interval` until the task is dropped.
///
/// Failures are logged and the loop carries on with the next tick.
pub async fn run(client: TriggerClient, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        match client.trigger().await {
            Ok(summary) => info!(
                candidates = summary.candidates,
                refreshed = summary.refreshed,
                skipped = summary.skipped,
                failed_transient = summary.failed_transient,
                revoked = summary.revoked,
                deferred = summary.deferred,
                "Refresh tick done"
            ),
            Err(e) => error!(error = %format!("{:#}", e), "Refresh tick failed"),
        }
    }
}
