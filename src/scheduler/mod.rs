//! Batch token refresh.
//!
//! One [`TokenRefreshScheduler::run`] selects due OAuth2 connections and
//! refreshes them with bounded concurrency:
//!
//! ```text
//! list_due ──► buffer_unordered(max_concurrency)
//!                 │
//!                 ├─ per-provider semaphore
//!                 ├─ re-read record (skip if gone / no longer due)
//!                 ├─ adapter.refresh under call timeout
//!                 └─ compare_and_swap on the re-read version
//! ```
//!
//! Overlapping runs are tolerated: two workers that race on the same record
//! both call the provider, but only one compare-and-swap lands and the other
//! counts as skipped.


use crate::config::RefreshConfig;
use crate::connection::{Connection, TokenIndex};
use crate::credentials::{CredentialCipher, CredentialStore, DueCriteria};
use crate::error::AdapterError;
use crate::provider::{call_with_timeout, ProviderRegistry};
use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Scheduler tuning, usually taken from `[refresh]` in the config file.
#[derive(Clone, Debug)]
pub struct SchedulerSettings {
    pub lookahead: chrono::Duration,
    pub max_concurrency: usize,
    pub per_provider_concurrency: usize,
    pub call_timeout: Duration,
    /// Transient failures tolerated before a connection is flagged ERROR.
    pub error_threshold: u32,
    /// Candidates not started within this window are left for the next run.
    pub soft_deadline: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            lookahead: config.lookahead(),
            max_concurrency: config.max_concurrency,
            per_provider_concurrency: config.per_provider_concurrency,
            call_timeout: config.call_timeout(),
            error_threshold: config.error_threshold,
            soft_deadline: config.soft_deadline(),
        }
    }
}

/// Counts reported by one scheduler run.
///
/// `escalated` is a subset of `failed_transient`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub candidates: usize,
    pub refreshed: usize,
    /// Lost a compare-and-swap, or no longer due when re-read.
    pub skipped: usize,
    pub failed_transient: usize,
    pub revoked: usize,
    pub escalated: usize,
    /// Not started before the soft deadline.
    pub deferred: usize,
}

impl JobSummary {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Refreshed => self.refreshed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::FailedTransient => self.failed_transient += 1,
            Outcome::Escalated => {
                self.failed_transient += 1;
                self.escalated += 1;
            }
            Outcome::Revoked => self.revoked += 1,
            Outcome::Deferred => self.deferred += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Refreshed,
    Skipped,
    FailedTransient,
    Escalated,
    Revoked,
    Deferred,
}

/// Periodic refresher for OAuth2 connections nearing expiry.
pub struct TokenRefreshScheduler {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn CredentialStore>,
    cipher: CredentialCipher,
    settings: SchedulerSettings,
    /// Lazily created, one per provider id.
    provider_permits: DashMap<String, Arc<Semaphore>>,
}

impl TokenRefreshScheduler {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn CredentialStore>,
        cipher: CredentialCipher,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            registry,
            store,
            cipher,
            settings,
            provider_permits: DashMap::new(),
        }
    }

    /// Runs one refresh pass.
    ///
    /// Per-connection failures are recorded on the connection and counted.
    /// A store failure aborts the run and is returned as the error.
    pub async fn run(&self) -> Result<JobSummary> {
        let deadline = Instant::now() + self.settings.soft_deadline;
        let criteria = DueCriteria::refresh_candidates(Utc::now(), self.settings.lookahead);

        let candidates = self
            .store
            .list_due(&criteria)
            .context("Failed to list refresh candidates")?;

        let summary = JobSummary {
            candidates: candidates.len(),
            ..Default::default()
        };
        debug!(candidates = summary.candidates, "Token refresh run started");

        let summary = stream::iter(candidates)
            .map(|candidate| self.process(candidate, &criteria, deadline))
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .try_fold(summary, |mut summary, outcome| async move {
                summary.record(outcome);
                Ok::<_, anyhow::Error>(summary)
            })
            .await?;

        info!(
            candidates = summary.candidates,
            refreshed = summary.refreshed,
            skipped = summary.skipped,
            failed_transient = summary.failed_transient,
            revoked = summary.revoked,
            escalated = summary.escalated,
            deferred = summary.deferred,
            "Token refresh run complete"
        );
        Ok(summary)
    }

    fn provider_permits(&self, provider_id: &str) -> Arc<Semaphore> {
        self.provider_permits
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.settings.per_provider_concurrency.max(1)))
            })
            .clone()
    }

    async fn process(
        &self,
        candidate: Connection,
        criteria: &DueCriteria,
        deadline: Instant,
    ) -> Result<Outcome> {
        if Instant::now() >= deadline {
            return Ok(Outcome::Deferred);
        }

        let permits = self.provider_permits(&candidate.provider_id);
        let _permit = permits
            .acquire_owned()
            .await
            .context("Provider semaphore closed")?;
        if Instant::now() >= deadline {
            return Ok(Outcome::Deferred);
        }

        let Some(current) = self
            .store
            .get(&candidate.id)
            .with_context(|| format!("Failed to re-read connection {}", candidate.id))?
        else {
            return Ok(Outcome::Skipped);
        };
        if !criteria.matches(&current) {
            debug!(connection_id = %current.id, "No longer due, skipping");
            return Ok(Outcome::Skipped);
        }

        let Some(adapter) = self.registry.adapter(&current.provider_id) else {
            warn!(
                connection_id = %current.id,
                provider = %current.provider_id,
                "Provider not registered, skipping refresh"
            );
            return Ok(Outcome::Skipped);
        };

        let previous = match current.credentials.as_ref().map(|s| self.cipher.open(s)) {
            Some(Ok(credentials)) => credentials,
            Some(Err(e)) => {
                let message = format!("failed to decrypt credentials: {:#}", e);
                return self.record_failure(current, AdapterError::Transient(message));
            }
            None => {
                let message = "credentials missing".to_string();
                return self.record_failure(current, AdapterError::Transient(message));
            }
        };
        let Some(refresh_token) = previous.refresh_token.clone() else {
            let message = "refresh token missing from credentials".to_string();
            return self.record_failure(current, AdapterError::Transient(message));
        };

        let result = call_with_timeout(
            self.settings.call_timeout,
            "token refresh",
            adapter.refresh(&refresh_token),
        )
        .await;

        match result {
            Ok(tokens) => {
                let now = Utc::now();
                let credentials = tokens.into_credentials(previous.refresh_token);
                let index = TokenIndex {
                    expires_at: credentials.expires_at,
                    has_refresh_token: credentials.refresh_token.is_some(),
                };
                let sealed = self
                    .cipher
                    .seal(&credentials)
                    .context("Failed to seal refreshed credentials")?;

                let mut updated = current.clone();
                updated.apply_refresh(sealed, index, now)?;

                if self.swap(&current, &updated)? {
                    info!(
                        connection_id = %current.id,
                        user_id = %current.user_id,
                        provider = %current.provider_id,
                        "Token refreshed"
                    );
                    Ok(Outcome::Refreshed)
                } else {
                    Ok(Outcome::Skipped)
                }
            }
            Err(e) => self.record_failure(current, e),
        }
    }

    /// Applies a classified refresh failure to the connection.
    fn record_failure(&self, current: Connection, error: AdapterError) -> Result<Outcome> {
        let now = Utc::now();
        let mut updated = current.clone();

        let outcome = match &error {
            AdapterError::Auth(msg) | AdapterError::InvalidCredentials(msg) => {
                updated.revoke(Some(msg.as_str()), now)?;
                Outcome::Revoked
            }
            AdapterError::Transient(_)
            | AdapterError::RateLimited { .. }
            | AdapterError::Unsupported(_) => {
                let escalated = updated.record_transient_failure(
                    &error.to_string(),
                    self.settings.error_threshold,
                    now,
                )?;
                if escalated {
                    Outcome::Escalated
                } else {
                    Outcome::FailedTransient
                }
            }
        };

        if !self.swap(&current, &updated)? {
            return Ok(Outcome::Skipped);
        }

        match outcome {
            Outcome::Revoked => warn!(
                connection_id = %current.id,
                user_id = %current.user_id,
                provider = %current.provider_id,
                error = %error,
                "Refresh rejected by provider, connection revoked"
            ),
            Outcome::Escalated => warn!(
                connection_id = %current.id,
                provider = %current.provider_id,
                error_count = updated.error_count,
                error = %error,
                "Repeated refresh failures, connection flagged ERROR"
            ),
            _ => warn!(
                connection_id = %current.id,
                provider = %current.provider_id,
                error_count = updated.error_count,
                error = %error,
                "Token refresh failed"
            ),
        }
        Ok(outcome)
    }

    /// Compare-and-swap keyed on the version that was read. Losing is not an error.
    fn swap(&self, current: &Connection, updated: &Connection) -> Result<bool> {
        let swapped = self
            .store
            .compare_and_swap(&current.id, current.version, updated)
            .with_context(|| format!("Failed to update connection {}", current.id))?;
        if !swapped {
            debug!(connection_id = %current.id, "Connection changed concurrently, result discarded");
        }
        Ok(swapped)
    }
}
