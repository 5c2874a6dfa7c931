//! Connection records and their status state machine.
//!
//! ```text
//!             callback / api key ok
//!   PENDING ─────────────────────────► ACTIVE ◄──────────┐
//!      │                              │  ▲ │            │ next success
//!      │                      expired │  │ │ refreshed  │
//!      │                              ▼  │ │            │
//!      │                             EXPIRED            │
//!      │                              │    │ errors > threshold
//!      │                              │    ▼            │
//!      │                              │   ERROR ────────┘
//!      ▼                              ▼    │
//!   REVOKED ◄─────────────────────────┴────┘   (terminal)
//! ```

pub mod health;
mod oauth_state;


use crate::credentials::SealedCredentials;
use crate::error::ConnectionError;
use crate::provider::{AccountProfile, AuthType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use health::{evaluate, HealthReport};
pub use oauth_state::OAuthState;

/// Lifecycle status of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Pending,
    Active,
    Expired,
    Error,
    Revoked,
}

impl ConnectionStatus {
    pub const ALL: [ConnectionStatus; 5] = [
        ConnectionStatus::Pending,
        ConnectionStatus::Active,
        ConnectionStatus::Expired,
        ConnectionStatus::Error,
        ConnectionStatus::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "PENDING",
            ConnectionStatus::Active => "ACTIVE",
            ConnectionStatus::Expired => "EXPIRED",
            ConnectionStatus::Error => "ERROR",
            ConnectionStatus::Revoked => "REVOKED",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Staying in the same status is always allowed (a refresh of an ACTIVE
    /// connection keeps it ACTIVE). REVOKED is terminal.
    pub fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        if *self == next {
            return true;
        }

        match (self, next) {
            (Pending, Active) => true,
            (Active, Expired) | (Expired, Active) => true,
            (Active, Error) | (Expired, Error) => true,
            (Error, Active) => true,
            (Pending, Revoked) | (Active, Revoked) | (Expired, Revoked) | (Error, Revoked) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown connection status '{}'", s))
    }
}

/// Install-time metadata, already validated against the provider's schema.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionMetadata(BTreeMap<String, String>);

impl ConnectionMetadata {
    /// Wraps a map that has passed [`crate::provider::MetadataSchema::validate`].
    pub(crate) fn from_validated(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// Clear-text refresh bookkeeping that accompanies a sealed credential blob.
///
/// Lets the store select refresh candidates without decrypting anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenIndex {
    pub expires_at: Option<DateTime<Utc>>,
    pub has_refresh_token: bool,
}

/// A user's link to one external provider.
#[derive(Clone, Debug, PartialEq)]
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub provider_id: String,
    pub auth_type: AuthType,
    pub status: ConnectionStatus,
    /// Encrypted credential blob. `None` once revoked.
    pub credentials: Option<SealedCredentials>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub has_refresh_token: bool,
    pub account_email: Option<String>,
    pub account_id: Option<String>,
    pub granted_scopes: Vec<String>,
    pub sync_enabled: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_count: u32,
    pub api_call_count: u64,
    pub metadata: ConnectionMetadata,
    /// Where the install was initiated (e.g. "settings", "onboarding").
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented by the store on every write; compare-and-swap key.
    pub version: u64,
}

impl Connection {
    /// Creates a PENDING connection that has never been written.
    pub fn new(user_id: &str, provider_id: &str, auth_type: AuthType, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            provider_id: provider_id.to_string(),
            auth_type,
            status: ConnectionStatus::Pending,
            credentials: None,
            token_expires_at: None,
            has_refresh_token: false,
            account_email: None,
            account_id: None,
            granted_scopes: Vec::new(),
            sync_enabled: true,
            last_synced_at: None,
            last_used_at: None,
            error_message: None,
            error_count: 0,
            api_call_count: 0,
            metadata: ConnectionMetadata::default(),
            source: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    pub fn transition(
        &mut self,
        next: ConnectionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), ConnectionError> {
        if !self.status.can_transition_to(next) {
            return Err(ConnectionError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Installs fresh credentials and identity after a successful OAuth
    /// callback or API-key validation.
    pub fn activate(
        &mut self,
        sealed: SealedCredentials,
        index: TokenIndex,
        profile: &AccountProfile,
        now: DateTime<Utc>,
    ) -> Result<(), ConnectionError> {
        self.transition(ConnectionStatus::Active, now)?;
        self.credentials = Some(sealed);
        self.token_expires_at = index.expires_at;
        self.has_refresh_token = index.has_refresh_token;
        if profile.account_email.is_some() {
            self.account_email = profile.account_email.clone();
        }
        if profile.account_id.is_some() {
            self.account_id = profile.account_id.clone();
        }
        if !profile.granted_scopes.is_empty() {
            self.granted_scopes = profile.granted_scopes.clone();
        }
        self.error_count = 0;
        self.error_message = None;
        self.last_synced_at = Some(now);
        Ok(())
    }

    /// Records a successful token refresh.
    pub fn apply_refresh(
        &mut self,
        sealed: SealedCredentials,
        index: TokenIndex,
        now: DateTime<Utc>,
    ) -> Result<(), ConnectionError> {
        self.transition(ConnectionStatus::Active, now)?;
        self.credentials = Some(sealed);
        self.token_expires_at = index.expires_at;
        self.has_refresh_token = index.has_refresh_token;
        self.error_count = 0;
        self.error_message = None;
        self.last_synced_at = Some(now);
        Ok(())
    }

    /// Counts a transient failure. Escalates to ERROR once `error_count`
    /// exceeds `threshold`; returns whether this call escalated.
    pub fn record_transient_failure(
        &mut self,
        message: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, ConnectionError> {
        self.error_count = self.error_count.saturating_add(1);
        self.error_message = Some(message.to_string());
        self.updated_at = now;

        let escalate = self.error_count > threshold
            && matches!(
                self.status,
                ConnectionStatus::Active | ConnectionStatus::Expired
            );
        if escalate {
            self.transition(ConnectionStatus::Error, now)?;
        }
        Ok(escalate)
    }

    /// Terminal revoke. Drops the credential blob so nothing can use it again.
    pub fn revoke(&mut self, reason: Option<&str>, now: DateTime<Utc>) -> Result<(), ConnectionError> {
        self.transition(ConnectionStatus::Revoked, now)?;
        self.credentials = None;
        self.token_expires_at = None;
        self.has_refresh_token = false;
        self.sync_enabled = false;
        if let Some(reason) = reason {
            self.error_message = Some(reason.to_string());
        }
        Ok(())
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<(), ConnectionError> {
        self.transition(ConnectionStatus::Expired, now)
    }

    pub fn record_use(&mut self, now: DateTime<Utc>) {
        self.last_used_at = Some(now);
        self.api_call_count = self.api_call_count.saturating_add(1);
        self.updated_at = now;
    }

    /// True when the access token has a known expiry at or before `now`.
    pub fn is_token_expired(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Every status except REVOKED counts towards the one-per-provider limit.
    pub fn is_live(&self) -> bool {
        self.status != ConnectionStatus::Revoked
    }
}
