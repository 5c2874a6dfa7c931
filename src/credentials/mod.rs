//! Encrypted credential storage for connections and OAuth state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  ConnectionManager / RefreshScheduler    │
//! │  - seal / open via CredentialCipher      │
//! └─────────────────────────────────────────┘
//!          ↓ SealedCredentials   ↑
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore (trait)            │
//! │  - get / upsert / compare_and_swap       │
//! │  - list_due / single-use OAuth state     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌──────────────────┐  ┌──────────────────┐
//! │ SqliteCredential │  │ MemoryCredential │
//! │ Store (durable)  │  │ Store (tests)    │
//! └──────────────────┘  └──────────────────┘
//! ```
//!
//! The store never sees plaintext tokens: the credential blob is sealed with
//! AES-256-GCM before it is handed over, and only the clear-text refresh index
//! (expiry, whether a refresh token exists) is queryable.
//!
//! # Concurrency
//!
//! Every mutation of a single record is atomic. Writers that race on the same
//! connection use [`CredentialStore::compare_and_swap`] keyed on
//! [`Connection::version`]; OAuth state consumption is a conditional
//! `consumed = false -> true` update that succeeds exactly once.

use crate::connection::{Connection, ConnectionStatus, OAuthState};
use crate::error::StoreResult;
use crate::provider::AuthType;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod encryption;
mod memory;
mod storage;

pub use encryption::{validate_key, CredentialCipher};
pub use memory::MemoryCredentialStore;
pub use storage::SqliteCredentialStore;

/// Decrypted credentials for an external provider.
///
/// Only exists for the duration of a single operation; persisted solely in
/// sealed form.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    /// OAuth access token, or the API key for key-based providers
    pub access_token: String,

    /// OAuth refresh token (used to obtain new access tokens)
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC)
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// API secret paired with the key (key-based providers only)
    #[serde(default)]
    pub api_secret: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("has_api_secret", &self.api_secret.is_some())
            .finish()
    }
}

/// AES-256-GCM sealed [`Credentials`], both fields base64.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCredentials {
    pub ciphertext: String,
    pub nonce: String,
}

impl fmt::Debug for SealedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedCredentials({} bytes)", self.ciphertext.len())
    }
}

/// Selection criteria for connections whose tokens need refreshing.
#[derive(Clone, Debug)]
pub struct DueCriteria {
    pub auth_type: AuthType,
    pub statuses: Vec<ConnectionStatus>,
    pub require_refresh_token: bool,
    /// Tokens expiring at or before this instant are due.
    pub expires_before: DateTime<Utc>,
    pub limit: Option<usize>,
}

impl DueCriteria {
    /// OAuth2 connections in ACTIVE/EXPIRED with a refresh token, expiring
    /// within `lookahead` of `now`.
    pub fn refresh_candidates(now: DateTime<Utc>, lookahead: Duration) -> Self {
        Self {
            auth_type: AuthType::OAuth2,
            statuses: vec![ConnectionStatus::Active, ConnectionStatus::Expired],
            require_refresh_token: true,
            expires_before: now + lookahead,
            limit: None,
        }
    }

    pub fn matches(&self, connection: &Connection) -> bool {
        connection.auth_type == self.auth_type
            && self.statuses.contains(&connection.status)
            && (!self.require_refresh_token || connection.has_refresh_token)
            && connection
                .token_expires_at
                .is_some_and(|expires_at| expires_at <= self.expires_before)
    }
}

/// Durable storage port for connection and OAuth state records.
///
/// Implementations must make every single-record mutation atomic. Versions are
/// owned by the store: an insert stores version 1 and every later write stores
/// the previous version + 1.
pub trait CredentialStore: Send + Sync {
    /// Fetches a connection by id.
    fn get(&self, id: &str) -> StoreResult<Option<Connection>>;

    /// Fetches the non-revoked connection for a user and provider, if any.
    fn find_active(&self, user_id: &str, provider_id: &str) -> StoreResult<Option<Connection>>;

    /// Inserts a new connection or fully overwrites an existing one.
    ///
    /// Returns the record as stored (with its new version). Fails with
    /// [`crate::error::StoreError::Conflict`] when the write would create a
    /// second live connection for the same user and provider.
    fn upsert(&self, connection: &Connection) -> StoreResult<Connection>;

    /// Writes `new` only if the stored version still equals `expected_version`.
    ///
    /// Returns `Ok(false)` when the record changed (or vanished) in between.
    fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        new: &Connection,
    ) -> StoreResult<bool>;

    /// All connections of a user, newest first.
    fn list_by_user(&self, user_id: &str) -> StoreResult<Vec<Connection>>;

    /// Connections matching `criteria`, most urgent expiry first.
    fn list_due(&self, criteria: &DueCriteria) -> StoreResult<Vec<Connection>>;

    fn insert_state(&self, state: &OAuthState) -> StoreResult<()>;

    fn get_state(&self, state: &str) -> StoreResult<Option<OAuthState>>;

    /// Atomically flips `consumed` from false to true. Returns `Ok(true)` for
    /// exactly one caller per state.
    fn consume_state(&self, state: &str) -> StoreResult<bool>;

    /// Deletes states whose TTL has passed. Returns the number removed.
    fn purge_expired_states(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}
