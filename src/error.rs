//! Failure taxonomy for the connection manager.
//!
//! Three layers, each classified before it crosses into the next:
//! - [`AdapterError`]: what a provider adapter reports about a network call
//! - [`StoreError`]: what the credential store reports about persistence
//! - [`ConnectionError`]: what install / configure / callback return to callers

use axum::http::StatusCode;
use thiserror::Error;

/// Errors returned by a provider adapter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    /// The grant or refresh token was rejected as invalid or revoked.
    #[error("authorization rejected by provider: {0}")]
    Auth(String),
    /// An API key / secret pair failed validation.
    #[error("credentials rejected by provider: {0}")]
    InvalidCredentials(String),
    /// Network failure, timeout, 5xx, or an unexpected response.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// The provider asked us to slow down (HTTP 429).
    #[error("rate limited by provider")]
    RateLimited { retry_after_seconds: Option<u64> },
    /// The adapter does not implement this operation for its auth type.
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl AdapterError {
    /// True when the failure may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_) | AdapterError::RateLimited { .. })
    }
}

/// Errors returned by a [`crate::credentials::CredentialStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write would break the one-live-connection-per-provider invariant.
    #[error("record conflict: {0}")]
    Conflict(String),
    /// The backing store failed (unreachable, corrupt, I/O).
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Structured failures returned by the connection manager.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectionError {
    #[error("provider '{0}' not found")]
    ProviderNotFound(String),

    #[error("provider '{provider_id}' uses {auth_type} authentication, which this operation does not support")]
    UnsupportedAuthType {
        provider_id: String,
        auth_type: String,
    },

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("OAuth state not found")]
    StateNotFound,

    #[error("OAuth state expired")]
    StateExpired,

    #[error("OAuth state already used")]
    StateReplay,

    #[error("authorization error: {0}")]
    AuthError(String),

    #[error("transient error: {0}")]
    TransientError(String),

    #[error("rate limited, try again later")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection '{0}' not found")]
    ConnectionNotFound(String),

    #[error("illegal status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl ConnectionError {
    /// Stable machine-readable code carried in error responses and redirects.
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionError::ProviderNotFound(_) => "PROVIDER_NOT_FOUND",
            ConnectionError::UnsupportedAuthType { .. } => "UNSUPPORTED_AUTH_TYPE",
            ConnectionError::InvalidCredentials(_) => "INVALID_CREDENTIALS",
            ConnectionError::StateNotFound => "STATE_NOT_FOUND",
            ConnectionError::StateExpired => "STATE_EXPIRED",
            ConnectionError::StateReplay => "STATE_REPLAY",
            ConnectionError::AuthError(_) => "AUTH_ERROR",
            ConnectionError::TransientError(_) => "TRANSIENT_ERROR",
            ConnectionError::RateLimited { .. } => "RATE_LIMITED",
            ConnectionError::InvalidRequest(_) => "INVALID_REQUEST",
            ConnectionError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            ConnectionError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ConnectionError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ConnectionError::ProviderNotFound(_) | ConnectionError::ConnectionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ConnectionError::UnsupportedAuthType { .. }
            | ConnectionError::InvalidRequest(_)
            | ConnectionError::StateNotFound
            | ConnectionError::StateExpired => StatusCode::BAD_REQUEST,
            ConnectionError::InvalidCredentials(_) | ConnectionError::AuthError(_) => {
                StatusCode::UNAUTHORIZED
            }
            ConnectionError::StateReplay => StatusCode::CONFLICT,
            ConnectionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ConnectionError::TransientError(_) => StatusCode::BAD_GATEWAY,
            ConnectionError::InvalidTransition { .. } | ConnectionError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<AdapterError> for ConnectionError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Auth(msg) => ConnectionError::AuthError(msg),
            AdapterError::InvalidCredentials(msg) => ConnectionError::InvalidCredentials(msg),
            AdapterError::Transient(msg) => ConnectionError::TransientError(msg),
            AdapterError::RateLimited {
                retry_after_seconds,
            } => ConnectionError::RateLimited {
                retry_after_seconds,
            },
            AdapterError::Unsupported(msg) => ConnectionError::InvalidRequest(msg),
        }
    }
}

impl From<StoreError> for ConnectionError {
    fn from(e: StoreError) -> Self {
        // {:#} keeps the anyhow context chain on one line
        match e {
            StoreError::Conflict(msg) => ConnectionError::Storage(format!("conflict: {}", msg)),
            StoreError::Backend(err) => ConnectionError::Storage(format!("{:#}", err)),
        }
    }
}
