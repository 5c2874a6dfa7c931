// Failure taxonomy
pub mod error;

// Service configuration
pub mod config;

// Connection records, state machine, OAuth state, health
pub mod connection;

// Encrypted credential storage
pub mod credentials;

// Provider definitions, adapters and the built-in catalog
pub mod provider;

// Install / API-key / callback orchestration
pub mod manager;

// Batch token refresh
pub mod scheduler;

// Request identity and shared-secret checks
pub mod auth;

// Per-user rate limiting
pub mod rate_limit;

// HTTP edges
pub mod api;

#[cfg(test)]
pub(crate) mod test_support;
