//! Health evaluation for connections.
//!
//! Pure and deterministic: the same snapshot always yields the same report,
//! so callers may cache reports keyed by `(connection id, version)`.

use super::{Connection, ConnectionStatus};
use serde::Serialize;

/// Derived usability summary of a connection. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub is_healthy: bool,
    pub can_sync: bool,
    pub needs_reauth: bool,
    pub last_error: Option<String>,
}

/// Computes the health report for a connection snapshot.
pub fn evaluate(connection: &Connection) -> HealthReport {
    let is_healthy = connection.status == ConnectionStatus::Active && connection.error_count == 0;

    HealthReport {
        is_healthy,
        can_sync: connection.sync_enabled && is_healthy,
        needs_reauth: matches!(
            connection.status,
            ConnectionStatus::Expired | ConnectionStatus::Revoked
        ),
        last_error: connection.error_message.clone(),
    }
}
