//! In-memory credential store.
//!
//! Satisfies the same atomicity contract as the SQLite store (one mutex around
//! all records), so unit tests exercise the real compare-and-swap semantics.

use super::{CredentialStore, DueCriteria};
use crate::connection::{Connection, OAuthState};
use crate::error::{StoreError, StoreResult};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Records {
    connections: HashMap<String, Connection>,
    states: HashMap<String, OAuthState>,
}

/// Non-durable [`CredentialStore`] used by tests and single-process demos.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: Mutex<Records>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Records>> {
        self.records
            .lock()
            .map_err(|_| StoreError::Backend(anyhow!("credential store lock poisoned")))
    }

    /// Number of OAuth states currently held (consumed or not).
    pub fn state_count(&self) -> usize {
        self.records.lock().map(|r| r.states.len()).unwrap_or(0)
    }
}

/// Rejects a write that would leave two live connections for one provider.
fn check_unique_live(records: &Records, candidate: &Connection) -> StoreResult<()> {
    if !candidate.is_live() {
        return Ok(());
    }
    let clash = records.connections.values().any(|existing| {
        existing.id != candidate.id
            && existing.is_live()
            && existing.user_id == candidate.user_id
            && existing.provider_id == candidate.provider_id
    });
    if clash {
        return Err(StoreError::Conflict(format!(
            "user '{}' already has a live '{}' connection",
            candidate.user_id, candidate.provider_id
        )));
    }
    Ok(())
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, id: &str) -> StoreResult<Option<Connection>> {
        Ok(self.lock()?.connections.get(id).cloned())
    }

    fn find_active(&self, user_id: &str, provider_id: &str) -> StoreResult<Option<Connection>> {
        Ok(self
            .lock()?
            .connections
            .values()
            .find(|c| c.is_live() && c.user_id == user_id && c.provider_id == provider_id)
            .cloned())
    }

    fn upsert(&self, connection: &Connection) -> StoreResult<Connection> {
        let mut records = self.lock()?;
        check_unique_live(&records, connection)?;

        let version = records
            .connections
            .get(&connection.id)
            .map(|existing| existing.version + 1)
            .unwrap_or(1);

        let mut stored = connection.clone();
        stored.version = version;
        records
            .connections
            .insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        new: &Connection,
    ) -> StoreResult<bool> {
        let mut records = self.lock()?;

        match records.connections.get(id) {
            Some(current) if current.version == expected_version => {}
            _ => return Ok(false),
        }
        check_unique_live(&records, new)?;

        let mut stored = new.clone();
        stored.id = id.to_string();
        stored.version = expected_version + 1;
        records.connections.insert(id.to_string(), stored);
        Ok(true)
    }

    fn list_by_user(&self, user_id: &str) -> StoreResult<Vec<Connection>> {
        let mut connections: Vec<Connection> = self
            .lock()?
            .connections
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        connections.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(connections)
    }

    fn list_due(&self, criteria: &DueCriteria) -> StoreResult<Vec<Connection>> {
        let mut due: Vec<Connection> = self
            .lock()?
            .connections
            .values()
            .filter(|c| criteria.matches(c))
            .cloned()
            .collect();
        due.sort_by_key(|c| c.token_expires_at);
        if let Some(limit) = criteria.limit {
            due.truncate(limit);
        }
        Ok(due)
    }

    fn insert_state(&self, state: &OAuthState) -> StoreResult<()> {
        let mut records = self.lock()?;
        if records.states.contains_key(&state.state) {
            return Err(StoreError::Conflict("duplicate OAuth state".to_string()));
        }
        records.states.insert(state.state.clone(), state.clone());
        Ok(())
    }

    fn get_state(&self, state: &str) -> StoreResult<Option<OAuthState>> {
        Ok(self.lock()?.states.get(state).cloned())
    }

    fn consume_state(&self, state: &str) -> StoreResult<bool> {
        let mut records = self.lock()?;
        match records.states.get_mut(state) {
            Some(entry) if !entry.consumed => {
                entry.consumed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn purge_expired_states(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut records = self.lock()?;
        let before = records.states.len();
        records.states.retain(|_, entry| !entry.is_expired(now));
        Ok(before - records.states.len())
    }
}
