//! Durable credential storage using SQLite.
//!
//! Stores connection records (with their sealed credential blob) and OAuth
//! state tokens. Token material is never written in clear text.

use super::{CredentialStore, DueCriteria, SealedCredentials};
use crate::connection::{Connection, ConnectionMetadata, ConnectionStatus, OAuthState};
use crate::error::{StoreError, StoreResult};
use crate::provider::AuthType;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection as SqliteConnection, ErrorCode, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    auth_type TEXT NOT NULL,
    status TEXT NOT NULL,
    credentials TEXT,                 -- AES-256-GCM ciphertext (base64)
    credentials_nonce TEXT,           -- Nonce for credentials (base64)
    token_expires_at INTEGER,         -- Unix millis (optional)
    has_refresh_token INTEGER NOT NULL,
    account_email TEXT,
    account_id TEXT,
    granted_scopes TEXT NOT NULL,     -- JSON array
    sync_enabled INTEGER NOT NULL,
    last_synced_at TEXT,
    last_used_at TEXT,
    error_message TEXT,
    error_count INTEGER NOT NULL,
    api_call_count INTEGER NOT NULL,
    metadata TEXT NOT NULL,           -- JSON object
    source TEXT,
    created_at TEXT NOT NULL,         -- RFC 3339, fixed microsecond width
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL
);

-- At most one non-revoked connection per (user, provider)
CREATE UNIQUE INDEX IF NOT EXISTS idx_connections_live
    ON connections(user_id, provider_id) WHERE status != 'REVOKED';

CREATE INDEX IF NOT EXISTS idx_connections_due
    ON connections(auth_type, status, token_expires_at);

CREATE INDEX IF NOT EXISTS idx_connections_user
    ON connections(user_id, created_at);

CREATE TABLE IF NOT EXISTS oauth_states (
    state TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    redirect_uri TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at INTEGER NOT NULL,      -- Unix millis
    consumed INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    source TEXT
);
"#;

const CONNECTION_COLUMNS: &str = "id, user_id, provider_id, auth_type, status, \
     credentials, credentials_nonce, token_expires_at, has_refresh_token, \
     account_email, account_id, granted_scopes, sync_enabled, last_synced_at, \
     last_used_at, error_message, error_count, api_call_count, metadata, source, \
     created_at, updated_at, version";

/// SQLite-backed [`CredentialStore`].
///
/// # Thread Safety
/// - Connection is wrapped in a Mutex; every trait call holds it for one
///   statement (or one transaction), which makes each record write atomic
/// - Compare-and-swap is a single `UPDATE ... WHERE version = ?`
pub struct SqliteCredentialStore {
    conn: Mutex<SqliteConnection>,
}

impl SqliteCredentialStore {
    /// Creates or opens a store at `db_path` (`:memory:` for an ephemeral one).
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = SqliteConnection::open(db_path).context("Failed to open database")?;
        // Other connections to the same file wait for the write lock instead of failing
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;

        conn.execute_batch(SCHEMA)
            .context("Failed to create credential store schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, SqliteConnection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend(anyhow!("credential store lock poisoned")))
    }

    fn query_connections(
        &self,
        sql: &str,
        values: Vec<Value>,
    ) -> StoreResult<Vec<Connection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).context("Failed to prepare query")?;

        let rows = stmt
            .query_map(params_from_iter(values.iter()), ConnectionRow::read)
            .context("Failed to execute query")?
            .collect::<rusqlite::Result<Vec<ConnectionRow>>>()
            .context("Failed to read connection rows")?;

        let connections = rows
            .into_iter()
            .map(ConnectionRow::into_connection)
            .collect::<Result<Vec<_>>>()?;
        Ok(connections)
    }
}

/// Raw column values, converted to a [`Connection`] outside the row closure so
/// conversion failures carry anyhow context.
struct ConnectionRow {
    id: String,
    user_id: String,
    provider_id: String,
    auth_type: String,
    status: String,
    credentials: Option<String>,
    credentials_nonce: Option<String>,
    token_expires_at: Option<i64>,
    has_refresh_token: bool,
    account_email: Option<String>,
    account_id: Option<String>,
    granted_scopes: String,
    sync_enabled: bool,
    last_synced_at: Option<String>,
    last_used_at: Option<String>,
    error_message: Option<String>,
    error_count: i64,
    api_call_count: i64,
    metadata: String,
    source: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl ConnectionRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            provider_id: row.get(2)?,
            auth_type: row.get(3)?,
            status: row.get(4)?,
            credentials: row.get(5)?,
            credentials_nonce: row.get(6)?,
            token_expires_at: row.get(7)?,
            has_refresh_token: row.get(8)?,
            account_email: row.get(9)?,
            account_id: row.get(10)?,
            granted_scopes: row.get(11)?,
            sync_enabled: row.get(12)?,
            last_synced_at: row.get(13)?,
            last_used_at: row.get(14)?,
            error_message: row.get(15)?,
            error_count: row.get(16)?,
            api_call_count: row.get(17)?,
            metadata: row.get(18)?,
            source: row.get(19)?,
            created_at: row.get(20)?,
            updated_at: row.get(21)?,
            version: row.get(22)?,
        })
    }

    fn into_connection(self) -> Result<Connection> {
        let credentials = match (self.credentials, self.credentials_nonce) {
            (Some(ciphertext), Some(nonce)) => Some(SealedCredentials { ciphertext, nonce }),
            _ => None,
        };
        let granted_scopes: Vec<String> = serde_json::from_str(&self.granted_scopes)
            .context("Failed to parse granted_scopes")?;
        let metadata: BTreeMap<String, String> =
            serde_json::from_str(&self.metadata).context("Failed to parse metadata")?;

        Ok(Connection {
            auth_type: self.auth_type.parse::<AuthType>()?,
            status: self.status.parse::<ConnectionStatus>()?,
            credentials,
            token_expires_at: self.token_expires_at.map(from_millis).transpose()?,
            has_refresh_token: self.has_refresh_token,
            account_email: self.account_email,
            account_id: self.account_id,
            granted_scopes,
            sync_enabled: self.sync_enabled,
            last_synced_at: self.last_synced_at.as_deref().map(parse_time).transpose()?,
            last_used_at: self.last_used_at.as_deref().map(parse_time).transpose()?,
            error_message: self.error_message,
            error_count: u32::try_from(self.error_count).context("error_count out of range")?,
            api_call_count: u64::try_from(self.api_call_count)
                .context("api_call_count out of range")?,
            metadata: ConnectionMetadata::from_validated(metadata),
            source: self.source,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            version: u64::try_from(self.version).context("version out of range")?,
            id: self.id,
            user_id: self.user_id,
            provider_id: self.provider_id,
        })
    }
}

/// Column values for a write, in [`CONNECTION_COLUMNS`] order (minus version).
fn connection_values(c: &Connection) -> Result<Vec<Value>> {
    let text = |s: &Option<String>| s.clone().map(Value::Text).unwrap_or(Value::Null);
    let time = |t: &Option<DateTime<Utc>>| t.map(|t| Value::Text(format_time(t))).unwrap_or(Value::Null);

    let (ciphertext, nonce) = match &c.credentials {
        Some(sealed) => (
            Value::Text(sealed.ciphertext.clone()),
            Value::Text(sealed.nonce.clone()),
        ),
        None => (Value::Null, Value::Null),
    };

    Ok(vec![
        Value::Text(c.id.clone()),
        Value::Text(c.user_id.clone()),
        Value::Text(c.provider_id.clone()),
        Value::Text(c.auth_type.as_str().to_string()),
        Value::Text(c.status.as_str().to_string()),
        ciphertext,
        nonce,
        c.token_expires_at
            .map(|t| Value::Integer(t.timestamp_millis()))
            .unwrap_or(Value::Null),
        Value::Integer(i64::from(c.has_refresh_token)),
        text(&c.account_email),
        text(&c.account_id),
        Value::Text(serde_json::to_string(&c.granted_scopes).context("Failed to encode scopes")?),
        Value::Integer(i64::from(c.sync_enabled)),
        time(&c.last_synced_at),
        time(&c.last_used_at),
        text(&c.error_message),
        Value::Integer(i64::from(c.error_count)),
        Value::Integer(i64::try_from(c.api_call_count).context("api_call_count out of range")?),
        Value::Text(
            serde_json::to_string(c.metadata.entries()).context("Failed to encode metadata")?,
        ),
        text(&c.source),
        Value::Text(format_time(c.created_at)),
        Value::Text(format_time(c.updated_at)),
    ])
}

/// Fixed-width RFC 3339 so lexical order equals time order.
fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp '{}'", s))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("Invalid timestamp millis {}", ms))
}

fn to_version(v: u64) -> Result<i64> {
    i64::try_from(v).context("version out of range")
}

/// Maps a unique-index violation to a conflict, everything else to a backend error.
fn classify(err: rusqlite::Error, what: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict(format!("{}: {}", what, err))
        }
        _ => StoreError::Backend(anyhow::Error::new(err).context(what.to_string())),
    }
}

fn update_sql() -> String {
    "UPDATE connections SET \
        user_id = ?2, provider_id = ?3, auth_type = ?4, status = ?5, \
        credentials = ?6, credentials_nonce = ?7, token_expires_at = ?8, \
        has_refresh_token = ?9, account_email = ?10, account_id = ?11, \
        granted_scopes = ?12, sync_enabled = ?13, last_synced_at = ?14, \
        last_used_at = ?15, error_message = ?16, error_count = ?17, \
        api_call_count = ?18, metadata = ?19, source = ?20, created_at = ?21, \
        updated_at = ?22, version = ?23 \
     WHERE id = ?1"
        .to_string()
}

impl CredentialStore for SqliteCredentialStore {
    fn get(&self, id: &str) -> StoreResult<Option<Connection>> {
        let sql = format!("SELECT {} FROM connections WHERE id = ?1", CONNECTION_COLUMNS);
        Ok(self
            .query_connections(&sql, vec![Value::Text(id.to_string())])?
            .into_iter()
            .next())
    }

    fn find_active(&self, user_id: &str, provider_id: &str) -> StoreResult<Option<Connection>> {
        let sql = format!(
            "SELECT {} FROM connections \
             WHERE user_id = ?1 AND provider_id = ?2 AND status != 'REVOKED'",
            CONNECTION_COLUMNS
        );
        Ok(self
            .query_connections(
                &sql,
                vec![
                    Value::Text(user_id.to_string()),
                    Value::Text(provider_id.to_string()),
                ],
            )?
            .into_iter()
            .next())
    }

    fn upsert(&self, connection: &Connection) -> StoreResult<Connection> {
        let mut values = connection_values(connection)?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .context("Failed to begin transaction")?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM connections WHERE id = ?1",
                params![connection.id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("Failed to read current version")?;

        let version = current.map(|v| v + 1).unwrap_or(1);
        values.push(Value::Integer(version));

        let sql = match current {
            Some(_) => update_sql(),
            None => format!(
                "INSERT INTO connections ({}) VALUES ({})",
                CONNECTION_COLUMNS,
                (1..=23).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
            ),
        };
        tx.execute(&sql, params_from_iter(values.iter()))
            .map_err(|e| classify(e, "Failed to write connection"))?;
        tx.commit().context("Failed to commit connection write")?;

        let mut stored = connection.clone();
        stored.version = u64::try_from(version).context("version out of range")?;
        Ok(stored)
    }

    fn compare_and_swap(
        &self,
        id: &str,
        expected_version: u64,
        new: &Connection,
    ) -> StoreResult<bool> {
        let mut values = connection_values(new)?;
        values[0] = Value::Text(id.to_string());
        values.push(Value::Integer(to_version(expected_version + 1)?));
        values.push(Value::Integer(to_version(expected_version)?));

        let sql = format!("{} AND version = ?24", update_sql());
        let rows = self
            .lock()?
            .execute(&sql, params_from_iter(values.iter()))
            .map_err(|e| classify(e, "Failed to update connection"))?;

        Ok(rows == 1)
    }

    fn list_by_user(&self, user_id: &str) -> StoreResult<Vec<Connection>> {
        let sql = format!(
            "SELECT {} FROM connections WHERE user_id = ?1 \
             ORDER BY created_at DESC, id DESC",
            CONNECTION_COLUMNS
        );
        self.query_connections(&sql, vec![Value::Text(user_id.to_string())])
    }

    fn list_due(&self, criteria: &DueCriteria) -> StoreResult<Vec<Connection>> {
        if criteria.statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut values = vec![
            Value::Text(criteria.auth_type.as_str().to_string()),
            Value::Integer(criteria.expires_before.timestamp_millis()),
        ];
        let placeholders: Vec<String> = criteria
            .statuses
            .iter()
            .map(|status| {
                values.push(Value::Text(status.as_str().to_string()));
                format!("?{}", values.len())
            })
            .collect();

        let mut sql = format!(
            "SELECT {} FROM connections \
             WHERE auth_type = ?1 \
               AND token_expires_at IS NOT NULL AND token_expires_at <= ?2 \
               AND status IN ({})",
            CONNECTION_COLUMNS,
            placeholders.join(", ")
        );
        if criteria.require_refresh_token {
            sql.push_str(" AND has_refresh_token = 1");
        }
        sql.push_str(" ORDER BY token_expires_at ASC");
        if let Some(limit) = criteria.limit {
            values.push(Value::Integer(
                i64::try_from(limit).context("limit out of range")?,
            ));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        self.query_connections(&sql, values)
    }

    fn insert_state(&self, state: &OAuthState) -> StoreResult<()> {
        let metadata = serde_json::to_string(state.metadata.entries())
            .context("Failed to encode state metadata")?;
        self.lock()?
            .execute(
                "INSERT INTO oauth_states \
                 (state, user_id, provider_id, redirect_uri, created_at, expires_at, consumed, metadata, source) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    state.state,
                    state.user_id,
                    state.provider_id,
                    state.redirect_uri,
                    format_time(state.created_at),
                    state.expires_at.timestamp_millis(),
                    state.consumed,
                    metadata,
                    state.source,
                ],
            )
            .map_err(|e| classify(e, "Failed to store OAuth state"))?;
        Ok(())
    }

    fn get_state(&self, state: &str) -> StoreResult<Option<OAuthState>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT state, user_id, provider_id, redirect_uri, created_at, expires_at, consumed, \
                 metadata, source FROM oauth_states WHERE state = ?1",
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![state])
            .context("Failed to execute query")?;

        let Some(row) = rows.next().context("Failed to read row")? else {
            return Ok(None);
        };

        let created_at: String = row.get(4).context("Failed to read created_at")?;
        let expires_at: i64 = row.get(5).context("Failed to read expires_at")?;
        let metadata: String = row.get(7).context("Failed to read metadata")?;
        let metadata: BTreeMap<String, String> =
            serde_json::from_str(&metadata).context("Failed to parse state metadata")?;

        Ok(Some(OAuthState {
            state: row.get(0).context("Failed to read state")?,
            user_id: row.get(1).context("Failed to read user_id")?,
            provider_id: row.get(2).context("Failed to read provider_id")?,
            redirect_uri: row.get(3).context("Failed to read redirect_uri")?,
            created_at: parse_time(&created_at)?,
            expires_at: from_millis(expires_at)?,
            consumed: row.get(6).context("Failed to read consumed")?,
            metadata: ConnectionMetadata::from_validated(metadata),
            source: row.get(8).context("Failed to read source")?,
        }))
    }

    fn consume_state(&self, state: &str) -> StoreResult<bool> {
        let rows = self
            .lock()?
            .execute(
                "UPDATE oauth_states SET consumed = 1 WHERE state = ?1 AND consumed = 0",
                params![state],
            )
            .context("Failed to consume OAuth state")?;
        Ok(rows == 1)
    }

    fn purge_expired_states(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let rows = self
            .lock()?
            .execute(
                "DELETE FROM oauth_states WHERE expires_at <= ?1",
                params![now.timestamp_millis()],
            )
            .context("Failed to purge expired OAuth states")?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TokenIndex;
    use crate::provider::AccountProfile;
    use chrono::Duration;
    use std::sync::{Arc, Barrier};
    use tempfile::NamedTempFile;

    fn store() -> SqliteCredentialStore {
        SqliteCredentialStore::new(":memory:").unwrap()
    }

    fn active(user: &str, provider: &str, expires_in: Duration) -> Connection {
        let now = Utc::now();
        let mut c = Connection::new(user, provider, AuthType::OAuth2, now);
        let profile = AccountProfile {
            account_id: Some("acct-1".to_string()),
            account_email: Some("user@example.com".to_string()),
            granted_scopes: vec!["read".to_string(), "trade".to_string()],
        };
        c.activate(
            SealedCredentials {
                ciphertext: "Y2lwaGVy".to_string(),
                nonce: "bm9uY2U=".to_string(),
            },
            TokenIndex {
                expires_at: Some(now + expires_in),
                has_refresh_token: true,
            },
            &profile,
            now,
        )
        .unwrap();
        c
    }

    #[test]
    fn test_upsert_and_get_preserves_fields() {
        let store = store();
        let mut original = active("u1", "alpaca", Duration::hours(1));
        let mut meta = BTreeMap::new();
        meta.insert("environment".to_string(), "paper".to_string());
        original.metadata = ConnectionMetadata::from_validated(meta);
        original.source = Some("settings".to_string());

        let stored = store.upsert(&original).unwrap();
        assert_eq!(stored.version, 1);

        let loaded = store.get(&original.id).unwrap().unwrap();
        assert_eq!(loaded.status, ConnectionStatus::Active);
        assert_eq!(loaded.credentials, original.credentials);
        assert_eq!(loaded.granted_scopes, vec!["read", "trade"]);
        assert_eq!(loaded.metadata.get("environment"), Some("paper"));
        assert_eq!(loaded.account_email.as_deref(), Some("user@example.com"));
        assert_eq!(
            loaded.token_expires_at.map(|t| t.timestamp_millis()),
            original.token_expires_at.map(|t| t.timestamp_millis())
        );
        assert!(loaded.has_refresh_token);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_get_missing_returns_none() {
        assert!(store().get("nope").unwrap().is_none());
    }

    #[test]
    fn test_unique_live_connection_per_provider() {
        let store = store();
        store.upsert(&active("u1", "alpaca", Duration::hours(1))).unwrap();

        let err = store
            .upsert(&active("u1", "alpaca", Duration::hours(1)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_revoked_rows_do_not_block_reinstall() {
        let store = store();
        let first = store.upsert(&active("u1", "alpaca", Duration::hours(1))).unwrap();

        let mut revoked = first.clone();
        revoked.revoke(None, Utc::now()).unwrap();
        assert!(store.compare_and_swap(&first.id, first.version, &revoked).unwrap());

        store.upsert(&active("u1", "alpaca", Duration::hours(1))).unwrap();
        let found = store.find_active("u1", "alpaca").unwrap().unwrap();
        assert_ne!(found.id, first.id);

        let loaded = store.get(&first.id).unwrap().unwrap();
        assert_eq!(loaded.status, ConnectionStatus::Revoked);
        assert!(loaded.credentials.is_none());
    }

    #[test]
    fn test_compare_and_swap_versions() {
        let store = store();
        let stored = store.upsert(&active("u1", "alpaca", Duration::hours(1))).unwrap();

        let mut update = stored.clone();
        update.error_count = 2;
        assert!(store.compare_and_swap(&stored.id, 1, &update).unwrap());
        assert!(!store.compare_and_swap(&stored.id, 1, &update).unwrap());

        let loaded = store.get(&stored.id).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.error_count, 2);
    }

    #[test]
    fn test_list_due_filters_and_orders() {
        let store = store();
        store.upsert(&active("u1", "late", Duration::minutes(10))).unwrap();
        store.upsert(&active("u1", "soon", Duration::minutes(2))).unwrap();
        store.upsert(&active("u1", "far", Duration::minutes(20))).unwrap();

        let mut no_refresh = active("u1", "norefresh", Duration::minutes(1));
        no_refresh.has_refresh_token = false;
        store.upsert(&no_refresh).unwrap();

        let mut errored = active("u1", "errored", Duration::minutes(1));
        errored.status = ConnectionStatus::Error;
        store.upsert(&errored).unwrap();

        let due = store
            .list_due(&DueCriteria::refresh_candidates(Utc::now(), Duration::minutes(15)))
            .unwrap();
        let providers: Vec<&str> = due.iter().map(|c| c.provider_id.as_str()).collect();
        assert_eq!(providers, vec!["soon", "late"]);

        let mut limited = DueCriteria::refresh_candidates(Utc::now(), Duration::minutes(15));
        limited.limit = Some(1);
        assert_eq!(store.list_due(&limited).unwrap().len(), 1);
    }

    #[test]
    fn test_list_by_user_newest_first() {
        let store = store();
        let now = Utc::now();
        let mut older = Connection::new("u1", "alpaca", AuthType::OAuth2, now - Duration::hours(2));
        older.created_at = now - Duration::hours(2);
        store.upsert(&older).unwrap();
        store
            .upsert(&Connection::new("u1", "polygon", AuthType::ApiKey, now))
            .unwrap();
        store
            .upsert(&Connection::new("u2", "polygon", AuthType::ApiKey, now))
            .unwrap();

        let listed = store.list_by_user("u1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].provider_id, "polygon");
    }

    #[test]
    fn test_state_lifecycle() {
        let store = store();
        let now = Utc::now();
        let mut meta = BTreeMap::new();
        meta.insert("environment".to_string(), "live".to_string());
        let state = OAuthState::issue("u1", "alpaca", "/settings", Duration::minutes(10), now)
            .with_install_context(ConnectionMetadata::from_validated(meta), Some("onboarding".to_string()));
        store.insert_state(&state).unwrap();

        let loaded = store.get_state(&state.state).unwrap().unwrap();
        assert_eq!(loaded.user_id, "u1");
        assert_eq!(loaded.redirect_uri, "/settings");
        assert_eq!(loaded.metadata.get("environment"), Some("live"));
        assert_eq!(loaded.source.as_deref(), Some("onboarding"));
        assert!(!loaded.consumed);

        assert!(store.consume_state(&state.state).unwrap());
        assert!(!store.consume_state(&state.state).unwrap());
        assert!(store.get_state(&state.state).unwrap().unwrap().consumed);

        assert!(!store.consume_state("unknown").unwrap());
    }

    #[test]
    fn test_purge_expired_states() {
        let store = store();
        let now = Utc::now();
        let short = OAuthState::issue("u1", "a", "/", Duration::seconds(1), now);
        let long = OAuthState::issue("u1", "b", "/", Duration::minutes(10), now);
        store.insert_state(&short).unwrap();
        store.insert_state(&long).unwrap();

        assert_eq!(store.purge_expired_states(now + Duration::seconds(2)).unwrap(), 1);
        assert!(store.get_state(&short.state).unwrap().is_none());
        assert!(store.get_state(&long.state).unwrap().is_some());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let file = NamedTempFile::new().unwrap();
        let id = {
            let store = SqliteCredentialStore::new(file.path()).unwrap();
            store
                .upsert(&active("u1", "alpaca", Duration::hours(1)))
                .unwrap()
                .id
        };

        let reopened = SqliteCredentialStore::new(file.path()).unwrap();
        let loaded = reopened.get(&id).unwrap().unwrap();
        assert_eq!(loaded.provider_id, "alpaca");
        assert_eq!(loaded.version, 1);
    }

    /// Independent connections on one file, as with several server processes.
    fn open_many(file: &NamedTempFile, count: usize) -> Vec<SqliteCredentialStore> {
        (0..count)
            .map(|_| SqliteCredentialStore::new(file.path()).unwrap())
            .collect()
    }

    #[test]
    fn test_state_consumed_once_across_connections() {
        let file = NamedTempFile::new().unwrap();
        let state = OAuthState::issue("u1", "alpaca", "/", Duration::minutes(10), Utc::now());
        SqliteCredentialStore::new(file.path())
            .unwrap()
            .insert_state(&state)
            .unwrap();

        let stores = open_many(&file, 8);
        let barrier = Arc::new(Barrier::new(stores.len()));
        let handles: Vec<_> = stores
            .into_iter()
            .map(|store| {
                let barrier = Arc::clone(&barrier);
                let token = state.state.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.consume_state(&token).unwrap()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);

        let reopened = SqliteCredentialStore::new(file.path()).unwrap();
        assert!(reopened.get_state(&state.state).unwrap().unwrap().consumed);
        assert!(!reopened.consume_state(&state.state).unwrap());
    }

    #[test]
    fn test_compare_and_swap_single_winner_across_connections() {
        let file = NamedTempFile::new().unwrap();
        let stored = SqliteCredentialStore::new(file.path())
            .unwrap()
            .upsert(&active("u1", "alpaca", Duration::minutes(5)))
            .unwrap();

        let stores = open_many(&file, 6);
        let barrier = Arc::new(Barrier::new(stores.len()));
        let handles: Vec<_> = stores
            .into_iter()
            .enumerate()
            .map(|(i, store)| {
                let barrier = Arc::clone(&barrier);
                let mut update = stored.clone();
                update.error_count = i as u32 + 1;
                std::thread::spawn(move || {
                    barrier.wait();
                    store
                        .compare_and_swap(&update.id, update.version, &update)
                        .unwrap()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);

        let loaded = SqliteCredentialStore::new(file.path())
            .unwrap()
            .get(&stored.id)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.version, stored.version + 1);
        assert!(loaded.error_count >= 1);
    }
}
