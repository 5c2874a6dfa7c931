//! Connection lifecycle orchestration.
//!
//! The manager is the request-path writer of connection and OAuth state
//! records. It resolves providers through the registry, calls adapters under a
//! timeout, seals credentials, and applies status changes through the
//! connection state machine.
//!
//! # Write protocol
//!
//! Every record write is either an insert (guarded by the store's one live
//! connection per provider check) or a compare-and-swap on the version that was
//! read. Losing either race re-reads and retries, up to [`MAX_WRITE_ATTEMPTS`].


use crate::config::Config;
use crate::connection::{
    evaluate, Connection, ConnectionMetadata, ConnectionStatus, HealthReport, OAuthState,
    TokenIndex,
};
use crate::credentials::{CredentialCipher, CredentialStore, Credentials, SealedCredentials};
use crate::error::{AdapterError, ConnectionError, StoreError};
use crate::provider::{
    call_with_timeout, AccountProfile, AuthType, Provider, ProviderAdapter, ProviderRegistry,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Attempts per write before giving up on a contended record.
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Request-path settings.
#[derive(Clone, Debug)]
pub struct ManagerSettings {
    /// Provider-facing redirect URI (our callback endpoint).
    pub callback_url: String,
    /// Browser target after the callback when the install named none.
    pub default_return_url: String,
    pub state_ttl: Duration,
    pub call_timeout: std::time::Duration,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            callback_url: config.oauth.callback_url(),
            default_return_url: config.oauth.default_return_url.clone(),
            state_ttl: config.oauth.state_ttl(),
            call_timeout: config.refresh.call_timeout(),
        }
    }
}

/// Optional install parameters.
#[derive(Clone, Debug, Default)]
pub struct InstallOptions {
    /// Where the browser should land after the OAuth callback.
    pub redirect_uri: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Where the install was initiated (e.g. "settings").
    pub source: Option<String>,
    /// Lets API-key providers install in one step.
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

/// Result of [`ConnectionManager::install_connection`].
#[derive(Clone, Debug)]
pub enum InstallOutcome {
    /// Send the user to `authorization_url`.
    Authorize {
        authorization_url: String,
        state: String,
        expires_at: DateTime<Utc>,
    },
    /// An API-key provider was configured directly.
    Connected(Connection),
}

/// Orchestrates install, API-key configuration and the OAuth callback.
pub struct ConnectionManager {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn CredentialStore>,
    cipher: CredentialCipher,
    settings: ManagerSettings,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn CredentialStore>,
        cipher: CredentialCipher,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            registry,
            store,
            cipher,
            settings,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    fn resolve(&self, provider_id: &str) -> Result<(&Provider, Arc<dyn ProviderAdapter>), ConnectionError> {
        match (self.registry.get(provider_id), self.registry.adapter(provider_id)) {
            (Some(provider), Some(adapter)) => Ok((provider, adapter)),
            _ => Err(ConnectionError::ProviderNotFound(provider_id.to_string())),
        }
    }

    /// Starts connecting `provider_id` for `user_id`.
    ///
    /// OAuth2 providers get a persisted single-use state and an authorization
    /// URL. API-key providers need `options.api_key`; without it the call
    /// fails with `UnsupportedAuthType`. Nothing is written when the provider
    /// is unknown or the metadata is invalid.
    pub async fn install_connection(
        &self,
        user_id: &str,
        provider_id: &str,
        options: InstallOptions,
    ) -> Result<InstallOutcome, ConnectionError> {
        let (provider, adapter) = self.resolve(provider_id)?;
        let metadata = provider.metadata_schema.validate(options.metadata)?;

        match provider.auth_type {
            AuthType::OAuth2 => {
                let return_url = self.resolve_return_url(options.redirect_uri.as_deref())?;
                let state = OAuthState::issue(
                    user_id,
                    provider_id,
                    &return_url,
                    self.settings.state_ttl,
                    Utc::now(),
                )
                .with_install_context(metadata, options.source);

                let authorization_url = adapter.build_authorize_url(
                    &state.state,
                    &self.settings.callback_url,
                    &provider.scopes,
                )?;

                self.store.insert_state(&state)?;

                info!(
                    user_id = %user_id,
                    provider = %provider_id,
                    "OAuth install started"
                );

                Ok(InstallOutcome::Authorize {
                    authorization_url,
                    state: state.state,
                    expires_at: state.expires_at,
                })
            }
            AuthType::ApiKey => {
                let Some(api_key) = options.api_key else {
                    return Err(ConnectionError::UnsupportedAuthType {
                        provider_id: provider_id.to_string(),
                        auth_type: provider.auth_type.to_string(),
                    });
                };
                let connection = self
                    .connect_api_key(
                        user_id,
                        provider,
                        adapter,
                        &api_key,
                        options.api_secret.as_deref(),
                        metadata,
                        options.source,
                    )
                    .await?;
                Ok(InstallOutcome::Connected(connection))
            }
        }
    }

    /// Validates and stores an API key, leaving the connection ACTIVE.
    ///
    /// Nothing is persisted when validation fails.
    pub async fn configure_api_key(
        &self,
        user_id: &str,
        provider_id: &str,
        api_key: &str,
        api_secret: Option<&str>,
    ) -> Result<Connection, ConnectionError> {
        let (provider, adapter) = self.resolve(provider_id)?;
        self.connect_api_key(
            user_id,
            provider,
            adapter,
            api_key,
            api_secret,
            ConnectionMetadata::default(),
            None,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn connect_api_key(
        &self,
        user_id: &str,
        provider: &Provider,
        adapter: Arc<dyn ProviderAdapter>,
        api_key: &str,
        api_secret: Option<&str>,
        metadata: ConnectionMetadata,
        source: Option<String>,
    ) -> Result<Connection, ConnectionError> {
        if provider.auth_type != AuthType::ApiKey {
            return Err(ConnectionError::UnsupportedAuthType {
                provider_id: provider.id.clone(),
                auth_type: provider.auth_type.to_string(),
            });
        }
        if api_key.trim().is_empty() {
            return Err(ConnectionError::InvalidRequest("apiKey is required".to_string()));
        }

        let profile = call_with_timeout(
            self.settings.call_timeout,
            "API key validation",
            adapter.validate_api_key(api_key, api_secret),
        )
        .await
        .map_err(|e| match e {
            // A rejected key is a credentials problem, not a revoked grant
            AdapterError::Auth(msg) => ConnectionError::InvalidCredentials(msg),
            other => ConnectionError::from(other),
        })
        .inspect_err(|e| {
            warn!(
                user_id = %user_id,
                provider = %provider.id,
                code = e.code(),
                "API key validation failed"
            )
        })?;

        let sealed = self.seal(&Credentials {
            access_token: api_key.to_string(),
            refresh_token: None,
            expires_at: None,
            api_secret: api_secret.map(str::to_string),
        })?;
        let index = TokenIndex {
            expires_at: None,
            has_refresh_token: false,
        };

        let connection = self.activate_connection(
            user_id,
            &provider.id,
            provider.auth_type,
            &sealed,
            index,
            &profile,
            &metadata,
            source.as_deref(),
        )?;

        info!(
            user_id = %user_id,
            provider = %provider.id,
            connection_id = %connection.id,
            "API key connection active"
        );
        Ok(connection)
    }

    /// Completes an OAuth install.
    ///
    /// The state is consumed before the code exchange, so any failure after
    /// that point leaves it spent.
    pub async fn handle_oauth_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<Connection, ConnectionError> {
        let record = self
            .store
            .get_state(state)?
            .ok_or(ConnectionError::StateNotFound)?;

        if record.consumed {
            return Err(ConnectionError::StateReplay);
        }
        if record.is_expired(Utc::now()) {
            return Err(ConnectionError::StateExpired);
        }
        if !self.store.consume_state(state)? {
            return Err(ConnectionError::StateReplay);
        }

        let (provider, adapter) = self.resolve(&record.provider_id)?;
        if code.is_empty() {
            return Err(ConnectionError::InvalidRequest(
                "authorization code is required".to_string(),
            ));
        }

        let grant = call_with_timeout(
            self.settings.call_timeout,
            "code exchange",
            adapter.exchange_code(code, &self.settings.callback_url),
        )
        .await
        .map_err(ConnectionError::from)
        .inspect_err(|e| {
            warn!(
                user_id = %record.user_id,
                provider = %record.provider_id,
                code = e.code(),
                "OAuth code exchange failed"
            )
        })?;

        let index = TokenIndex {
            expires_at: grant.tokens.expires_at,
            has_refresh_token: grant.tokens.refresh_token.is_some(),
        };
        let sealed = self.seal(&grant.tokens.into_credentials(None))?;

        let connection = self.activate_connection(
            &record.user_id,
            &provider.id,
            provider.auth_type,
            &sealed,
            index,
            &grant.profile,
            &record.metadata,
            record.source.as_deref(),
        )?;

        info!(
            user_id = %record.user_id,
            provider = %record.provider_id,
            connection_id = %connection.id,
            "OAuth connection active"
        );
        Ok(connection)
    }

    /// Browser target for a callback carrying `state`, falling back to the
    /// configured default when the state is unknown.
    pub fn return_url_for(&self, state: Option<&str>) -> String {
        state
            .and_then(|s| self.store.get_state(s).ok().flatten())
            .map(|record| record.redirect_uri)
            .unwrap_or_else(|| self.settings.default_return_url.clone())
    }

    /// All connections of a user, newest first.
    pub fn get_user_connections(&self, user_id: &str) -> Result<Vec<Connection>, ConnectionError> {
        Ok(self.store.list_by_user(user_id)?)
    }

    /// Connections of a user paired with their health reports.
    pub fn list_connection_health(
        &self,
        user_id: &str,
    ) -> Result<Vec<(Connection, HealthReport)>, ConnectionError> {
        Ok(self
            .get_user_connections(user_id)?
            .into_iter()
            .map(|c| {
                let report = evaluate(&c);
                (c, report)
            })
            .collect())
    }

    /// Explicitly revokes a connection and drops its credentials.
    ///
    /// Revoking an already revoked connection is a no-op.
    pub fn revoke_connection(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<Connection, ConnectionError> {
        let connection = self.update_owned(user_id, connection_id, |c, now| {
            if c.status == ConnectionStatus::Revoked {
                return Ok(false);
            }
            c.revoke(None, now)?;
            Ok(true)
        })?;

        info!(
            user_id = %user_id,
            provider = %connection.provider_id,
            connection_id = %connection.id,
            "Connection revoked by user"
        );
        Ok(connection)
    }

    pub fn set_sync_enabled(
        &self,
        user_id: &str,
        connection_id: &str,
        enabled: bool,
    ) -> Result<Connection, ConnectionError> {
        self.update_owned(user_id, connection_id, |c, now| {
            if enabled && c.status == ConnectionStatus::Revoked {
                return Err(ConnectionError::InvalidRequest(
                    "cannot enable sync on a revoked connection".to_string(),
                ));
            }
            if c.sync_enabled == enabled {
                return Ok(false);
            }
            c.sync_enabled = enabled;
            c.updated_at = now;
            Ok(true)
        })
    }

    /// Decrypted credentials of the user's connection to `provider_id`, for
    /// product code about to call the provider.
    ///
    /// Counts the use. An ACTIVE connection whose token has expired is moved
    /// to EXPIRED and rejected.
    pub fn access_credentials(
        &self,
        user_id: &str,
        provider_id: &str,
    ) -> Result<Credentials, ConnectionError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let connection = self
                .store
                .find_active(user_id, provider_id)?
                .ok_or_else(|| ConnectionError::ConnectionNotFound(provider_id.to_string()))?;
            let now = Utc::now();

            if connection.status == ConnectionStatus::Active && connection.is_token_expired(now) {
                let mut expired = connection.clone();
                expired.mark_expired(now)?;
                if self
                    .store
                    .compare_and_swap(&connection.id, connection.version, &expired)?
                {
                    info!(
                        user_id = %user_id,
                        provider = %provider_id,
                        connection_id = %connection.id,
                        "Access token expired"
                    );
                }
                return Err(ConnectionError::AuthError("access token expired".to_string()));
            }

            if connection.status != ConnectionStatus::Active {
                return Err(ConnectionError::AuthError(format!(
                    "connection is {}",
                    connection.status
                )));
            }

            let sealed = connection
                .credentials
                .as_ref()
                .ok_or_else(|| ConnectionError::Storage("credentials missing".to_string()))?;
            let credentials = self.open(sealed)?;

            let mut used = connection.clone();
            used.record_use(now);
            if self
                .store
                .compare_and_swap(&connection.id, connection.version, &used)?
            {
                return Ok(credentials);
            }
            debug!(connection_id = %connection.id, "Usage update lost a race, retrying");
        }

        Err(ConnectionError::Storage(
            "connection changed concurrently, retries exhausted".to_string(),
        ))
    }

    /// Deletes OAuth states whose TTL has passed.
    pub fn purge_expired_states(&self) -> Result<usize, ConnectionError> {
        let removed = self.store.purge_expired_states(Utc::now())?;
        if removed > 0 {
            debug!(removed, "Purged expired OAuth states");
        }
        Ok(removed)
    }

    fn seal(&self, credentials: &Credentials) -> Result<SealedCredentials, ConnectionError> {
        self.cipher
            .seal(credentials)
            .map_err(|e| ConnectionError::Storage(format!("{:#}", e)))
    }

    fn open(&self, sealed: &SealedCredentials) -> Result<Credentials, ConnectionError> {
        self.cipher
            .open(sealed)
            .map_err(|e| ConnectionError::Storage(format!("{:#}", e)))
    }

    /// Resolves `requested` against the default return URL and accepts it
    /// only when it lands on the same origin without embedded credentials.
    fn resolve_return_url(&self, requested: Option<&str>) -> Result<String, ConnectionError> {
        let default = &self.settings.default_return_url;
        let Some(requested) = requested.filter(|r| !r.is_empty()) else {
            return Ok(default.clone());
        };

        let base = Url::parse(default).map_err(|e| {
            ConnectionError::InvalidRequest(format!("default return URL is unusable: {}", e))
        })?;
        let rejected = || {
            ConnectionError::InvalidRequest(format!(
                "redirectUri must stay on {}",
                base.origin().ascii_serialization()
            ))
        };

        let target = base.join(requested).map_err(|_| rejected())?;
        if target.origin() != base.origin()
            || !target.username().is_empty()
            || target.password().is_some()
        {
            return Err(rejected());
        }
        Ok(target.into())
    }

    /// Creates or reactivates the live connection for (user, provider).
    #[allow(clippy::too_many_arguments)]
    fn activate_connection(
        &self,
        user_id: &str,
        provider_id: &str,
        auth_type: AuthType,
        sealed: &SealedCredentials,
        index: TokenIndex,
        profile: &AccountProfile,
        metadata: &ConnectionMetadata,
        source: Option<&str>,
    ) -> Result<Connection, ConnectionError> {
        let apply = |c: &mut Connection, now: DateTime<Utc>| -> Result<(), ConnectionError> {
            c.activate(sealed.clone(), index, profile, now)?;
            if !metadata.is_empty() {
                c.metadata = metadata.clone();
            }
            if let Some(source) = source {
                c.source = Some(source.to_string());
            }
            Ok(())
        };

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let now = Utc::now();
            match self.store.find_active(user_id, provider_id)? {
                Some(existing) => {
                    let mut updated = existing.clone();
                    apply(&mut updated, now)?;
                    if self
                        .store
                        .compare_and_swap(&existing.id, existing.version, &updated)?
                    {
                        updated.version = existing.version + 1;
                        return Ok(updated);
                    }
                }
                None => {
                    let mut fresh = Connection::new(user_id, provider_id, auth_type, now);
                    apply(&mut fresh, now)?;
                    match self.store.upsert(&fresh) {
                        Ok(stored) => return Ok(stored),
                        Err(StoreError::Conflict(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            debug!(
                user_id = %user_id,
                provider = %provider_id,
                attempt,
                "Connection write lost a race, retrying"
            );
        }

        Err(ConnectionError::Storage(
            "connection changed concurrently, retries exhausted".to_string(),
        ))
    }

    /// Read-modify-CAS on a connection owned by `user_id`.
    ///
    /// `mutate` returns whether it changed anything; unchanged records are
    /// returned without a write.
    fn update_owned<F>(
        &self,
        user_id: &str,
        connection_id: &str,
        mut mutate: F,
    ) -> Result<Connection, ConnectionError>
    where
        F: FnMut(&mut Connection, DateTime<Utc>) -> Result<bool, ConnectionError>,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self
                .store
                .get(connection_id)?
                .filter(|c| c.user_id == user_id)
                .ok_or_else(|| ConnectionError::ConnectionNotFound(connection_id.to_string()))?;

            let mut updated = current.clone();
            if !mutate(&mut updated, Utc::now())? {
                return Ok(current);
            }
            if self
                .store
                .compare_and_swap(&current.id, current.version, &updated)?
            {
                updated.version = current.version + 1;
                return Ok(updated);
            }
        }

        Err(ConnectionError::Storage(
            "connection changed concurrently, retries exhausted".to_string(),
        ))
    }
}
