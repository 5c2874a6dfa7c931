//! Fakes shared by unit tests.

use crate::connection::{Connection, ConnectionStatus, TokenIndex};
use crate::credentials::{CredentialCipher, CredentialStore, Credentials, MemoryCredentialStore};
use crate::error::AdapterError;
use crate::provider::{
    catalog, AccountProfile, ProviderAdapter, ProviderRegistry, TokenGrant, TokenSet,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;

pub const GOOD_API_KEY: &str = "good-key";

/// Scriptable adapter. Unscripted calls succeed.
#[derive(Default)]
pub struct FakeAdapter {
    refresh_outcomes: Mutex<VecDeque<Result<TokenSet, AdapterError>>>,
    exchange_error: Mutex<Option<AdapterError>>,
    refresh_delay: Mutex<Option<std::time::Duration>>,
    refresh_barrier: Mutex<Option<Arc<Barrier>>>,
    pub refresh_calls: AtomicUsize,
    pub exchange_calls: AtomicUsize,
    pub validate_calls: AtomicUsize,
}

impl FakeAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_refresh(&self, outcome: Result<TokenSet, AdapterError>) {
        self.refresh_outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn fail_exchange(&self, error: AdapterError) {
        *self.exchange_error.lock().unwrap() = Some(error);
    }

    pub fn delay_refresh(&self, delay: std::time::Duration) {
        *self.refresh_delay.lock().unwrap() = Some(delay);
    }

    /// Every refresh waits on `barrier` before answering.
    pub fn gate_refresh(&self, barrier: Arc<Barrier>) {
        *self.refresh_barrier.lock().unwrap() = Some(barrier);
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

pub fn fresh_tokens(tag: &str) -> TokenSet {
    TokenSet {
        access_token: format!("access-{}", tag),
        refresh_token: Some(format!("refresh-{}", tag)),
        expires_at: Some(Utc::now() + Duration::hours(1)),
    }
}

#[async_trait]
impl ProviderAdapter for FakeAdapter {
    fn build_authorize_url(
        &self,
        state: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<String, AdapterError> {
        Ok(format!(
            "https://provider.test/authorize?state={}&redirect_uri={}&scope={}",
            urlencoding::encode(state),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes.join(" "))
        ))
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<TokenGrant, AdapterError> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.exchange_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(TokenGrant {
            tokens: fresh_tokens(code),
            profile: AccountProfile {
                account_id: Some(format!("acct-{}", code)),
                account_email: Some(format!("{}@example.com", code)),
                granted_scopes: vec!["trading".to_string()],
            },
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AdapterError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst);

        let barrier = self.refresh_barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        let delay = *self.refresh_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.refresh_outcomes.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(fresh_tokens(&format!("{}-{}", refresh_token, call))))
    }

    async fn validate_api_key(
        &self,
        api_key: &str,
        _api_secret: Option<&str>,
    ) -> Result<AccountProfile, AdapterError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        match api_key {
            GOOD_API_KEY => Ok(AccountProfile {
                account_id: Some("key-account".to_string()),
                ..Default::default()
            }),
            "flaky-key" => Err(AdapterError::Transient("503".to_string())),
            _ => Err(AdapterError::InvalidCredentials("unknown key".to_string())),
        }
    }
}

/// Registry with `alpaca` (oauth2) and `polygon` (apikey), both served by `adapter`.
pub fn registry(adapter: Arc<FakeAdapter>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(catalog::alpaca(), adapter.clone());
    registry.register(catalog::google_calendar(), adapter.clone());
    registry.register(catalog::polygon(), adapter);
    registry
}

pub fn cipher() -> CredentialCipher {
    CredentialCipher::from_bytes(&[7u8; 32]).unwrap()
}

/// Stores an ACTIVE oauth2 connection whose token expires in `expires_in`.
pub fn seed_active(
    store: &MemoryCredentialStore,
    cipher: &CredentialCipher,
    user_id: &str,
    provider_id: &str,
    expires_in: Duration,
) -> Connection {
    let now = Utc::now();
    let expires_at = now + expires_in;
    let sealed = cipher
        .seal(&Credentials {
            access_token: "seed-access".to_string(),
            refresh_token: Some("seed-refresh".to_string()),
            expires_at: Some(expires_at),
            api_secret: None,
        })
        .unwrap();

    let mut connection = Connection::new(user_id, provider_id, crate::provider::AuthType::OAuth2, now);
    connection
        .activate(
            sealed,
            TokenIndex {
                expires_at: Some(expires_at),
                has_refresh_token: true,
            },
            &AccountProfile::default(),
            now,
        )
        .unwrap();
    assert_eq!(connection.status, ConnectionStatus::Active);
    store.upsert(&connection).unwrap()
}
