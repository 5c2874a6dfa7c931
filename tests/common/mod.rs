// Shared fixtures for API integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{body::Body, http::Request, Router};
use chrono::{Duration, Utc};
use std::sync::Arc;
use switchboard::api::{create_router, ConnectionAppState, CronAppState};
use switchboard::auth::{SingleUser, TokenDirectory, UserResolver};
use switchboard::credentials::{CredentialCipher, MemoryCredentialStore};
use switchboard::error::AdapterError;
use switchboard::manager::{ConnectionManager, ManagerSettings};
use switchboard::provider::{
    catalog, AccountProfile, ProviderAdapter, ProviderRegistry, TokenGrant, TokenSet,
};
use switchboard::rate_limit::{Quota, RateLimiter, RateLimits};
use switchboard::scheduler::{SchedulerSettings, TokenRefreshScheduler};

pub const CRON_SECRET: &str = "test-cron-secret";
pub const RETURN_URL: &str = "http://localhost:5173/settings/integrations";
/// Registered as alice's and bob's bearer tokens when auth is enabled.
pub const ALICE_TOKEN: &str = "tok-alice-7f3a";
pub const BOB_TOKEN: &str = "tok-bob-21c9";

/// Provider double: codes starting with "bad" fail, only "good-key" validates.
pub struct StubAdapter;

#[async_trait]
impl ProviderAdapter for StubAdapter {
    fn build_authorize_url(
        &self,
        state: &str,
        redirect_uri: &str,
        _scopes: &[String],
    ) -> Result<String, AdapterError> {
        Ok(format!(
            "https://provider.test/authorize?state={}&redirect_uri={}",
            urlencoding::encode(state),
            urlencoding::encode(redirect_uri)
        ))
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<TokenGrant, AdapterError> {
        if code.starts_with("bad") {
            return Err(AdapterError::Auth("invalid_grant".to_string()));
        }
        Ok(TokenGrant {
            tokens: TokenSet {
                access_token: format!("access-{}", code),
                refresh_token: Some(format!("refresh-{}", code)),
                expires_at: Some(Utc::now() + Duration::minutes(5)),
            },
            profile: AccountProfile {
                account_id: Some("acct-1".to_string()),
                account_email: Some("trader@example.com".to_string()),
                granted_scopes: vec!["trading".to_string()],
            },
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AdapterError> {
        Ok(TokenSet {
            access_token: format!("{}-renewed", refresh_token),
            refresh_token: None,
            expires_at: Some(Utc::now() + Duration::hours(1)),
        })
    }

    async fn validate_api_key(
        &self,
        api_key: &str,
        _api_secret: Option<&str>,
    ) -> Result<AccountProfile, AdapterError> {
        match api_key {
            "good-key" => Ok(AccountProfile::default()),
            _ => Err(AdapterError::InvalidCredentials("unknown key".to_string())),
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryCredentialStore>,
    pub manager: Arc<ConnectionManager>,
}

pub struct AppOptions {
    pub auth_enabled: bool,
    pub rate_limit_per_minute: Option<u64>,
    pub cron_secret: Option<String>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            auth_enabled: false,
            rate_limit_per_minute: None,
            cron_secret: Some(CRON_SECRET.to_string()),
        }
    }
}

pub fn cipher() -> CredentialCipher {
    CredentialCipher::from_bytes(&[3u8; 32]).unwrap()
}

pub fn create_test_app(options: AppOptions) -> TestApp {
    let adapter = Arc::new(StubAdapter);
    let mut registry = ProviderRegistry::new();
    registry.register(catalog::alpaca(), adapter.clone());
    registry.register(catalog::polygon(), adapter);
    let registry = Arc::new(registry);

    let store = Arc::new(MemoryCredentialStore::new());
    let manager = Arc::new(ConnectionManager::new(
        registry.clone(),
        store.clone(),
        cipher(),
        ManagerSettings {
            callback_url: "http://localhost:3000/api/connections/oauth/callback".to_string(),
            default_return_url: RETURN_URL.to_string(),
            state_ttl: Duration::minutes(10),
            call_timeout: std::time::Duration::from_secs(5),
        },
    ));
    let scheduler = Arc::new(TokenRefreshScheduler::new(
        registry,
        store.clone(),
        cipher(),
        SchedulerSettings {
            lookahead: Duration::minutes(20),
            max_concurrency: 4,
            per_provider_concurrency: 2,
            call_timeout: std::time::Duration::from_secs(5),
            error_threshold: 5,
            soft_deadline: std::time::Duration::from_secs(60),
        },
    ));

    let users: Arc<dyn UserResolver> = if options.auth_enabled {
        let directory = TokenDirectory::new();
        directory.insert(ALICE_TOKEN, "alice");
        directory.insert(BOB_TOKEN, "bob");
        Arc::new(directory)
    } else {
        Arc::new(SingleUser)
    };
    let quota = options.rate_limit_per_minute.map(Quota::per_minute);

    let router = create_router(
        ConnectionAppState {
            manager: manager.clone(),
            users,
            rate_limiter: Arc::new(RateLimiter::new(RateLimits {
                install: quota,
                api_key: quota,
            })),
        },
        CronAppState {
            scheduler,
            cron_secret: options.cron_secret,
        },
    );

    TestApp {
        router,
        store,
        manager,
    }
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
