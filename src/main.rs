use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use switchboard::api::{create_router, ConnectionAppState, CronAppState};
use switchboard::auth::{SingleUser, TokenDirectory, UserResolver};
use switchboard::config::Config;
use switchboard::credentials::{CredentialCipher, CredentialStore, SqliteCredentialStore};
use switchboard::manager::{ConnectionManager, ManagerSettings};
use switchboard::provider::catalog::builtin_registry;
use switchboard::rate_limit::RateLimiter;
use switchboard::scheduler::{SchedulerSettings, TokenRefreshScheduler};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info".into()),
        )
        .init();

    info!("Switchboard starting...");

    let config_path =
        std::env::var("SWITCHBOARD_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    info!(
        bind_addr = %config.server.bind_addr,
        database = %config.database.path,
        auth_enabled = config.server.auth_enabled,
        callback_url = %config.oauth.callback_url(),
        "Configuration loaded"
    );

    let encryption_key = config
        .secrets
        .encryption_key
        .as_deref()
        .context("SWITCHBOARD_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;
    let cipher = CredentialCipher::new(encryption_key).context("Invalid encryption key")?;

    let store: Arc<dyn CredentialStore> = Arc::new(
        SqliteCredentialStore::new(&config.database.path)
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let registry = Arc::new(builtin_registry(|key| std::env::var(key).ok())?);
    info!(providers = registry.len(), "Provider registry loaded");

    let manager = Arc::new(ConnectionManager::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        cipher.clone(),
        ManagerSettings::from_config(&config),
    ));
    let scheduler = Arc::new(TokenRefreshScheduler::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        cipher,
        SchedulerSettings::from_config(&config.refresh),
    ));

    if config.secrets.cron_secret.is_none() {
        warn!("SWITCHBOARD_CRON_SECRET not set; the refresh trigger endpoint will reject every call");
    }

    let cleanup_manager = Arc::clone(&manager);
    let cleanup_interval = Duration::from_secs(config.oauth.state_cleanup_interval_seconds);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        loop {
            interval.tick().await;
            if let Err(e) = cleanup_manager.purge_expired_states() {
                warn!(error = %e, "OAuth state cleanup failed");
            }
        }
    });

    let users: Arc<dyn UserResolver> = if config.server.auth_enabled {
        let directory = TokenDirectory::parse(
            config.secrets.user_tokens.as_deref().unwrap_or_default(),
        )
        .context("Invalid SWITCHBOARD_USER_TOKENS")?;
        if directory.is_empty() {
            warn!("Auth enabled but SWITCHBOARD_USER_TOKENS is empty, every user request will be rejected");
        }
        info!(users = directory.len(), "User tokens loaded");
        Arc::new(directory)
    } else {
        Arc::new(SingleUser)
    };

    let connections = ConnectionAppState {
        manager,
        users,
        rate_limiter: Arc::new(RateLimiter::new(config.rate_limit.limits())),
    };
    let cron = CronAppState {
        scheduler,
        cron_secret: config.secrets.cron_secret.clone(),
    };

    let router = create_router(connections, cron).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(bind_addr = %config.server.bind_addr, "Switchboard API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("Switchboard stopped");

    Ok(())
}
