use anyhow::{Context, Result};
use refresh_trigger::{run, TriggerClient, TriggerConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refresh_trigger=info".into()),
        )
        .init();

    let config = TriggerConfig::from_env(|key| std::env::var(key).ok())?;
    info!(
        base_url = %config.base_url,
        interval_seconds = config.interval.as_secs(),
        "Refresh trigger starting"
    );

    let client = TriggerClient::new(&config)?;
    let loop_handle = tokio::spawn(run(client, config.interval));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    loop_handle.abort();
    Ok(())
}
