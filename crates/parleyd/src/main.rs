//! parleyd: the Parley instant-messaging server.

use anyhow::Result;

use parley_core::config::ParleyConfig;
use parleyd::Server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match ParleyConfig::write_default_if_missing() {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let config = ParleyConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ParleyConfig::default()
    });
    tracing::info!(
        control_port = config.network.control_port,
        bulk_port = config.network.bulk_port,
        negotiation = ?config.transfer.negotiation,
        acknowledged = config.transfer.acknowledged,
        "parleyd starting"
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    Server::bind(config).await?.run(shutdown_tx).await
}
