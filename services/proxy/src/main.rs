//! Faultline
//!
//! Runs the proxies listed in `FAULTLINE_CONFIG` until interrupted.

use std::fs::File;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use faultline_proxy::{Config, ProxyCollection};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FAULTLINE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting faultline");
    info!(
        proxies_file = ?config.proxies_file,
        udp_idle_timeout_ms = ?config.udp_idle_timeout.map(|d| d.as_millis()),
        "Configuration loaded"
    );

    let collection = ProxyCollection::with_udp_policy(config.udp_policy());

    if let Some(path) = &config.proxies_file {
        let file = File::open(path)
            .with_context(|| format!("Failed to open proxy config {}", path.display()))?;
        let proxies = collection
            .populate_json(file)
            .await
            .with_context(|| format!("Failed to load proxies from {}", path.display()))?;

        for proxy in &proxies {
            let proxy = proxy.config();
            info!(
                name = %proxy.name,
                protocol = %proxy.protocol,
                listen = %proxy.listen,
                upstream = %proxy.upstream,
                enabled = proxy.enabled,
                "Proxy loaded"
            );
        }
    } else {
        info!("No FAULTLINE_CONFIG set, starting without proxies");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    collection.clear().await;
    info!("Faultline stopped");

    Ok(())
}
