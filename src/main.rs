//! netd - dual-role TCP connection daemon
//!
//! Accepts clients and cluster peers on separate listeners and relays
//! messages between them.

mod relay;

use netd_server::metrics::run_metrics_server;
use netd_server::{Config, Metrics, Server};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if NETD_CONFIG is set, then env overrides)
    let config_path = std::env::var("NETD_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    // Load credentials from external file if configured
    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load credentials: {}", e);
        return Err(e.into());
    }

    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting netd {}", netd_server::VERSION);
    tracing::info!("  Client address: {}", config.network.client_addr);
    tracing::info!("  Cluster address: {}", config.network.cluster_addr);
    if config.auth.enabled {
        tracing::info!(
            "  Authentication: enabled{} ({} client / {} cluster credential(s))",
            if config.auth.required { ", required" } else { "" },
            config.auth.client_credentials.len(),
            config.auth.cluster_credentials.len()
        );
    } else {
        tracing::info!("  Authentication: disabled");
    }
    if config.tls.enabled {
        tracing::info!("  TLS: enabled");
        if config.tls.verify_clients {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    } else {
        tracing::info!("  TLS: disabled");
    }

    let (metrics_shutdown, _) = broadcast::channel::<()>(1);
    let mut builder = Server::builder(config.clone());
    let mut metrics_handle = None;
    if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        builder = builder.metrics(metrics);
    }
    let server = Arc::new(builder.build()?);

    if let Some(metrics) = server.metrics() {
        let addr = config.metrics.bind_addr;
        let stats = server.stats();
        let rx = metrics_shutdown.subscribe();
        metrics_handle = Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, stats, rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }));
    }

    server.serve_clients(relay::handler()).await?;
    server.serve_clusters(relay::handler()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping server...");

    server.close().await;
    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
