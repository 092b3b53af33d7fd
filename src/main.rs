//! svcwire - bidirectional RPC and event server
//!
//! Serves registered services, relays events between connected clients and
//! proxies resource sessions over a single TCP connection per client.

use std::sync::Arc;
use svcwire_server::metrics::{run_metrics_server, Metrics};
use svcwire_server::{builtin, Config, Server, ServerConfig, ServiceRegistry};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Config file from SVCWIRE_CONFIG if set, then SVCWIRE_* overrides
    let mut config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("SVCWIRE_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if std::env::var("SVCWIRE_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting svcwire server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Split threshold: {} bytes, chunk {} bytes",
        config.protocol.split_threshold_bytes,
        config.protocol.split_chunk_bytes
    );
    if config.auth.required {
        tracing::info!(
            "  Authentication: enabled ({} token(s))",
            config.auth.token_hashes.len()
        );
    } else {
        tracing::info!("  Authentication: disabled");
    }
    if config.uploads.enabled {
        tracing::info!("  Uploads: {}", config.uploads.root_dir.display());
    } else {
        tracing::info!("  Uploads: disabled");
    }

    let mut server_config = ServerConfig::from_config(&config);

    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let rx = metrics_shutdown.subscribe();
        tracing::info!("  Metrics: http://{}/metrics", addr);
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, rx).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let mut services = ServiceRegistry::new();
    builtin::register(&mut services, server_config.resource_driver.is_some());
    tracing::info!("  Services: {}", services.names().join(", "));

    let server = Arc::new(Server::new(server_config, services));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
