//! The Weir broker server binary.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamMap;
use tracing_subscriber::prelude::*;

use weir::config::Config;
use weir::server::Server;
use weir::store::{FileStore, MemoryStore, Store, StoreLimits};
use weir::transport::MemoryTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let config = Arc::new(Config::new()?);
    let recorder = Box::leak(Box::new(PrometheusBuilder::new().build()));
    metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;

    tracing::info!(
        cluster_id = %config.cluster_id,
        discover_prefix = %config.discover_prefix,
        max_channels = config.max_channels,
        max_msgs = config.max_msgs,
        storage_data_path = %config.storage_data_path,
        "starting Weir broker",
    );

    let limits = StoreLimits {
        max_channels: config.max_channels,
        max_msgs: config.max_msgs,
        max_bytes: config.max_bytes,
        max_subs: config.max_subs,
    };
    let store: Arc<dyn Store> = if config.storage_data_path.is_empty() {
        Arc::new(MemoryStore::new(limits))
    } else {
        let path = PathBuf::from(&config.storage_data_path);
        Arc::new(FileStore::open(&path, limits).context("error opening file store")?)
    };
    let transport = Arc::new(MemoryTransport::new());
    let server = Server::start(config, transport.clone(), store).context("error starting broker server")?;

    // Run until a shutdown signal arrives.
    let mut signals = StreamMap::new();
    signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
    signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
    if let Some((sig, _)) = signals.next().await {
        tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
    }

    server.shutdown();
    transport.close();
    tracing::debug!("Weir shutdown complete");

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    Ok(())
}
