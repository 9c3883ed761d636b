//! mosaic -- screen-share viewing server daemon.
//!
//! Starts the TCP listener for broadcasting clients, wires the session
//! registry to the viewport controller, and runs until Ctrl+C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mosaic::config::ServerConfig;
use mosaic::registry::SessionRegistry;
use mosaic::server;
use mosaic::stitch::NoopStitcher;
use mosaic::viewport::{LatestImages, ViewportController};

/// mosaic -- screen-share viewing server.
///
/// Broadcasting clients connect over TCP, register, and stream screen
/// frames; the server keeps at most one page of them actively sending.
#[derive(Parser, Debug)]
#[command(name = "mosaic", version, about, long_about = None)]
struct Cli {
    /// Address to bind the TCP listener (overrides the config file)
    #[arg(long, env = "MOSAIC_BIND")]
    bind: Option<SocketAddr>,

    /// Path to a TOML config file
    #[arg(long, env = "MOSAIC_CONFIG")]
    config: Option<PathBuf>,

    /// Liveness timeout in milliseconds (overrides the config file)
    #[arg(long)]
    liveness_timeout_ms: Option<u64>,

    /// Tile budget per display page (overrides the config file)
    #[arg(long)]
    max_tiles: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?.unwrap_or_default(),
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(timeout) = cli.liveness_timeout_ms {
        config.liveness_timeout_ms = timeout;
    }
    if let Some(max_tiles) = cli.max_tiles {
        config.max_tiles = max_tiles;
    }

    let registry = SessionRegistry::builder()
        .liveness_timeout(Duration::from_millis(config.liveness_timeout_ms))
        .frame_capacity(config.frame_queue_capacity)
        .image_capacity(config.image_queue_capacity)
        .build();

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let sink = LatestImages::new();
    let controller = ViewportController::with_max_tiles(
        Arc::new(NoopStitcher),
        Arc::new(sink),
        command_tx,
        config.max_tiles,
    );

    let cancel = CancellationToken::new();
    controller.attach(&registry, cancel.clone());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "mosaic server starting");

    let server_task = {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server::serve(listener, registry, command_rx, cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C, shutting down");

    cancel.cancel();
    registry.drain();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(?e, "server exited with error"),
        Err(e) => tracing::warn!(?e, "server task panicked"),
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mosaic=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
