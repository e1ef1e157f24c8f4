//! # murmur node
//!
//! Starts one process of a murmur cluster:
//!
//! 1. Load configuration (file, then command-line overrides)
//! 2. Bind the listener and start the node
//! 3. Join through the seeds
//! 4. Run until Ctrl+C, then leave the cluster gracefully

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use murmur::murmur_core::NodeConfig;
use murmur::{FrameHandler, Node, TcpTransport, default_bus, serve, store_for, telemetry};

/// Run a murmur cluster node.
#[derive(Debug, Parser)]
#[command(name = "murmur", version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on; overrides the configuration.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Seed address to join through. Repeatable.
    #[arg(short, long = "seed")]
    seeds: Vec<SocketAddr>,

    /// Stable process id; overrides the configuration.
    #[arg(long)]
    id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if args.id.is_some() {
        config.id = args.id;
    }
    if !args.seeds.is_empty() {
        config.seeds = args.seeds;
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    config.listen = listener
        .local_addr()
        .context("listener has no local address")?;

    let timeout = config.membership.probe_timeout().max(Duration::from_millis(100));
    let transport = Arc::new(TcpTransport::new(timeout, config.delivery.ack_timeout()));
    let seeds = config.seeds.clone();
    let store = store_for(&config);
    let node = Node::start(config, transport, store, default_bus())
        .await
        .context("node failed to start")?;

    let shutdown = Arc::new(Notify::new());
    let handler: Arc<dyn FrameHandler> = node.clone();
    let server = tokio::spawn(serve(listener, handler, Arc::clone(&shutdown)));

    match node.join(seeds).await {
        Ok(answered) => info!(answered, "joined"),
        Err(e) => warn!(error = %e, "running as a singleton until someone joins us"),
    }

    info!(process = %node.identity(), "murmur is running. Press Ctrl+C to stop.");
    match signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, leaving the cluster"),
        Err(err) => error!("failed to listen for shutdown signal: {}", err),
    }

    if let Err(e) = node.leave().await {
        warn!(error = %e, "leave did not complete cleanly");
    }
    shutdown.notify_one();
    server.await.context("listener task failed")?;
    info!("murmur stopped");
    Ok(())
}
