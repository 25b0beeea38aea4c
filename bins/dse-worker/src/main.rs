//! # DSE Worker Daemon
//!
//! Registers with the coordinator (persisting the assigned `workerId` back
//! into its configuration file), brings up the exchange transport and the
//! query manager, and serves the coordinator's deployment RPCs until
//! interrupted.
//!
//! ## Usage
//!
//! ```bash
//! dse-worker --config examples-config/worker.yaml
//! RUST_LOG=debug dse-worker --config worker.yaml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dse_node::{ClientConfig, CoordinatorClient, NodeEngine};

/// Command-line arguments for the worker daemon
#[derive(Parser, Debug)]
#[command(name = "dse-worker")]
#[command(about = "DSE worker daemon")]
struct Args {
    /// Path to the worker YAML configuration file; rewritten in place when
    /// the coordinator assigns a fresh worker id
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = dse_node::load_config(&args.config)?;

    let client = Arc::new(CoordinatorClient::new(
        &config.coordinator_host,
        config.coordinator_port,
        ClientConfig::default(),
    )?);
    let (worker_id, config) = dse_node::register(&client, &args.config, config)
        .await
        .context("registration with the coordinator failed")?;
    info!(%worker_id, "registered with coordinator");

    let cancel = CancellationToken::new();
    let engine = NodeEngine::start(
        worker_id,
        config.clone(),
        Arc::clone(&client),
        cancel.child_token(),
    )
    .await?;
    let rpc_addr = format!("{}:{}", config.local_host, config.rpc_port);
    let (_, server) = dse_node::serve(Arc::clone(&engine), &rpc_addr, cancel.clone()).await?;

    signal::ctrl_c().await?;
    println!("\nReceived Ctrl-C, shutting down...");
    engine.shutdown().await;
    if let Err(e) = client.unregister_worker(worker_id).await {
        tracing::warn!(error = %e, "unregister failed");
    }
    cancel.cancel();
    let _ = server.await;
    Ok(())
}
