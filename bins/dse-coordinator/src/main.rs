//! # DSE Coordinator Daemon
//!
//! Runs the coordinator services (submission surface, worker RPC, global
//! plan, placement, deployment) together with an embedded worker node that
//! hosts root-placed operators such as user sinks.
//!
//! ## Usage
//!
//! ```bash
//! dse-coordinator --config examples-config/coordinator.yaml
//! RUST_LOG=debug dse-coordinator --config coordinator.yaml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dse_core::config::{CoordinatorConfig, WorkerConfig};
use dse_core::TopologyNodeId;
use dse_coord::{Coordinator, HttpWorkerControl, RetryPolicy, Topology};
use dse_node::{ClientConfig, CoordinatorClient, NodeEngine};

/// Command-line arguments for the coordinator daemon
#[derive(Parser, Debug)]
#[command(name = "dse-coordinator")]
#[command(about = "DSE coordinator daemon")]
struct Args {
    /// Path to the coordinator YAML configuration file
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
    let config: CoordinatorConfig = {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("read {:?}", args.config))?;
        serde_yaml::from_str(&text).with_context(|| format!("parse {:?}", args.config))?
    };

    let topology = Topology::new(
        config.rpc_host.clone(),
        config.node_rpc_port,
        config.node_data_port,
        config.node_slots,
    );
    let control = Arc::new(HttpWorkerControl::new(RetryPolicy::default())?);
    let coordinator = Arc::new(Coordinator::new(topology, control));
    for source in &config.logical_sources {
        coordinator
            .register_logical_source(&source.name, &source.schema)
            .with_context(|| format!("register logical source {}", source.name))?;
    }

    let cancel = CancellationToken::new();
    let rpc_addr = format!("{}:{}", config.rpc_host, config.rpc_port);
    let (addr, coordinator_server) =
        dse_coord::serve(Arc::clone(&coordinator), &rpc_addr, cancel.clone()).await?;
    info!(%addr, "coordinator accepting submissions");

    // embedded worker node for root-placed operators
    let node_config: WorkerConfig = serde_yaml::from_str(&format!(
        "coordinatorHost: {host}\ncoordinatorPort: {port}\nlocalHost: {host}\nrpcPort: {node_rpc}\ndataPort: {node_data}\nslots: {slots}\nworkerThreads: {threads}\n",
        host = config.rpc_host,
        port = config.rpc_port,
        node_rpc = config.node_rpc_port,
        node_data = config.node_data_port,
        slots = config.node_slots,
        threads = config.worker_threads,
    ))?;
    let node_client = Arc::new(CoordinatorClient::new(
        &config.rpc_host,
        config.rpc_port,
        ClientConfig::default(),
    )?);
    let engine = NodeEngine::start(
        TopologyNodeId::new(1),
        node_config,
        node_client,
        cancel.child_token(),
    )
    .await?;
    let node_addr = format!("{}:{}", config.rpc_host, config.node_rpc_port);
    let (_, node_server) =
        dse_node::serve(Arc::clone(&engine), &node_addr, cancel.clone()).await?;

    signal::ctrl_c().await?;
    println!("\nReceived Ctrl-C, shutting down...");
    engine.shutdown().await;
    cancel.cancel();
    let _ = node_server.await;
    let _ = coordinator_server.await;
    Ok(())
}
