//! Worker bootstrap: registration with the coordinator and the persisted
//! worker identity.
//!
//! On the first registration the coordinator assigns a monotonic worker
//! id. The worker writes it back into its YAML configuration under the
//! `workerId` key, overwriting a stale value if the coordinator decided
//! differently.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use dse_core::config::WorkerConfig;
use dse_core::rpc::{PhysicalSourceDef, RegisterWorkerRequest};
use dse_core::{CoreError, CoreResult, TopologyNodeId};

use crate::client::CoordinatorClient;

pub fn load_config(path: &Path) -> CoreResult<WorkerConfig> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Validation(format!("read config {path:?}: {e}")))?;
    serde_yaml::from_str(&text)
        .map_err(|e| CoreError::Validation(format!("parse config {path:?}: {e}")))
}

/// Rewrite the configuration file with the assigned worker id.
pub fn persist_worker_id(path: &Path, config: &WorkerConfig, id: TopologyNodeId) -> CoreResult<()> {
    let mut updated = config.clone();
    updated.worker_id = Some(id.raw());
    let text = serde_yaml::to_string(&updated)
        .map_err(|e| CoreError::RuntimeSystem(format!("serialize config: {e}")))?;
    std::fs::write(path, text)
        .map_err(|e| CoreError::RuntimeSystem(format!("write config {path:?}: {e}")))?;
    Ok(())
}

/// Register with the coordinator and persist the assigned id. Returns the
/// id and the (possibly updated) configuration.
pub async fn register(
    client: &CoordinatorClient,
    config_path: &Path,
    mut config: WorkerConfig,
) -> CoreResult<(TopologyNodeId, WorkerConfig)> {
    let request = RegisterWorkerRequest {
        worker_id: config.worker_id.map(TopologyNodeId::new),
        address: config.local_host.clone(),
        control_port: config.rpc_port,
        data_port: config.data_port,
        slots: config.slots,
        capabilities: BTreeMap::new(),
        location: config.location,
    };
    let assigned = client.register_worker(request).await?;

    if config.worker_id != Some(assigned.raw()) {
        persist_worker_id(config_path, &config, assigned)?;
        config.worker_id = Some(assigned.raw());
        info!(worker = %assigned, "assigned worker id persisted");
    }

    let sources: Vec<PhysicalSourceDef> = config
        .physical_sources
        .iter()
        .map(|p| PhysicalSourceDef {
            logical_name: p.logical_source_name.clone(),
            physical_name: p.physical_source_name.clone(),
            source_type: match &p.source {
                dse_core::config::SourceKind::Generator { .. } => "generator".to_string(),
                dse_core::config::SourceKind::Csv { .. } => "csv".to_string(),
            },
        })
        .collect();
    if !sources.is_empty() {
        client.register_physical_sources(assigned, sources).await?;
    }
    Ok((assigned, config))
}
