//! YAML configuration for the coordinator and worker daemons.
//!
//! Keys are camelCase on disk. The worker configuration is rewritten in
//! place when the coordinator assigns a fresh `workerId` at registration.

use serde::{Deserialize, Serialize};

use crate::rpc::GeoLocation;

/// How a worker arranges its task queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMode {
    /// One shared queue; any worker task picks any task.
    Dynamic,
    /// `queues` separate queues, each bound to a fixed slice of workers;
    /// registered queries are spread over the queues round-robin.
    PerQuery { queues: usize },
}

impl Default for QueueMode {
    fn default() -> Self {
        QueueMode::Dynamic
    }
}

/// A physical source hosted by a worker, attached to a logical source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalSourceConfig {
    pub logical_source_name: String,
    pub physical_source_name: String,
    #[serde(flatten)]
    pub source: SourceKind,
}

/// Concrete source implementations a worker can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    /// Emits `tuples` generated rows, one batch per `intervalMs`.
    Generator {
        #[serde(default = "default_generator_tuples")]
        tuples: u64,
        #[serde(rename = "intervalMs", default = "default_interval_ms")]
        interval_ms: u64,
    },
    /// Replays a CSV file in schema order.
    Csv {
        path: String,
        #[serde(rename = "hasHeader", default)]
        has_header: bool,
        #[serde(rename = "intervalMs", default = "default_interval_ms")]
        interval_ms: u64,
    },
}

fn default_generator_tuples() -> u64 {
    10
}

fn default_interval_ms() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Coordinator-assigned identity, persisted across restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u64>,
    pub coordinator_host: String,
    pub coordinator_port: u16,
    #[serde(default = "default_host")]
    pub local_host: String,
    /// Port of the worker's control RPC server.
    pub rpc_port: u16,
    /// Port of the tuple-buffer exchange transport.
    pub data_port: u16,
    #[serde(default = "default_slots")]
    pub slots: u16,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default)]
    pub queue_mode: QueueMode,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_buffers_in_pool")]
    pub buffers_in_pool: usize,
    #[serde(default = "default_network_handlers")]
    pub network_handler_threads: usize,
    #[serde(default)]
    pub physical_sources: Vec<PhysicalSourceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalSourceConfig {
    pub name: String,
    /// `name:type,name:type` field list.
    pub schema: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    #[serde(default = "default_host")]
    pub rpc_host: String,
    pub rpc_port: u16,
    /// Control port of the coordinator's embedded worker node.
    #[serde(default = "default_node_rpc_port")]
    pub node_rpc_port: u16,
    /// Exchange transport port of the embedded worker node.
    #[serde(default = "default_node_data_port")]
    pub node_data_port: u16,
    #[serde(default = "default_node_slots")]
    pub node_slots: u16,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default)]
    pub logical_sources: Vec<LogicalSourceConfig>,
    /// Seconds a graceful stop may drain before promotion to hard stop.
    #[serde(default = "default_soft_stop_timeout_secs")]
    pub soft_stop_timeout_secs: u64,
}

fn default_node_rpc_port() -> u16 {
    8083
}

fn default_node_data_port() -> u16 {
    8084
}

fn default_node_slots() -> u16 {
    64
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_slots() -> u16 {
    8
}

fn default_worker_threads() -> usize {
    4
}

fn default_buffer_size() -> usize {
    4096
}

fn default_buffers_in_pool() -> usize {
    1024
}

fn default_network_handlers() -> usize {
    2
}

fn default_soft_stop_timeout_secs() -> u64 {
    600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_yaml_roundtrip_keeps_worker_id_key() {
        let yaml = r#"
coordinatorHost: 127.0.0.1
coordinatorPort: 8081
rpcPort: 9090
dataPort: 9091
physicalSources:
  - logicalSourceName: default_logical
    physicalSourceName: default_physical
    type: generator
    tuples: 10
"#;
        let mut cfg: WorkerConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.worker_id.is_none());
        assert_eq!(cfg.queue_mode, QueueMode::Dynamic);
        assert_eq!(cfg.physical_sources.len(), 1);

        cfg.worker_id = Some(2);
        let out = serde_yaml::to_string(&cfg).unwrap();
        assert!(out.contains("workerId: 2"), "got: {out}");
    }

    #[test]
    fn per_query_queue_mode_parses() {
        let yaml = "type: per_query\nqueues: 3\n";
        let mode: QueueMode = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(mode, QueueMode::PerQuery { queues: 3 });
    }
}
