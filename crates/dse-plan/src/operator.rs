//! Logical operator variants and their payloads.
//!
//! Operators are a flat tagged enum rather than a trait hierarchy; the
//! narrow behavior seams live in the runtime kernels, not here. Everything
//! serializes, because subplans travel to workers as JSON.

use serde::{Deserialize, Serialize};

use dse_core::config::SourceKind;
use dse_core::{Expr, OperatorId, OriginId, Partition, Schema};

/// Which clock a windowed operator runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeCharacteristic {
    /// Event time read from a schema field carrying epoch milliseconds.
    EventTime { field: String },
    /// Arrival time stamped by the ingesting source.
    IngestionTime,
}

impl TimeCharacteristic {
    /// The schema field windows are keyed on, if event time.
    pub fn field(&self) -> Option<&str> {
        match self {
            TimeCharacteristic::EventTime { field } => Some(field),
            TimeCharacteristic::IngestionTime => None,
        }
    }
}

/// Window shapes supported by window assignment and joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowType {
    Tumbling { size_ms: u64 },
    Sliding { size_ms: u64, slide_ms: u64 },
    /// Contiguous runs of tuples satisfying `predicate`, at least
    /// `min_count` long.
    Threshold { predicate: Expr, min_count: u64 },
}

impl WindowType {
    /// `(start, end]` windows a timestamp belongs to, oldest first.
    ///
    /// Threshold windows are data-driven and resolved by the assigner, not
    /// by timestamp arithmetic.
    pub fn windows_for(&self, ts: u64) -> Vec<(u64, u64)> {
        match self {
            WindowType::Tumbling { size_ms } => {
                let start = ts - ts % size_ms;
                vec![(start, start + size_ms)]
            }
            WindowType::Sliding { size_ms, slide_ms } => {
                let mut out = Vec::new();
                let last_start = ts - ts % slide_ms;
                let mut start = last_start.saturating_sub(size_ms - slide_ms);
                // align to slide grid
                start -= start % slide_ms;
                while start <= last_start {
                    if ts >= start && ts < start + size_ms {
                        out.push((start, start + size_ms));
                    }
                    start += slide_ms;
                }
                out
            }
            WindowType::Threshold { .. } => Vec::new(),
        }
    }
}

/// Aggregation functions of the window operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Sum,
    Count,
    Min,
    Max,
    Avg,
    Median,
}

/// Keyed, windowed aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowDescriptor {
    pub window: WindowType,
    pub time: TimeCharacteristic,
    /// Grouping key field; unkeyed windows aggregate everything into key 0.
    pub key: Option<String>,
    pub aggregation: AggregationType,
    /// Aggregated field; ignored by `Count`.
    pub on_field: String,
}

/// Strategy of the windowed stream join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JoinStrategy {
    NestedLoop,
    HashPartitioned { partitions: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinDescriptor {
    pub left_key: String,
    pub right_key: String,
    pub window: WindowType,
    pub time: TimeCharacteristic,
    pub strategy: JoinStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkDescriptor {
    pub time: TimeCharacteristic,
    /// Subtracted from the maximum observed timestamp per origin.
    pub allowed_lateness_ms: u64,
}

/// A logical source with its catalog schema; the physical implementation is
/// attached during decomposition for the worker that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub logical_name: String,
    pub schema: Schema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical: Option<SourceKind>,
    #[serde(default = "origin_invalid")]
    pub origin: OriginId,
}

fn origin_invalid() -> OriginId {
    OriginId::INVALID
}

/// Sinks a query can terminate in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkDescriptor {
    Print,
    /// CSV file with a `name:TYPE` header line.
    File { path: String, append: bool },
    Null,
}

/// Receiving end of a network edge, installed by placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSourceDescriptor {
    pub partition: Partition,
    pub schema: Schema,
    /// Every origin whose buffers cross this edge; windowed operators
    /// downstream wait on all of them before triggering.
    pub origins: Vec<OriginId>,
}

/// Sending end of a network edge, installed by placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSinkDescriptor {
    pub partition: Partition,
    pub target_host: String,
    pub target_port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperatorKind {
    Source(SourceDescriptor),
    Filter { predicate: Expr },
    Map { field: String, expr: Expr },
    /// Ordered selection; each entry is `(input field, optional new name)`.
    Project { fields: Vec<(String, Option<String>)> },
    Union,
    Join(JoinDescriptor),
    Window(WindowDescriptor),
    WatermarkAssign(WatermarkDescriptor),
    Sink(SinkDescriptor),
    NetworkSource(NetworkSourceDescriptor),
    NetworkSink(NetworkSinkDescriptor),
}

impl OperatorKind {
    pub fn is_source(&self) -> bool {
        matches!(self, OperatorKind::Source(_) | OperatorKind::NetworkSource(_))
    }

    pub fn is_sink(&self) -> bool {
        matches!(self, OperatorKind::Sink(_) | OperatorKind::NetworkSink(_))
    }

    /// Binary operators have an ordered pair of input branches.
    pub fn is_binary(&self) -> bool {
        matches!(self, OperatorKind::Union | OperatorKind::Join(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Source(_) => "source",
            OperatorKind::Filter { .. } => "filter",
            OperatorKind::Map { .. } => "map",
            OperatorKind::Project { .. } => "project",
            OperatorKind::Union => "union",
            OperatorKind::Join(_) => "join",
            OperatorKind::Window(_) => "window",
            OperatorKind::WatermarkAssign(_) => "watermark_assign",
            OperatorKind::Sink(_) => "sink",
            OperatorKind::NetworkSource(_) => "network_source",
            OperatorKind::NetworkSink(_) => "network_sink",
        }
    }
}

/// One node of the plan arena: the operator plus its inferred output schema
/// and its edges, all by stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorNode {
    pub id: OperatorId,
    pub kind: OperatorKind,
    /// Downstream consumers.
    pub parents: Vec<OperatorId>,
    /// Upstream inputs; order is the branch order of binary operators.
    pub children: Vec<OperatorId>,
    /// Filled by schema inference.
    pub output_schema: Schema,
}
