//! # DSE Core - Shared Types for the Distributed Stream Engine
//!
//! This crate provides the foundational types every other DSE crate builds
//! on: opaque identifiers, stream schemas and runtime values, serializable
//! expression trees, the pooled tuple-buffer memory manager, the query
//! lifecycle vocabulary, RPC message bodies and the YAML configuration
//! model.
//!
//! ## Key Components
//!
//! - **Identifiers**: 64-bit newtype ids with `INVALID` sentinels and
//!   catalog-local monotonic generators.
//! - **Schema & Values**: ordered `(name, type)` field lists with a fixed
//!   row slot layout; `Value` is the unit of expression evaluation.
//! - **Expressions**: predicate/assignment trees with the structural
//!   operations the plan rewrite phases need (rename, substitution,
//!   conjunct split) and a canonical form for operator signatures.
//! - **Tuple Buffers**: fixed-size pooled buffers with an exclusive write
//!   phase, reference-counted read phase, child buffers for variable-length
//!   payloads and pool recycling on last drop.
//! - **Error taxonomy**: one `thiserror` enum whose kinds encode how a
//!   failure is handled (validate, retry, skip tuple, fail query).

pub mod buffer;
pub mod config;
pub mod error;
pub mod expr;
pub mod ids;
pub mod query;
pub mod row;
pub mod rpc;
pub mod types;

pub use buffer::{now_millis, BufferBuilder, BufferManager, TupleBuffer};
pub use error::{CoreError, CoreResult};
pub use expr::{BinaryOp, Expr, FieldResolver, UnaryOp};
pub use ids::{
    IdGenerator, OperatorId, OriginId, Partition, PartitionId, PipelineId, QueryId,
    SharedQueryId, SubPlanId, TopologyNodeId,
};
pub use query::{
    ExecutionStatus, FaultToleranceType, LineageType, PlacementStrategy, QueryStatus,
    SharedQueryStatus, TerminationType,
};
pub use row::{rows, RowView, RowsBuilder};
pub use types::{DataType, Field, Schema, Value, ATTRIBUTE_SEPARATOR};
