//! # DSE Plan - Logical Query Plans and the Query Merger
//!
//! Everything between a submitted query and a deployable subplan:
//!
//! - **Operator model**: a flat tagged enum of logical operators with
//!   serializable payloads ([`operator`]).
//! - **Plan arena**: operators in a slot vector addressed by stable ids,
//!   edges as id lists, explicit work-queue traversal ([`plan`]).
//! - **Builder**: the fluent `Query::from(..).filter(..).sink(..)` API
//!   ([`builder`]).
//! - **Inference**: schema propagation and field validation ([`inference`]).
//! - **Rewrite**: filter and projection push-down ([`rewrite`]).
//! - **Merger**: signature-based equality and containment merging into
//!   shared query plans with change logs ([`merger`]).
//! - **Decomposition**: per-worker subplans serialized for deployment
//!   ([`decompose`]).

pub mod builder;
pub mod decompose;
pub mod inference;
pub mod merger;
pub mod operator;
pub mod plan;
pub mod rewrite;
pub mod signature;

pub use builder::Query;
pub use decompose::{is_pipeline_breaker, DecomposedPlan};
pub use inference::{attach_source_schemas, infer_schemas};
pub use merger::{source_set, ChangeLogEntry, SharedQueryPlan};
pub use operator::{
    AggregationType, JoinDescriptor, JoinStrategy, NetworkSinkDescriptor,
    NetworkSourceDescriptor, OperatorKind, OperatorNode, SinkDescriptor, SourceDescriptor,
    TimeCharacteristic, WatermarkDescriptor, WindowDescriptor, WindowType,
};
pub use plan::QueryPlan;
pub use rewrite::{FilterPushDownPhase, ProjectionPushDownPhase};
pub use signature::signatures;
