//! # DSE Runtime - Pipeline Execution on a Worker
//!
//! Turns deployed subplans into running dataflow:
//!
//! - **Kernels** ([`kernels`], [`window`], [`join`]): the runtime form of
//!   logical operators, from stateless row transforms to windowed
//!   aggregation and the two join variants.
//! - **Executables** ([`executable`], [`compiler`]): subplans lowered into
//!   source runners, fused kernel pipelines and sinks, wired by successor
//!   routes with end-of-stream accounting.
//! - **Manager** ([`manager`]): task queues, worker tasks, the
//!   reconfiguration barrier protocol and termination-token bookkeeping.
//! - **Sources & sinks** ([`sources`], [`sinks`]): generators, CSV replay,
//!   print/file sinks, and the bridges into the network exchange.

pub mod compiler;
pub mod executable;
pub mod join;
pub mod kernels;
pub mod manager;
pub mod sinks;
pub mod sources;
pub mod window;

pub use compiler::{compile, CompileContext};
pub use executable::{Destination, ExecutablePipeline, ExecutableQueryPlan, TaskPayload};
pub use kernels::{KernelContext, OperatorKernel};
pub use manager::{QueryManager, ReconfigurationType};
pub use sinks::ExecutableSink;
pub use sources::SourceRunner;
