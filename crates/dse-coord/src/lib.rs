//! # DSE Coord - Coordinator Services
//!
//! The control plane of the engine: worker topology, source and query
//! catalogs, the global query plan with signature-based sharing, operator
//! placement, two-phase deployment and the coordinator's HTTP surface
//! (query submission plus the worker-facing RPC routes).

pub mod catalog;
pub mod coordinator;
pub mod deploy;
pub mod global_plan;
pub mod parser;
pub mod placement;
pub mod server;
pub mod topology;

pub use catalog::{PhysicalSourceEntry, QueryCatalog, QueryEntry, SourceCatalog};
pub use coordinator::Coordinator;
pub use deploy::{DeploymentPhase, HttpWorkerControl, RetryPolicy, WorkerControl, WorkerEndpoint};
pub use global_plan::GlobalQueryPlan;
pub use parser::parse_query;
pub use placement::{ExecutionNode, GlobalExecutionPlan, PlacementPhase};
pub use server::{router, serve};
pub use topology::{Topology, TopologyNode};
