//! # DSE Node - The Worker Side of the Engine
//!
//! Glues the runtime to the control plane: the [`engine::NodeEngine`]
//! hosts buffer pool, exchange transport and query manager; the
//! [`server`] module exposes the coordinator-facing control RPC; the
//! [`client`] talks back to the coordinator with bounded retries; and
//! [`bootstrap`] handles registration plus the persisted `workerId`
//! write-back into the YAML configuration.

pub mod bootstrap;
pub mod client;
pub mod engine;
pub mod server;

pub use bootstrap::{load_config, persist_worker_id, register};
pub use client::{ClientConfig, CoordinatorClient};
pub use engine::NodeEngine;
pub use server::{router, serve};
