//! # DSE Net - Tuple Buffer Exchange Transport
//!
//! Moves sealed tuple buffers and control events between worker partitions
//! over TCP. A receiving worker registers partitions in its
//! [`PartitionRegistry`] and runs one [`NetworkTransport`]; upstream
//! network sinks open a [`NetworkChannel`] per partition with an
//! announce/ready handshake, retried with backoff while deployment is
//! still converging.
//!
//! Delivery model: per-partition ordering is the TCP order, backpressure
//! propagates from the receiver's pooled buffers and bounded destination
//! queues back to the sender socket, and every buffer submitted before a
//! graceful end-of-stream is delivered exactly once before that marker.

pub mod channel;
pub mod error;
pub mod registry;
pub mod server;
pub mod wire;

pub use channel::{ChannelConfig, NetworkChannel};
pub use error::{NetError, NetResult};
pub use registry::{ChannelEvent, PartitionRegistry};
pub use server::NetworkTransport;
pub use wire::{DataFrame, EventKind, WireMessage};
