//! Error taxonomy shared by every crate of the engine.
//!
//! The kinds mirror how failures are handled, not where they originate:
//! validation and not-found surface at the API edge, transient RPC failures
//! are retried, data errors stay inside one tuple, system errors fail the
//! owning query, and `Terminated` marks a normal shutdown observed by an
//! in-flight operation.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input rejected at submission time. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown id or name; aborts the containing operation.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection reset, unavailable or deadline exceeded; retried with
    /// bounded exponential backoff by the RPC layer.
    #[error("transient rpc failure: {0}")]
    TransientRpc(String),

    /// Partial install of a shared plan; triggers rollback.
    #[error("deployment failed: {0}")]
    Deployment(String),

    /// Per-tuple evaluation failure (bad cast, missing field). Handled by
    /// the operator policy, never crashes a pipeline.
    #[error("data error: {0}")]
    RuntimeData(String),

    /// Pool exhaustion, queue shutdown and similar; fails the owning query.
    #[error("runtime failure: {0}")]
    RuntimeSystem(String),

    /// Unpooled allocation refused.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The owning context was shut down while the operation was in flight.
    #[error("terminated")]
    Terminated,
}

impl CoreError {
    /// Whether the RPC retry policy may re-issue the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientRpc(_))
    }
}
