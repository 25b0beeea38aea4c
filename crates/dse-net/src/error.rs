//! Transport error classes.

use dse_core::{CoreError, Partition};
use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Corrupted frame header; the offending connection is closed, others
    /// are unaffected.
    #[error("bad magic: {0:#x}")]
    BadMagic(u32),

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Frame shorter than its own header claims.
    #[error("corrupt frame: {0}")]
    Corrupt(&'static str),

    /// The server answered the announcement with an error.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// No partition registered under the announced identity.
    #[error("partition {0} is not registered")]
    Unregistered(Partition),

    #[error("retry budget exhausted after {attempts} attempts for partition {partition}")]
    RetriesExhausted {
        partition: Partition,
        attempts: usize,
    },

    /// The transport context was shut down; translated by handlers into a
    /// normal drain, never into a failure.
    #[error("terminated")]
    Terminated,

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl NetError {
    pub fn is_terminated(&self) -> bool {
        matches!(self, NetError::Terminated | NetError::Core(CoreError::Terminated))
    }
}
