//! Sender side of a network edge.
//!
//! A network sink opens one channel per partition: connect, announce the
//! partition, wait for `ServerReady`. The receiver may not have registered
//! yet when the sender comes up (deployment starts workers in topological
//! order but registration is concurrent), so the handshake retries with
//! exponential backoff and jitter until the retry budget runs out.
//!
//! Buffers are framed onto the TCP stream in submission order; closing the
//! channel writes the end-of-stream marker and flushes before the socket
//! shuts down, which is what makes the graceful-close delivery guarantee
//! hold.

use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dse_core::{Partition, TerminationType, TupleBuffer};

use crate::error::{NetError, NetResult};
use crate::wire::{read_frame, write_frame, DataFrame, EventKind, WireMessage};

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub retry_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 10,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// An established, announced channel to one remote partition.
#[derive(Debug)]
pub struct NetworkChannel {
    stream: TcpStream,
    partition: Partition,
}

impl NetworkChannel {
    /// Connect and announce, retrying with backoff until the server is
    /// ready or the budget is spent.
    pub async fn connect(
        addr: &str,
        partition: Partition,
        config: &ChannelConfig,
        cancel: &CancellationToken,
    ) -> NetResult<NetworkChannel> {
        let mut backoff = config.initial_backoff;
        for attempt in 1..=config.retry_attempts {
            if cancel.is_cancelled() {
                return Err(NetError::Terminated);
            }
            match Self::try_connect(addr, partition).await {
                Ok(channel) => {
                    debug!(%partition, %addr, attempt, "channel established");
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(%partition, %addr, attempt, error = %e, "handshake attempt failed");
                }
            }
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
            tokio::select! {
                _ = cancel.cancelled() => return Err(NetError::Terminated),
                _ = tokio::time::sleep(backoff + Duration::from_millis(jitter)) => {}
            }
            backoff = (backoff * 2).min(config.max_backoff);
        }
        Err(NetError::RetriesExhausted {
            partition,
            attempts: config.retry_attempts,
        })
    }

    async fn try_connect(addr: &str, partition: Partition) -> NetResult<NetworkChannel> {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, &WireMessage::Announce(partition)).await?;
        match read_frame(&mut stream).await? {
            Some(WireMessage::ServerReady) => Ok(NetworkChannel { stream, partition }),
            Some(WireMessage::Error(msg)) => Err(NetError::HandshakeRejected(msg)),
            Some(other) => Err(NetError::HandshakeRejected(format!(
                "unexpected reply: {other:?}"
            ))),
            None => Err(NetError::HandshakeRejected("connection closed".into())),
        }
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    /// Frame and send one buffer; per-partition ordering is the TCP order.
    pub async fn send_buffer(&mut self, buffer: &TupleBuffer) -> NetResult<()> {
        write_frame(
            &mut self.stream,
            &WireMessage::Data(DataFrame::from_buffer(buffer)),
        )
        .await
    }

    pub async fn send_event(&mut self, event: EventKind) -> NetResult<()> {
        write_frame(&mut self.stream, &WireMessage::Event(event)).await
    }

    /// Send end-of-stream and flush everything before the socket closes.
    pub async fn close(mut self, termination: TerminationType) -> NetResult<()> {
        write_frame(&mut self.stream, &WireMessage::EndOfStream(termination)).await?;
        self.stream.flush().await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
