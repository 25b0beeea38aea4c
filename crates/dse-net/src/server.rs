//! The exchange transport server.
//!
//! One router task accepts connections and spawns a reader per connection;
//! readers perform the announce/ready handshake inline and feed decoded
//! data and control frames into a shared queue consumed by at least two
//! handler tasks. Handlers copy payloads into pooled buffers and dispatch
//! them to the registered partition, so pool pressure and full destination
//! queues throttle the TCP readers naturally.
//!
//! `start` returns only after the router and every handler passed the
//! startup barrier. `shutdown` cancels the context: readers observe the
//! cancellation as a `Terminated` receive and close, handlers drain the
//! queue and exit, and `wait_terminated` joins everything before the port
//! is considered released.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Barrier;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dse_core::{BufferManager, Partition};

use crate::error::{NetError, NetResult};
use crate::registry::{ChannelEvent, PartitionRegistry};
use crate::wire::{read_frame, write_frame, DataFrame, WireMessage};

/// A decoded frame bound to the partition its connection announced.
struct Routed {
    partition: Partition,
    message: WireMessage,
}

pub struct NetworkTransport {
    local_addr: SocketAddr,
    registry: PartitionRegistry,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkTransport {
    /// Bind and start the transport; returns once router and handlers are
    /// ready. `handler_count` is clamped to at least two.
    pub async fn start(
        bind_addr: &str,
        handler_count: usize,
        buffers: BufferManager,
        registry: PartitionRegistry,
        cancel: CancellationToken,
    ) -> NetResult<NetworkTransport> {
        let handler_count = handler_count.max(2);
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let (queue_tx, queue_rx) = async_channel::bounded::<Routed>(handler_count * 64);

        // router + handlers + this call
        let barrier = Arc::new(Barrier::new(handler_count + 2));
        let mut tasks = Vec::new();

        for handler_id in 0..handler_count {
            let rx = queue_rx.clone();
            let registry = registry.clone();
            let buffers = buffers.clone();
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                handler_loop(handler_id, rx, registry, buffers).await;
            }));
        }

        {
            let registry = registry.clone();
            let cancel = cancel.clone();
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                router_loop(listener, registry, queue_tx, cancel).await;
            }));
        }

        barrier.wait().await;
        info!(%local_addr, handlers = handler_count, "exchange transport started");
        Ok(NetworkTransport {
            local_addr,
            registry,
            cancel,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &PartitionRegistry {
        &self.registry
    }

    /// Signal shutdown; receives in flight surface as `Terminated` and the
    /// remaining connections drain.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Join router and handlers. After this returns the port is released.
    pub async fn wait_terminated(mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("exchange transport terminated");
    }
}

async fn router_loop(
    listener: TcpListener,
    registry: PartitionRegistry,
    queue: async_channel::Sender<Routed>,
    cancel: CancellationToken,
) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let registry = registry.clone();
                        let queue = queue.clone();
                        let cancel = cancel.clone();
                        connections.push(tokio::spawn(async move {
                            if let Err(e) = connection_loop(stream, registry, queue, cancel).await {
                                if e.is_terminated() {
                                    debug!(%peer, "connection closed by shutdown");
                                } else {
                                    warn!(%peer, error = %e, "connection closed on error");
                                }
                            }
                        }));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
    // the queue sender in each connection keeps handlers alive until the
    // connection drains
    drop(queue);
    for conn in connections {
        let _ = conn.await;
    }
}

/// Per-connection reader: handshake first, then data/control frames.
async fn connection_loop(
    stream: TcpStream,
    registry: PartitionRegistry,
    queue: async_channel::Sender<Routed>,
    cancel: CancellationToken,
) -> NetResult<()> {
    let (mut reader, mut writer) = stream.into_split();

    // handshake: the first frame must announce a registered partition
    let partition = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Err(NetError::Terminated),
            frame = read_frame(&mut reader) => frame?,
        };
        match frame {
            Some(WireMessage::Announce(partition)) => {
                if registry.is_registered(&partition) {
                    write_frame(&mut writer, &WireMessage::ServerReady).await?;
                    break partition;
                }
                // channel torn down, server keeps running
                reject(&mut writer, &partition).await?;
                return Err(NetError::Unregistered(partition));
            }
            Some(other) => {
                write_frame(
                    &mut writer,
                    &WireMessage::Error("expected announcement".into()),
                )
                .await?;
                return Err(NetError::HandshakeRejected(format!(
                    "unexpected first frame: {other:?}"
                )));
            }
            None => return Ok(()),
        }
    };

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Err(NetError::Terminated),
            frame = read_frame(&mut reader) => frame?,
        };
        let Some(message) = frame else {
            return Ok(());
        };
        let is_eos = matches!(message, WireMessage::EndOfStream(_));
        if queue
            .send(Routed {
                partition,
                message,
            })
            .await
            .is_err()
        {
            return Err(NetError::Terminated);
        }
        if is_eos {
            return Ok(());
        }
    }
}

async fn reject(writer: &mut OwnedWriteHalf, partition: &Partition) -> NetResult<()> {
    write_frame(
        writer,
        &WireMessage::Error(format!("partition {partition} is not registered")),
    )
    .await
}

async fn handler_loop(
    handler_id: usize,
    queue: async_channel::Receiver<Routed>,
    registry: PartitionRegistry,
    buffers: BufferManager,
) {
    // recv errors once every sender is gone and the queue is drained
    while let Ok(Routed {
        partition,
        message,
    }) = queue.recv().await
    {
        let result = match message {
            WireMessage::Data(frame) => ingest(&registry, &buffers, &partition, frame).await,
            WireMessage::Event(event) => {
                registry
                    .dispatch(&partition, ChannelEvent::Event(event))
                    .await
            }
            WireMessage::EndOfStream(termination) => {
                debug!(%partition, ?termination, "end of stream");
                registry
                    .dispatch(&partition, ChannelEvent::EndOfStream(termination))
                    .await
            }
            other => {
                warn!(%partition, "unexpected frame after handshake: {other:?}");
                Ok(())
            }
        };
        if let Err(e) = result {
            if e.is_terminated() {
                return;
            }
            warn!(%partition, error = %e, "dispatch failed");
        }
    }
    debug!(handler_id, "handler drained");
}

/// Copy a received frame into a pooled buffer and hand it to the partition.
async fn ingest(
    registry: &PartitionRegistry,
    buffers: &BufferManager,
    partition: &Partition,
    frame: DataFrame,
) -> NetResult<()> {
    let mut builder = if frame.payload.len() <= buffers.segment_size() {
        buffers.acquire().await?
    } else {
        buffers.acquire_unpooled(frame.payload.len())?
    };
    builder.set_origin(frame.origin);
    builder.set_creation_ts(frame.creation_ts);
    builder.set_watermark(frame.watermark);
    builder.bytes_mut().extend_from_slice(&frame.payload);
    for child in frame.children {
        builder.attach_child(child);
    }
    let buffer = builder.seal(frame.tuple_count);
    buffer.set_sequence_number(frame.sequence);
    registry
        .dispatch(partition, ChannelEvent::Data(buffer))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::{OperatorId, PartitionId, SubPlanId, TerminationType};
    use tokio::io::AsyncWriteExt;

    fn partition(n: u64) -> Partition {
        Partition::new(SubPlanId::new(n), OperatorId::new(1), PartitionId::new(0))
    }

    async fn start_transport() -> (NetworkTransport, PartitionRegistry) {
        let registry = PartitionRegistry::new();
        let transport = NetworkTransport::start(
            "127.0.0.1:0",
            2,
            BufferManager::new(4096, 16),
            registry.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (transport, registry)
    }

    #[tokio::test]
    async fn handshake_rejects_unknown_partition() {
        let (transport, _registry) = start_transport().await;
        let mut stream = TcpStream::connect(transport.local_addr()).await.unwrap();
        write_frame(&mut stream, &WireMessage::Announce(partition(42)))
            .await
            .unwrap();
        let reply = read_frame(&mut stream).await.unwrap().unwrap();
        assert!(matches!(reply, WireMessage::Error(_)));

        // server keeps running: a registered partition still handshakes
        let (transport2, registry) = (transport, _registry);
        let _rx = registry.register(partition(1), 4);
        let mut stream2 = TcpStream::connect(transport2.local_addr()).await.unwrap();
        write_frame(&mut stream2, &WireMessage::Announce(partition(1)))
            .await
            .unwrap();
        let reply2 = read_frame(&mut stream2).await.unwrap().unwrap();
        assert!(matches!(reply2, WireMessage::ServerReady));

        transport2.shutdown();
        transport2.wait_terminated().await;
    }

    #[tokio::test]
    async fn corrupt_magic_closes_only_the_offending_connection() {
        let (transport, registry) = start_transport().await;
        let _rx = registry.register(partition(1), 4);

        // healthy connection first
        let mut good = TcpStream::connect(transport.local_addr()).await.unwrap();
        write_frame(&mut good, &WireMessage::Announce(partition(1)))
            .await
            .unwrap();
        assert!(matches!(
            read_frame(&mut good).await.unwrap().unwrap(),
            WireMessage::ServerReady
        ));

        // corrupted frame: valid length, wrong magic
        let mut bad = TcpStream::connect(transport.local_addr()).await.unwrap();
        bad.write_all(&[5, 0, 0, 0, 0xEF, 0xBE, 0xAD, 0xDE, 0]).await.unwrap();
        bad.flush().await.unwrap();
        let closed = read_frame(&mut bad).await.unwrap();
        assert!(closed.is_none(), "corrupt connection should be closed");

        // the healthy connection still works
        write_frame(
            &mut good,
            &WireMessage::EndOfStream(TerminationType::Graceful),
        )
        .await
        .unwrap();

        transport.shutdown();
        transport.wait_terminated().await;
    }

    #[tokio::test]
    async fn shutdown_releases_the_port() {
        let (transport, _registry) = start_transport().await;
        let addr = transport.local_addr();
        transport.shutdown();
        transport.wait_terminated().await;
        // rebinding the same port succeeds once the transport is gone
        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }
}
