//! Partition registry: the demultiplexing table of the transport.
//!
//! Network sources register their partition with a bounded channel before
//! the upstream sender announces it; the handshake succeeds only for a
//! registered partition. A bounded destination channel is what carries
//! receive backpressure up the TCP connection.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use dse_core::{Partition, TerminationType, TupleBuffer};

use crate::error::{NetError, NetResult};
use crate::wire::EventKind;

/// What a registered network source receives from its channel.
#[derive(Debug)]
pub enum ChannelEvent {
    Data(TupleBuffer),
    Event(EventKind),
    EndOfStream(TerminationType),
}

#[derive(Clone, Default)]
pub struct PartitionRegistry {
    inner: Arc<DashMap<Partition, mpsc::Sender<ChannelEvent>>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a partition and hand back the consuming end.
    pub fn register(&self, partition: Partition, capacity: usize) -> mpsc::Receiver<ChannelEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.inner.insert(partition, tx);
        rx
    }

    pub fn unregister(&self, partition: &Partition) {
        self.inner.remove(partition);
    }

    pub fn is_registered(&self, partition: &Partition) -> bool {
        self.inner.contains_key(partition)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Deliver an event to the partition's consumer, waiting on a full
    /// destination queue.
    pub async fn dispatch(&self, partition: &Partition, event: ChannelEvent) -> NetResult<()> {
        let sender = self
            .inner
            .get(partition)
            .map(|e| e.value().clone())
            .ok_or(NetError::Unregistered(*partition))?;
        sender
            .send(event)
            .await
            .map_err(|_| NetError::Unregistered(*partition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::{OperatorId, PartitionId, SubPlanId};

    fn partition(n: u64) -> Partition {
        Partition::new(SubPlanId::new(n), OperatorId::new(1), PartitionId::new(0))
    }

    #[tokio::test]
    async fn dispatch_reaches_registered_consumer() {
        let registry = PartitionRegistry::new();
        let mut rx = registry.register(partition(1), 4);
        registry
            .dispatch(&partition(1), ChannelEvent::Event(EventKind::SourceStart))
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ChannelEvent::Event(EventKind::SourceStart))
        ));
    }

    #[tokio::test]
    async fn unregistered_partition_is_an_error() {
        let registry = PartitionRegistry::new();
        let err = registry
            .dispatch(&partition(9), ChannelEvent::Event(EventKind::SourceStart))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Unregistered(_)));
    }

    #[tokio::test]
    async fn unregister_closes_the_route() {
        let registry = PartitionRegistry::new();
        let _rx = registry.register(partition(1), 4);
        assert!(registry.is_registered(&partition(1)));
        registry.unregister(&partition(1));
        assert!(!registry.is_registered(&partition(1)));
    }
}
