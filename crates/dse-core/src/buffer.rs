//! Pooled tuple buffers.
//!
//! The buffer manager owns a fixed pool of equally sized memory segments.
//! A segment is checked out exclusively as a [`BufferBuilder`], filled by
//! its creator, then sealed into an immutable, reference-counted
//! [`TupleBuffer`] that can be cloned freely across pipelines and the
//! network layer. When the last reference drops, the segment returns to the
//! pool and a waiting `acquire` call is released.
//!
//! Buffer contents are opaque bytes to everything below the kernel layer.
//! The header travels with the buffer: origin id, sequence number,
//! watermark, creation timestamp and tuple count. Sequence number is
//! written exactly once after sealing (by the emitting operator); the
//! watermark can only move forward. Variable-length payloads live in child
//! buffers addressed by stable indexes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{CoreError, CoreResult};
use crate::ids::OriginId;

/// Milliseconds since the Unix epoch, used for buffer creation stamps.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct SegmentPool {
    free: Mutex<Vec<BytesMut>>,
    available: Semaphore,
    segment_size: usize,
}

impl SegmentPool {
    fn release(&self, mut segment: BytesMut) {
        segment.clear();
        if segment.capacity() < self.segment_size {
            segment = BytesMut::with_capacity(self.segment_size);
        }
        self.free.lock().push(segment);
        self.available.add_permits(1);
    }
}

struct UnpooledBudget {
    used: AtomicUsize,
    limit: usize,
}

/// Hands out pooled fixed-size buffers and bounded unpooled overflow buffers.
#[derive(Clone)]
pub struct BufferManager {
    pool: Arc<SegmentPool>,
    unpooled: Arc<UnpooledBudget>,
}

impl BufferManager {
    /// Pool of `pool_size` segments of `segment_size` bytes each. Unpooled
    /// allocations are capped at four times the pooled memory.
    pub fn new(segment_size: usize, pool_size: usize) -> Self {
        let free = (0..pool_size)
            .map(|_| BytesMut::with_capacity(segment_size))
            .collect();
        Self {
            pool: Arc::new(SegmentPool {
                free: Mutex::new(free),
                available: Semaphore::new(pool_size),
                segment_size,
            }),
            unpooled: Arc::new(UnpooledBudget {
                used: AtomicUsize::new(0),
                limit: segment_size * pool_size * 4,
            }),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.pool.segment_size
    }

    /// Number of segments currently available without blocking.
    pub fn available(&self) -> usize {
        self.pool.available.available_permits()
    }

    /// Check out a pooled segment, waiting while the pool is exhausted.
    pub async fn acquire(&self) -> CoreResult<BufferBuilder> {
        let permit = self
            .pool
            .available
            .acquire()
            .await
            .map_err(|_| CoreError::Terminated)?;
        permit.forget();
        let segment = self
            .pool
            .free
            .lock()
            .pop()
            .expect("semaphore permit implies a free segment");
        Ok(BufferBuilder::pooled(segment, Arc::clone(&self.pool)))
    }

    /// Non-blocking acquire; `None` is the backpressure signal.
    pub fn try_acquire(&self) -> Option<BufferBuilder> {
        let permit = self.pool.available.try_acquire().ok()?;
        permit.forget();
        let segment = self
            .pool
            .free
            .lock()
            .pop()
            .expect("semaphore permit implies a free segment");
        Some(BufferBuilder::pooled(segment, Arc::clone(&self.pool)))
    }

    /// Non-blocking acquire for operator kernels: a pooled segment when one
    /// is free and large enough, otherwise an unpooled buffer of at least
    /// `min_bytes`. Never waits; kernels must not block the worker.
    pub fn try_acquire_or_grow(&self, min_bytes: usize) -> CoreResult<BufferBuilder> {
        if min_bytes <= self.segment_size() {
            if let Some(builder) = self.try_acquire() {
                return Ok(builder);
            }
        }
        self.acquire_unpooled(min_bytes.max(self.segment_size()))
    }

    /// Allocate an unpooled buffer of `n` bytes outside the segment pool.
    pub fn acquire_unpooled(&self, n: usize) -> CoreResult<BufferBuilder> {
        let prev = self.unpooled.used.fetch_add(n, Ordering::SeqCst);
        if prev + n > self.unpooled.limit {
            self.unpooled.used.fetch_sub(n, Ordering::SeqCst);
            return Err(CoreError::OutOfMemory(format!(
                "unpooled allocation of {n} bytes exceeds budget"
            )));
        }
        Ok(BufferBuilder::unpooled(
            BytesMut::with_capacity(n),
            n,
            Arc::clone(&self.unpooled),
        ))
    }
}

enum Backing {
    Pooled(Arc<SegmentPool>),
    Unpooled { budget: Arc<UnpooledBudget>, bytes: usize },
}

/// Exclusive write handle for a buffer under construction.
pub struct BufferBuilder {
    data: Option<BytesMut>,
    backing: Option<Backing>,
    origin: OriginId,
    creation_ts: u64,
    watermark: u64,
    children: Vec<Bytes>,
}

impl BufferBuilder {
    fn pooled(segment: BytesMut, pool: Arc<SegmentPool>) -> Self {
        Self {
            data: Some(segment),
            backing: Some(Backing::Pooled(pool)),
            origin: OriginId::INVALID,
            creation_ts: now_millis(),
            watermark: 0,
            children: Vec::new(),
        }
    }

    fn unpooled(data: BytesMut, bytes: usize, budget: Arc<UnpooledBudget>) -> Self {
        Self {
            data: Some(data),
            backing: Some(Backing::Unpooled { budget, bytes }),
            origin: OriginId::INVALID,
            creation_ts: now_millis(),
            watermark: 0,
            children: Vec::new(),
        }
    }

    pub fn set_origin(&mut self, origin: OriginId) {
        self.origin = origin;
    }

    pub fn set_creation_ts(&mut self, ts: u64) {
        self.creation_ts = ts;
    }

    pub fn set_watermark(&mut self, wm: u64) {
        self.watermark = wm;
    }

    /// Remaining writable capacity in bytes.
    pub fn remaining(&self) -> usize {
        let data = self.data.as_ref().expect("builder not sealed");
        data.capacity() - data.len()
    }

    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        self.data.as_mut().expect("builder not sealed")
    }

    /// Attach a variable-length payload; the returned index is stable for
    /// the lifetime of the buffer.
    pub fn attach_child(&mut self, payload: Bytes) -> u32 {
        self.children.push(payload);
        (self.children.len() - 1) as u32
    }

    /// Freeze the buffer. The tuple count is fixed here and never rewritten.
    pub fn seal(mut self, tuple_count: u32) -> TupleBuffer {
        let data = self.data.take().expect("builder not sealed");
        let backing = self.backing.take();
        TupleBuffer {
            inner: Arc::new(BufferInner {
                data: data.freeze(),
                backing,
                origin: self.origin,
                creation_ts: self.creation_ts,
                tuple_count,
                sequence: AtomicU64::new(0),
                watermark: AtomicU64::new(self.watermark),
                children: std::mem::take(&mut self.children),
            }),
        }
    }
}

impl Drop for BufferBuilder {
    fn drop(&mut self) {
        // A builder abandoned before seal() still returns its memory.
        if let Some(data) = self.data.take() {
            match self.backing.take() {
                Some(Backing::Pooled(pool)) => pool.release(data),
                Some(Backing::Unpooled { budget, bytes }) => {
                    budget.used.fetch_sub(bytes, Ordering::SeqCst);
                }
                None => {}
            }
        }
    }
}

struct BufferInner {
    data: Bytes,
    backing: Option<Backing>,
    origin: OriginId,
    creation_ts: u64,
    tuple_count: u32,
    sequence: AtomicU64,
    watermark: AtomicU64,
    children: Vec<Bytes>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        match &self.backing {
            Some(Backing::Pooled(pool)) => {
                // At refcount zero we hold the only handle, so the segment
                // converts back in place; the fallback covers a payload that
                // was sliced and leaked a second handle.
                let segment = data
                    .try_into_mut()
                    .unwrap_or_else(|_| BytesMut::with_capacity(pool.segment_size));
                pool.release(segment);
            }
            Some(Backing::Unpooled { budget, bytes }) => {
                budget.used.fetch_sub(*bytes, Ordering::SeqCst);
            }
            None => {}
        }
    }
}

/// An immutable, reference-counted tuple buffer.
#[derive(Clone)]
pub struct TupleBuffer {
    inner: Arc<BufferInner>,
}

impl TupleBuffer {
    /// Read access to the payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    /// Cheap handle to the payload, used by the network sender.
    pub fn data_bytes(&self) -> Bytes {
        self.inner.data.clone()
    }

    pub fn payload_len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn origin(&self) -> OriginId {
        self.inner.origin
    }

    pub fn creation_ts(&self) -> u64 {
        self.inner.creation_ts
    }

    pub fn tuple_count(&self) -> u32 {
        self.inner.tuple_count
    }

    pub fn sequence_number(&self) -> u64 {
        self.inner.sequence.load(Ordering::Acquire)
    }

    /// Stamp the sequence number. Exactly one writer may do this; a second
    /// attempt is an invariant violation and is ignored with a debug check.
    pub fn set_sequence_number(&self, seq: u64) {
        let prev = self
            .inner
            .sequence
            .compare_exchange(0, seq, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(prev.is_ok(), "sequence number written twice");
    }

    pub fn watermark(&self) -> u64 {
        self.inner.watermark.load(Ordering::Acquire)
    }

    /// Advance the watermark; a lower value never regresses it.
    pub fn advance_watermark(&self, wm: u64) {
        self.inner.watermark.fetch_max(wm, Ordering::AcqRel);
    }

    pub fn child_count(&self) -> u32 {
        self.inner.children.len() as u32
    }

    pub fn child_at(&self, index: u32) -> Option<&Bytes> {
        self.inner.children.get(index as usize)
    }

    pub fn children(&self) -> &[Bytes] {
        &self.inner.children
    }
}

impl std::fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("origin", &self.inner.origin)
            .field("sequence", &self.sequence_number())
            .field("watermark", &self.watermark())
            .field("tuples", &self.inner.tuple_count)
            .field("children", &self.inner.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_recycles_on_last_drop() {
        let mgr = BufferManager::new(128, 2);
        assert_eq!(mgr.available(), 2);

        let a = mgr.acquire().await.unwrap().seal(0);
        let b = mgr.acquire().await.unwrap().seal(0);
        assert_eq!(mgr.available(), 0);
        assert!(mgr.try_acquire().is_none());

        let a2 = a.clone();
        drop(a);
        // still one live reference
        assert_eq!(mgr.available(), 0);
        drop(a2);
        assert_eq!(mgr.available(), 1);
        drop(b);
        assert_eq!(mgr.available(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let mgr = BufferManager::new(64, 1);
        let held = mgr.acquire().await.unwrap().seal(0);

        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move { mgr2.acquire().await.map(|b| b.seal(0)) });
        tokio::task::yield_now().await;
        drop(held);
        let got = waiter.await.unwrap();
        assert!(got.is_ok());
    }

    #[test]
    fn abandoned_builder_returns_segment() {
        let mgr = BufferManager::new(64, 1);
        let builder = mgr.try_acquire().unwrap();
        drop(builder);
        assert_eq!(mgr.available(), 1);
    }

    #[test]
    fn unpooled_budget_is_enforced() {
        let mgr = BufferManager::new(16, 1);
        // budget is 4 * 16 = 64 bytes
        let a = mgr.acquire_unpooled(48).unwrap();
        assert!(matches!(
            mgr.acquire_unpooled(32),
            Err(CoreError::OutOfMemory(_))
        ));
        drop(a);
        assert!(mgr.acquire_unpooled(32).is_ok());
    }

    #[test]
    fn header_write_once_semantics() {
        let mgr = BufferManager::new(64, 1);
        let mut builder = mgr.try_acquire().unwrap();
        builder.set_origin(OriginId::new(9));
        let buf = builder.seal(3);

        buf.set_sequence_number(5);
        assert_eq!(buf.sequence_number(), 5);

        buf.advance_watermark(100);
        buf.advance_watermark(50);
        assert_eq!(buf.watermark(), 100);
        assert_eq!(buf.origin(), OriginId::new(9));
        assert_eq!(buf.tuple_count(), 3);
    }

    #[test]
    fn child_indexes_are_stable() {
        let mgr = BufferManager::new(64, 1);
        let mut builder = mgr.try_acquire().unwrap();
        let i0 = builder.attach_child(Bytes::from_static(b"alpha"));
        let i1 = builder.attach_child(Bytes::from_static(b"beta"));
        assert_eq!((i0, i1), (0, 1));
        let buf = builder.seal(1);
        assert_eq!(buf.child_at(0).unwrap().as_ref(), b"alpha");
        assert_eq!(buf.child_at(1).unwrap().as_ref(), b"beta");
        assert!(buf.child_at(2).is_none());
    }
}
