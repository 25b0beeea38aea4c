//! Windowed stream joins.
//!
//! Both sides accumulate their tuples into per-window slice stores; when
//! the minimum watermark over every contributing origin strictly exceeds a
//! window's end, that window's slices are taken out of the store under the
//! state lock and probed by exactly one thread. Taking the slices is what
//! makes triggering idempotent and what stands in for the per-window probe
//! lock: no other worker can reach a window that is no longer stored.
//!
//! The nested-loop variant keeps an append-only vector per side and walks
//! the cross product on trigger; the hash-partitioned variant splits each
//! window into `P` partitions of key-indexed tables probed independently.
//!
//! Output schema is `(window_start, window_end, key, left.*, right.*)`.
//! Emission order inside a window is unspecified but deterministic for a
//! fixed input interleaving. Joins do not deduplicate replayed tuples.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use tracing::trace;

use dse_core::types::{Schema, Value};
use dse_core::{CoreError, CoreResult, OriginId, RowsBuilder, TerminationType, TupleBuffer};
use dse_plan::{JoinDescriptor, JoinStrategy};

use crate::kernels::{row_timestamp, KernelContext, KeyValue, OperatorKernel, OutputStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    Left,
    Right,
}

/// Tuples of one window, one side.
enum SliceStore {
    /// append-only vectors, probed as a cross product
    Vectors(Vec<(KeyValue, Vec<Value>)>),
    /// key-indexed tables per hash partition
    Partitioned(Vec<HashMap<KeyValue, Vec<Vec<Value>>>>),
}

impl SliceStore {
    fn new(strategy: &JoinStrategy) -> SliceStore {
        match strategy {
            JoinStrategy::NestedLoop => SliceStore::Vectors(Vec::new()),
            JoinStrategy::HashPartitioned { partitions } => {
                SliceStore::Partitioned(vec![HashMap::new(); (*partitions).max(1)])
            }
        }
    }

    fn insert(&mut self, key: KeyValue, row: Vec<Value>) {
        match self {
            SliceStore::Vectors(rows) => rows.push((key, row)),
            SliceStore::Partitioned(parts) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                let p = (hasher.finish() as usize) % parts.len();
                parts[p].entry(key).or_default().push(row);
            }
        }
    }
}

struct WindowPair {
    left: SliceStore,
    right: SliceStore,
}

struct JoinStateInner {
    windows: BTreeMap<(u64, u64), WindowPair>,
    watermarks: HashMap<OriginId, u64>,
    /// Build sides still streaming; the joint flush runs when the last
    /// side closes.
    open_sides: usize,
}

/// State shared by both build kernels of one join.
pub struct JoinState {
    desc: JoinDescriptor,
    left_schema: Schema,
    right_schema: Schema,
    out_schema: Schema,
    left_key: usize,
    right_key: usize,
    expected_origins: HashSet<OriginId>,
    output: OutputStream,
    inner: Mutex<JoinStateInner>,
}

impl JoinState {
    pub fn new(
        desc: JoinDescriptor,
        left_schema: Schema,
        right_schema: Schema,
        out_schema: Schema,
        expected_origins: HashSet<OriginId>,
        output: OutputStream,
    ) -> CoreResult<JoinState> {
        let left_key = left_schema.field_index(&desc.left_key).ok_or_else(|| {
            CoreError::Validation(format!("join key missing: {}", desc.left_key))
        })?;
        let right_key = right_schema.field_index(&desc.right_key).ok_or_else(|| {
            CoreError::Validation(format!("join key missing: {}", desc.right_key))
        })?;
        let time_field = desc
            .time
            .field()
            .ok_or_else(|| CoreError::Validation("joins require event time".into()))?;
        for (schema, side) in [(&left_schema, "left"), (&right_schema, "right")] {
            if !schema.has_field(time_field) {
                return Err(CoreError::Validation(format!(
                    "event time field missing on {side}: {time_field}"
                )));
            }
        }
        Ok(JoinState {
            desc,
            left_schema,
            right_schema,
            out_schema,
            left_key,
            right_key,
            expected_origins,
            output,
            inner: Mutex::new(JoinStateInner {
                windows: BTreeMap::new(),
                watermarks: HashMap::new(),
                open_sides: 2,
            }),
        })
    }

    fn min_watermark(&self, inner: &JoinStateInner) -> u64 {
        self.expected_origins
            .iter()
            .map(|o| inner.watermarks.get(o).copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    /// Ingest one buffer for `side`, then probe every window the new
    /// minimum watermark ripened.
    fn ingest(
        &self,
        side: JoinSide,
        buffer: &TupleBuffer,
        ctx: &KernelContext,
    ) -> CoreResult<Vec<TupleBuffer>> {
        let (schema, key_idx) = match side {
            JoinSide::Left => (&self.left_schema, self.left_key),
            JoinSide::Right => (&self.right_schema, self.right_key),
        };
        let mut inner = self.inner.lock();
        for row in dse_core::rows(buffer, schema) {
            let ts = row_timestamp(&self.desc.time, &row, schema, buffer)?;
            let key = KeyValue::of(&row.get(key_idx)?);
            if key == KeyValue::Null {
                continue;
            }
            let values = row.values()?;
            for window in self.desc.window.windows_for(ts) {
                let pair = inner.windows.entry(window).or_insert_with(|| WindowPair {
                    left: SliceStore::new(&self.desc.strategy),
                    right: SliceStore::new(&self.desc.strategy),
                });
                match side {
                    JoinSide::Left => pair.left.insert(key.clone(), values.clone()),
                    JoinSide::Right => pair.right.insert(key.clone(), values.clone()),
                }
            }
        }
        let entry = inner.watermarks.entry(buffer.origin()).or_insert(0);
        *entry = (*entry).max(buffer.watermark());
        let min_wm = self.min_watermark(&inner);
        let ripe = Self::take_ripe(&mut inner, min_wm);
        drop(inner);
        self.probe_all(ripe, min_wm, ctx)
    }

    fn take_ripe(
        inner: &mut JoinStateInner,
        up_to_exclusive: u64,
    ) -> Vec<((u64, u64), WindowPair)> {
        let ripe: Vec<(u64, u64)> = inner
            .windows
            .keys()
            .filter(|(_, end)| *end < up_to_exclusive)
            .copied()
            .collect();
        ripe.into_iter()
            .map(|w| {
                let pair = inner.windows.remove(&w).expect("ripe window present");
                (w, pair)
            })
            .collect()
    }

    fn probe_all(
        &self,
        ripe: Vec<((u64, u64), WindowPair)>,
        watermark: u64,
        ctx: &KernelContext,
    ) -> CoreResult<Vec<TupleBuffer>> {
        let mut matches: Vec<Vec<Value>> = Vec::new();
        for ((start, end), pair) in ripe {
            let before = matches.len();
            match (pair.left, pair.right) {
                (SliceStore::Vectors(left), SliceStore::Vectors(right)) => {
                    for (lk, lrow) in &left {
                        for (rk, rrow) in &right {
                            if lk == rk {
                                matches.push(self.joined_row(start, end, lk, lrow, rrow));
                            }
                        }
                    }
                }
                (SliceStore::Partitioned(left), SliceStore::Partitioned(right)) => {
                    for (lpart, rpart) in left.into_iter().zip(right) {
                        for (key, lrows) in lpart {
                            if let Some(rrows) = rpart.get(&key) {
                                for lrow in &lrows {
                                    for rrow in rrows {
                                        matches.push(
                                            self.joined_row(start, end, &key, lrow, rrow),
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
                _ => {
                    return Err(CoreError::RuntimeSystem(
                        "join sides disagree on slice layout".into(),
                    ))
                }
            }
            trace!(start, end, pairs = matches.len() - before, "join window fired");
        }
        if matches.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = RowsBuilder::new(
            ctx.buffers
                .try_acquire_or_grow(self.out_schema.tuple_size() * matches.len())?,
            self.out_schema.clone(),
        );
        self.output.stamp(out.builder_mut(), watermark);
        for row in matches {
            out.push_row(&row)?;
        }
        let sealed = out.finish();
        sealed.set_sequence_number(self.output.next_sequence());
        Ok(vec![sealed])
    }

    fn joined_row(
        &self,
        start: u64,
        end: u64,
        key: &KeyValue,
        left: &[Value],
        right: &[Value],
    ) -> Vec<Value> {
        let mut row = Vec::with_capacity(3 + left.len() + right.len());
        row.push(Value::UInt64(start));
        row.push(Value::UInt64(end));
        row.push(key.to_value());
        row.extend_from_slice(left);
        row.extend_from_slice(right);
        row
    }

    fn flush(
        &self,
        termination: TerminationType,
        ctx: &KernelContext,
    ) -> CoreResult<Vec<TupleBuffer>> {
        let mut inner = self.inner.lock();
        inner.open_sides = inner.open_sides.saturating_sub(1);
        if inner.open_sides > 0 && termination == TerminationType::Graceful {
            // the other side may still add matches; drain on its flush
            return Ok(Vec::new());
        }
        match termination {
            TerminationType::Graceful => {
                let max_wm = inner.watermarks.values().copied().max().unwrap_or(0);
                let ripe = Self::take_ripe(&mut inner, max_wm.saturating_add(1));
                inner.windows.clear();
                drop(inner);
                self.probe_all(ripe, max_wm, ctx)
            }
            TerminationType::HardStop | TerminationType::Failure => {
                // release live slice stores without emitting partial windows
                inner.windows.clear();
                Ok(Vec::new())
            }
        }
    }
}

/// One side's build kernel; the probe runs inside whichever build call
/// ripens a window.
pub struct JoinBuildKernel {
    side: JoinSide,
    state: std::sync::Arc<JoinState>,
}

impl JoinBuildKernel {
    pub fn new(side: JoinSide, state: std::sync::Arc<JoinState>) -> Self {
        Self { side, state }
    }
}

impl OperatorKernel for JoinBuildKernel {
    fn name(&self) -> &'static str {
        match self.side {
            JoinSide::Left => "join_build_left",
            JoinSide::Right => "join_build_right",
        }
    }

    fn execute(&self, buffer: &TupleBuffer, ctx: &KernelContext) -> CoreResult<Vec<TupleBuffer>> {
        self.state.ingest(self.side, buffer, ctx)
    }

    fn flush(
        &self,
        termination: TerminationType,
        ctx: &KernelContext,
    ) -> CoreResult<Vec<TupleBuffer>> {
        self.state.flush(termination, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::types::{DataType, Field};
    use dse_core::BufferManager;
    use dse_plan::{TimeCharacteristic, WindowType};
    use std::sync::Arc;

    fn side_schema(src: &str) -> Schema {
        Schema::new(vec![
            Field::new(format!("{src}$k"), DataType::Int64),
            Field::new(format!("{src}$ts"), DataType::UInt64),
        ])
    }

    fn out_schema() -> Schema {
        Schema::new(vec![
            Field::new("start", DataType::UInt64),
            Field::new("end", DataType::UInt64),
            Field::new("key", DataType::Int64),
            Field::new("a$k", DataType::Int64),
            Field::new("a$ts", DataType::UInt64),
            Field::new("b$k", DataType::Int64),
            Field::new("b$ts", DataType::UInt64),
        ])
    }

    fn state(strategy: JoinStrategy) -> Arc<JoinState> {
        Arc::new(
            JoinState::new(
                JoinDescriptor {
                    left_key: "a$k".into(),
                    right_key: "b$k".into(),
                    window: WindowType::Tumbling { size_ms: 1000 },
                    time: TimeCharacteristic::EventTime { field: "ts".into() },
                    strategy,
                },
                side_schema("a"),
                side_schema("b"),
                out_schema(),
                [OriginId::new(1), OriginId::new(2)].into_iter().collect(),
                OutputStream::new(OriginId::new(50)),
            )
            .unwrap(),
        )
    }

    fn push(
        kernel: &JoinBuildKernel,
        ctx: &KernelContext,
        mgr: &BufferManager,
        schema: &Schema,
        origin: u64,
        watermark: u64,
        rows: &[(i64, u64)],
    ) -> Vec<TupleBuffer> {
        let mut rb = RowsBuilder::new(mgr.try_acquire().unwrap(), schema.clone());
        rb.builder_mut().set_origin(OriginId::new(origin));
        rb.builder_mut().set_watermark(watermark);
        for (k, ts) in rows {
            rb.push_row(&[Value::Int64(*k), Value::UInt64(*ts)]).unwrap();
        }
        let buf = rb.finish();
        buf.set_sequence_number(1);
        kernel.execute(&buf, ctx).unwrap()
    }

    fn joined(buffers: &[TupleBuffer]) -> Vec<Vec<Value>> {
        let schema = out_schema();
        buffers
            .iter()
            .flat_map(|b| {
                dse_core::rows(b, &schema)
                    .map(|r| r.values().unwrap())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn run_strategy(strategy: JoinStrategy) -> Vec<Vec<Value>> {
        let st = state(strategy);
        let left = JoinBuildKernel::new(JoinSide::Left, Arc::clone(&st));
        let right = JoinBuildKernel::new(JoinSide::Right, Arc::clone(&st));
        let mgr = BufferManager::new(2048, 16);
        let ctx = KernelContext::new(mgr.clone());

        // window (0, 1000): keys 1 and 2 on the left, keys 1 and 3 on the right
        assert!(push(&left, &ctx, &mgr, &side_schema("a"), 1, 900, &[(1, 100), (2, 200)]).is_empty());
        assert!(push(&right, &ctx, &mgr, &side_schema("b"), 2, 900, &[(1, 300), (3, 400)]).is_empty());

        // advance both watermarks past the window end
        assert!(push(&left, &ctx, &mgr, &side_schema("a"), 1, 1500, &[]).is_empty());
        let out = push(&right, &ctx, &mgr, &side_schema("b"), 2, 1500, &[]);
        joined(&out)
    }

    #[test]
    fn nested_loop_joins_matching_keys_in_window() {
        let rows = run_strategy(JoinStrategy::NestedLoop);
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0],
            vec![
                Value::UInt64(0),
                Value::UInt64(1000),
                Value::Int64(1),
                Value::Int64(1),
                Value::UInt64(100),
                Value::Int64(1),
                Value::UInt64(300),
            ]
        );
    }

    #[test]
    fn hash_partitioned_matches_nested_loop() {
        let nlj = run_strategy(JoinStrategy::NestedLoop);
        let hash = run_strategy(JoinStrategy::HashPartitioned { partitions: 4 });
        assert_eq!(nlj, hash);
    }

    #[test]
    fn window_fires_exactly_once() {
        let st = state(JoinStrategy::NestedLoop);
        let left = JoinBuildKernel::new(JoinSide::Left, Arc::clone(&st));
        let right = JoinBuildKernel::new(JoinSide::Right, Arc::clone(&st));
        let mgr = BufferManager::new(2048, 16);
        let ctx = KernelContext::new(mgr.clone());

        push(&left, &ctx, &mgr, &side_schema("a"), 1, 2000, &[(1, 100)]);
        push(&right, &ctx, &mgr, &side_schema("b"), 2, 2000, &[(1, 200)]);
        // the second ingest above already fired (0, 1000); advancing again
        // must not emit it a second time
        let out = push(&left, &ctx, &mgr, &side_schema("a"), 1, 3000, &[]);
        let again = push(&right, &ctx, &mgr, &side_schema("b"), 2, 3500, &[]);
        let total = joined(&out).len() + joined(&again).len();
        assert_eq!(total, 0);
    }

    #[test]
    fn replayed_tuples_both_participate() {
        let st = state(JoinStrategy::NestedLoop);
        let left = JoinBuildKernel::new(JoinSide::Left, Arc::clone(&st));
        let right = JoinBuildKernel::new(JoinSide::Right, Arc::clone(&st));
        let mgr = BufferManager::new(2048, 16);
        let ctx = KernelContext::new(mgr.clone());

        // the same left tuple twice: joins are not deduplicating
        push(&left, &ctx, &mgr, &side_schema("a"), 1, 900, &[(1, 100), (1, 100)]);
        push(&right, &ctx, &mgr, &side_schema("b"), 2, 900, &[(1, 300)]);
        push(&left, &ctx, &mgr, &side_schema("a"), 1, 1500, &[]);
        let out = push(&right, &ctx, &mgr, &side_schema("b"), 2, 1500, &[]);
        assert_eq!(joined(&out).len(), 2);
    }

    #[test]
    fn failure_flush_emits_nothing() {
        let st = state(JoinStrategy::NestedLoop);
        let left = JoinBuildKernel::new(JoinSide::Left, Arc::clone(&st));
        let right = JoinBuildKernel::new(JoinSide::Right, Arc::clone(&st));
        let mgr = BufferManager::new(2048, 16);
        let ctx = KernelContext::new(mgr.clone());

        push(&left, &ctx, &mgr, &side_schema("a"), 1, 900, &[(1, 100)]);
        push(&right, &ctx, &mgr, &side_schema("b"), 2, 900, &[(1, 200)]);
        assert!(left.flush(TerminationType::Failure, &ctx).unwrap().is_empty());
        assert!(right.flush(TerminationType::Failure, &ctx).unwrap().is_empty());
    }

    #[test]
    fn graceful_flush_fires_covered_windows() {
        let st = state(JoinStrategy::NestedLoop);
        let left = JoinBuildKernel::new(JoinSide::Left, Arc::clone(&st));
        let right = JoinBuildKernel::new(JoinSide::Right, Arc::clone(&st));
        let mgr = BufferManager::new(2048, 16);
        let ctx = KernelContext::new(mgr.clone());

        push(&left, &ctx, &mgr, &side_schema("a"), 1, 1000, &[(1, 100)]);
        push(&right, &ctx, &mgr, &side_schema("b"), 2, 1000, &[(1, 200)]);
        // the first side to close must not fire: the other side could
        // still contribute matches
        assert!(left.flush(TerminationType::Graceful, &ctx).unwrap().is_empty());
        // watermark 1000 covers window end 1000 (end <= wm): the joint
        // drain happens on the last side's flush
        let out = right.flush(TerminationType::Graceful, &ctx).unwrap();
        assert_eq!(joined(&out).len(), 1);
    }
}
