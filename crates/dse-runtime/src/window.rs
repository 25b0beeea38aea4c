//! Keyed, windowed aggregation.
//!
//! Tuples are assigned to their windows on ingest and folded directly into
//! per-key aggregate state; a window fires once the minimum watermark over
//! all expected origins strictly exceeds its end, and its state is dropped
//! in the same step, which makes firing idempotent.
//!
//! Output rows are `(start, end, key, aggregate)` for keyed windows and
//! `(start, end, aggregate, key=0)` for unkeyed ones (the shape pattern
//! iteration counts rely on).

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use tracing::trace;

use dse_core::types::{Schema, Value};
use dse_core::{CoreError, CoreResult, OriginId, RowsBuilder, TerminationType, TupleBuffer};
use dse_plan::{AggregationType, TimeCharacteristic, WindowDescriptor, WindowType};

use crate::kernels::{row_timestamp, KernelContext, KeyValue, OperatorKernel, OutputStream};

/// Incremental fold of one aggregation function.
#[derive(Debug, Clone)]
pub enum AggState {
    Sum(f64),
    Count(u64),
    Min(f64),
    Max(f64),
    Avg { sum: f64, count: u64 },
    Median(Vec<f64>),
}

impl AggState {
    pub fn new(aggregation: AggregationType) -> AggState {
        match aggregation {
            AggregationType::Sum => AggState::Sum(0.0),
            AggregationType::Count => AggState::Count(0),
            AggregationType::Min => AggState::Min(f64::INFINITY),
            AggregationType::Max => AggState::Max(f64::NEG_INFINITY),
            AggregationType::Avg => AggState::Avg { sum: 0.0, count: 0 },
            AggregationType::Median => AggState::Median(Vec::new()),
        }
    }

    pub fn update(&mut self, value: f64) {
        match self {
            AggState::Sum(s) => *s += value,
            AggState::Count(c) => *c += 1,
            AggState::Min(m) => *m = m.min(value),
            AggState::Max(m) => *m = m.max(value),
            AggState::Avg { sum, count } => {
                *sum += value;
                *count += 1;
            }
            AggState::Median(values) => values.push(value),
        }
    }

    /// Final value, typed like the inferred output field.
    pub fn finish(&self, output: &Value) -> Value {
        let result = match self {
            AggState::Sum(s) => *s,
            AggState::Count(c) => return Value::UInt64(*c),
            AggState::Min(m) => *m,
            AggState::Max(m) => *m,
            AggState::Avg { sum, count } => {
                if *count == 0 {
                    0.0
                } else {
                    sum / *count as f64
                }
            }
            AggState::Median(values) => {
                let mut sorted = values.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                match sorted.len() {
                    0 => 0.0,
                    n if n % 2 == 1 => sorted[n / 2],
                    n => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
                }
            }
        };
        match output {
            Value::Int32(_) => Value::Int32(result as i32),
            Value::Int64(_) => Value::Int64(result as i64),
            Value::UInt64(_) => Value::UInt64(result as u64),
            _ => Value::Float64(result),
        }
    }
}

struct WindowState {
    /// window -> key -> running aggregate
    slices: BTreeMap<(u64, u64), HashMap<KeyValue, AggState>>,
    /// last watermark per origin; a window fires only once every expected
    /// origin has pushed past its end
    watermarks: HashMap<OriginId, u64>,
    /// threshold windows: an open run per key
    runs: HashMap<KeyValue, (u64, u64, AggState, u64)>,
}

pub struct WindowAggKernel {
    desc: WindowDescriptor,
    in_schema: Schema,
    out_schema: Schema,
    key_index: Option<usize>,
    agg_index: Option<usize>,
    expected_origins: HashSet<OriginId>,
    output: OutputStream,
    state: Mutex<WindowState>,
}

impl WindowAggKernel {
    pub fn new(
        desc: WindowDescriptor,
        in_schema: Schema,
        out_schema: Schema,
        expected_origins: HashSet<OriginId>,
        output: OutputStream,
    ) -> CoreResult<Self> {
        let key_index = match &desc.key {
            Some(key) => Some(in_schema.field_index(key).ok_or_else(|| {
                CoreError::Validation(format!("window key missing: {key}"))
            })?),
            None => None,
        };
        let agg_index = match desc.aggregation {
            AggregationType::Count => None,
            _ => Some(in_schema.field_index(&desc.on_field).ok_or_else(|| {
                CoreError::Validation(format!("aggregated field missing: {}", desc.on_field))
            })?),
        };
        Ok(Self {
            desc,
            in_schema,
            out_schema,
            key_index,
            agg_index,
            expected_origins,
            output,
            state: Mutex::new(WindowState {
                slices: BTreeMap::new(),
                watermarks: HashMap::new(),
                runs: HashMap::new(),
            }),
        })
    }

    fn min_watermark(&self, state: &WindowState) -> u64 {
        self.expected_origins
            .iter()
            .map(|o| state.watermarks.get(o).copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    /// Pop every window whose end the minimum watermark strictly passed.
    fn take_ripe(
        &self,
        state: &mut WindowState,
        up_to_exclusive: u64,
    ) -> Vec<((u64, u64), HashMap<KeyValue, AggState>)> {
        let ripe: Vec<(u64, u64)> = state
            .slices
            .keys()
            .filter(|(_, end)| *end < up_to_exclusive)
            .copied()
            .collect();
        ripe.into_iter()
            .map(|w| {
                let keys = state.slices.remove(&w).expect("ripe window present");
                (w, keys)
            })
            .collect()
    }

    fn emit(
        &self,
        fired: Vec<((u64, u64), HashMap<KeyValue, AggState>)>,
        watermark: u64,
        ctx: &KernelContext,
    ) -> CoreResult<Vec<TupleBuffer>> {
        if fired.is_empty() {
            return Ok(Vec::new());
        }
        let rows: usize = fired.iter().map(|(_, keys)| keys.len()).sum();
        let mut out = RowsBuilder::new(
            ctx.buffers
                .try_acquire_or_grow(self.out_schema.tuple_size() * rows)?,
            self.out_schema.clone(),
        );
        self.output.stamp(out.builder_mut(), watermark);
        for ((start, end), keys) in fired {
            let mut ordered: Vec<(KeyValue, AggState)> = keys.into_iter().collect();
            ordered.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, agg) in ordered {
                let row = self.output_row(start, end, key, agg)?;
                out.push_row(&row)?;
            }
            trace!(start, end, "window fired");
        }
        let sealed = out.finish();
        sealed.set_sequence_number(self.output.next_sequence());
        Ok(vec![sealed])
    }

    fn output_row(
        &self,
        start: u64,
        end: u64,
        key: KeyValue,
        agg: AggState,
    ) -> CoreResult<Vec<Value>> {
        Ok(match self.key_index {
            Some(_) => {
                // (start, end, key, aggregate)
                let proto = proto_value(&self.out_schema, 3);
                vec![
                    Value::UInt64(start),
                    Value::UInt64(end),
                    key.to_value(),
                    agg.finish(&proto),
                ]
            }
            None => {
                // (start, end, aggregate, key=0)
                let proto = proto_value(&self.out_schema, 2);
                vec![
                    Value::UInt64(start),
                    Value::UInt64(end),
                    agg.finish(&proto),
                    Value::UInt64(0),
                ]
            }
        })
    }

    fn key_of(&self, row: &dse_core::RowView<'_>) -> CoreResult<KeyValue> {
        match self.key_index {
            Some(i) => Ok(KeyValue::of(&row.get(i)?)),
            None => Ok(KeyValue::UInt(0)),
        }
    }

    fn agg_input(&self, row: &dse_core::RowView<'_>) -> CoreResult<f64> {
        match self.agg_index {
            Some(i) => row.get(i)?.as_f64(),
            None => Ok(1.0),
        }
    }
}

/// Zero value of the output field's type, steering aggregate coercion.
fn proto_value(schema: &Schema, index: usize) -> Value {
    match schema.fields.get(index).map(|f| f.data_type) {
        Some(dse_core::DataType::Int32) => Value::Int32(0),
        Some(dse_core::DataType::Int64) => Value::Int64(0),
        Some(dse_core::DataType::UInt64) => Value::UInt64(0),
        _ => Value::Float64(0.0),
    }
}

impl OperatorKernel for WindowAggKernel {
    fn name(&self) -> &'static str {
        "window"
    }

    fn execute(&self, buffer: &TupleBuffer, ctx: &KernelContext) -> CoreResult<Vec<TupleBuffer>> {
        let mut state = self.state.lock();

        if let WindowType::Threshold {
            predicate,
            min_count,
        } = &self.desc.window
        {
            // contiguous runs of satisfying tuples; a run closes on the
            // first non-satisfying tuple for its key
            let mut finished: Vec<((u64, u64), HashMap<KeyValue, AggState>)> = Vec::new();
            for row in dse_core::rows(buffer, &self.in_schema) {
                let ts = row_timestamp(&self.desc.time, &row, &self.in_schema, buffer)?;
                let key = self.key_of(&row)?;
                let satisfied = matches!(predicate.evaluate(&row), Ok(Value::Bool(true)));
                if satisfied {
                    let value = self.agg_input(&row)?;
                    let run = state.runs.entry(key.clone()).or_insert_with(|| {
                        (ts, ts, AggState::new(self.desc.aggregation), 0)
                    });
                    run.1 = ts;
                    run.2.update(value);
                    run.3 += 1;
                } else if let Some((start, end, agg, count)) = state.runs.remove(&key) {
                    if count >= *min_count {
                        finished.push(((start, end), HashMap::from([(key, agg)])));
                    }
                }
            }
            let wm = buffer.watermark();
            return self.emit(finished, wm, ctx);
        }

        for row in dse_core::rows(buffer, &self.in_schema) {
            let ts = row_timestamp(&self.desc.time, &row, &self.in_schema, buffer)?;
            let key = self.key_of(&row)?;
            let value = self.agg_input(&row)?;
            for window in self.desc.window.windows_for(ts) {
                state
                    .slices
                    .entry(window)
                    .or_default()
                    .entry(key.clone())
                    .or_insert_with(|| AggState::new(self.desc.aggregation))
                    .update(value);
            }
        }

        let origin_entry = state.watermarks.entry(buffer.origin()).or_insert(0);
        *origin_entry = (*origin_entry).max(buffer.watermark());
        let min_wm = self.min_watermark(&state);
        // strict: a window (s, e) fires only when the minimum watermark
        // exceeds e, so everything with e < min_wm is ripe
        let fired = self.take_ripe(&mut state, min_wm);
        drop(state);
        self.emit(fired, min_wm, ctx)
    }

    fn flush(
        &self,
        termination: TerminationType,
        ctx: &KernelContext,
    ) -> CoreResult<Vec<TupleBuffer>> {
        let mut state = self.state.lock();
        match termination {
            TerminationType::Graceful => {
                // fire every window whose end the observed watermark covers
                let max_wm = state.watermarks.values().copied().max().unwrap_or(0);
                let fired = self.take_ripe(&mut state, max_wm.saturating_add(1));
                state.slices.clear();
                state.runs.clear();
                drop(state);
                self.emit(fired, max_wm, ctx)
            }
            TerminationType::HardStop | TerminationType::Failure => {
                state.slices.clear();
                state.runs.clear();
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::types::{DataType, Field};
    use dse_core::BufferManager;
    use dse_plan::inference::{
        WINDOW_COUNT_FIELD, WINDOW_END_FIELD, WINDOW_KEY_FIELD, WINDOW_START_FIELD,
    };

    fn in_schema() -> Schema {
        Schema::new(vec![
            Field::new("value", DataType::UInt64),
            Field::new("id", DataType::UInt64),
            Field::new("timestamp", DataType::UInt64),
        ])
    }

    fn keyed_out_schema() -> Schema {
        Schema::new(vec![
            Field::new(WINDOW_START_FIELD, DataType::UInt64),
            Field::new(WINDOW_END_FIELD, DataType::UInt64),
            Field::new("id", DataType::UInt64),
            Field::new("value", DataType::UInt64),
        ])
    }

    fn kernel(expected: &[u64]) -> WindowAggKernel {
        WindowAggKernel::new(
            WindowDescriptor {
                window: WindowType::Tumbling { size_ms: 1000 },
                time: TimeCharacteristic::EventTime {
                    field: "timestamp".into(),
                },
                key: Some("id".into()),
                aggregation: AggregationType::Sum,
                on_field: "value".into(),
            },
            in_schema(),
            keyed_out_schema(),
            expected.iter().map(|&o| OriginId::new(o)).collect(),
            OutputStream::new(OriginId::new(99)),
        )
        .unwrap()
    }

    fn push(
        kernel: &WindowAggKernel,
        ctx: &KernelContext,
        mgr: &BufferManager,
        origin: u64,
        watermark: u64,
        rows: &[(u64, u64, u64)],
    ) -> Vec<TupleBuffer> {
        let mut rb = RowsBuilder::new(mgr.try_acquire().unwrap(), in_schema());
        rb.builder_mut().set_origin(OriginId::new(origin));
        rb.builder_mut().set_watermark(watermark);
        for (value, id, ts) in rows {
            rb.push_row(&[
                Value::UInt64(*value),
                Value::UInt64(*id),
                Value::UInt64(*ts),
            ])
            .unwrap();
        }
        let buf = rb.finish();
        buf.set_sequence_number(1);
        kernel.execute(&buf, ctx).unwrap()
    }

    fn rows_of(buffers: &[TupleBuffer], schema: &Schema) -> Vec<Vec<u64>> {
        buffers
            .iter()
            .flat_map(|b| {
                dse_core::rows(b, schema)
                    .map(|r| {
                        r.values()
                            .unwrap()
                            .into_iter()
                            .map(|v| v.as_u64().unwrap())
                            .collect::<Vec<u64>>()
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn tumbling_sum_fires_on_watermark() {
        let mgr = BufferManager::new(1024, 16);
        let ctx = KernelContext::new(mgr.clone());
        let k = kernel(&[1]);

        // two windows of data, watermark still inside the second
        let out = push(
            &k,
            &ctx,
            &mgr,
            1,
            1500,
            &[(1, 1, 1000), (2, 1, 1100), (5, 2, 1400)],
        );
        assert!(out.is_empty(), "watermark 1500 fires nothing");

        // watermark passes 2000: window (1000, 2000) fires
        let out = push(&k, &ctx, &mgr, 1, 2100, &[(7, 1, 2050)]);
        let rows = rows_of(&out, &keyed_out_schema());
        assert_eq!(rows, vec![vec![1000, 2000, 1, 3], vec![1000, 2000, 2, 5]]);

        // firing is idempotent: the window is gone
        let out = push(&k, &ctx, &mgr, 1, 2200, &[]);
        assert!(out.is_empty());
    }

    #[test]
    fn fires_only_after_all_origins_advance() {
        let mgr = BufferManager::new(1024, 16);
        let ctx = KernelContext::new(mgr.clone());
        let k = kernel(&[1, 2]);

        let out = push(&k, &ctx, &mgr, 1, 5000, &[(1, 1, 500)]);
        assert!(out.is_empty(), "origin 2 has not advanced yet");
        let out = push(&k, &ctx, &mgr, 2, 5000, &[]);
        let rows = rows_of(&out, &keyed_out_schema());
        assert_eq!(rows, vec![vec![0, 1000, 1, 1]]);
    }

    #[test]
    fn graceful_flush_fires_covered_windows_only() {
        let mgr = BufferManager::new(1024, 16);
        let ctx = KernelContext::new(mgr.clone());
        let k = kernel(&[1]);

        push(&k, &ctx, &mgr, 1, 2000, &[(3, 1, 500), (4, 1, 2500)]);
        // watermark 2000 covers (0,1000] but not (2000,3000]
        let out = k.flush(TerminationType::Graceful, &ctx).unwrap();
        let rows = rows_of(&out, &keyed_out_schema());
        assert_eq!(rows, vec![vec![0, 1000, 1, 3]]);
    }

    #[test]
    fn failure_flush_drops_state_silently() {
        let mgr = BufferManager::new(1024, 16);
        let ctx = KernelContext::new(mgr.clone());
        let k = kernel(&[1]);
        push(&k, &ctx, &mgr, 1, 900, &[(3, 1, 500)]);
        let out = k.flush(TerminationType::Failure, &ctx).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn unkeyed_count_emits_iteration_shape() {
        let out_schema = Schema::new(vec![
            Field::new(WINDOW_START_FIELD, DataType::UInt64),
            Field::new(WINDOW_END_FIELD, DataType::UInt64),
            Field::new(WINDOW_COUNT_FIELD, DataType::UInt64),
            Field::new(WINDOW_KEY_FIELD, DataType::UInt64),
        ]);
        let k = WindowAggKernel::new(
            WindowDescriptor {
                window: WindowType::Tumbling { size_ms: 1000 },
                time: TimeCharacteristic::EventTime {
                    field: "timestamp".into(),
                },
                key: None,
                aggregation: AggregationType::Count,
                on_field: String::new(),
            },
            in_schema(),
            out_schema.clone(),
            [OriginId::new(1)].into_iter().collect(),
            OutputStream::new(OriginId::new(99)),
        )
        .unwrap();
        let mgr = BufferManager::new(1024, 16);
        let ctx = KernelContext::new(mgr.clone());

        push(&k, &ctx, &mgr, 1, 800, &[(1, 7, 100), (1, 8, 200), (1, 9, 300)]);
        let out = push(&k, &ctx, &mgr, 1, 1100, &[]);
        let rows = rows_of(&out, &out_schema);
        assert_eq!(rows, vec![vec![0, 1000, 3, 0]]);
    }
}
