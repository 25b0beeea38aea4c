//! Operator kernels.
//!
//! A kernel is the runtime form of one logical operator: `setup` once at
//! pipeline creation, `execute` per input buffer, `flush` when the last
//! end-of-stream arrives, `close` when the pipeline is destroyed. Kernels
//! are shared between worker tasks, so mutable state lives behind locks
//! inside the stateful ones.
//!
//! Per-tuple evaluation failures are data errors: the offending tuple is
//! skipped (counted and logged), the pipeline keeps running. Only resource
//! failures (pool exhaustion, full buffers) escalate.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

use dse_core::types::{Schema, Value};
use dse_core::{
    BufferManager, CoreError, CoreResult, Expr, OriginId, RowView, RowsBuilder, TerminationType,
    TupleBuffer,
};
use dse_plan::TimeCharacteristic;

/// Everything a kernel may touch while executing.
pub struct KernelContext {
    pub buffers: BufferManager,
}

impl KernelContext {
    pub fn new(buffers: BufferManager) -> Self {
        Self { buffers }
    }
}

/// The narrow capability surface every kernel implements.
pub trait OperatorKernel: Send + Sync {
    fn name(&self) -> &'static str;

    fn setup(&self, _ctx: &KernelContext) -> CoreResult<()> {
        Ok(())
    }

    /// Process one buffer, returning zero or more output buffers.
    fn execute(&self, buffer: &TupleBuffer, ctx: &KernelContext) -> CoreResult<Vec<TupleBuffer>>;

    /// Drain state when the last upstream finished. Graceful termination
    /// may still emit; hard stop and failure must not.
    fn flush(
        &self,
        _termination: TerminationType,
        _ctx: &KernelContext,
    ) -> CoreResult<Vec<TupleBuffer>> {
        Ok(Vec::new())
    }

    fn close(&self, _ctx: &KernelContext) {}
}

/// A `Value` that can key a hash map: integers collapse to one
/// representation, floats key by bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Int(i64),
    UInt(u64),
    Bool(bool),
    Text(String),
    Bits(u64),
    Null,
}

impl KeyValue {
    pub fn of(value: &Value) -> KeyValue {
        match value {
            Value::Int32(v) => KeyValue::Int(*v as i64),
            Value::Int64(v) => KeyValue::Int(*v),
            Value::UInt64(v) => KeyValue::UInt(*v),
            Value::Bool(v) => KeyValue::Bool(*v),
            Value::Text(v) => KeyValue::Text(v.clone()),
            Value::Float64(v) => KeyValue::Bits(v.to_bits()),
            Value::Null => KeyValue::Null,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Int(v) => Value::Int64(*v),
            KeyValue::UInt(v) => Value::UInt64(*v),
            KeyValue::Bool(v) => Value::Bool(*v),
            KeyValue::Text(v) => Value::Text(v.clone()),
            KeyValue::Bits(v) => Value::Float64(f64::from_bits(*v)),
            KeyValue::Null => Value::Null,
        }
    }
}

/// Copy the source-owned header fields onto a derived buffer.
pub fn inherit_header(builder: &mut dse_core::BufferBuilder, from: &TupleBuffer) {
    builder.set_origin(from.origin());
    builder.set_creation_ts(from.creation_ts());
    builder.set_watermark(from.watermark());
}

/// Row timestamp under a time characteristic.
pub fn row_timestamp(
    time: &TimeCharacteristic,
    row: &RowView<'_>,
    schema: &Schema,
    buffer: &TupleBuffer,
) -> CoreResult<u64> {
    match time {
        TimeCharacteristic::EventTime { field } => {
            let idx = schema.field_index(field).ok_or_else(|| {
                CoreError::RuntimeData(format!("event time field missing: {field}"))
            })?;
            row.get(idx)?.as_u64()
        }
        TimeCharacteristic::IngestionTime => Ok(buffer.creation_ts()),
    }
}

/// Compacting filter: matching tuples only, header preserved except the
/// tuple count.
pub struct FilterKernel {
    predicate: Expr,
    schema: Schema,
}

impl FilterKernel {
    pub fn new(predicate: Expr, schema: Schema) -> Self {
        Self { predicate, schema }
    }
}

impl OperatorKernel for FilterKernel {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn execute(&self, buffer: &TupleBuffer, ctx: &KernelContext) -> CoreResult<Vec<TupleBuffer>> {
        let mut out = RowsBuilder::new(
            ctx.buffers
                .try_acquire_or_grow(self.schema.tuple_size() * buffer.tuple_count() as usize)?,
            self.schema.clone(),
        );
        inherit_header(out.builder_mut(), buffer);
        let mut skipped = 0u32;
        for row in dse_core::rows(buffer, &self.schema) {
            match self.predicate.evaluate(&row) {
                Ok(Value::Bool(true)) => out.push_row(&row.values()?)?,
                Ok(Value::Bool(false)) | Ok(Value::Null) => {}
                Ok(other) => {
                    skipped += 1;
                    debug!(?other, "filter predicate returned non-boolean, tuple skipped");
                }
                Err(CoreError::RuntimeData(msg)) => {
                    skipped += 1;
                    debug!(%msg, "filter evaluation failed, tuple skipped");
                }
                Err(e) => return Err(e),
            }
        }
        if skipped > 0 {
            warn!(skipped, "filter skipped undecidable tuples");
        }
        if out.count() == 0 {
            return Ok(Vec::new());
        }
        let sealed = out.finish();
        sealed.set_sequence_number(buffer.sequence_number());
        Ok(vec![sealed])
    }
}

/// Map: evaluates an assignment, widening the schema when the target field
/// is new.
pub struct MapKernel {
    field: String,
    expr: Expr,
    in_schema: Schema,
    out_schema: Schema,
    target_index: usize,
    appends: bool,
}

impl MapKernel {
    pub fn new(field: String, expr: Expr, in_schema: Schema, out_schema: Schema) -> Self {
        let (target_index, appends) = match in_schema.field_index(&field) {
            Some(i) => (i, false),
            None => (out_schema.len() - 1, true),
        };
        Self {
            field,
            expr,
            in_schema,
            out_schema,
            target_index,
            appends,
        }
    }
}

impl OperatorKernel for MapKernel {
    fn name(&self) -> &'static str {
        "map"
    }

    fn execute(&self, buffer: &TupleBuffer, ctx: &KernelContext) -> CoreResult<Vec<TupleBuffer>> {
        let mut out = RowsBuilder::new(
            ctx.buffers.try_acquire_or_grow(
                self.out_schema.tuple_size() * buffer.tuple_count() as usize,
            )?,
            self.out_schema.clone(),
        );
        inherit_header(out.builder_mut(), buffer);
        for row in dse_core::rows(buffer, &self.in_schema) {
            let mut values = row.values()?;
            match self.expr.evaluate(&row) {
                Ok(v) => {
                    if self.appends {
                        values.push(v);
                    } else {
                        values[self.target_index] = v;
                    }
                    out.push_row(&values)?;
                }
                Err(CoreError::RuntimeData(msg)) => {
                    debug!(field = %self.field, %msg, "map evaluation failed, tuple skipped");
                }
                Err(e) => return Err(e),
            }
        }
        if out.count() == 0 {
            return Ok(Vec::new());
        }
        let sealed = out.finish();
        sealed.set_sequence_number(buffer.sequence_number());
        Ok(vec![sealed])
    }
}

/// Projection with renames; pure column shuffling.
pub struct ProjectKernel {
    in_schema: Schema,
    out_schema: Schema,
    indices: Vec<usize>,
}

impl ProjectKernel {
    pub fn new(
        fields: &[(String, Option<String>)],
        in_schema: Schema,
        out_schema: Schema,
    ) -> CoreResult<Self> {
        let indices = fields
            .iter()
            .map(|(name, _)| {
                in_schema
                    .field_index(name)
                    .ok_or_else(|| CoreError::Validation(format!("projected field missing: {name}")))
            })
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Self {
            in_schema,
            out_schema,
            indices,
        })
    }
}

impl OperatorKernel for ProjectKernel {
    fn name(&self) -> &'static str {
        "project"
    }

    fn execute(&self, buffer: &TupleBuffer, ctx: &KernelContext) -> CoreResult<Vec<TupleBuffer>> {
        let mut out = RowsBuilder::new(
            ctx.buffers.try_acquire_or_grow(
                self.out_schema.tuple_size() * buffer.tuple_count() as usize,
            )?,
            self.out_schema.clone(),
        );
        inherit_header(out.builder_mut(), buffer);
        for row in dse_core::rows(buffer, &self.in_schema) {
            let values = self
                .indices
                .iter()
                .map(|&i| row.get(i))
                .collect::<CoreResult<Vec<_>>>()?;
            out.push_row(&values)?;
        }
        let sealed = out.finish();
        sealed.set_sequence_number(buffer.sequence_number());
        Ok(vec![sealed])
    }
}

/// Union merge point: buffers pass through untouched; the pipeline's
/// input accounting does the actual merging.
pub struct PassthroughKernel;

impl OperatorKernel for PassthroughKernel {
    fn name(&self) -> &'static str {
        "union"
    }

    fn execute(&self, buffer: &TupleBuffer, _ctx: &KernelContext) -> CoreResult<Vec<TupleBuffer>> {
        Ok(vec![buffer.clone()])
    }
}

/// Event-time watermark assignment: `max(seen) - allowed_lateness` per
/// origin, never regressing.
pub struct WatermarkAssignKernel {
    time: TimeCharacteristic,
    allowed_lateness_ms: u64,
    schema: Schema,
    last_seen: Mutex<HashMap<OriginId, u64>>,
}

impl WatermarkAssignKernel {
    pub fn new(time: TimeCharacteristic, allowed_lateness_ms: u64, schema: Schema) -> Self {
        Self {
            time,
            allowed_lateness_ms,
            schema,
            last_seen: Mutex::new(HashMap::new()),
        }
    }
}

impl OperatorKernel for WatermarkAssignKernel {
    fn name(&self) -> &'static str {
        "watermark_assign"
    }

    fn execute(&self, buffer: &TupleBuffer, _ctx: &KernelContext) -> CoreResult<Vec<TupleBuffer>> {
        let mut max_ts = 0u64;
        for row in dse_core::rows(buffer, &self.schema) {
            let ts = row_timestamp(&self.time, &row, &self.schema, buffer)?;
            max_ts = max_ts.max(ts);
        }
        let candidate = max_ts.saturating_sub(self.allowed_lateness_ms);
        let mut seen = self.last_seen.lock();
        let entry = seen.entry(buffer.origin()).or_insert(0);
        *entry = (*entry).max(candidate);
        buffer.advance_watermark(*entry);
        Ok(vec![buffer.clone()])
    }
}

/// Sequence stamping for operators that originate new streams (window
/// aggregation, join probes).
pub struct OutputStream {
    origin: OriginId,
    next_seq: AtomicU64,
}

impl OutputStream {
    pub fn new(origin: OriginId) -> Self {
        Self {
            origin,
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    pub fn stamp(&self, builder: &mut dse_core::BufferBuilder, watermark: u64) {
        builder.set_origin(self.origin);
        builder.set_watermark(watermark);
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }
}
