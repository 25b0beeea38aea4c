//! Source runners: generator, CSV replay and the network source.
//!
//! A source runner produces one sealed buffer per call until exhausted,
//! stopped or failed. The driving loop lives in the query manager, which
//! submits every produced buffer as a data task and the final end-of-stream
//! marker after the source winds down. Leaf sources (generator, CSV) are
//! the only ones a graceful stop cancels directly; network sources end when
//! their upstream channel delivers its end-of-stream.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dse_core::config::SourceKind;
use dse_core::types::{DataType, Schema, Value};
use dse_core::{
    now_millis, BufferManager, CoreError, CoreResult, OperatorId, OriginId, Partition,
    RowsBuilder, TerminationType, TupleBuffer,
};
use dse_net::{ChannelEvent, PartitionRegistry};

enum SourceImpl {
    Generator {
        remaining: u64,
        interval_ms: u64,
    },
    Csv {
        path: String,
        has_header: bool,
        interval_ms: u64,
        lines: Option<Vec<String>>,
        position: usize,
    },
    Network {
        partition: Partition,
        registry: PartitionRegistry,
    },
}

pub struct SourceRunner {
    pub operator: OperatorId,
    pub origin: OriginId,
    /// Leaf sources ingest from outside; network sources relay a peer.
    pub leaf: bool,
    schema: Schema,
    state: Mutex<SourceImpl>,
    /// Held only by the single driver task; an async lock because recv
    /// awaits while it is held.
    network_rx: Option<tokio::sync::Mutex<mpsc::Receiver<ChannelEvent>>>,
    cancel: CancellationToken,
    termination: Mutex<TerminationType>,
    next_seq: AtomicU64,
    batch_rows: usize,
}

impl SourceRunner {
    pub fn physical(
        operator: OperatorId,
        origin: OriginId,
        schema: Schema,
        kind: &SourceKind,
    ) -> Self {
        let state = match kind {
            SourceKind::Generator {
                tuples,
                interval_ms,
            } => SourceImpl::Generator {
                remaining: *tuples,
                interval_ms: *interval_ms,
            },
            SourceKind::Csv {
                path,
                has_header,
                interval_ms,
            } => SourceImpl::Csv {
                path: path.clone(),
                has_header: *has_header,
                interval_ms: *interval_ms,
                lines: None,
                position: 0,
            },
        };
        Self {
            operator,
            origin,
            leaf: true,
            schema,
            state: Mutex::new(state),
            network_rx: None,
            cancel: CancellationToken::new(),
            termination: Mutex::new(TerminationType::Graceful),
            next_seq: AtomicU64::new(1),
            batch_rows: 128,
        }
    }

    pub fn network(
        operator: OperatorId,
        origin: OriginId,
        schema: Schema,
        partition: Partition,
        registry: PartitionRegistry,
        rx: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            operator,
            origin,
            leaf: false,
            schema,
            state: Mutex::new(SourceImpl::Network {
                partition,
                registry,
            }),
            network_rx: Some(tokio::sync::Mutex::new(rx)),
            cancel: CancellationToken::new(),
            termination: Mutex::new(TerminationType::Graceful),
            next_seq: AtomicU64::new(1),
            batch_rows: 128,
        }
    }

    /// Ask the source to wind down with the given termination type.
    pub fn stop(&self, termination: TerminationType) {
        {
            let mut t = self.termination.lock();
            if *t != TerminationType::Failure {
                *t = termination;
            }
        }
        self.cancel.cancel();
    }

    pub fn termination(&self) -> TerminationType {
        *self.termination.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Produce the next buffer; `None` means the source is done.
    pub async fn next_batch(&self, buffers: &BufferManager) -> CoreResult<Option<TupleBuffer>> {
        if self.cancel.is_cancelled() && self.leaf {
            return Ok(None);
        }
        // network state needs the receiver mutably and awaits; everything
        // else computes under the lock and sleeps outside it
        enum Step {
            Emit(TupleBuffer),
            Done,
            AwaitNetwork,
        }
        let step = {
            let mut state = self.state.lock();
            match &mut *state {
                SourceImpl::Generator { remaining, .. } => {
                    if *remaining == 0 {
                        Step::Done
                    } else {
                        let count = (*remaining).min(self.batch_rows as u64);
                        *remaining -= count;
                        Step::Emit(self.generate(buffers, count)?)
                    }
                }
                SourceImpl::Csv {
                    path,
                    has_header,
                    lines,
                    position,
                    ..
                } => {
                    if lines.is_none() {
                        let content = std::fs::read_to_string(&*path).map_err(|e| {
                            CoreError::RuntimeSystem(format!("read csv {path}: {e}"))
                        })?;
                        let mut all: Vec<String> =
                            content.lines().map(str::to_string).collect();
                        if *has_header && !all.is_empty() {
                            all.remove(0);
                        }
                        *lines = Some(all);
                    }
                    let all = lines.as_ref().expect("csv loaded");
                    if *position >= all.len() {
                        Step::Done
                    } else {
                        let end = (*position + self.batch_rows).min(all.len());
                        let batch: Vec<String> = all[*position..end].to_vec();
                        *position = end;
                        Step::Emit(self.parse_csv_rows(buffers, &batch)?)
                    }
                }
                SourceImpl::Network { .. } => Step::AwaitNetwork,
            }
        };

        match step {
            Step::Done => Ok(None),
            Step::Emit(buffer) => Ok(Some(buffer)),
            Step::AwaitNetwork => self.next_network(buffers).await,
        }
    }

    async fn next_network(&self, _buffers: &BufferManager) -> CoreResult<Option<TupleBuffer>> {
        let rx = self
            .network_rx
            .as_ref()
            .ok_or_else(|| CoreError::RuntimeSystem("network source without receiver".into()))?;
        let mut rx = rx.lock().await;
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => None,
                ev = rx.recv() => ev,
            };
            match event {
                Some(ChannelEvent::Data(buffer)) => return Ok(Some(buffer)),
                Some(ChannelEvent::Event(event)) => {
                    debug!(?event, "network source control event");
                }
                Some(ChannelEvent::EndOfStream(termination)) => {
                    *self.termination.lock() = termination;
                    self.deregister();
                    return Ok(None);
                }
                None => {
                    // channel gone or cancelled
                    self.deregister();
                    return Ok(None);
                }
            }
        }
    }

    fn deregister(&self) {
        let state = self.state.lock();
        if let SourceImpl::Network {
            partition,
            registry,
            ..
        } = &*state
        {
            registry.unregister(partition);
        }
    }

    /// Delay between batches for paced sources.
    pub fn interval_ms(&self) -> u64 {
        match &*self.state.lock() {
            SourceImpl::Generator { interval_ms, .. } => *interval_ms,
            SourceImpl::Csv { interval_ms, .. } => *interval_ms,
            SourceImpl::Network { .. } => 0,
        }
    }

    fn stamp(&self, builder: &mut RowsBuilder) {
        builder.builder_mut().set_origin(self.origin);
        builder.builder_mut().set_creation_ts(now_millis());
    }

    fn generate(&self, buffers: &BufferManager, count: u64) -> CoreResult<TupleBuffer> {
        let mut rb = RowsBuilder::new(
            buffers.try_acquire_or_grow(self.schema.tuple_size() * count as usize)?,
            self.schema.clone(),
        );
        self.stamp(&mut rb);
        let row: Vec<Value> = self
            .schema
            .fields
            .iter()
            .map(|f| match f.data_type {
                DataType::Bool => Value::Bool(true),
                DataType::Int32 => Value::Int32(1),
                DataType::Int64 => Value::Int64(1),
                DataType::UInt64 => Value::UInt64(1),
                DataType::Float64 => Value::Float64(1.0),
                DataType::Text => Value::Text("default".into()),
            })
            .collect();
        for _ in 0..count {
            rb.push_row(&row)?;
        }
        let buffer = rb.finish();
        buffer.set_sequence_number(self.next_seq.fetch_add(1, Ordering::Relaxed));
        Ok(buffer)
    }

    fn parse_csv_rows(&self, buffers: &BufferManager, lines: &[String]) -> CoreResult<TupleBuffer> {
        let mut rb = RowsBuilder::new(
            buffers.try_acquire_or_grow(self.schema.tuple_size() * lines.len())?,
            self.schema.clone(),
        );
        self.stamp(&mut rb);
        for line in lines {
            match self.parse_line(line) {
                Ok(values) => rb.push_row(&values)?,
                Err(e) => {
                    // data error: skip the malformed line
                    warn!(line, error = %e, "csv line skipped");
                }
            }
        }
        let buffer = rb.finish();
        buffer.set_sequence_number(self.next_seq.fetch_add(1, Ordering::Relaxed));
        Ok(buffer)
    }

    fn parse_line(&self, line: &str) -> CoreResult<Vec<Value>> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() != self.schema.len() {
            return Err(CoreError::RuntimeData(format!(
                "csv line has {} fields, schema has {}",
                parts.len(),
                self.schema.len()
            )));
        }
        parts
            .iter()
            .zip(&self.schema.fields)
            .map(|(part, field)| {
                let parse_err =
                    |e: String| CoreError::RuntimeData(format!("field {}: {e}", field.name));
                Ok(match field.data_type {
                    DataType::Bool => Value::Bool(matches!(*part, "true" | "1")),
                    DataType::Int32 => {
                        Value::Int32(part.parse().map_err(|e| parse_err(format!("{e}")))?)
                    }
                    DataType::Int64 => {
                        Value::Int64(part.parse().map_err(|e| parse_err(format!("{e}")))?)
                    }
                    DataType::UInt64 => {
                        Value::UInt64(part.parse().map_err(|e| parse_err(format!("{e}")))?)
                    }
                    DataType::Float64 => {
                        Value::Float64(part.parse().map_err(|e| parse_err(format!("{e}")))?)
                    }
                    DataType::Text => Value::Text(part.to_string()),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::types::Field;
    use std::io::Write;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int32),
            Field::new("value", DataType::Int64),
        ])
    }

    #[tokio::test]
    async fn generator_emits_exactly_n_tuples() {
        let buffers = BufferManager::new(4096, 8);
        let source = SourceRunner::physical(
            OperatorId::new(1),
            OriginId::new(1),
            schema(),
            &SourceKind::Generator {
                tuples: 10,
                interval_ms: 0,
            },
        );
        let mut total = 0;
        while let Some(buffer) = source.next_batch(&buffers).await.unwrap() {
            total += buffer.tuple_count();
            let schema = schema();
            let row = dse_core::rows(&buffer, &schema).next().unwrap();
            assert_eq!(row.values().unwrap(), vec![Value::Int32(1), Value::Int64(1)]);
        }
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn csv_source_replays_and_skips_malformed_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id,value").unwrap();
        writeln!(file, "1,10").unwrap();
        writeln!(file, "not,a,number").unwrap();
        writeln!(file, "2,20").unwrap();
        file.flush().unwrap();

        let buffers = BufferManager::new(4096, 8);
        let source = SourceRunner::physical(
            OperatorId::new(1),
            OriginId::new(1),
            schema(),
            &SourceKind::Csv {
                path: file.path().display().to_string(),
                has_header: true,
                interval_ms: 0,
            },
        );
        let buffer = source.next_batch(&buffers).await.unwrap().unwrap();
        assert_eq!(buffer.tuple_count(), 2);
        assert!(source.next_batch(&buffers).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stopped_generator_stops_producing() {
        let buffers = BufferManager::new(4096, 8);
        let source = SourceRunner::physical(
            OperatorId::new(1),
            OriginId::new(1),
            schema(),
            &SourceKind::Generator {
                tuples: 1_000_000,
                interval_ms: 0,
            },
        );
        assert!(source.next_batch(&buffers).await.unwrap().is_some());
        source.stop(TerminationType::Graceful);
        assert!(source.next_batch(&buffers).await.unwrap().is_none());
        assert_eq!(source.termination(), TerminationType::Graceful);
    }
}
