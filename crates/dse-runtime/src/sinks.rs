//! Sink executables: print, CSV file, null and the network sink.
//!
//! File sinks write a `name:TYPE` header line and one comma-separated row
//! per tuple. The network sink bridges into the exchange transport: it
//! connects with the retrying handshake at open, forwards sealed buffers
//! in submission order, keeps a lineage log of (watermark, sequence) pairs
//! while lineage is enabled, trims it on epoch barriers, and closes the
//! channel with the plan's termination type.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use dse_core::types::Schema;
use dse_core::{CoreError, CoreResult, OperatorId, SubPlanId, TerminationType, TupleBuffer};
use dse_net::{ChannelConfig, EventKind, NetworkChannel};
use dse_plan::NetworkSinkDescriptor;

pub struct ExecutableSink {
    pub operator: OperatorId,
    pub subplan: SubPlanId,
    schema: Schema,
    kind: SinkImpl,
}

enum SinkImpl {
    Print,
    File {
        path: PathBuf,
        append: bool,
        writer: Mutex<Option<BufWriter<File>>>,
    },
    Null,
    Network {
        descriptor: NetworkSinkDescriptor,
        config: ChannelConfig,
        cancel: CancellationToken,
        channel: tokio::sync::Mutex<Option<NetworkChannel>>,
        /// (watermark, sequence) pairs retained until an epoch covers them.
        lineage: Mutex<Vec<(u64, u64)>>,
        lineage_enabled: bool,
    },
}

impl ExecutableSink {
    pub fn print(operator: OperatorId, subplan: SubPlanId, schema: Schema) -> Self {
        Self {
            operator,
            subplan,
            schema,
            kind: SinkImpl::Print,
        }
    }

    pub fn file(
        operator: OperatorId,
        subplan: SubPlanId,
        schema: Schema,
        path: impl Into<PathBuf>,
        append: bool,
    ) -> Self {
        Self {
            operator,
            subplan,
            schema,
            kind: SinkImpl::File {
                path: path.into(),
                append,
                writer: Mutex::new(None),
            },
        }
    }

    pub fn null(operator: OperatorId, subplan: SubPlanId, schema: Schema) -> Self {
        Self {
            operator,
            subplan,
            schema,
            kind: SinkImpl::Null,
        }
    }

    pub fn network(
        operator: OperatorId,
        subplan: SubPlanId,
        schema: Schema,
        descriptor: NetworkSinkDescriptor,
        config: ChannelConfig,
        cancel: CancellationToken,
        lineage_enabled: bool,
    ) -> Self {
        Self {
            operator,
            subplan,
            schema,
            kind: SinkImpl::Network {
                descriptor,
                config,
                cancel,
                channel: tokio::sync::Mutex::new(None),
                lineage: Mutex::new(Vec::new()),
                lineage_enabled,
            },
        }
    }

    fn header_line(&self) -> String {
        self.schema
            .fields
            .iter()
            .map(|f| format!("{}:{}", f.name, f.data_type))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn format_rows(&self, buffer: &TupleBuffer) -> CoreResult<Vec<String>> {
        dse_core::rows(buffer, &self.schema)
            .map(|row| {
                Ok(row
                    .values()?
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(","))
            })
            .collect()
    }

    /// Bind resources: create the file, connect the network channel.
    pub async fn open(&self) -> CoreResult<()> {
        match &self.kind {
            SinkImpl::Print | SinkImpl::Null => Ok(()),
            SinkImpl::File {
                path,
                append,
                writer,
            } => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(*append)
                    .truncate(!*append)
                    .open(path)
                    .map_err(|e| {
                        CoreError::RuntimeSystem(format!("open sink file {path:?}: {e}"))
                    })?;
                let mut w = BufWriter::new(file);
                writeln!(w, "{}", self.header_line())
                    .map_err(|e| CoreError::RuntimeSystem(format!("write header: {e}")))?;
                *writer.lock() = Some(w);
                Ok(())
            }
            SinkImpl::Network {
                descriptor,
                config,
                cancel,
                channel,
                ..
            } => {
                let addr = format!("{}:{}", descriptor.target_host, descriptor.target_port);
                let connected =
                    NetworkChannel::connect(&addr, descriptor.partition, config, cancel)
                        .await
                        .map_err(|e| {
                            CoreError::RuntimeSystem(format!("network sink connect: {e}"))
                        })?;
                info!(partition = %descriptor.partition, %addr, "network sink bound");
                *channel.lock().await = Some(connected);
                Ok(())
            }
        }
    }

    pub async fn write(&self, buffer: &TupleBuffer) -> CoreResult<()> {
        match &self.kind {
            SinkImpl::Print => {
                for line in self.format_rows(buffer)? {
                    println!("{line}");
                }
                Ok(())
            }
            SinkImpl::Null => Ok(()),
            SinkImpl::File { writer, .. } => {
                let lines = self.format_rows(buffer)?;
                let mut guard = writer.lock();
                let w = guard
                    .as_mut()
                    .ok_or_else(|| CoreError::RuntimeSystem("sink file not open".into()))?;
                for line in lines {
                    writeln!(w, "{line}")
                        .map_err(|e| CoreError::RuntimeSystem(format!("write row: {e}")))?;
                }
                Ok(())
            }
            SinkImpl::Network {
                channel,
                lineage,
                lineage_enabled,
                ..
            } => {
                let mut guard = channel.lock().await;
                let ch = guard
                    .as_mut()
                    .ok_or_else(|| CoreError::RuntimeSystem("network sink not bound".into()))?;
                ch.send_buffer(buffer)
                    .await
                    .map_err(|e| CoreError::RuntimeSystem(format!("network send: {e}")))?;
                if *lineage_enabled {
                    lineage
                        .lock()
                        .push((buffer.watermark(), buffer.sequence_number()));
                }
                Ok(())
            }
        }
    }

    /// Flush and release; the network sink forwards the termination type.
    pub async fn finish(&self, termination: TerminationType) -> CoreResult<()> {
        match &self.kind {
            SinkImpl::Print | SinkImpl::Null => Ok(()),
            SinkImpl::File { writer, .. } => {
                if let Some(mut w) = writer.lock().take() {
                    w.flush()
                        .map_err(|e| CoreError::RuntimeSystem(format!("flush sink: {e}")))?;
                }
                Ok(())
            }
            SinkImpl::Network { channel, .. } => {
                if let Some(ch) = channel.lock().await.take() {
                    ch.close(termination)
                        .await
                        .map_err(|e| CoreError::RuntimeSystem(format!("network close: {e}")))?;
                }
                Ok(())
            }
        }
    }

    /// Epoch barrier: forward to the peer and trim covered lineage.
    pub async fn propagate_epoch(&self, timestamp: u64, query_id: u64) -> CoreResult<()> {
        if let SinkImpl::Network {
            channel, lineage, ..
        } = &self.kind
        {
            let mut guard = channel.lock().await;
            if let Some(ch) = guard.as_mut() {
                ch.send_event(EventKind::EpochBarrier {
                    timestamp,
                    query_id,
                })
                .await
                .map_err(|e| CoreError::RuntimeSystem(format!("epoch propagation: {e}")))?;
            }
            let mut log = lineage.lock();
            let before = log.len();
            log.retain(|(wm, _)| *wm > timestamp);
            debug!(
                trimmed = before - log.len(),
                timestamp, "lineage trimmed to epoch"
            );
        }
        Ok(())
    }

    /// Entries still awaiting an epoch, for monitoring.
    pub fn lineage_len(&self) -> usize {
        match &self.kind {
            SinkImpl::Network { lineage, .. } => lineage.lock().len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::types::{DataType, Field, Value};
    use dse_core::{BufferManager, RowsBuilder};

    fn schema() -> Schema {
        Schema::new(vec![Field::new(
            "default_logical$NewName",
            DataType::Int32,
        )])
    }

    fn one_column_buffer(values: &[i32]) -> TupleBuffer {
        let mgr = BufferManager::new(256, 4);
        let mut rb = RowsBuilder::new(mgr.try_acquire().unwrap(), schema());
        for v in values {
            rb.push_row(&[Value::Int32(*v)]).unwrap();
        }
        rb.finish()
    }

    #[tokio::test]
    async fn file_sink_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let sink = ExecutableSink::file(
            OperatorId::new(1),
            SubPlanId::new(1),
            schema(),
            &path,
            false,
        );
        sink.open().await.unwrap();
        sink.write(&one_column_buffer(&[1; 10])).await.unwrap();
        sink.finish(TerminationType::Graceful).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "default_logical$NewName:INTEGER(32 bits)");
        assert_eq!(lines.len(), 11);
        assert!(lines[1..].iter().all(|l| *l == "1"));
    }

    #[tokio::test]
    async fn write_before_open_is_a_system_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ExecutableSink::file(
            OperatorId::new(1),
            SubPlanId::new(1),
            schema(),
            dir.path().join("x.csv"),
            false,
        );
        let err = sink.write(&one_column_buffer(&[1])).await.unwrap_err();
        assert!(matches!(err, CoreError::RuntimeSystem(_)));
    }
}
