//! Wire format of the exchange transport.
//!
//! Frames are length-prefixed: a `u32` body length followed by the body.
//! Every body starts with the magic word and a message type byte. Integers
//! are little-endian. Data frames carry the full tuple-buffer header, then
//! the payload, then one size-prefixed blob per child buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use dse_core::{OperatorId, OriginId, Partition, PartitionId, SubPlanId, TerminationType, TupleBuffer};

use crate::error::{NetError, NetResult};

/// `DSE1`
pub const MAGIC: u32 = 0x4453_4531;

/// Upper bound on a single frame; anything larger is treated as corruption.
const MAX_FRAME: u32 = 64 * 1024 * 1024;

const MSG_ANNOUNCE: u8 = 0;
const MSG_SERVER_READY: u8 = 1;
const MSG_ERROR: u8 = 2;
const MSG_DATA: u8 = 3;
const MSG_EVENT: u8 = 4;
const MSG_EOS: u8 = 5;

const EVENT_SOURCE_START: u8 = 0;
const EVENT_EPOCH_BARRIER: u8 = 1;
const EVENT_CUSTOM: u8 = 2;

const TERM_GRACEFUL: u8 = 0;
const TERM_HARD: u8 = 1;
const TERM_FAILURE: u8 = 2;

/// Control events that travel alongside data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    SourceStart,
    /// Lineage trim marker propagated to network sinks.
    EpochBarrier { timestamp: u64, query_id: u64 },
    Custom(u32),
}

/// Decoded header + payload of a data frame.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub origin: OriginId,
    pub sequence: u64,
    pub watermark: u64,
    pub creation_ts: u64,
    pub tuple_count: u32,
    pub payload: Bytes,
    pub children: Vec<Bytes>,
}

impl DataFrame {
    pub fn from_buffer(buffer: &TupleBuffer) -> DataFrame {
        DataFrame {
            origin: buffer.origin(),
            sequence: buffer.sequence_number(),
            watermark: buffer.watermark(),
            creation_ts: buffer.creation_ts(),
            tuple_count: buffer.tuple_count(),
            payload: buffer.data_bytes(),
            children: buffer.children().to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WireMessage {
    /// Downstream receiver announces the partition it wants to feed.
    Announce(Partition),
    ServerReady,
    Error(String),
    Data(DataFrame),
    Event(EventKind),
    EndOfStream(TerminationType),
}

impl WireMessage {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(64);
        body.put_u32_le(MAGIC);
        match self {
            WireMessage::Announce(p) => {
                body.put_u8(MSG_ANNOUNCE);
                body.put_u64_le(p.subplan.raw());
                body.put_u64_le(p.operator.raw());
                body.put_u64_le(p.partition.raw());
            }
            WireMessage::ServerReady => body.put_u8(MSG_SERVER_READY),
            WireMessage::Error(msg) => {
                body.put_u8(MSG_ERROR);
                body.put_u32_le(msg.len() as u32);
                body.put_slice(msg.as_bytes());
            }
            WireMessage::Data(frame) => {
                body.put_u8(MSG_DATA);
                body.put_u64_le(frame.origin.raw());
                body.put_u64_le(frame.sequence);
                body.put_u64_le(frame.watermark);
                body.put_u64_le(frame.creation_ts);
                body.put_u32_le(frame.tuple_count);
                body.put_u32_le(frame.payload.len() as u32);
                body.put_u32_le(frame.children.len() as u32);
                body.put_slice(&frame.payload);
                for child in &frame.children {
                    body.put_u32_le(child.len() as u32);
                    body.put_slice(child);
                }
            }
            WireMessage::Event(event) => {
                body.put_u8(MSG_EVENT);
                match event {
                    EventKind::SourceStart => body.put_u8(EVENT_SOURCE_START),
                    EventKind::EpochBarrier {
                        timestamp,
                        query_id,
                    } => {
                        body.put_u8(EVENT_EPOCH_BARRIER);
                        body.put_u64_le(*timestamp);
                        body.put_u64_le(*query_id);
                    }
                    EventKind::Custom(code) => {
                        body.put_u8(EVENT_CUSTOM);
                        body.put_u32_le(*code);
                    }
                }
            }
            WireMessage::EndOfStream(termination) => {
                body.put_u8(MSG_EOS);
                body.put_u8(match termination {
                    TerminationType::Graceful => TERM_GRACEFUL,
                    TerminationType::HardStop => TERM_HARD,
                    TerminationType::Failure => TERM_FAILURE,
                });
            }
        }
        let mut framed = BytesMut::with_capacity(4 + body.len());
        framed.put_u32_le(body.len() as u32);
        framed.extend_from_slice(&body);
        framed.freeze()
    }

    pub fn decode(mut body: Bytes) -> NetResult<WireMessage> {
        if body.remaining() < 5 {
            return Err(NetError::BadMagic(0));
        }
        let magic = body.get_u32_le();
        if magic != MAGIC {
            return Err(NetError::BadMagic(magic));
        }
        let msg_type = body.get_u8();
        match msg_type {
            MSG_ANNOUNCE => {
                if body.remaining() < 24 {
                    return Err(NetError::Corrupt("announce body"));
                }
                let subplan = SubPlanId::new(body.get_u64_le());
                let operator = OperatorId::new(body.get_u64_le());
                let partition = PartitionId::new(body.get_u64_le());
                Ok(WireMessage::Announce(Partition::new(
                    subplan, operator, partition,
                )))
            }
            MSG_SERVER_READY => Ok(WireMessage::ServerReady),
            MSG_ERROR => {
                if body.remaining() < 4 {
                    return Err(NetError::Corrupt("error length"));
                }
                let len = body.get_u32_le() as usize;
                if body.remaining() < len {
                    return Err(NetError::Corrupt("error text"));
                }
                let msg = String::from_utf8_lossy(&body.copy_to_bytes(len)).into_owned();
                Ok(WireMessage::Error(msg))
            }
            MSG_DATA => {
                if body.remaining() < 8 * 4 + 4 * 3 {
                    return Err(NetError::Corrupt("data header"));
                }
                let origin = OriginId::new(body.get_u64_le());
                let sequence = body.get_u64_le();
                let watermark = body.get_u64_le();
                let creation_ts = body.get_u64_le();
                let tuple_count = body.get_u32_le();
                let payload_size = body.get_u32_le() as usize;
                let num_children = body.get_u32_le() as usize;
                if body.remaining() < payload_size {
                    return Err(NetError::Corrupt("data payload"));
                }
                let payload = body.copy_to_bytes(payload_size);
                let mut children = Vec::with_capacity(num_children);
                for _ in 0..num_children {
                    if body.remaining() < 4 {
                        return Err(NetError::Corrupt("child header"));
                    }
                    let size = body.get_u32_le() as usize;
                    if body.remaining() < size {
                        return Err(NetError::Corrupt("child payload"));
                    }
                    children.push(body.copy_to_bytes(size));
                }
                Ok(WireMessage::Data(DataFrame {
                    origin,
                    sequence,
                    watermark,
                    creation_ts,
                    tuple_count,
                    payload,
                    children,
                }))
            }
            MSG_EVENT => {
                if body.remaining() < 1 {
                    return Err(NetError::Corrupt("event type"));
                }
                let event_type = body.get_u8();
                let event = match event_type {
                    EVENT_SOURCE_START => EventKind::SourceStart,
                    EVENT_EPOCH_BARRIER => {
                        if body.remaining() < 16 {
                            return Err(NetError::Corrupt("epoch barrier body"));
                        }
                        EventKind::EpochBarrier {
                            timestamp: body.get_u64_le(),
                            query_id: body.get_u64_le(),
                        }
                    }
                    EVENT_CUSTOM => {
                        if body.remaining() < 4 {
                            return Err(NetError::Corrupt("custom event body"));
                        }
                        EventKind::Custom(body.get_u32_le())
                    }
                    other => return Err(NetError::UnknownMessageType(other)),
                };
                Ok(WireMessage::Event(event))
            }
            MSG_EOS => {
                if body.remaining() < 1 {
                    return Err(NetError::Corrupt("eos body"));
                }
                let termination = match body.get_u8() {
                    TERM_GRACEFUL => TerminationType::Graceful,
                    TERM_HARD => TerminationType::HardStop,
                    TERM_FAILURE => TerminationType::Failure,
                    other => return Err(NetError::UnknownMessageType(other)),
                };
                Ok(WireMessage::EndOfStream(termination))
            }
            other => Err(NetError::UnknownMessageType(other)),
        }
    }
}

/// Read one frame; `Ok(None)` is a clean remote close at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> NetResult<Option<WireMessage>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME {
        return Err(NetError::BadMagic(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    WireMessage::decode(Bytes::from(body)).map(Some)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &WireMessage,
) -> NetResult<()> {
    writer.write_all(&message.encode()).await?;
    Ok(())
}
