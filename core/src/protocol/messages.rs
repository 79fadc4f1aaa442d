use super::codec::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::SystemTime;

pub type TopicName = String;
pub type Offset = u64;
pub type SeqNum = u64;

/// Version stamped into every frame header. Receivers do not validate it yet.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the fixed frame header: type, version, payload length.
pub const FRAME_HEADER_LEN: usize = 8;

/// ATTACH flag bit asking the broker to replay from the supplied offset.
pub const ATTACH_FLAG_USE_OFFSET: u16 = 1 << 15;

/// Frame type codes carried in the first header field.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Attach = 1,
    Attached = 2,
    Detach = 3,
    Detached = 4,
    Publish = 5,
    Ack = 6,
    Data = 7,
    Ping = 8,
    Pong = 9,
}

impl FrameType {
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::Attach),
            2 => Some(Self::Attached),
            3 => Some(Self::Detach),
            4 => Some(Self::Detached),
            5 => Some(Self::Publish),
            6 => Some(Self::Ack),
            7 => Some(Self::Data),
            8 => Some(Self::Ping),
            9 => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

/// A raw protocol frame: header fields plus an opaque payload.
///
/// The framing layer never interprets the payload, so frames of unknown type
/// pass through it untouched and are dropped at dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u16,
    pub version: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: u16, payload: Bytes) -> Self {
        Self {
            frame_type,
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Total encoded size including the header
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }
}

/// A message stored in a topic and delivered to subscribers.
///
/// `offset` is the end position of the message's record in the topic log,
/// which is also the point a consumer resumes from after receiving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: TopicName,
    pub payload: Bytes,
    pub offset: Offset,
}

impl Message {
    pub fn new<T: Into<TopicName>, P: Into<Bytes>>(topic: T, payload: P, offset: Offset) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            offset,
        }
    }
}

/// Typed protocol commands exchanged between client and broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Subscribe to a topic, optionally replaying from `offset`
    Attach {
        topic: TopicName,
        offset: Option<Offset>,
    },
    /// Subscription established; `offset` is where to resume from next time
    Attached { topic: TopicName, offset: Offset },
    Detach { topic: TopicName },
    Detached { topic: TopicName },
    Publish {
        topic: TopicName,
        seq: SeqNum,
        payload: Bytes,
    },
    /// Cumulative acknowledgement of every publish up to and including `seq`
    Ack { seq: SeqNum },
    Data {
        topic: TopicName,
        offset: Offset,
        payload: Bytes,
    },
    Ping { timestamp: i64 },
    Pong { timestamp: i64 },
}

impl Command {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Command::Attach { .. } => FrameType::Attach,
            Command::Attached { .. } => FrameType::Attached,
            Command::Detach { .. } => FrameType::Detach,
            Command::Detached { .. } => FrameType::Detached,
            Command::Publish { .. } => FrameType::Publish,
            Command::Ack { .. } => FrameType::Ack,
            Command::Data { .. } => FrameType::Data,
            Command::Ping { .. } => FrameType::Ping,
            Command::Pong { .. } => FrameType::Pong,
        }
    }

    /// Build a DATA command for a stored message
    pub fn data(message: Message) -> Self {
        Command::Data {
            topic: message.topic,
            offset: message.offset,
            payload: message.payload,
        }
    }

    /// Exact number of payload bytes this command encodes to
    pub fn payload_len(&self) -> usize {
        match self {
            Command::Attach { topic, .. } => 2 + 4 + topic.len() + 8,
            Command::Attached { topic, .. } => 4 + topic.len() + 8,
            Command::Detach { topic } | Command::Detached { topic } => 4 + topic.len(),
            Command::Publish { topic, payload, .. } | Command::Data { topic, payload, .. } => {
                4 + topic.len() + 8 + 4 + payload.len()
            }
            Command::Ack { .. } | Command::Ping { .. } | Command::Pong { .. } => 8,
        }
    }

    /// Write the payload fields (no header) into `dst`
    pub fn encode_payload(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(self.payload_len());
        match self {
            Command::Attach { topic, offset } => {
                let flags = if offset.is_some() {
                    ATTACH_FLAG_USE_OFFSET
                } else {
                    0
                };
                dst.put_u16(flags);
                put_len_prefixed(dst, "topic", topic.as_bytes())?;
                dst.put_u64(offset.unwrap_or(0));
            }
            Command::Attached { topic, offset } => {
                put_len_prefixed(dst, "topic", topic.as_bytes())?;
                dst.put_u64(*offset);
            }
            Command::Detach { topic } | Command::Detached { topic } => {
                put_len_prefixed(dst, "topic", topic.as_bytes())?;
            }
            Command::Publish {
                topic,
                seq,
                payload,
            } => {
                put_len_prefixed(dst, "topic", topic.as_bytes())?;
                dst.put_u64(*seq);
                put_len_prefixed(dst, "payload", payload)?;
            }
            Command::Ack { seq } => dst.put_u64(*seq),
            Command::Data {
                topic,
                offset,
                payload,
            } => {
                put_len_prefixed(dst, "topic", topic.as_bytes())?;
                dst.put_u64(*offset);
                put_len_prefixed(dst, "payload", payload)?;
            }
            Command::Ping { timestamp } | Command::Pong { timestamp } => dst.put_i64(*timestamp),
        }
        Ok(())
    }

    /// Decode a frame's payload.
    ///
    /// Returns `Ok(None)` for frame types this version does not know, so newer
    /// peers can add types without breaking older ones.
    pub fn decode(frame: &Frame) -> Result<Option<Command>, CodecError> {
        let Some(frame_type) = FrameType::from_u16(frame.frame_type) else {
            return Ok(None);
        };

        let mut reader = PayloadReader::new(frame_type, frame.payload.clone());
        let command = match frame_type {
            FrameType::Attach => {
                let flags = reader.u16("flags")?;
                let topic = reader.string("topic")?;
                let offset = reader.u64("offset")?;
                Command::Attach {
                    topic,
                    offset: (flags & ATTACH_FLAG_USE_OFFSET != 0).then_some(offset),
                }
            }
            FrameType::Attached => Command::Attached {
                topic: reader.string("topic")?,
                offset: reader.u64("offset")?,
            },
            FrameType::Detach => Command::Detach {
                topic: reader.string("topic")?,
            },
            FrameType::Detached => Command::Detached {
                topic: reader.string("topic")?,
            },
            FrameType::Publish => Command::Publish {
                topic: reader.string("topic")?,
                seq: reader.u64("seq")?,
                payload: reader.bytes("payload")?,
            },
            FrameType::Ack => Command::Ack {
                seq: reader.u64("seq")?,
            },
            FrameType::Data => Command::Data {
                topic: reader.string("topic")?,
                offset: reader.u64("offset")?,
                payload: reader.bytes("payload")?,
            },
            FrameType::Ping => Command::Ping {
                timestamp: reader.i64("timestamp")?,
            },
            FrameType::Pong => Command::Pong {
                timestamp: reader.i64("timestamp")?,
            },
        };
        reader.finish()?;
        Ok(Some(command))
    }
}

/// Milliseconds since the Unix epoch, used for PING timestamps
pub fn timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn put_len_prefixed(dst: &mut BytesMut, field: &'static str, data: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(data.len()).map_err(|_| CodecError::FieldTooLarge {
        field,
        len: data.len(),
    })?;
    dst.put_u32(len);
    dst.extend_from_slice(data);
    Ok(())
}

/// Bounds-checked cursor over a frame payload
struct PayloadReader {
    frame_type: FrameType,
    buf: Bytes,
}

impl PayloadReader {
    fn new(frame_type: FrameType, buf: Bytes) -> Self {
        Self { frame_type, buf }
    }

    fn need(&self, field: &'static str, len: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < len {
            return Err(CodecError::Truncated {
                frame: self.frame_type,
                field,
            });
        }
        Ok(())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        self.need(field, 2)?;
        Ok(self.buf.get_u16())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, CodecError> {
        self.need(field, 8)?;
        Ok(self.buf.get_u64())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, CodecError> {
        self.need(field, 8)?;
        Ok(self.buf.get_i64())
    }

    fn bytes(&mut self, field: &'static str) -> Result<Bytes, CodecError> {
        self.need(field, 4)?;
        let len = self.buf.get_u32() as usize;
        self.need(field, len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        let raw = self.bytes(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { field })
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.buf.has_remaining() {
            return Err(CodecError::TrailingBytes {
                frame: self.frame_type,
                count: self.buf.remaining(),
            });
        }
        Ok(())
    }
}
