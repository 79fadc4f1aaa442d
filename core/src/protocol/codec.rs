use super::messages::{Command, Frame, FrameType, FRAME_HEADER_LEN, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Largest payload accepted by default (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame payload of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Truncated {frame:?} frame while reading {field}")]
    Truncated {
        frame: FrameType,
        field: &'static str,
    },

    #[error("Field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("{count} unexpected trailing bytes in {frame:?} frame")]
    TrailingBytes { frame: FrameType, count: usize },

    #[error("Field {field} of {len} bytes does not fit a u32 length prefix")]
    FieldTooLarge { field: &'static str, len: usize },
}

/// Streaming codec for raw frames.
///
/// A frame is split off the read buffer only once the full header and payload
/// are buffered; partial frames stay in the buffer for the next read.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        // Peek at the header without consuming it
        let mut header = &src[..FRAME_HEADER_LEN];
        let frame_type = header.get_u16();
        let version = header.get_u16();
        let payload_len = header.get_u32() as usize;

        if payload_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        let total_len = FRAME_HEADER_LEN + payload_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame {
            frame_type,
            version,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        if frame.payload.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: frame.payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(frame.encoded_len());
        dst.put_u16(frame.frame_type);
        dst.put_u16(frame.version);
        dst.put_u32(frame.payload.len() as u32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

/// Typed codec used by both the broker and the client.
///
/// Frames with an unknown type are skipped, not reported.
#[derive(Debug, Clone, Default)]
pub struct CommandCodec {
    frames: FrameCodec,
}

impl CommandCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            frames: FrameCodec::new(max_frame_size),
        }
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, CodecError> {
        while let Some(frame) = self.frames.decode(src)? {
            match Command::decode(&frame)? {
                Some(command) => return Ok(Some(command)),
                None => trace!(
                    frame_type = frame.frame_type,
                    len = frame.payload.len(),
                    "Skipping frame of unknown type"
                ),
            }
        }
        Ok(None)
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = CodecError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload_len = command.payload_len();
        if payload_len > self.frames.max_frame_size() {
            return Err(CodecError::FrameTooLarge {
                size: payload_len,
                max: self.frames.max_frame_size(),
            });
        }

        // Encode straight into the output buffer; no intermediate frame
        dst.reserve(FRAME_HEADER_LEN + payload_len);
        dst.put_u16(command.frame_type().code());
        dst.put_u16(PROTOCOL_VERSION);
        dst.put_u32(payload_len as u32);
        let start = dst.len();
        if let Err(e) = command.encode_payload(dst) {
            dst.truncate(start - FRAME_HEADER_LEN);
            return Err(e);
        }
        debug_assert_eq!(dst.len() - start, payload_len);
        Ok(())
    }
}
