//! # DriftMQ Wire Protocol
//!
//! Binary framing shared by the broker and the client. Every frame starts with
//! an 8-byte big-endian header followed by a type-specific payload:
//!
//! ```text
//! +-----------+-----------+----------------+------------------+
//! | type: u16 | vers: u16 | payload_len:u32| payload ...      |
//! +-----------+-----------+----------------+------------------+
//! ```
//!
//! Variable-length fields (topics, message bodies) carry a `u32` length prefix;
//! fixed-width fields do not.
//!
//! | Frame | Payload |
//! |---|---|
//! | ATTACH | flags:u16 (bit 15 = use offset), topic, offset:u64 |
//! | ATTACHED | topic, offset:u64 |
//! | DETACH / DETACHED | topic |
//! | PUBLISH | topic, seq:u64, payload |
//! | ACK | seq:u64 (cumulative) |
//! | DATA | topic, offset:u64, payload |
//! | PING / PONG | timestamp:i64 (ms) |
//!
//! ## Modules
//!
//! - [`messages`] - Frame and command types plus payload encoding
//! - [`codec`] - `tokio_util` codecs for streaming decode over any transport

pub mod codec;
pub mod messages;
pub mod tests;

pub use codec::{CodecError, CommandCodec, FrameCodec, DEFAULT_MAX_FRAME_SIZE};
pub use messages::*;
