//! # DriftMQ Storage Module
//!
//! Per-topic commit logs made of length-prefixed records.
//!
//! ## Layout
//!
//! A topic's log is a sequence of segments. Each segment holds records encoded
//! as `[len: u32 BE][payload]` and is named after its base offset, the absolute
//! byte position at which it starts:
//!
//! ```text
//! data/
//!   orders/
//!     00000000000000000000.log
//!     00000000000067108866.log
//! ```
//!
//! Offsets are absolute byte positions across the whole log. A message's
//! offset is the position just past the end of its record, so the offset
//! returned from an append is also the point a consumer resumes from.
//!
//! ## Backends
//!
//! - [`MemorySegment`] keeps records in RAM; nothing survives a restart
//! - [`FileSegment`] buffers appends and writes them out on flush, leaving the
//!   fsync to the returned [`SegmentSync`]; opening an existing directory
//!   rebuilds the record index by scanning every segment
//!
//! ## Modules
//!
//! - [`commit_log`] - Segment rolling and offset lookup
//! - [`segment`] - Segment trait and the RAM backend
//! - [`log`] - File-backed segments and crash recovery
//! - [`index`] - Record boundary index

pub mod commit_log;
pub mod index;
pub mod log;
pub mod segment;

pub use commit_log::CommitLog;
pub use index::RecordIndex;
pub use log::FileSegment;
pub use segment::{MemorySegment, Segment, SegmentSync};

use crate::protocol::Offset;
use thiserror::Error;

/// Length prefix in front of every stored record
pub const RECORD_HEADER_LEN: usize = 4;

/// Default segment roll size (64 MiB)
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment contents do not match the record index
    #[error("Corrupt segment {segment} at position {position}: {reason}")]
    Corrupt {
        segment: Offset,
        position: u64,
        reason: String,
    },

    #[error("Record of {len} bytes exceeds the maximum record size")]
    RecordTooLarge { len: usize },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
