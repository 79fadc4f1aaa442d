use super::log::{parse_segment_file_name, FileSegment};
use super::segment::{MemorySegment, Segment, SegmentSync};
use super::{StorageError, StorageResult, RECORD_HEADER_LEN};
use crate::protocol::Offset;
use bytes::Bytes;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Append-only, offset-addressed log for a single topic.
///
/// Offsets are absolute byte positions: a segment's base offset is the log end
/// at the moment it was created, and every record's offset is the position
/// just past its last byte. [`CommitLog::append`] returns that end offset and
/// [`CommitLog::lookup`] accepts any position, rounding up to the next record
/// boundary.
#[derive(Debug)]
pub struct CommitLog {
    dir: Option<PathBuf>,
    segment_size: u64,
    state: RwLock<LogState>,
}

#[derive(Debug)]
struct LogState {
    segments: Vec<Box<dyn Segment>>,
    end_offset: Offset,
}

impl CommitLog {
    /// Log whose segments live in RAM for the lifetime of the process
    pub fn in_memory(segment_size: u64) -> Self {
        Self {
            dir: None,
            segment_size,
            state: RwLock::new(LogState {
                segments: Vec::new(),
                end_offset: 0,
            }),
        }
    }

    /// Open (or create) a file-backed log in `dir`, recovering any segments
    /// already present.
    pub fn open<P: AsRef<Path>>(dir: P, segment_size: u64) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut segment_files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(base_offset) = parse_segment_file_name(&path) {
                segment_files.push((base_offset, path));
            }
        }
        segment_files.sort_by_key(|(base_offset, _)| *base_offset);

        let mut segments: Vec<Box<dyn Segment>> = Vec::with_capacity(segment_files.len());
        let mut end_offset = 0;
        for (base_offset, path) in segment_files {
            if !segments.is_empty() && base_offset < end_offset {
                return Err(StorageError::Corrupt {
                    segment: base_offset,
                    position: 0,
                    reason: format!("segment overlaps previous segment ending at {}", end_offset),
                });
            }
            let segment = FileSegment::open(&path, base_offset)?;
            end_offset = segment.end_offset();
            segments.push(Box::new(segment));
        }

        if !segments.is_empty() {
            info!(
                "Recovered {} segment(s) from {} (end offset {})",
                segments.len(),
                dir.display(),
                end_offset
            );
        }

        Ok(Self {
            dir: Some(dir),
            segment_size,
            state: RwLock::new(LogState {
                segments,
                end_offset,
            }),
        })
    }

    /// Append one record and return the new end-of-log offset.
    ///
    /// Rolls to a fresh segment first when the record would push the active
    /// segment past the configured size. A record larger than the segment size
    /// gets a segment of its own.
    pub fn append(&self, payload: &[u8]) -> StorageResult<Offset> {
        let record_len = (RECORD_HEADER_LEN + payload.len()) as u64;
        let mut rolled = None;

        let end_offset = {
            let mut state = self.state.write();

            let needs_roll = match state.segments.last() {
                None => true,
                Some(active) => {
                    !active.is_empty() && active.size() + record_len > self.segment_size
                }
            };
            if needs_roll {
                if let Some(active) = state.segments.last_mut() {
                    rolled = active.flush()?;
                }
                let segment = self.new_segment(state.end_offset)?;
                debug!("Rolled to segment at base offset {}", state.end_offset);
                state.segments.push(segment);
            }

            let active = state
                .segments
                .last_mut()
                .ok_or_else(|| StorageError::Corrupt {
                    segment: 0,
                    position: 0,
                    reason: "no active segment".to_string(),
                })?;
            active.append(payload)?;
            state.end_offset += record_len;
            state.end_offset
        };

        // fsync the retired segment after readers and appenders are released
        if let Some(sync) = rolled {
            sync.sync()?;
        }
        Ok(end_offset)
    }

    /// Find the first record starting at or after `offset`.
    ///
    /// Returns the payload together with the record's end offset, or `None`
    /// when `offset` is at or past the end of the log. Offsets older than the
    /// first retained segment round up to its first record.
    pub fn lookup(&self, offset: Offset) -> StorageResult<Option<(Bytes, Offset)>> {
        let state = self.state.read();
        if offset >= state.end_offset || state.segments.is_empty() {
            return Ok(None);
        }

        // Recent offsets are the common case, so scan newest first
        let start = state
            .segments
            .iter()
            .rposition(|segment| segment.base_offset() <= offset)
            .unwrap_or(0);

        for segment in &state.segments[start..] {
            let relative = offset.saturating_sub(segment.base_offset());
            if let Some(position) = segment.index().first_at_or_after(relative) {
                let payload = segment.read_record(position)?;
                let end = segment.base_offset()
                    + position
                    + RECORD_HEADER_LEN as u64
                    + payload.len() as u64;
                return Ok(Some((payload, end)));
            }
        }

        Ok(None)
    }

    /// Offset one past the last byte written
    pub fn end_offset(&self) -> Offset {
        self.state.read().end_offset
    }

    /// Base offset of the oldest retained segment
    pub fn start_offset(&self) -> Offset {
        let state = self.state.read();
        state
            .segments
            .first()
            .map_or(state.end_offset, |segment| segment.base_offset())
    }

    /// Persist buffered records of every segment. Only the writes to the
    /// segment files happen under the log lock; the fsyncs run after it is
    /// released.
    pub fn flush(&self) -> StorageResult<()> {
        let syncs = {
            let mut state = self.state.write();
            state
                .segments
                .iter_mut()
                .filter_map(|segment| segment.flush().transpose())
                .collect::<StorageResult<Vec<SegmentSync>>>()?
        };
        for sync in syncs {
            sync.sync()?;
        }
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    pub fn segment_offsets(&self) -> Vec<Offset> {
        self.state
            .read()
            .segments
            .iter()
            .map(|segment| segment.base_offset())
            .collect()
    }

    pub fn is_persistent(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn new_segment(&self, base_offset: Offset) -> StorageResult<Box<dyn Segment>> {
        Ok(match &self.dir {
            Some(dir) => Box::new(FileSegment::create(dir, base_offset)?),
            None => Box::new(MemorySegment::new(base_offset)),
        })
    }
}
