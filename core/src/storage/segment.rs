use super::index::RecordIndex;
use super::{StorageError, StorageResult, RECORD_HEADER_LEN};
use crate::protocol::Offset;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::fs::File;

/// A contiguous run of length-prefixed records starting at a base offset.
///
/// Records are laid out as `[len: u32 BE][payload: len bytes]` with no other
/// metadata. Positions passed to [`Segment::read_record`] are relative to the
/// segment base and must be record boundaries taken from [`Segment::index`].
pub trait Segment: Send + Sync + fmt::Debug {
    fn base_offset(&self) -> Offset;

    /// Bytes written to this segment, flushed or not
    fn size(&self) -> u64;

    fn index(&self) -> &RecordIndex;

    /// Append one record. The segment does not enforce a size limit; the
    /// commit log decides when to roll.
    fn append(&mut self, payload: &[u8]) -> StorageResult<()>;

    /// Read the payload of the record starting at relative `position`
    fn read_record(&self, position: u64) -> StorageResult<Bytes>;

    /// Write buffered records to the backing file. The returned handle makes
    /// them durable and should be synced once no log lock is held. RAM-backed
    /// segments have nothing to sync.
    fn flush(&mut self) -> StorageResult<Option<SegmentSync>>;

    fn end_offset(&self) -> Offset {
        self.base_offset() + self.size()
    }

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Outstanding fsync for records already written to a segment file
#[derive(Debug)]
pub struct SegmentSync {
    file: File,
}

impl SegmentSync {
    pub(crate) fn new(file: File) -> Self {
        Self { file }
    }

    pub fn sync(self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Encode the record length prefix, rejecting payloads a u32 cannot describe
pub(crate) fn record_header(payload: &[u8]) -> StorageResult<[u8; RECORD_HEADER_LEN]> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::RecordTooLarge { len: payload.len() })?;
    Ok(len.to_be_bytes())
}

/// Segment kept entirely in RAM for the lifetime of the process.
#[derive(Debug)]
pub struct MemorySegment {
    base_offset: Offset,
    data: BytesMut,
    index: RecordIndex,
}

impl MemorySegment {
    pub fn new(base_offset: Offset) -> Self {
        Self {
            base_offset,
            data: BytesMut::new(),
            index: RecordIndex::new(),
        }
    }
}

impl Segment for MemorySegment {
    fn base_offset(&self) -> Offset {
        self.base_offset
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn index(&self) -> &RecordIndex {
        &self.index
    }

    fn append(&mut self, payload: &[u8]) -> StorageResult<()> {
        let header = record_header(payload)?;
        let position = self.size();
        self.data.reserve(RECORD_HEADER_LEN + payload.len());
        self.data.put_slice(&header);
        self.data.put_slice(payload);
        self.index.push(position);
        Ok(())
    }

    fn read_record(&self, position: u64) -> StorageResult<Bytes> {
        let start = position as usize;
        let corrupt = |reason: &str| StorageError::Corrupt {
            segment: self.base_offset,
            position,
            reason: reason.to_string(),
        };

        if start + RECORD_HEADER_LEN > self.data.len() {
            return Err(corrupt("record header past end of segment"));
        }
        let len = (&self.data[start..start + RECORD_HEADER_LEN]).get_u32() as usize;
        let body = start + RECORD_HEADER_LEN;
        if body + len > self.data.len() {
            return Err(corrupt("record body past end of segment"));
        }
        Ok(Bytes::copy_from_slice(&self.data[body..body + len]))
    }

    fn flush(&mut self) -> StorageResult<Option<SegmentSync>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_segment_layout() {
        let mut segment = MemorySegment::new(100);
        segment.append(b"foo").unwrap();
        segment.append(b"").unwrap();
        segment.append(b"barbaz").unwrap();

        assert_eq!(segment.size(), 7 + 4 + 10);
        assert_eq!(segment.end_offset(), 121);
        assert_eq!(segment.index().len(), 3);
        assert_eq!(segment.index().first_at_or_after(1), Some(7));

        assert_eq!(segment.read_record(0).unwrap(), Bytes::from_static(b"foo"));
        assert_eq!(segment.read_record(7).unwrap(), Bytes::new());
        assert_eq!(segment.read_record(11).unwrap(), Bytes::from_static(b"barbaz"));
    }

    #[test]
    fn test_read_past_end_is_corrupt() {
        let mut segment = MemorySegment::new(0);
        segment.append(b"abc").unwrap();
        assert!(matches!(
            segment.read_record(7),
            Err(StorageError::Corrupt { position: 7, .. })
        ));
    }
}
