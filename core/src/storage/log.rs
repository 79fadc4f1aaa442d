use super::index::RecordIndex;
use super::segment::{record_header, Segment, SegmentSync};
use super::{StorageError, StorageResult, RECORD_HEADER_LEN};
use crate::protocol::Offset;
use bytes::{BufMut, Bytes, BytesMut};
use memmap2::MmapOptions;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Segment file extension
pub const SEGMENT_SUFFIX: &str = "log";

/// File name for the segment starting at `base_offset`: `{base_offset:020}.log`
pub fn segment_file_name(base_offset: Offset) -> String {
    format!("{:020}.{}", base_offset, SEGMENT_SUFFIX)
}

/// Parse the base offset back out of a segment file path
pub fn parse_segment_file_name(path: &Path) -> Option<Offset> {
    if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_SUFFIX) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<Offset>().ok())
}

/// File-backed segment.
///
/// Appended records are buffered in memory until [`Segment::flush`] writes the
/// buffered tail to the file. Flushes always move whole records, so a record
/// is either entirely in the file or entirely in the buffer. Durability comes
/// from syncing the [`SegmentSync`] a flush hands back.
#[derive(Debug)]
pub struct FileSegment {
    path: PathBuf,
    base_offset: Offset,
    file: Mutex<File>,
    /// Bytes written to the file
    flushed: u64,
    /// Records appended since the last flush
    pending: BytesMut,
    index: RecordIndex,
}

impl FileSegment {
    /// Create an empty segment file in `dir`
    pub fn create<P: AsRef<Path>>(dir: P, base_offset: Offset) -> StorageResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(segment_file_name(base_offset));

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        debug!("Created segment {}", path.display());

        Ok(Self {
            path,
            base_offset,
            file: Mutex::new(file),
            flushed: 0,
            pending: BytesMut::new(),
            index: RecordIndex::new(),
        })
    }

    /// Open an existing segment file, rebuilding its record index.
    ///
    /// A torn record at the tail (crash during a write) is truncated away.
    pub fn open<P: AsRef<Path>>(path: P, base_offset: Offset) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let (index, valid_len) = Self::scan_records(&file)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                "Truncating torn record in {} ({} -> {} bytes)",
                path.display(),
                file_len,
                valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        debug!(
            "Recovered segment {} with {} records ({} bytes)",
            path.display(),
            index.len(),
            valid_len
        );

        Ok(Self {
            path,
            base_offset,
            file: Mutex::new(file),
            flushed: valid_len,
            pending: BytesMut::new(),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk length prefixes from the start of the file. Returns the index and
    /// the length of the prefix made of complete records.
    fn scan_records(file: &File) -> StorageResult<(RecordIndex, u64)> {
        let mut index = RecordIndex::new();
        if file.metadata()?.len() == 0 {
            return Ok((index, 0));
        }

        // SAFETY: the mapping is read-only, dropped before this function
        // returns, and the segment file is only written through this process.
        let mmap = unsafe { MmapOptions::new().map(file)? };
        let mut pos = 0usize;

        while pos + RECORD_HEADER_LEN <= mmap.len() {
            let len = u32::from_be_bytes([mmap[pos], mmap[pos + 1], mmap[pos + 2], mmap[pos + 3]])
                as usize;
            let next = pos + RECORD_HEADER_LEN + len;
            if next > mmap.len() {
                break;
            }
            index.push(pos as u64);
            pos = next;
        }

        Ok((index, pos as u64))
    }

    fn read_from_file(&self, position: u64) -> StorageResult<Bytes> {
        let corrupt = |reason: &str| StorageError::Corrupt {
            segment: self.base_offset,
            position,
            reason: reason.to_string(),
        };

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(position))?;

        let mut header = [0u8; RECORD_HEADER_LEN];
        file.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header) as u64;
        if position + RECORD_HEADER_LEN as u64 + len > self.flushed {
            return Err(corrupt("record body past flushed end of segment"));
        }

        let mut body = vec![0u8; len as usize];
        file.read_exact(&mut body)?;
        Ok(Bytes::from(body))
    }

    fn read_from_pending(&self, position: u64) -> StorageResult<Bytes> {
        let corrupt = |reason: &str| StorageError::Corrupt {
            segment: self.base_offset,
            position,
            reason: reason.to_string(),
        };

        let start = (position - self.flushed) as usize;
        if start + RECORD_HEADER_LEN > self.pending.len() {
            return Err(corrupt("record header past end of segment"));
        }
        let header: [u8; RECORD_HEADER_LEN] = [
            self.pending[start],
            self.pending[start + 1],
            self.pending[start + 2],
            self.pending[start + 3],
        ];
        let len = u32::from_be_bytes(header) as usize;
        let body = start + RECORD_HEADER_LEN;
        if body + len > self.pending.len() {
            return Err(corrupt("record body past end of segment"));
        }
        Ok(Bytes::copy_from_slice(&self.pending[body..body + len]))
    }
}

impl Segment for FileSegment {
    fn base_offset(&self) -> Offset {
        self.base_offset
    }

    fn size(&self) -> u64 {
        self.flushed + self.pending.len() as u64
    }

    fn index(&self) -> &RecordIndex {
        &self.index
    }

    fn append(&mut self, payload: &[u8]) -> StorageResult<()> {
        let header = record_header(payload)?;
        let position = self.size();
        self.pending.reserve(RECORD_HEADER_LEN + payload.len());
        self.pending.put_slice(&header);
        self.pending.put_slice(payload);
        self.index.push(position);
        Ok(())
    }

    fn read_record(&self, position: u64) -> StorageResult<Bytes> {
        if position >= self.flushed {
            self.read_from_pending(position)
        } else {
            self.read_from_file(position)
        }
    }

    fn flush(&mut self) -> StorageResult<Option<SegmentSync>> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let file = self.file.get_mut();
        file.seek(SeekFrom::Start(self.flushed))?;
        file.write_all(&self.pending)?;
        let sync = SegmentSync::new(file.try_clone()?);

        self.flushed += self.pending.len() as u64;
        self.pending.clear();
        Ok(Some(sync))
    }
}
