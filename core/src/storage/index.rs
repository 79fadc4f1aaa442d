/// In-memory index of record start positions within one segment.
///
/// Positions are relative to the segment's base offset and strictly
/// increasing, so lookups are a binary search. Every record is indexed: the
/// commit log needs exact record boundaries to round an arbitrary offset up
/// to the next record.
#[derive(Debug, Clone, Default)]
pub struct RecordIndex {
    starts: Vec<u64>,
}

impl RecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new entry. Callers append in position order.
    pub fn push(&mut self, position: u64) {
        debug_assert!(self.starts.last().map_or(true, |&last| last < position));
        self.starts.push(position);
    }

    /// First record boundary at or after `position`
    pub fn first_at_or_after(&self, position: u64) -> Option<u64> {
        let idx = self.starts.partition_point(|&start| start < position);
        self.starts.get(idx).copied()
    }

    pub fn first(&self) -> Option<u64> {
        self.starts.first().copied()
    }

    pub fn last(&self) -> Option<u64> {
        self.starts.last().copied()
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}
