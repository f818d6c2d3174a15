use std::collections::BTreeSet;

/// Sorted set of acknowledged offsets for one topic partition.
///
/// Acks arrive in any order and may repeat; duplicates collapse on insert.
/// Commit advancement walks the longest run of consecutive offsets anchored
/// right above the committed watermark, so a gap stalls progress until the
/// missing offsets are acked.
#[derive(Debug, Default)]
pub struct AckSet {
    offsets: BTreeSet<i64>,
}

impl AckSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an ack. Returns false if the offset was already present.
    pub fn insert(&mut self, offset: i64) -> bool {
        self.offsets.insert(offset)
    }

    /// Highest offset that may be committed, given the last committed offset
    /// for the partition.
    ///
    /// The committable run starts at `committed + 1`, or at the lowest acked
    /// offset when nothing has been committed yet this session:
    ///
    ///   committed=36, acked=[40, 41]        -> None (gap at 37)
    ///   committed=36, acked=[37, 38, 40]    -> Some(38)
    ///   committed=None, acked=[0, 1, 2, 5]  -> Some(2)
    pub fn committable(&self, committed: Option<i64>) -> Option<i64> {
        let start = match committed {
            Some(c) => c + 1,
            None => *self.offsets.first()?,
        };
        let mut last = None;
        let mut expected = start;
        for &offset in self.offsets.range(start..) {
            if offset != expected {
                break;
            }
            last = Some(offset);
            expected = offset + 1;
        }
        last
    }

    /// Drops every offset at or below `offset`: the committed prefix once a
    /// commit succeeded, or stale acks that regressed behind the watermark.
    pub fn collapse_through(&mut self, offset: i64) {
        self.offsets = self.offsets.split_off(&(offset + 1));
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.offsets.iter().copied()
    }
}
