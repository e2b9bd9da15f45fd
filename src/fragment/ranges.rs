//! Received byte-range bookkeeping for reassembly buffers.
//!
//! [`ReceivedRanges`] stores a sorted list of disjoint, non-adjacent
//! half-open intervals. Inserting a range merges it with every interval it
//! touches, so the list never contains two overlapping entries no matter how
//! fragments overlap or repeat on the wire.

use std::ops::Range;

/// Sorted set of disjoint half-open byte intervals.
///
/// # Examples
///
/// ```
/// use fragmentation::fragment::ReceivedRanges;
/// let mut ranges = ReceivedRanges::new();
/// ranges.insert(10..20);
/// ranges.insert(0..10);
/// assert!(ranges.covers(&(0..20)));
/// assert!(ranges.is_complete(20));
/// assert_eq!(ranges.intervals().len(), 1);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceivedRanges {
    intervals: Vec<Range<usize>>,
}

impl ReceivedRanges {
    /// Create an empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }

    /// Borrow the recorded intervals in ascending order.
    #[must_use]
    pub fn intervals(&self) -> &[Range<usize>] { &self.intervals }

    /// Total number of bytes covered.
    #[must_use]
    pub fn covered_len(&self) -> usize { self.intervals.iter().map(ExactSizeIterator::len).sum() }

    /// Whether every byte of `range` is already covered.
    ///
    /// Empty ranges are trivially covered.
    #[must_use]
    pub fn covers(&self, range: &Range<usize>) -> bool {
        if range.is_empty() {
            return true;
        }
        let idx = self.intervals.partition_point(|iv| iv.end < range.end);
        self.intervals
            .get(idx)
            .is_some_and(|iv| iv.start <= range.start && range.end <= iv.end)
    }

    /// Whether the set covers exactly `[0, total)`.
    #[must_use]
    pub fn is_complete(&self, total: usize) -> bool {
        match self.intervals.as_slice() {
            [] => total == 0,
            [only] => only.start == 0 && only.end >= total,
            _ => false,
        }
    }

    /// Record `range` as received, returning the number of newly covered bytes.
    pub fn insert(&mut self, range: Range<usize>) -> usize {
        if range.is_empty() {
            return 0;
        }
        let before = self.covered_len();

        // First interval that could touch `range` (end >= start keeps adjacency).
        let first = self.intervals.partition_point(|iv| iv.end < range.start);
        // One past the last interval that starts at or before `range.end`.
        let last = self.intervals.partition_point(|iv| iv.start <= range.end);

        let merged = if first < last {
            let start = self.intervals[first].start.min(range.start);
            let end = self.intervals[last - 1].end.max(range.end);
            start..end
        } else {
            range
        };
        self.intervals.splice(first..last, std::iter::once(merged));

        self.covered_len() - before
    }
}
