//! Sequence tracker
//!
//! An interval set over the per-partition sequence space recording which
//! sequence numbers have been buffered. Ranges are closed, disjoint and never
//! touch: adding `[5,9]` next to `[1,4]` yields the single range `[1,9]`.
//!
//! The region past the last tracked sequence is "not yet known" rather than a
//! gap: a tracker covering `[1,100]` reports no gap at 150, because rows beyond
//! its end are expected to arrive. Only holes between ranges, and the region
//! before the first range, are gaps.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;

/// Lowest valid sequence number.
pub const MIN_SEQNO: u64 = 1;

/// Sentinel for "no known upper bound". Kept at `i64::MAX` so `+ 1` never
/// overflows in range arithmetic.
pub const INFINITE_SEQNO: u64 = i64::MAX as u64;

/// Serialized size of the range count prefix.
const COUNT_SIZE: usize = 4;
/// Serialized size of one `(start, end)` pair.
const RANGE_SIZE: usize = 16;

/// Set of disjoint closed sequence ranges, ordered by start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    /// start -> end (inclusive)
    ranges: BTreeMap<u64, u64>,
}

impl SequenceTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker holding a single range
    pub fn with_range(start: u64, end: u64) -> Self {
        let mut tracker = Self::new();
        tracker.add_range(start, end);
        tracker
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// First tracked sequence number
    pub fn first_seq(&self) -> Option<u64> {
        self.ranges.first_key_value().map(|(start, _)| *start)
    }

    /// Last tracked sequence number
    pub fn last_seq(&self) -> Option<u64> {
        self.ranges.last_key_value().map(|(_, end)| *end)
    }

    /// End of the first range: no gap exists at or below this point.
    pub fn safe_point(&self) -> Option<u64> {
        self.ranges.first_key_value().map(|(_, end)| *end)
    }

    /// Total number of tracked sequence numbers
    pub fn sequence_count(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |acc, (start, end)| acc.saturating_add(end - start + 1))
    }

    /// Iterate over `(start, end)` ranges in ascending order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(start, end)| (*start, *end))
    }

    /// Add `[start, end]` to the set.
    ///
    /// Returns how many sequence numbers were not already covered. Adding the
    /// same range twice is a no-op the second time.
    pub fn add_range(&mut self, start: u64, end: u64) -> u64 {
        let end = end.min(INFINITE_SEQNO);
        if start > end {
            return 0;
        }

        let mut merged_start = start;
        let mut merged_end = end;
        let mut overlapped = 0u64;
        let mut absorbed = Vec::new();

        // Every range that overlaps or touches [start, end] has a start at or
        // below end + 1; walk them backwards until one ends before start - 1.
        for (&s, &e) in self.ranges.range(..=end.saturating_add(1)).rev() {
            if e.saturating_add(1) < start {
                break;
            }
            let lo = s.max(start);
            let hi = e.min(end);
            if lo <= hi {
                overlapped += hi - lo + 1;
            }
            merged_start = merged_start.min(s);
            merged_end = merged_end.max(e);
            absorbed.push(s);
        }

        for s in absorbed {
            self.ranges.remove(&s);
        }
        self.ranges.insert(merged_start, merged_end);

        (end - start + 1) - overlapped
    }

    /// Append `[start, end]` strictly after the current last sequence.
    ///
    /// Used for ordered ingestion; anything that does not extend the tail is
    /// rejected with [`Error::OutOfOrder`].
    pub fn append(&mut self, start: u64, end: u64) -> Result<()> {
        if start > end || start < MIN_SEQNO {
            return Err(Error::InvalidRange { start, end });
        }
        if let Some(last) = self.last_seq() {
            if start <= last {
                return Err(Error::OutOfOrder { start, end, last });
            }
        }
        self.add_range(start, end);
        Ok(())
    }

    /// Drop every sequence number below `point`.
    ///
    /// No-op when `point` does not pass the first tracked sequence. Returns the
    /// number of sequence numbers removed.
    pub fn truncate_before(&mut self, point: u64) -> u64 {
        match self.first_seq() {
            Some(first) if point > first => {}
            _ => return 0,
        }

        let mut truncated = 0u64;
        while let Some((&start, &end)) = self.ranges.first_key_value() {
            if start >= point {
                break;
            }
            self.ranges.remove(&start);
            if end < point {
                truncated += end - start + 1;
            } else {
                truncated += point - start;
                self.ranges.insert(point, end);
                break;
            }
        }
        truncated
    }

    /// Drop every sequence number above `point`. Returns the number removed.
    pub fn truncate_after(&mut self, point: u64) -> u64 {
        let mut truncated = 0u64;
        while let Some((&start, &end)) = self.ranges.last_key_value() {
            if end <= point {
                break;
            }
            self.ranges.remove(&start);
            if start > point {
                truncated += end - start + 1;
            } else {
                truncated += end - point;
                self.ranges.insert(start, point);
                break;
            }
        }
        truncated
    }

    /// Union with another tracker. Returns the count of newly covered sequences.
    pub fn merge_tracker(&mut self, other: &SequenceTracker) -> u64 {
        other
            .iter()
            .map(|(start, end)| self.add_range(start, end))
            .sum()
    }

    /// Extend the first range backwards to `lowest`.
    ///
    /// Closes a leading gap that only exists because this tracker's history
    /// starts later than its peers'. Empty trackers are left alone.
    pub fn pad_start(&mut self, lowest: u64) {
        if let Some(first) = self.first_seq() {
            if lowest.max(MIN_SEQNO) < first {
                self.add_range(lowest.max(MIN_SEQNO), first - 1);
            }
        }
    }

    /// First missing interval at or after `after`.
    ///
    /// The returned start is clipped to `after`. Returns `None` when every
    /// sequence from `after` to the end of the tracker is present. An empty
    /// tracker is gapped everywhere; nothing is gapped at or past
    /// [`INFINITE_SEQNO`].
    pub fn first_gap(&self, after: u64) -> Option<(u64, u64)> {
        if after >= INFINITE_SEQNO {
            return None;
        }
        let after = after.max(MIN_SEQNO);
        let (&first, _) = match self.ranges.first_key_value() {
            Some(entry) => entry,
            None => return Some((after, INFINITE_SEQNO)),
        };

        match self.ranges.range(..=after).next_back() {
            // `after` is covered: the gap (if any) follows this range
            Some((_, &end)) if end >= after => self
                .ranges
                .range(end.saturating_add(1)..)
                .next()
                .map(|(&next, _)| (end + 1, next - 1)),
            // `after` sits in a hole behind an earlier range
            Some(_) => self
                .ranges
                .range(after..)
                .next()
                .map(|(&next, _)| (after, next - 1)),
            // `after` precedes the first range
            None => Some((after, first - 1)),
        }
    }

    /// Whether every sequence in `[start, end]` is present.
    ///
    /// Anything at or below the safe point counts as present: history before
    /// the first range has already been released.
    pub fn contains(&self, start: u64, end: u64) -> bool {
        if start > end {
            return false;
        }
        let safe_point = match self.safe_point() {
            Some(point) => point,
            None => return false,
        };
        if end <= safe_point {
            return true;
        }
        match self.ranges.range(..=start).next_back() {
            Some((_, &range_end)) => range_end >= end,
            None => false,
        }
    }

    /// Whether every range of `other` is contained in this tracker.
    pub fn contains_all_sequences_in(&self, other: &SequenceTracker) -> bool {
        other.iter().all(|(start, end)| self.contains(start, end))
    }

    /// Size of [`serialize`](Self::serialize) output
    pub fn serialized_size(&self) -> usize {
        COUNT_SIZE + RANGE_SIZE * self.ranges.len()
    }

    /// Write the count-prefixed `(start, end)` list
    pub fn serialize<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.ranges.len() as u32);
        for (start, end) in self.iter() {
            buf.put_u64(start);
            buf.put_u64(end);
        }
    }

    /// Serialize into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        self.serialize(&mut buf);
        buf.freeze()
    }

    /// Rebuild a tracker written by [`serialize`](Self::serialize)
    pub fn deserialize<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < COUNT_SIZE {
            return Err(Error::Truncated {
                needed: COUNT_SIZE,
                available: buf.remaining(),
            });
        }
        let count = buf.get_u32() as usize;
        let needed = count.saturating_mul(RANGE_SIZE);
        if buf.remaining() < needed {
            return Err(Error::Truncated {
                needed,
                available: buf.remaining(),
            });
        }

        let mut tracker = Self::new();
        for _ in 0..count {
            let start = buf.get_u64();
            let end = buf.get_u64();
            if start > end || start < MIN_SEQNO {
                return Err(Error::InvalidRange { start, end });
            }
            tracker.add_range(start, end);
        }
        Ok(tracker)
    }
}

impl fmt::Display for SequenceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return write!(f, "[]");
        }
        let mut first = true;
        for (start, end) in self.iter() {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            if end >= INFINITE_SEQNO {
                write!(f, "[{},INF]", start)?;
            } else {
                write!(f, "[{},{}]", start, end)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(ranges: &[(u64, u64)]) -> SequenceTracker {
        let mut t = SequenceTracker::new();
        for &(s, e) in ranges {
            t.add_range(s, e);
        }
        t
    }

    #[test]
    fn test_add_range_merges_adjacent() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.add_range(1, 4), 4);
        assert_eq!(t.add_range(5, 9), 5);
        assert_eq!(t.range_count(), 1);
        assert_eq!(t.first_seq(), Some(1));
        assert_eq!(t.last_seq(), Some(9));
    }

    #[test]
    fn test_add_range_counts_new_sequences() {
        let mut t = tracker(&[(1, 10), (21, 30)]);
        // 11..=20 are new, the rest overlap
        assert_eq!(t.add_range(5, 25), 10);
        assert_eq!(t.iter().collect::<Vec<_>>(), vec![(1, 30)]);
    }

    #[test]
    fn test_add_range_idempotent() {
        let mut once = SequenceTracker::new();
        once.add_range(3, 7);
        let mut twice = once.clone();
        assert_eq!(twice.add_range(3, 7), 0);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_add_range_bridges_multiple() {
        let mut t = tracker(&[(1, 2), (5, 6), (9, 10), (20, 30)]);
        t.add_range(3, 11);
        assert_eq!(t.iter().collect::<Vec<_>>(), vec![(1, 11), (20, 30)]);
    }

    #[test]
    fn test_append_requires_tail_growth() {
        let mut t = SequenceTracker::new();
        t.append(1, 100).unwrap();
        t.append(101, 200).unwrap();
        assert_eq!(t.range_count(), 1);

        let err = t.append(150, 250).unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { last: 200, .. }));

        // gaps are allowed, overlaps are not
        t.append(301, 400).unwrap();
        assert_eq!(t.range_count(), 2);
    }

    #[test]
    fn test_truncate_before() {
        let mut t = tracker(&[(1, 10), (21, 30)]);
        assert_eq!(t.truncate_before(5), 4);
        assert_eq!(t.first_seq(), Some(5));

        assert_eq!(t.truncate_before(15), 6);
        assert_eq!(t.first_seq(), Some(21));

        // no-op when the point precedes the first sequence
        assert_eq!(t.truncate_before(3), 0);
        assert_eq!(t.first_seq(), Some(21));

        assert_eq!(t.truncate_before(100), 10);
        assert!(t.is_empty());
    }

    #[test]
    fn test_truncate_before_floor_property() {
        let base = tracker(&[(1, 3), (7, 12), (15, 15), (40, 60)]);
        for point in 0..70 {
            let mut t = base.clone();
            t.truncate_before(point);
            if let Some(first) = t.first_seq() {
                assert!(first >= point, "point {} left first {}", point, first);
            }
        }
    }

    #[test]
    fn test_truncate_after() {
        let mut t = tracker(&[(1, 10), (21, 30)]);
        assert_eq!(t.truncate_after(25), 5);
        assert_eq!(t.last_seq(), Some(25));
        assert_eq!(t.truncate_after(15), 5);
        assert_eq!(t.iter().collect::<Vec<_>>(), vec![(1, 10)]);
        assert_eq!(t.truncate_after(50), 0);
    }

    #[test]
    fn test_first_gap() {
        let t = tracker(&[(1, 9), (21, INFINITE_SEQNO)]);
        assert_eq!(t.first_gap(1), Some((10, 20)));
        assert_eq!(t.first_gap(5), Some((10, 20)));
        assert_eq!(t.first_gap(15), Some((15, 20)));
        assert_eq!(t.first_gap(21), None);
        assert_eq!(t.first_gap(INFINITE_SEQNO), None);

        let t = tracker(&[(11, 20)]);
        assert_eq!(t.first_gap(1), Some((1, 10)));
        // past the end is not a gap
        assert_eq!(t.first_gap(30), None);
    }

    #[test]
    fn test_first_gap_empty_tracker() {
        let t = SequenceTracker::new();
        assert_eq!(t.first_gap(0), Some((MIN_SEQNO, INFINITE_SEQNO)));
        assert_eq!(t.first_gap(1), Some((MIN_SEQNO, INFINITE_SEQNO)));
        assert_eq!(t.first_gap(INFINITE_SEQNO), None);
    }

    #[test]
    fn test_contiguous_iff_no_gap() {
        // non-overlapping ranges added in a shuffled order
        let cases: Vec<Vec<(u64, u64)>> = vec![
            vec![(1, 5), (6, 10)],
            vec![(6, 10), (1, 5)],
            vec![(1, 5), (7, 10)],
            vec![(2, 5)],
            vec![(11, 20), (1, 10), (21, 21)],
            vec![(11, 20), (1, 9)],
        ];
        for ranges in cases {
            let t = tracker(&ranges);
            let last = t.last_seq().unwrap();
            let covered: u64 = ranges.iter().map(|(s, e)| e - s + 1).sum();
            let contiguous = t.first_seq() == Some(1) && covered == last;
            assert_eq!(t.first_gap(1).is_none(), contiguous, "ranges {:?}", ranges);
        }
    }

    #[test]
    fn test_safe_point_and_contains() {
        let t = tracker(&[(5, 9), (21, 30)]);
        assert_eq!(t.safe_point(), Some(9));
        assert!(t.contains(1, 4)); // below the safe point
        assert!(t.contains(6, 9));
        assert!(t.contains(22, 30));
        assert!(!t.contains(8, 22));
        assert!(!t.contains(25, 31));

        let sub = tracker(&[(2, 3), (22, 29)]);
        assert!(t.contains_all_sequences_in(&sub));
        let not_sub = tracker(&[(10, 12)]);
        assert!(!t.contains_all_sequences_in(&not_sub));
    }

    #[test]
    fn test_merge_and_pad() {
        let mut a = tracker(&[(10, 20)]);
        let b = tracker(&[(21, 30), (50, 60)]);
        assert_eq!(a.merge_tracker(&b), 21);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![(10, 30), (50, 60)]);

        a.pad_start(3);
        assert_eq!(a.first_seq(), Some(3));
        assert_eq!(a.range_count(), 2);

        let mut empty = SequenceTracker::new();
        empty.pad_start(1);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_serialization_round_trip() {
        let t = tracker(&[(1, 9), (21, 40), (77, INFINITE_SEQNO)]);
        let bytes = t.to_bytes();
        assert_eq!(bytes.len(), 4 + 16 * 3);
        assert_eq!(t.serialized_size(), bytes.len());

        let mut buf = bytes.clone();
        let restored = SequenceTracker::deserialize(&mut buf).unwrap();
        assert_eq!(restored, t);
        for point in [0, 1, 9, 10, 15, 21, 41, 76, 77, 1000] {
            assert_eq!(restored.first_gap(point), t.first_gap(point));
        }
    }

    #[test]
    fn test_deserialize_truncated() {
        let t = tracker(&[(1, 9), (21, 40)]);
        let bytes = t.to_bytes();
        let mut short = bytes.slice(..bytes.len() - 1);
        assert!(matches!(
            SequenceTracker::deserialize(&mut short),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn test_display() {
        let t = tracker(&[(1, 9), (21, INFINITE_SEQNO)]);
        assert_eq!(t.to_string(), "[1,9] [21,INF]");
        assert_eq!(SequenceTracker::new().to_string(), "[]");
    }
}
