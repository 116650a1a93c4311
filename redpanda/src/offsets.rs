//! Commit watermarks for out-of-order settlement.
//!
//! Deliveries from one partition are processed concurrently and settle in any
//! order. A partition's committed offset may only advance past offsets that
//! are settled, so after a crash every unsettled message is read again.
//!
//! ```text
//! offsets     10  11  12  13
//! settled      ✓   ✗   ✓   ✓
//! committable 11            (11 is still in flight)
//! ```

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    next: Option<i64>,
    /// Last offset committed, or the first one read.
    committed: Option<i64>,
}

impl PartitionOffsets {
    fn watermark(&self) -> Option<i64> {
        self.in_flight.first().copied().or(self.next)
    }
}

/// In-flight offsets per partition of one subscription.
#[derive(Debug, Default)]
pub(crate) struct OffsetTracker {
    partitions: HashMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record that `offset` was read and handed out.
    pub(crate) fn track(&mut self, partition: i32, offset: i64) {
        let offsets = self.partitions.entry(partition).or_default();
        offsets.committed.get_or_insert(offset);
        offsets.in_flight.insert(offset);
        offsets.next = Some(offsets.next.map_or(offset + 1, |next| next.max(offset + 1)));
    }

    /// Mark `offset` settled.
    ///
    /// Returns the offset to commit (the next one to read) when the
    /// contiguous settled prefix grew.
    pub(crate) fn complete(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let offsets = self.partitions.get_mut(&partition)?;
        if !offsets.in_flight.remove(&offset) {
            return None;
        }

        let watermark = offsets.watermark()?;
        if offsets.committed.is_some_and(|committed| committed >= watermark) {
            return None;
        }
        offsets.committed = Some(watermark);
        Some(watermark)
    }

    /// Offsets read but not yet settled, across partitions.
    pub(crate) fn in_flight(&self) -> usize {
        self.partitions.values().map(|p| p.in_flight.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_settlement_commits_each_offset() {
        let mut tracker = OffsetTracker::new();
        tracker.track(0, 10);
        tracker.track(0, 11);

        assert_eq!(tracker.complete(0, 10), Some(11));
        assert_eq!(tracker.complete(0, 11), Some(12));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn gap_holds_the_watermark_until_it_closes() {
        let mut tracker = OffsetTracker::new();
        for offset in 10..=13 {
            tracker.track(0, offset);
        }

        assert_eq!(tracker.complete(0, 12), None);
        assert_eq!(tracker.complete(0, 13), None);
        assert_eq!(tracker.complete(0, 10), Some(11));
        assert_eq!(tracker.complete(0, 11), Some(14));
    }

    #[test]
    fn partitions_are_independent() {
        let mut tracker = OffsetTracker::new();
        tracker.track(0, 5);
        tracker.track(1, 7);
        tracker.track(1, 8);

        assert_eq!(tracker.complete(1, 7), Some(8));
        assert_eq!(tracker.in_flight(), 2);
        assert_eq!(tracker.complete(0, 5), Some(6));
        assert_eq!(tracker.in_flight(), 1);
    }

    #[test]
    fn unknown_or_repeated_settlement_commits_nothing() {
        let mut tracker = OffsetTracker::new();
        tracker.track(0, 1);

        assert_eq!(tracker.complete(0, 1), Some(2));
        assert_eq!(tracker.complete(0, 1), None);
        assert_eq!(tracker.complete(3, 1), None);
    }
}
