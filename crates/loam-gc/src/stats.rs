//! Heap statistics.

use std::mem::size_of;

use crate::heap::HeapRegistry;
use crate::object::{Kind, Slot};

/// Number of free-run-length histogram buckets; bucket `i` counts runs of
/// length in `[2^i, 2^(i+1))`, the last bucket is open-ended.
pub const FREE_RUN_BUCKETS: usize = 8;

/// A snapshot of heap occupancy, taken outside any cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    /// Live objects, including internal ones.
    pub objects: usize,
    /// Live syntax tree nodes (a subset of `objects`).
    pub node_objects: usize,
    /// Live objects that cannot reference other objects.
    pub terminal_objects: usize,
    /// Arenas currently holding slots (retired arenas excluded).
    pub arenas: usize,
    /// Total slot capacity.
    pub total_slots: usize,
    /// Free slots.
    pub free_slots: usize,
    /// Bytes held by live objects' slots.
    pub live_bytes: usize,
    /// Bytes held by free slots.
    pub free_bytes: usize,
    /// Free slots before the first live object, summed over arenas.
    pub leading_free_slots: usize,
    /// Free slots after the last live object, summed over arenas.
    pub trailing_free_slots: usize,
    /// Histogram of contiguous free-run lengths, bucketed by powers of two.
    pub free_run_histogram: [usize; FREE_RUN_BUCKETS],
    /// Collection cycles completed so far.
    pub cycles: u64,
}

fn bucket_of(run: usize) -> usize {
    debug_assert!(run > 0);
    let bucket = run.ilog2() as usize;
    bucket.min(FREE_RUN_BUCKETS - 1)
}

pub(crate) fn gather(heap: &HeapRegistry, cycles: u64) -> HeapStatistics {
    let mut stats = HeapStatistics {
        cycles,
        ..HeapStatistics::default()
    };

    for arena in heap.arenas() {
        if arena.is_retired() {
            continue;
        }
        stats.arenas += 1;
        stats.total_slots += arena.limit();

        let mut leading = 0usize;
        let mut trailing = 0usize;
        let mut run = 0usize;
        let mut seen_live = false;

        for index in 0..arena.limit() {
            let slot = arena.slot_at(index);
            // SAFETY: index is within the arena's live range and the caller
            // holds the collector, so no cycle is mutating slots.
            let s = unsafe { slot.as_ref() };
            // Slots parked for deferred finalization (free body, flags still
            // set) and reserved slots count as neither live nor free.
            let free = s.is_free() && s.flags().is_empty();
            if s.is_live() {
                let kind = s.kind().expect("live slot has a kind");
                stats.objects += 1;
                match kind {
                    Kind::Node => stats.node_objects += 1,
                    Kind::Float | Kind::Bignum | Kind::Regexp | Kind::File => {
                        stats.terminal_objects += 1;
                    }
                    _ => {}
                }
                seen_live = true;
                trailing = 0;
                if run > 0 {
                    stats.free_run_histogram[bucket_of(run)] += 1;
                    run = 0;
                }
            } else if free {
                stats.free_slots += 1;
                run += 1;
                if seen_live {
                    trailing += 1;
                } else {
                    leading += 1;
                }
            } else {
                // Reserved or parked: breaks the free run.
                seen_live = true;
                trailing = 0;
                if run > 0 {
                    stats.free_run_histogram[bucket_of(run)] += 1;
                    run = 0;
                }
            }
        }
        if run > 0 {
            stats.free_run_histogram[bucket_of(run)] += 1;
        }
        stats.leading_free_slots += leading;
        stats.trailing_free_slots += trailing;
    }

    stats.live_bytes = stats.objects * size_of::<Slot>();
    stats.free_bytes = stats.free_slots * size_of::<Slot>();
    stats
}

#[cfg(test)]
mod tests {
    use super::{bucket_of, FREE_RUN_BUCKETS};

    #[test]
    fn runs_bucket_by_powers_of_two() {
        assert_eq!(bucket_of(1), 0);
        assert_eq!(bucket_of(2), 1);
        assert_eq!(bucket_of(3), 1);
        assert_eq!(bucket_of(4), 2);
        assert_eq!(bucket_of(255), 7);
        assert_eq!(bucket_of(1 << 20), FREE_RUN_BUCKETS - 1);
    }
}
