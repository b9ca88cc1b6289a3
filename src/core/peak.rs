//! Bounded-memory reconstruction of per-site peak contributions.
//!
//! At the global peak time we want, for every allocation site, its share of
//! the outstanding bytes at that instant. Snapshotting every site on every
//! event would be quadratic; tracking only the total loses the attribution.
//! Instead the event stream is cut into fixed-size snippets:
//!
//! ```text
//!     [A1 A2 D1] [A3 D2 D3] [A4 A5 A6] [A7 D4 D5] …
//! ```
//!
//! Each snippet starts with a snapshot of every site's `leaked` value and
//! then records its events in order, together with the local peak (time,
//! memory, event position). Only two snippets are ever live: the one being
//! filled and the best one seen so far. At the end of the parse the best
//! snippet replays its events up to the peak position, which yields the
//! exact per-site values while the memory overhead stays within the
//! configured budget no matter how long the trace runs.

use crate::core::indices::AllocationInfoIndex;
use crate::core::trace_data::{Allocation, AllocationInfo};

/// Default memory budget shared by the two live snippets.
pub const DEFAULT_BUDGET: usize = 128 * 1024 * 1024;

/// Parse state captured alongside each event.
pub struct SnapshotState<'a> {
    pub timestamp: i64,
    pub total_leaked: i64,
    pub allocations: &'a [Allocation],
}

struct TraceSnippet {
    capacity: usize,
    peak_time: i64,
    peak_mem: i64,
    /// 0 means the snapshot itself is the peak; otherwise replay events up
    /// to and including `events[peak_idx - 1]`.
    peak_idx: usize,
    starting_allocations: Vec<i64>,
    events: Vec<AllocationInfoIndex>,
    is_alloc: Vec<bool>,
}

impl TraceSnippet {
    fn new(capacity: usize, state: &SnapshotState) -> TraceSnippet {
        let mut snippet = TraceSnippet {
            capacity,
            peak_time: 0,
            peak_mem: 0,
            peak_idx: 0,
            starting_allocations: Vec::new(),
            events: Vec::with_capacity(capacity),
            is_alloc: Vec::with_capacity(capacity),
        };
        snippet.reset(state);
        snippet
    }

    fn reset(&mut self, state: &SnapshotState) {
        self.peak_time = state.timestamp;
        self.peak_mem = state.total_leaked;
        self.peak_idx = 0;
        self.starting_allocations.clear();
        self.starting_allocations
            .extend(state.allocations.iter().map(|a| a.data.leaked));
        self.events.clear();
        self.is_alloc.clear();
    }

    fn is_full(&self) -> bool {
        self.events.len() == self.capacity
    }

    fn record_event(&mut self, info_index: AllocationInfoIndex, is_alloc: bool, state: &SnapshotState) {
        debug_assert!(!self.is_full());
        self.events.push(info_index);
        self.is_alloc.push(is_alloc);

        if state.total_leaked > self.peak_mem {
            self.peak_time = state.timestamp;
            self.peak_mem = state.total_leaked;
            self.peak_idx = self.events.len();
        }
    }

    fn peak_allocations(&self, infos: &[AllocationInfo]) -> Vec<i64> {
        let mut peak_allocations = self.starting_allocations.clone();
        for idx in 0..self.peak_idx {
            let info = &infos[self.events[idx] as usize];
            let position = info.allocation_index as usize;
            if position >= peak_allocations.len() {
                // new sites can appear after the snapshot was taken
                peak_allocations.resize(position + 1, 0);
            }
            peak_allocations[position] += if self.is_alloc[idx] {
                info.size as i64
            } else {
                -(info.size as i64)
            };
        }
        peak_allocations
    }
}

/// Moving window over the allocation event stream, always hanging on to the
/// snippet that contains the global peak.
pub struct PeakTracker {
    peak_snippet: TraceSnippet,
    current_snippet: TraceSnippet,
}

impl PeakTracker {
    pub fn with_budget(budget: usize) -> PeakTracker {
        // two live buffers share the budget
        let capacity =
            (budget / std::mem::size_of::<AllocationInfoIndex>() / 2).max(1);
        let empty = SnapshotState {
            timestamp: 0,
            total_leaked: 0,
            allocations: &[],
        };
        PeakTracker {
            peak_snippet: TraceSnippet::new(capacity, &empty),
            current_snippet: TraceSnippet::new(capacity, &empty),
        }
    }

    pub fn new() -> PeakTracker {
        PeakTracker::with_budget(DEFAULT_BUDGET)
    }

    /// Record one allocation event. The caller has already applied the
    /// event's effect to `state`, so when a full snippet forces a rotation
    /// the event is folded into the fresh snapshot instead of the array.
    pub fn record_event(
        &mut self,
        info_index: AllocationInfoIndex,
        is_alloc: bool,
        state: &SnapshotState,
    ) {
        if self.current_snippet.is_full() {
            self.rotate(state);
        } else {
            self.current_snippet.record_event(info_index, is_alloc, state);
        }
    }

    /// Promote the current snippet if it beats the best peak, then start a
    /// fresh one. Also called once at the end of the parse.
    pub fn finalize(&mut self, state: &SnapshotState) {
        self.rotate(state);
    }

    fn rotate(&mut self, state: &SnapshotState) {
        if self.current_snippet.peak_mem > self.peak_snippet.peak_mem {
            std::mem::swap(&mut self.peak_snippet, &mut self.current_snippet);
        }
        self.current_snippet.reset(state);
    }

    pub fn peak_time(&self) -> i64 {
        self.peak_snippet.peak_time
    }

    /// Replay the peak snippet and return each site's `leaked` value at the
    /// global peak, indexed by allocation position.
    pub fn peak_allocations(&self, infos: &[AllocationInfo]) -> Vec<i64> {
        self.peak_snippet.peak_allocations(infos)
    }
}

impl Default for PeakTracker {
    fn default() -> PeakTracker {
        PeakTracker::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::indices::TraceIndex;
    use crate::core::trace_data::AllocationData;

    struct Harness {
        tracker: PeakTracker,
        infos: Vec<AllocationInfo>,
        allocations: Vec<Allocation>,
        total_leaked: i64,
        timestamp: i64,
    }

    impl Harness {
        fn new(budget: usize, sizes: &[u64]) -> Harness {
            let infos = sizes
                .iter()
                .enumerate()
                .map(|(position, &size)| AllocationInfo {
                    size,
                    trace_index: TraceIndex(position as u32 + 1),
                    allocation_index: position as u32,
                })
                .collect::<Vec<_>>();
            let allocations = sizes
                .iter()
                .enumerate()
                .map(|(position, _)| Allocation {
                    trace_index: TraceIndex(position as u32 + 1),
                    data: AllocationData::default(),
                })
                .collect();
            Harness {
                tracker: PeakTracker::with_budget(budget),
                infos,
                allocations,
                total_leaked: 0,
                timestamp: 0,
            }
        }

        fn event(&mut self, info: usize, is_alloc: bool) {
            self.timestamp += 1;
            let size = self.infos[info].size as i64;
            let delta = if is_alloc { size } else { -size };
            self.total_leaked += delta;
            self.allocations[info].data.leaked += delta;
            let state = SnapshotState {
                timestamp: self.timestamp,
                total_leaked: self.total_leaked,
                allocations: &self.allocations,
            };
            self.tracker.record_event(info as u32, is_alloc, &state);
        }

        fn finish(&mut self) -> Vec<i64> {
            let state = SnapshotState {
                timestamp: self.timestamp,
                total_leaked: self.total_leaked,
                allocations: &self.allocations,
            };
            self.tracker.finalize(&state);
            self.tracker.peak_allocations(&self.infos)
        }
    }

    #[test]
    fn single_snippet_peak() {
        let mut harness = Harness::new(1 << 20, &[100, 50]);
        harness.event(0, true); // 100
        harness.event(1, true); // 150 <- peak
        harness.event(0, false); // 50
        let peaks = harness.finish();
        assert_eq!(peaks, vec![100, 50]);
        assert_eq!(peaks.iter().sum::<i64>(), 150);
        assert_eq!(harness.tracker.peak_time(), 2);
    }

    #[test]
    fn peak_across_snippet_rotation() {
        // capacity of 2 events per snippet forces many rotations
        let mut harness = Harness::new(2 * 4 * 2, &[10, 20, 30]);
        harness.event(0, true); // 10
        harness.event(1, true); // 30
        harness.event(0, false); // 20
        harness.event(2, true); // 50
        harness.event(1, false); // 30
        harness.event(0, true); // 40
        harness.event(0, true); // 50... ties do not displace the earlier peak
        harness.event(2, false); // 20
        let peaks = harness.finish();
        // the first time 50 was reached: sites 1 and 2 alive
        assert_eq!(peaks.iter().sum::<i64>(), 50);
        assert_eq!(peaks[1], 20);
        assert_eq!(peaks[2], 30);
        assert_eq!(harness.tracker.peak_time(), 4);
    }

    #[test]
    fn sites_created_after_snapshot_grow_the_vector() {
        let mut harness = Harness::new(1 << 20, &[10, 20]);
        harness.event(0, true);
        // site 1 only shows up mid-snippet
        harness.event(1, true);
        let peaks = harness.finish();
        assert_eq!(peaks, vec![10, 20]);
    }

    #[test]
    fn empty_stream_has_empty_peak() {
        let mut harness = Harness::new(1 << 20, &[]);
        let peaks = harness.finish();
        assert!(peaks.is_empty());
        assert_eq!(harness.tracker.peak_time(), 0);
    }

    #[test]
    fn memory_stays_within_budget() {
        // tiny budget, long stream: capacity is budget / 4 / 2 events
        let budget = 64;
        let mut harness = Harness::new(budget, &[8]);
        for _ in 0..10_000 {
            harness.event(0, true);
            harness.event(0, false);
        }
        harness.event(0, true);
        let capacity = budget / 4 / 2;
        assert_eq!(harness.tracker.current_snippet.capacity, capacity);
        assert!(harness.tracker.current_snippet.events.len() <= capacity);
        assert!(harness.tracker.peak_snippet.events.len() <= capacity);
        let peaks = harness.finish();
        assert_eq!(peaks.iter().sum::<i64>(), 8);
    }
}
