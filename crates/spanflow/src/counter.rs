//! Counter store for span lifecycle events.
//!
//! One monotonically increasing counter per [`SpanState`]. Increments are a
//! single relaxed `fetch_add` on a cache-padded atomic, so `on_start` and
//! `on_end` from many threads never contend on a lock or false-share a line.

use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle states a span is counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpanState {
    Started,
    Ended,
}

impl SpanState {
    /// Every known state, in exposition order.
    pub const ALL: [SpanState; 2] = [SpanState::Started, SpanState::Ended];

    /// The `state` label value for this state.
    pub const fn as_str(self) -> &'static str {
        match self {
            SpanState::Started => "started",
            SpanState::Ended => "ended",
        }
    }

    /// Parses a `state` label value.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == label)
    }

    const fn index(self) -> usize {
        match self {
            SpanState::Started => 0,
            SpanState::Ended => 1,
        }
    }
}

impl fmt::Display for SpanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concurrency-safe span counters keyed by [`SpanState`].
///
/// Counters are never reset. A [`snapshot`](Self::snapshot) reads each
/// counter atomically; the two counters are not read as one unit.
#[derive(Debug, Default)]
pub struct SpanCounter {
    counts: [CachePadded<AtomicU64>; 2],
}

impl SpanCounter {
    /// Metric name the counters are exposed under.
    pub const NAME: &'static str = "spans_total";
    /// Help text of the exposed metric.
    pub const HELP: &'static str = "The total number of processed spans";
    /// Label distinguishing the counters.
    pub const LABEL: &'static str = "state";

    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter for `state` by one.
    #[inline]
    pub fn increment(&self, state: SpanState) {
        self.counts[state.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the counter named by a raw label value.
    ///
    /// An unknown label is a programming error: it panics in debug builds and
    /// is dropped with a warning otherwise.
    pub fn increment_label(&self, label: &str) {
        match SpanState::from_label(label) {
            Some(state) => self.increment(state),
            None => {
                if cfg!(debug_assertions) {
                    panic!("unknown span state label: {label:?}");
                }
                tracing::warn!(label, "ignoring increment of unknown span state");
            }
        }
    }

    /// Current value of the counter for `state`.
    #[inline]
    pub fn get(&self, state: SpanState) -> u64 {
        self.counts[state.index()].load(Ordering::Relaxed)
    }

    /// One `(state, value)` pair per known state, in [`SpanState::ALL`] order.
    pub fn snapshot(&self) -> [(SpanState, u64); 2] {
        SpanState::ALL.map(|state| (state, self.get(state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_increment_and_snapshot() {
        let counter = SpanCounter::new();
        assert_eq!(
            counter.snapshot(),
            [(SpanState::Started, 0), (SpanState::Ended, 0)]
        );

        counter.increment(SpanState::Started);
        counter.increment(SpanState::Started);
        counter.increment(SpanState::Ended);

        assert_eq!(
            counter.snapshot(),
            [(SpanState::Started, 2), (SpanState::Ended, 1)]
        );
    }

    #[test]
    fn test_labels_round_trip() {
        for state in SpanState::ALL {
            assert_eq!(SpanState::from_label(state.as_str()), Some(state));
        }
        assert_eq!(SpanState::from_label("dropped"), None);
    }

    #[test]
    fn test_increment_known_label() {
        let counter = SpanCounter::new();
        counter.increment_label("ended");
        assert_eq!(counter.get(SpanState::Ended), 1);
        assert_eq!(counter.get(SpanState::Started), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unknown span state label")]
    fn test_unknown_label_panics_in_debug() {
        SpanCounter::new().increment_label("dropped");
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 10_000;

        let counter = Arc::new(SpanCounter::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        counter.increment(SpanState::Started);
                        if i % 2 == 0 {
                            counter.increment(SpanState::Ended);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.get(SpanState::Started), THREADS * PER_THREAD);
        assert_eq!(counter.get(SpanState::Ended), THREADS / 2 * PER_THREAD);
    }
}
