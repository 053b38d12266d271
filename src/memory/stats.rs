//! Process-wide diagnostic counters.
//!
//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent; cross-counter snapshots may be transiently
//! inconsistent. This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions: per-source accounting
//! lives in `SourceStats`.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }

    #[inline]
    pub fn fetch_add(&self, val: usize, ordering: Ordering) -> usize {
        self.0.fetch_add(Self::delta(val), ordering).max(0).cast_unsigned()
    }
}

// Address space reserved by chunk sources (process and scratch)
crate::sync::static_atomic! {
    pub static RESERVED_BYTES: Counter = Counter::new();
}
// Chunks bump-carved from a reservation
crate::sync::static_atomic! {
    pub static CARVED_CHUNKS: Counter = Counter::new();
}
// Chunks pushed back onto a bucket
crate::sync::static_atomic! {
    pub static RECYCLED_CHUNKS: Counter = Counter::new();
}
// Chunks re-formatted for a different size class
crate::sync::static_atomic! {
    pub static REFORMATTED_CHUNKS: Counter = Counter::new();
}
// `acquire` calls that found the reservation exhausted
crate::sync::static_atomic! {
    pub static EXHAUSTED_REQUESTS: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Snapshot of the process-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub reserved_bytes: usize,
    pub carved_chunks: usize,
    pub recycled_chunks: usize,
    pub reformatted_chunks: usize,
    pub exhausted_requests: usize,
}

#[must_use]
pub fn diagnostics() -> Diagnostics {
    Diagnostics {
        reserved_bytes: RESERVED_BYTES.get(),
        carved_chunks: CARVED_CHUNKS.get(),
        recycled_chunks: RECYCLED_CHUNKS.get(),
        reformatted_chunks: REFORMATTED_CHUNKS.get(),
        exhausted_requests: EXHAUSTED_REQUESTS.get(),
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_clamps_negative() {
        let counter = Counter::new();
        counter.add(5);
        counter.sub(8);
        assert_eq!(counter.get(), 0);
        counter.add(10);
        assert_eq!(counter.get(), 7);
    }

    #[test]
    fn test_counter_fetch_add_returns_previous() {
        let counter = Counter::new();
        assert_eq!(counter.fetch_add(3, Ordering::Relaxed), 0);
        assert_eq!(counter.fetch_add(4, Ordering::Relaxed), 3);
        assert_eq!(counter.get(), 7);
    }

    #[test]
    fn test_counter_clamps_huge_delta() {
        let counter = Counter::new();
        counter.add(usize::MAX);
        assert_eq!(counter.get(), isize::MAX as usize);
    }
}
