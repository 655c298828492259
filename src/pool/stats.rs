//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., an active-allocation figure may briefly disagree with
//! the difference of its alloc/dealloc counters). This is acceptable for
//! diagnostic display. Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicI64, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `get()`, which
/// clamps negative values to zero.
pub(crate) struct Counter(AtomicI64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    #[inline]
    fn delta(val: usize) -> i64 {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, i64::MAX as usize) as i64
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
    pub fn inc(&self) {
        self.add(1);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0) as usize
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add_sub() {
        let c = Counter::new();
        c.add(10);
        c.sub(3);
        assert_eq!(c.get(), 7);
    }

    #[test]
    fn test_counter_clamps_below_zero() {
        let c = Counter::new();
        c.sub(5);
        assert_eq!(c.get(), 0);
        c.add(2);
        // Raw value is -3; reads clamp.
        assert_eq!(c.get(), 0);
    }
}
