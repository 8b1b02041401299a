//! Per-stream byte counters.
//!
//! A counter is a single `AtomicU64`, so a snapshot is always a value some
//! increment actually produced. Counters are never shared between streams.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic byte tally for one direction of one stream.
#[derive(Debug, Default)]
pub struct ByteCounter {
    total: AtomicU64,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` bytes and return the new total.
    pub fn increment(&self, n: u64) -> u64 {
        self.total.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Current total.
    pub fn snapshot(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn increment_returns_running_total() {
        let counter = ByteCounter::new();
        assert_eq!(counter.increment(5), 5);
        assert_eq!(counter.increment(0), 5);
        assert_eq!(counter.increment(11), 16);
        assert_eq!(counter.snapshot(), 16);
    }

    // Both 32-bit halves change on every increment, so a torn read would
    // show up as a value that is not a multiple of the step.
    const STEP: u64 = 0x0000_0001_0000_0001;

    #[test]
    fn snapshots_never_tear_under_concurrent_increments() {
        for _ in 0..2_000 {
            let counter = Arc::new(ByteCounter::new());
            let done = Arc::new(AtomicBool::new(false));
            let writes = 2_000u64;

            let writer = {
                let counter = Arc::clone(&counter);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    for _ in 0..writes {
                        counter.increment(STEP);
                    }
                    done.store(true, Ordering::Release);
                })
            };

            let mut last = 0;
            while !done.load(Ordering::Acquire) {
                let seen = counter.snapshot();
                assert_eq!(seen % STEP, 0, "torn read: {seen:#x}");
                assert!(seen >= last, "counter went backwards");
                assert!(seen <= writes * STEP);
                last = seen;
            }

            writer.join().unwrap();
            assert_eq!(counter.snapshot(), writes * STEP);
        }
    }
}
