//! Countdown latch for batch completion signaling.
//!
//! Replaces multi-subscriber completion events with a known-arity
//! synchronization primitive: the dispatcher knows exactly how many
//! completions it is waiting for.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A latch initialized with a count; waiters block until the count
/// reaches zero.
pub struct CountdownLatch {
    remaining: Mutex<usize>,
    zeroed: Condvar,
}

impl CountdownLatch {
    /// Create a latch expecting `count` completions.
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            zeroed: Condvar::new(),
        }
    }

    /// Record one completion. Saturates at zero.
    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        if *remaining > 0 {
            *remaining -= 1;
        }
        if *remaining == 0 {
            self.zeroed.notify_all();
        }
    }

    /// Completions still outstanding.
    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }

    /// Block until every completion has been recorded.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.zeroed.wait(&mut remaining);
        }
    }

    /// Block up to `timeout`; returns true when the latch reached zero.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            let _ = self.zeroed.wait_until(&mut remaining, deadline);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_latch_releases_at_zero() {
        let latch = Arc::new(CountdownLatch::new(3));
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait())
        };

        latch.count_down();
        latch.count_down();
        assert_eq!(latch.remaining(), 1);
        latch.count_down();

        waiter.join().unwrap();
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn test_wait_for_times_out() {
        let latch = CountdownLatch::new(1);
        assert!(!latch.wait_for(Duration::from_millis(10)));
        latch.count_down();
        assert!(latch.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn test_count_down_saturates() {
        let latch = CountdownLatch::new(1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.remaining(), 0);
    }

    #[test]
    fn test_zero_count_never_blocks() {
        let latch = CountdownLatch::new(0);
        latch.wait();
        assert!(latch.wait_for(Duration::from_millis(1)));
    }
}
