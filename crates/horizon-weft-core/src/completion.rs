//! Counted completion gate for cross-thread teardown and startup barriers.
//!
//! A [`Latch`] starts at some count and is counted down by the threads doing
//! the work; threads that need the work finished block on [`Latch::wait`]
//! until the count reaches zero. The count never increases, which makes the
//! latch a natural fit for "wait until all N children have reported" steps:
//! the listen startup barrier and the stop protocol's still-running-children
//! gate both are exactly that.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A one-way counter that releases waiters when it reaches zero.
pub struct Latch {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Latch {
    /// Create a latch that waits for `count` completions.
    ///
    /// A latch created with count 0 is already released.
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    /// The number of completions still outstanding.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Record one completion and return the remaining count.
    ///
    /// Counting down an already-released latch is a no-op (the count
    /// saturates at zero rather than wrapping).
    pub fn count_down(&self) -> usize {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.condvar.notify_all();
            }
        }
        *count
    }

    /// Block until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.condvar.wait(&mut count);
        }
    }

    /// Block until the count reaches zero or `timeout` elapses.
    ///
    /// Returns `true` if the latch was released, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.condvar.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latch").field("count", &self.count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_zero_latch_is_released() {
        let latch = Latch::new(0);
        assert_eq!(latch.count(), 0);
        // Must not block.
        latch.wait();
        assert!(latch.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_count_down_saturates() {
        let latch = Latch::new(1);
        assert_eq!(latch.count_down(), 0);
        assert_eq!(latch.count_down(), 0);
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_wait_releases_after_all_count_downs() {
        let latch = Arc::new(Latch::new(3));
        let released = Arc::new(AtomicBool::new(false));

        let waiter = {
            let latch = latch.clone();
            let released = released.clone();
            std::thread::spawn(move || {
                latch.wait();
                released.store(true, Ordering::SeqCst);
            })
        };

        for expected_remaining in [2, 1] {
            std::thread::sleep(Duration::from_millis(10));
            assert!(!released.load(Ordering::SeqCst));
            assert_eq!(latch.count_down(), expected_remaining);
        }
        latch.count_down();

        waiter.join().unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let latch = Latch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_many_threads_counting_down() {
        let latch = Arc::new(Latch::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let latch = latch.clone();
                std::thread::spawn(move || {
                    latch.count_down();
                })
            })
            .collect();
        latch.wait();
        assert_eq!(latch.count(), 0);
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
