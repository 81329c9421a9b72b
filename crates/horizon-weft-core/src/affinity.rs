//! Worker identity and thread-affinity verification.
//!
//! Every worker thread in a pool is assigned a [`WorkerId`] and registers it
//! in thread-local storage when the thread starts. Code that must only run on
//! a socket's owning worker can then ask "which worker am I?" and either act
//! directly or marshal the work onto the right queue.
//!
//! ```ignore
//! use horizon_weft_core::affinity;
//!
//! fn deliver(owner: affinity::WorkerId) {
//!     if affinity::current_worker() == Some(owner) {
//!         // Already on the owning thread: act directly.
//!     } else {
//!         // Enqueue to `owner`'s event queue instead.
//!     }
//! }
//! ```
//!
//! Two levels of checking are provided, mirroring the usual debug/release
//! split: [`assert_on_worker`] always runs, [`debug_assert_on_worker`] is a
//! no-op in release builds and can be sprinkled through thread-affine code
//! without cost.

use std::cell::Cell;
use std::fmt;

/// Identifier of one worker thread within a pool.
///
/// Ids are dense indices `0..worker_count`, so they double as an index into
/// per-worker arrays (queues, child sockets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    /// Create a worker id from its pool index.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The pool index of this worker.
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {}", self.0)
    }
}

thread_local! {
    /// The worker identity of the current thread, if it is a worker thread.
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Register the current thread as `worker`.
///
/// Called by the worker pool as the first thing a worker thread does. Tests
/// that exercise worker-affine code on an ordinary thread may call this to
/// impersonate a worker (pair with [`clear_current_worker`]).
///
/// # Panics
///
/// Panics if the thread is already registered as a different worker.
pub fn register_current_worker(worker: WorkerId) {
    CURRENT_WORKER.with(|current| match current.get() {
        Some(existing) if existing != worker => {
            panic!("thread is already registered as {existing}, cannot re-register as {worker}");
        }
        _ => current.set(Some(worker)),
    });
}

/// Remove the current thread's worker registration.
///
/// Worker threads never call this (the registration dies with the thread);
/// it exists so tests can impersonate several workers in sequence.
pub fn clear_current_worker() {
    CURRENT_WORKER.with(|current| current.set(None));
}

/// The worker identity of the current thread, or `None` when called from a
/// thread that is not part of a worker pool.
#[inline]
pub fn current_worker() -> Option<WorkerId> {
    CURRENT_WORKER.with(Cell::get)
}

/// Whether the current thread is the given worker.
#[inline]
pub fn is_on_worker(worker: WorkerId) -> bool {
    current_worker() == Some(worker)
}

/// Panics unless the current thread is `worker`.
///
/// Always active. Use [`debug_assert_on_worker`] for checks that should
/// vanish in release builds.
#[inline]
pub fn assert_on_worker(worker: WorkerId, what: &str) {
    if !is_on_worker(worker) {
        panic_wrong_worker(worker, what);
    }
}

/// Debug-only assertion that the current thread is `worker`.
#[inline]
pub fn debug_assert_on_worker(worker: WorkerId, what: &str) {
    #[cfg(debug_assertions)]
    assert_on_worker(worker, what);
    #[cfg(not(debug_assertions))]
    {
        let _ = (worker, what);
    }
}

#[cold]
#[inline(never)]
fn panic_wrong_worker(worker: WorkerId, what: &str) -> ! {
    let current = std::thread::current();
    let current_name = current.name().unwrap_or("<unnamed>");
    let registration = match current_worker() {
        Some(id) => format!("registered as {id}"),
        None => "not a worker thread".to_string(),
    };
    panic!(
        "{what} must run on {worker}, but the current thread \
         \"{current_name}\" is {registration}. Thread-affine socket state may \
         only be touched on its owning worker; enqueue the operation to that \
         worker's event queue instead."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_index_roundtrip() {
        let id = WorkerId::new(3);
        assert_eq!(id.index(), 3);
        assert_eq!(id.to_string(), "worker 3");
    }

    #[test]
    fn test_unregistered_thread_has_no_worker() {
        let handle = std::thread::spawn(|| current_worker());
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn test_register_and_query() {
        std::thread::spawn(|| {
            register_current_worker(WorkerId::new(1));
            assert_eq!(current_worker(), Some(WorkerId::new(1)));
            assert!(is_on_worker(WorkerId::new(1)));
            assert!(!is_on_worker(WorkerId::new(2)));

            // Re-registering the same id is fine.
            register_current_worker(WorkerId::new(1));

            clear_current_worker();
            assert_eq!(current_worker(), None);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_reregister_as_different_worker_panics() {
        let result = std::thread::spawn(|| {
            register_current_worker(WorkerId::new(0));
            register_current_worker(WorkerId::new(1));
        })
        .join();
        assert!(result.is_err(), "expected re-registration to panic");
    }

    #[test]
    fn test_assert_on_worker_panics_off_worker() {
        let result = std::thread::spawn(|| {
            assert_on_worker(WorkerId::new(0), "test operation");
        })
        .join();
        assert!(result.is_err(), "expected affinity assertion to panic");
    }

    #[test]
    fn test_assert_on_worker_passes_on_worker() {
        std::thread::spawn(|| {
            register_current_worker(WorkerId::new(7));
            assert_on_worker(WorkerId::new(7), "test operation");
            debug_assert_on_worker(WorkerId::new(7), "test operation");
        })
        .join()
        .unwrap();
    }
}
