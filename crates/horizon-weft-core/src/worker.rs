//! Worker pool: one event-loop thread per worker.
//!
//! A [`WorkerPool`] owns N OS threads. Each thread registers its
//! [`WorkerId`], builds a single-threaded tokio runtime with a
//! [`LocalSet`](tokio::task::LocalSet), and then drains its own
//! [`EventQueue`](crate::queue::EventQueue) for the life of the pool. The
//! handler runs inside the `LocalSet`, so it may `spawn_local` follow-up
//! tasks (socket read loops, timers, deferred completions) that are pinned
//! to that worker's thread and make progress whenever the worker is idle in
//! `recv()`. At shutdown the worker drains its queue and then runs the
//! `LocalSet` until every remaining task finishes, so tasks that never end
//! on their own must be aborted by the handler's teardown.
//!
//! Handlers are built per worker by a factory that runs on the worker's own
//! thread, which is what lets them own non-`Send` state (the factory itself
//! must be `Send + Sync`, the handler it returns does not).
//!
//! # Example
//!
//! ```
//! use horizon_weft_core::worker::WorkerPool;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let seen = Arc::new(AtomicUsize::new(0));
//! let pool = {
//!     let seen = seen.clone();
//!     WorkerPool::spawn(2, move |_worker| {
//!         let seen = seen.clone();
//!         move |n: usize| {
//!             seen.fetch_add(n, Ordering::SeqCst);
//!         }
//!     })
//!     .unwrap()
//! };
//!
//! pool.sender(horizon_weft_core::affinity::WorkerId::new(0))
//!     .unwrap()
//!     .enqueue(5)
//!     .unwrap();
//! pool.stop_and_join();
//! assert_eq!(seen.load(Ordering::SeqCst), 5);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::affinity::{self, WorkerId};
use crate::error::{CoreError, Result};
use crate::queue::{EventQueue, EventReceiver, EventSender};

/// Configuration for spawning a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix for worker thread names; threads are named `{prefix}-{index}`.
    pub thread_name: String,
    /// Stack size for worker threads in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_name: "weft-worker".to_string(),
            stack_size: None,
        }
    }
}

/// An item on a worker's queue: either user work or the shutdown marker.
enum PoolEvent<E> {
    User(E),
    Shutdown,
}

/// Sender for one worker's queue, hiding the pool's internal shutdown marker.
pub struct WorkerSender<E> {
    inner: EventSender<PoolEvent<E>>,
}

impl<E> Clone for WorkerSender<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> WorkerSender<E> {
    /// The worker this sender feeds.
    pub fn owner(&self) -> WorkerId {
        self.inner.owner()
    }

    /// Enqueue an event to the owning worker.
    pub fn enqueue(&self, event: E) -> Result<()> {
        self.inner.enqueue(PoolEvent::User(event))
    }

    /// Like [`enqueue`](WorkerSender::enqueue), but hands the event back on
    /// failure so the caller can complete it in place.
    pub fn enqueue_or_return(&self, event: E) -> std::result::Result<(), E> {
        self.inner
            .enqueue_or_return(PoolEvent::User(event))
            .map_err(|returned| match returned {
                PoolEvent::User(event) => event,
                PoolEvent::Shutdown => unreachable!("a user event was sent"),
            })
    }
}

impl<E> std::fmt::Debug for WorkerSender<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSender").field("owner", &self.owner()).finish()
    }
}

/// A fixed set of event-loop worker threads.
///
/// The pool is `Send + Sync`; senders can be handed to any thread. Stopping
/// is two-phase like the rest of the teardown machinery: [`stop`] requests
/// shutdown without blocking, [`join`] waits for the threads.
///
/// [`stop`]: WorkerPool::stop
/// [`join`]: WorkerPool::join
pub struct WorkerPool<E: Send + 'static> {
    senders: Vec<WorkerSender<E>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl<E: Send + 'static> WorkerPool<E> {
    /// Spawn `count` workers with the default configuration.
    ///
    /// `factory` is invoked once on each worker thread, after the thread has
    /// registered its identity and built its runtime, to produce that
    /// worker's event handler.
    pub fn spawn<F, H>(count: usize, factory: F) -> Result<Self>
    where
        F: Fn(WorkerId) -> H + Send + Sync + 'static,
        H: FnMut(E),
    {
        Self::spawn_with_config(count, PoolConfig::default(), factory)
    }

    /// Spawn `count` workers with a custom configuration.
    ///
    /// Returns once every worker thread is live with its runtime built; if
    /// any worker fails to come up, the ones that did are stopped and the
    /// error is returned.
    pub fn spawn_with_config<F, H>(count: usize, config: PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn(WorkerId) -> H + Send + Sync + 'static,
        H: FnMut(E),
    {
        assert!(count > 0, "worker pool requires at least one worker");

        let factory = Arc::new(factory);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::io::Result<()>>(count);

        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        let mut spawn_error: Option<CoreError> = None;

        for index in 0..count {
            let id = WorkerId::new(index);
            let queue = EventQueue::new(id);
            let receiver = queue.take_receiver()?;
            senders.push(WorkerSender {
                inner: queue.sender(),
            });

            let mut builder = thread::Builder::new().name(format!("{}-{index}", config.thread_name));
            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let factory = factory.clone();
            let ready_tx = ready_tx.clone();
            match builder.spawn(move || worker_main(id, receiver, factory, ready_tx)) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    spawn_error = Some(CoreError::Spawn(err));
                    break;
                }
            }
        }
        drop(ready_tx);

        // Startup handshake: every spawned worker reports whether its
        // runtime came up before the pool is considered live.
        if spawn_error.is_none() {
            for _ in 0..handles.len() {
                match ready_rx.recv() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        spawn_error = Some(CoreError::Spawn(err));
                        break;
                    }
                    Err(_) => break,
                }
            }
        }

        if let Some(err) = spawn_error {
            for sender in &senders {
                let _ = sender.inner.enqueue(PoolEvent::Shutdown);
            }
            for handle in handles {
                let _ = handle.join();
            }
            return Err(err);
        }

        tracing::trace!(
            target: "horizon_weft_core::worker",
            workers = count,
            "worker pool started"
        );

        Ok(Self {
            senders,
            handles: Mutex::new(handles),
            running: AtomicBool::new(true),
        })
    }

    /// Number of workers in the pool.
    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Whether [`stop`](WorkerPool::stop) has not yet been requested.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The sender for one worker's queue.
    pub fn sender(&self, worker: WorkerId) -> Option<WorkerSender<E>> {
        self.senders.get(worker.index()).cloned()
    }

    /// Senders for every worker, indexed by [`WorkerId::index`].
    pub fn senders(&self) -> Vec<WorkerSender<E>> {
        self.senders.clone()
    }

    /// Request shutdown of every worker without blocking.
    ///
    /// Events enqueued before this call are still processed; the shutdown
    /// marker sits behind them in each queue.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::trace!(target: "horizon_weft_core::worker", "stopping worker pool");
            for sender in &self.senders {
                let _ = sender.inner.enqueue(PoolEvent::Shutdown);
            }
        }
    }

    /// Wait for every worker thread to finish.
    ///
    /// Returns `true` if all threads were joined cleanly, `false` if already
    /// joined or a thread panicked.
    pub fn join(&self) -> bool {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return false;
        }
        let mut all_ok = true;
        for handle in handles {
            all_ok &= handle.join().is_ok();
        }
        all_ok
    }

    /// [`stop`](WorkerPool::stop) followed by [`join`](WorkerPool::join).
    pub fn stop_and_join(&self) -> bool {
        self.stop();
        self.join()
    }
}

impl<E: Send + 'static> Drop for WorkerPool<E> {
    fn drop(&mut self) {
        self.stop();
        // Don't block in drop - just request shutdown
    }
}

static_assertions::assert_impl_all!(WorkerPool<u32>: Send, Sync);
static_assertions::assert_impl_all!(WorkerSender<u32>: Send, Sync);

/// Body of one worker thread.
fn worker_main<E, F, H>(
    id: WorkerId,
    mut receiver: EventReceiver<PoolEvent<E>>,
    factory: Arc<F>,
    ready_tx: crossbeam_channel::Sender<std::io::Result<()>>,
) where
    E: Send + 'static,
    F: Fn(WorkerId) -> H + Send + Sync + 'static,
    H: FnMut(E),
{
    affinity::register_current_worker(id);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => {
            let _ = ready_tx.send(Ok(()));
            runtime
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    drop(ready_tx);

    let mut handler = factory(id);
    tracing::trace!(target: "horizon_weft_core::worker", worker = id.index(), "worker started");

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async {
        while let Some(event) = receiver.recv().await {
            match event {
                PoolEvent::User(event) => handler(event),
                PoolEvent::Shutdown => break,
            }
        }
        // Shut the intake first so a late enqueue fails back to its
        // sender, then drain everything the queue had already accepted.
        // The drain stays inside the runtime so handlers can keep using
        // the reactor and spawn_local.
        receiver.close();
        while let Some(event) = receiver.try_recv() {
            if let PoolEvent::User(event) = event {
                handler(event);
            }
        }
    });
    // Run the local set dry before the thread exits: tasks the drained
    // handlers spawned still complete on this worker, none are dropped
    // mid-flight.
    runtime.block_on(local);

    tracing::trace!(target: "horizon_weft_core::worker", worker = id.index(), "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_factory_runs_once_per_worker() {
        let ids = Arc::new(Mutex::new(Vec::new()));
        let pool = {
            let ids = ids.clone();
            WorkerPool::spawn(3, move |worker| {
                ids.lock().push(worker);
                move |_: u32| {}
            })
            .unwrap()
        };
        assert_eq!(pool.worker_count(), 3);
        pool.stop_and_join();

        let mut seen = ids.lock().clone();
        seen.sort();
        assert_eq!(seen, vec![WorkerId::new(0), WorkerId::new(1), WorkerId::new(2)]);
    }

    #[test]
    fn test_events_run_on_owning_worker() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let pool = {
            let observed = observed.clone();
            WorkerPool::spawn(2, move |_| {
                let observed = observed.clone();
                move |expected: WorkerId| {
                    observed.lock().push((expected, affinity::current_worker()));
                }
            })
            .unwrap()
        };

        for id in [WorkerId::new(0), WorkerId::new(1), WorkerId::new(0)] {
            pool.sender(id).unwrap().enqueue(id).unwrap();
        }
        pool.stop_and_join();

        let observed = observed.lock();
        assert_eq!(observed.len(), 3);
        for (expected, actual) in observed.iter() {
            assert_eq!(Some(*expected), *actual);
        }
    }

    #[test]
    fn test_events_already_queued_survive_stop() {
        let processed = Arc::new(AtomicUsize::new(0));
        let pool = {
            let processed = processed.clone();
            WorkerPool::spawn(1, move |_| {
                let processed = processed.clone();
                move |_: u32| {
                    processed.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap()
        };

        let sender = pool.sender(WorkerId::new(0)).unwrap();
        for n in 0..50 {
            sender.enqueue(n).unwrap();
        }
        pool.stop_and_join();
        assert_eq!(processed.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_handler_can_spawn_local_tasks() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = {
            let done = done.clone();
            WorkerPool::spawn(1, move |_| {
                let done = done.clone();
                move |_: u32| {
                    let done = done.clone();
                    tokio::task::spawn_local(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
            .unwrap()
        };

        pool.sender(WorkerId::new(0)).unwrap().enqueue(0).unwrap();

        // The task progresses while the worker waits for more events.
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(done.load(Ordering::SeqCst), 1);
        pool.stop_and_join();
    }

    #[test]
    fn test_spawned_tasks_finish_before_join_returns() {
        let done = Arc::new(AtomicUsize::new(0));
        let pool = {
            let done = done.clone();
            WorkerPool::spawn(1, move |_| {
                let done = done.clone();
                move |_: u32| {
                    let done = done.clone();
                    tokio::task::spawn_local(async move {
                        tokio::task::yield_now().await;
                        done.fetch_add(1, Ordering::SeqCst);
                    });
                }
            })
            .unwrap()
        };

        let sender = pool.sender(WorkerId::new(0)).unwrap();
        for n in 0..50 {
            sender.enqueue(n).unwrap();
        }
        // Join with no grace period: tasks spawned by the final drained
        // events must still run before the worker thread exits.
        pool.stop_and_join();
        assert_eq!(done.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_events_racing_stop_are_processed_or_returned() {
        let processed = Arc::new(AtomicUsize::new(0));
        let pool = {
            let processed = processed.clone();
            WorkerPool::spawn(1, move |_| {
                let processed = processed.clone();
                move |_: u32| {
                    processed.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap()
        };
        let sender = pool.sender(WorkerId::new(0)).unwrap();

        let halt = Arc::new(AtomicBool::new(false));
        let returned = Arc::new(AtomicUsize::new(0));
        let producer = {
            let halt = halt.clone();
            let returned = returned.clone();
            let sender = sender.clone();
            thread::spawn(move || {
                let mut attempts = 0usize;
                while !halt.load(Ordering::SeqCst) {
                    if sender.enqueue_or_return(attempts as u32).is_err() {
                        returned.fetch_add(1, Ordering::SeqCst);
                    }
                    attempts += 1;
                }
                attempts
            })
        };

        thread::sleep(Duration::from_millis(20));
        pool.stop_and_join();
        halt.store(true, Ordering::SeqCst);
        let attempts = producer.join().unwrap();

        // Every event either ran on the worker or came back to the
        // producer; none slipped into the queue unseen.
        assert_eq!(
            processed.load(Ordering::SeqCst) + returned.load(Ordering::SeqCst),
            attempts
        );
    }

    #[test]
    fn test_enqueue_after_shutdown_fails() {
        let pool = WorkerPool::spawn(1, |_| move |_: u32| {}).unwrap();
        let sender = pool.sender(WorkerId::new(0)).unwrap();

        assert!(pool.is_running());
        pool.stop_and_join();
        assert!(!pool.is_running());

        assert!(matches!(sender.enqueue(1), Err(CoreError::QueueClosed(_))));
        assert_eq!(sender.enqueue_or_return(2), Err(2));
    }

    #[test]
    fn test_join_twice_returns_false() {
        let pool = WorkerPool::spawn(1, |_| move |_: u32| {}).unwrap();
        assert!(pool.stop_and_join());
        assert!(!pool.join());
    }

    #[test]
    fn test_fifo_order_through_pool() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pool = {
            let order = order.clone();
            WorkerPool::spawn(1, move |_| {
                let order = order.clone();
                move |n: u32| {
                    order.lock().push(n);
                }
            })
            .unwrap()
        };

        let sender = pool.sender(WorkerId::new(0)).unwrap();
        for n in 0..100 {
            sender.enqueue(n).unwrap();
        }
        pool.stop_and_join();
        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
    }
}
