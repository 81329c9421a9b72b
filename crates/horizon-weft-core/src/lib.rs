//! Core systems for Horizon Weft.
//!
//! This crate provides the thread substrate for the Horizon Weft network
//! manager:
//!
//! - **Worker Pool**: N event-loop threads, each a single-threaded tokio
//!   runtime with a `LocalSet` for thread-pinned tasks
//! - **Event Queues**: the per-worker FIFO that is the only sanctioned way
//!   to reach another worker's state
//! - **Worker Affinity**: worker identity in thread-local storage, plus
//!   assertion helpers for thread-affine code
//! - **Completion Gates**: counted latches for startup barriers and
//!   teardown waits
//!
//! # Worker Pool Example
//!
//! ```
//! use horizon_weft_core::affinity::{self, WorkerId};
//! use horizon_weft_core::worker::WorkerPool;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let hits = Arc::new(AtomicUsize::new(0));
//! let pool = {
//!     let hits = hits.clone();
//!     WorkerPool::spawn(4, move |worker: WorkerId| {
//!         let hits = hits.clone();
//!         move |_event: ()| {
//!             // Runs on `worker`'s own thread.
//!             assert_eq!(affinity::current_worker(), Some(worker));
//!             hits.fetch_add(1, Ordering::SeqCst);
//!         }
//!     })
//!     .unwrap()
//! };
//!
//! for sender in pool.senders() {
//!     sender.enqueue(()).unwrap();
//! }
//! pool.stop_and_join();
//! assert_eq!(hits.load(Ordering::SeqCst), 4);
//! ```

pub mod affinity;
pub mod completion;
mod error;
pub mod queue;
pub mod worker;

pub use affinity::{current_worker, is_on_worker, WorkerId};
pub use completion::Latch;
pub use error::{CoreError, Result};
pub use queue::{EventQueue, EventReceiver, EventSender};
pub use worker::{PoolConfig, WorkerPool, WorkerSender};
