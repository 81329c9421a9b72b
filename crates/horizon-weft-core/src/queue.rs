//! Per-worker event queues.
//!
//! An [`EventQueue`] is the only sanctioned way to reach state owned by
//! another worker thread: any thread may enqueue through a cheap cloneable
//! [`EventSender`], while the single [`EventReceiver`] is claimed once by the
//! owning worker and drained only there. Enqueueing wakes the owner if it is
//! parked waiting for I/O, because the receive half is awaited inside the
//! worker's runtime.
//!
//! Ordering: events enqueued by one producer thread for the same worker are
//! received in enqueue order. Nothing is guaranteed across workers.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::affinity::{self, WorkerId};
use crate::error::{CoreError, Result};

/// A FIFO of work items owned by one worker thread.
pub struct EventQueue<E> {
    sender: EventSender<E>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<E>>>,
}

impl<E> EventQueue<E> {
    /// Create the queue for `owner`.
    pub fn new(owner: WorkerId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: EventSender { owner, tx },
            receiver: Mutex::new(Some(rx)),
        }
    }

    /// The worker that owns (and drains) this queue.
    pub fn owner(&self) -> WorkerId {
        self.sender.owner
    }

    /// A sender usable from any thread.
    pub fn sender(&self) -> EventSender<E> {
        self.sender.clone()
    }

    /// Claim the receive half.
    ///
    /// This succeeds exactly once; the worker calls it when its thread
    /// starts, and from then on the queue can only be drained there.
    pub fn take_receiver(&self) -> Result<EventReceiver<E>> {
        match self.receiver.lock().take() {
            Some(rx) => Ok(EventReceiver {
                owner: self.sender.owner,
                rx,
            }),
            None => Err(CoreError::ReceiverTaken(self.sender.owner)),
        }
    }
}

/// Thread-safe enqueue half of an [`EventQueue`].
pub struct EventSender<E> {
    owner: WorkerId,
    tx: mpsc::UnboundedSender<E>,
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner,
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSender<E> {
    /// The worker this sender feeds.
    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    /// Append an event to the owner's queue, waking the owner if idle.
    ///
    /// Fails only when the owning worker has shut down and dropped the
    /// receive half.
    pub fn enqueue(&self, event: E) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| CoreError::QueueClosed(self.owner))
    }

    /// Like [`enqueue`](EventSender::enqueue), but hands the event back on
    /// failure so the caller can complete it in place instead of losing it.
    pub fn enqueue_or_return(&self, event: E) -> std::result::Result<(), E> {
        self.tx.send(event).map_err(|err| err.0)
    }
}

impl<E> std::fmt::Debug for EventSender<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender").field("owner", &self.owner).finish()
    }
}

/// The owner-side drain half of an [`EventQueue`].
pub struct EventReceiver<E> {
    owner: WorkerId,
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> EventReceiver<E> {
    /// The worker that owns this receiver.
    pub fn owner(&self) -> WorkerId {
        self.owner
    }

    /// Await the next event. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<E> {
        affinity::debug_assert_on_worker(self.owner, "draining the event queue");
        self.rx.recv().await
    }

    /// Pop an event without waiting, if one is ready.
    ///
    /// Used to drain stragglers during worker shutdown.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Shut the intake while keeping events already accepted receivable.
    ///
    /// From this point every `enqueue` fails and `enqueue_or_return` hands
    /// the event back. Paired with a final
    /// [`try_recv`](EventReceiver::try_recv) drain, every event the queue
    /// ever accepted is still received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

static_assertions::assert_impl_all!(EventSender<u32>: Send, Sync);
static_assertions::assert_impl_all!(EventQueue<u32>: Send, Sync);
