//! Shared socket state.
//!
//! A [`UdpSocket`] is the cross-thread view of one socket: identity, owner
//! worker, lifecycle flags, and the gates other threads wait on. The I/O
//! object itself ([`DriverSocket`](crate::udp::driver::DriverSocket)) lives
//! in the owning worker's table and never leaves that thread.
//!
//! Listener groups form a two-level tree: a parent socket that owns no I/O
//! fans out to one child per worker, each bound to the same local address.
//! Connected sockets are single-level and owned by one worker outright.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use horizon_weft_core::{Latch, WorkerId};

use crate::udp::manager::Shared;
use crate::udp::state::SocketState;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SocketKind {
    /// Listener group parent; owns no I/O.
    Listener,
    /// One listener child, bound on its owning worker.
    Child,
    /// Connected socket, bound and connected on its owning worker.
    Connected,
}

pub(crate) struct UdpSocket {
    id: u64,
    kind: SocketKind,
    /// Owning worker. `None` for listener parents, which have no I/O and
    /// therefore no owner.
    tid: Option<WorkerId>,
    parent: Weak<UdpSocket>,
    children: OnceLock<Box<[Arc<UdpSocket>]>>,
    active: AtomicBool,
    closed: AtomicBool,
    local: OnceLock<SocketAddr>,
    peer: Option<SocketAddr>,
    read_timeout: Option<Duration>,
    /// Counts live [`Handle`](crate::udp::handle::Handle)s on this socket.
    handles: AtomicUsize,
    /// Connected only: set while a read is armed.
    reading: AtomicBool,
    /// Released once per child (parent) or once on close (connected).
    stop_gate: Option<Latch>,
    /// Parent only: released once per child when its bind resolves either
    /// way. Callers wait on this before judging the listen.
    startup: Option<Latch>,
    /// Parent only: children whose bind succeeded.
    bound: AtomicUsize,
    shared: Arc<Shared>,
}

impl UdpSocket {
    pub(crate) fn new_parent(shared: &Arc<Shared>, workers: usize) -> Arc<Self> {
        let socket = Arc::new(Self {
            id: next_id(),
            kind: SocketKind::Listener,
            tid: None,
            parent: Weak::new(),
            children: OnceLock::new(),
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            local: OnceLock::new(),
            peer: None,
            read_timeout: None,
            handles: AtomicUsize::new(0),
            reading: AtomicBool::new(false),
            stop_gate: Some(Latch::new(workers)),
            startup: Some(Latch::new(workers)),
            bound: AtomicUsize::new(0),
            shared: Arc::clone(shared),
        });
        shared.register(&socket);
        socket
    }

    pub(crate) fn new_child(parent: &Arc<Self>, tid: WorkerId) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            kind: SocketKind::Child,
            tid: Some(tid),
            parent: Arc::downgrade(parent),
            children: OnceLock::new(),
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            local: OnceLock::new(),
            peer: None,
            read_timeout: None,
            handles: AtomicUsize::new(0),
            reading: AtomicBool::new(false),
            stop_gate: None,
            startup: None,
            bound: AtomicUsize::new(0),
            shared: Arc::clone(&parent.shared),
        })
    }

    pub(crate) fn new_connected(
        shared: &Arc<Shared>,
        tid: WorkerId,
        peer: SocketAddr,
        read_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let socket = Arc::new(Self {
            id: next_id(),
            kind: SocketKind::Connected,
            tid: Some(tid),
            parent: Weak::new(),
            children: OnceLock::new(),
            active: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            local: OnceLock::new(),
            peer: Some(peer),
            read_timeout,
            handles: AtomicUsize::new(0),
            reading: AtomicBool::new(false),
            stop_gate: Some(Latch::new(1)),
            startup: None,
            bound: AtomicUsize::new(0),
            shared: Arc::clone(shared),
        });
        shared.register(&socket);
        socket
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> SocketKind {
        self.kind
    }

    pub(crate) fn owner(&self) -> Option<WorkerId> {
        self.tid
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn state(&self) -> SocketState {
        if self.closed.load(Ordering::Acquire) {
            SocketState::Closed
        } else if !self.is_active() {
            SocketState::Stopping
        } else if self.local.get().is_none() {
            SocketState::Created
        } else {
            SocketState::Active
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Flip the socket inactive. Returns true for the one caller that made
    /// the transition; every later call sees false and backs off.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip the socket closed. Returns true for the one caller that made
    /// the transition. Closing is what releases the stop gate, so every
    /// teardown path checks this before counting the socket down.
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.shared.deregister(self.id);
        }
        first
    }

    pub(crate) fn local(&self) -> Option<SocketAddr> {
        self.local.get().copied()
    }

    pub(crate) fn set_local(&self, addr: SocketAddr) {
        let _ = self.local.set(addr);
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub(crate) fn set_children(&self, children: Vec<Arc<UdpSocket>>) {
        let _ = self.children.set(children.into_boxed_slice());
    }

    pub(crate) fn children(&self) -> &[Arc<UdpSocket>] {
        self.children.get().map_or(&[], |c| c)
    }

    pub(crate) fn parent(&self) -> Option<Arc<UdpSocket>> {
        self.parent.upgrade()
    }

    pub(crate) fn attach_handle(&self) {
        self.handles.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns how many handles remain attached.
    pub(crate) fn detach_handle(&self) -> usize {
        self.handles.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }

    /// Claim the single read slot. Fails if a read is already armed.
    pub(crate) fn try_begin_read(&self) -> bool {
        self.reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_read(&self) {
        self.reading.store(false, Ordering::Release);
    }

    // Parent-side bookkeeping for child startup.

    pub(crate) fn note_child_bound(&self) {
        self.bound.fetch_add(1, Ordering::AcqRel);
        if let Some(startup) = &self.startup {
            startup.count_down();
        }
    }

    pub(crate) fn note_child_bind_failed(&self) {
        if let Some(startup) = &self.startup {
            startup.count_down();
        }
    }

    pub(crate) fn wait_children_started(&self) {
        if let Some(startup) = &self.startup {
            startup.wait();
        }
    }

    pub(crate) fn bound_children(&self) -> usize {
        self.bound.load(Ordering::Acquire)
    }

    // Stop-gate plumbing. A child releases its parent's gate; a connected
    // socket releases its own.

    pub(crate) fn note_stopped(&self) {
        match self.kind {
            SocketKind::Child => {
                if let Some(parent) = self.parent() {
                    if let Some(gate) = &parent.stop_gate {
                        gate.count_down();
                    }
                }
            }
            _ => {
                if let Some(gate) = &self.stop_gate {
                    gate.count_down();
                }
            }
        }
    }

    pub(crate) fn await_stopped(&self) {
        if let Some(gate) = &self.stop_gate {
            gate.wait();
        }
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tid", &self.tid)
            .field("state", &self.state())
            .field("handles", &self.live_handles())
            .finish()
    }
}

static_assertions::assert_impl_all!(UdpSocket: Send, Sync);
