//! Per-worker socket state and event dispatch.
//!
//! Each pool thread owns a [`WorkerState`]: its driver plus a table mapping
//! socket ids to live I/O objects. The state is reachable two ways. The
//! worker's event handler dispatches queued [`NetEvent`]s into it, and the
//! `submit_*` entry points take a shortcut straight into it when the calling
//! thread already is the socket's owner, skipping the queue hop.
//!
//! Re-entrancy rules: user callbacks are always invoked with no table or
//! driver borrow held, so a callback is free to send, arm reads, or drop
//! handles. Datagram deliveries and successful send completions arrive
//! from local tasks the driver spawned, never from inside a dispatch
//! frame. The one exception is a stop, which settles every completion
//! still in flight inline before it reports the socket closed.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use horizon_weft_core::{affinity, WorkerId};
use rand::Rng;

use crate::error::NetError;
use crate::udp::config::ManagerConfig;
use crate::udp::driver::{DriverError, DriverSocket, RecvFn, UdpDriver};
use crate::udp::event::{ConnectCallback, NetEvent, RecvCallback, SendCallback};
use crate::udp::handle::Handle;
use crate::udp::manager::Shared;
use crate::udp::socket::{SocketKind, UdpSocket};
use crate::udp::stats::ManagerStats;

thread_local! {
    static WORKER_STATE: RefCell<Option<Rc<WorkerState>>> = const { RefCell::new(None) };
}

struct Entry {
    io: Box<dyn DriverSocket>,
    read: Option<ReadState>,
    /// Sends handed to the driver whose completions have not run yet,
    /// keyed and ordered by issue. A completion claims its slot back; a
    /// stop claims whatever is left, so each callback fires exactly once.
    sends: Rc<RefCell<BTreeMap<u64, InFlightSend>>>,
    next_send: u64,
}

impl Entry {
    fn new(io: Box<dyn DriverSocket>) -> Self {
        Self {
            io,
            read: None,
            sends: Rc::new(RefCell::new(BTreeMap::new())),
            next_send: 0,
        }
    }
}

struct InFlightSend {
    handle: Handle,
    done: SendCallback,
}

struct ReadState {
    cb: RecvCallback,
    handle: Handle,
    timer: Option<tokio::task::JoinHandle<()>>,
}

pub(crate) struct WorkerState {
    id: WorkerId,
    shared: Arc<Shared>,
    driver: RefCell<Box<dyn UdpDriver>>,
    table: RefCell<HashMap<u64, Entry>>,
}

/// Build this thread's [`WorkerState`] and hand back the pool event handler.
/// Runs on the worker thread itself, from the pool's handler factory.
pub(crate) fn install(
    id: WorkerId,
    shared: Arc<Shared>,
    driver: Box<dyn UdpDriver>,
) -> impl FnMut(NetEvent) {
    let state = Rc::new(WorkerState {
        id,
        shared,
        driver: RefCell::new(driver),
        table: RefCell::new(HashMap::new()),
    });
    WORKER_STATE.with(|slot| *slot.borrow_mut() = Some(Rc::clone(&state)));
    move |event| state.handle(event)
}

fn current_state() -> Option<Rc<WorkerState>> {
    WORKER_STATE.with(|slot| slot.borrow().clone())
}

/// This thread's state, but only if the thread is `owner` inside the same
/// manager. A worker of some other manager must not be mistaken for an
/// owner just because its index matches.
fn local_state(shared: &Arc<Shared>, owner: WorkerId) -> Option<Rc<WorkerState>> {
    current_state().filter(|state| state.id == owner && Arc::ptr_eq(&state.shared, shared))
}

fn local_worker(shared: &Arc<Shared>) -> Option<WorkerId> {
    current_state()
        .filter(|state| Arc::ptr_eq(&state.shared, shared))
        .map(|state| state.id)
}

fn exceeds_limit(config: &ManagerConfig, len: usize) -> bool {
    config.max_datagram_size.is_some_and(|limit| len > limit)
}

/// Start a send on the socket behind `handle`.
///
/// Listener-group handles resolve to one child first: the current worker's
/// own child when the caller is a pool thread, a uniformly random child
/// otherwise. The completion then runs on the chosen child's owner.
pub(crate) fn submit_send(handle: Handle, payload: Bytes, done: SendCallback) {
    let shared = Arc::clone(handle.socket().shared());

    // Fault injection: an oversize datagram is treated as lost in transit.
    // No completion callback fires for this path.
    if exceeds_limit(shared.config(), payload.len()) {
        ManagerStats::incr(&shared.stats().sends_dropped);
        return;
    }

    let target = match handle.socket().kind() {
        SocketKind::Listener => {
            match pick_child(&shared, handle.socket().children()) {
                Some(child) => child,
                None => {
                    ManagerStats::incr(&shared.stats().send_failures);
                    done(handle, Err(NetError::Canceled));
                    return;
                }
            }
        }
        _ => Arc::clone(handle.socket()),
    };

    let peer = match target.kind() {
        SocketKind::Connected => None,
        _ => Some(handle.peer()),
    };
    let Some(owner) = target.owner() else {
        ManagerStats::incr(&shared.stats().send_failures);
        done(handle, Err(NetError::Canceled));
        return;
    };

    match local_state(&shared, owner) {
        Some(state) => state.do_send(&target, peer, payload, handle, done),
        None => enqueue_or_fail(
            &shared,
            owner,
            NetEvent::Send {
                socket: target,
                peer,
                payload,
                handle,
                done,
            },
        ),
    }
}

/// Arm a read on a connected socket. The caller has already claimed the
/// socket's read slot.
pub(crate) fn submit_start_read(handle: Handle, cb: RecvCallback) {
    let socket = Arc::clone(handle.socket());
    let shared = Arc::clone(socket.shared());
    let Some(owner) = socket.owner() else {
        socket.end_read();
        cb(handle, Err(NetError::Canceled));
        return;
    };
    match local_state(&shared, owner) {
        Some(state) => state.do_start_read(socket, handle, cb),
        None => enqueue_or_fail(&shared, owner, NetEvent::StartRead { socket, handle, cb }),
    }
}

pub(crate) fn submit_cancel_read(socket: &Arc<UdpSocket>) {
    let shared = Arc::clone(socket.shared());
    let Some(owner) = socket.owner() else { return };
    match local_state(&shared, owner) {
        Some(state) => state.do_cancel_read(socket),
        None => enqueue_or_fail(
            &shared,
            owner,
            NetEvent::CancelRead {
                socket: Arc::clone(socket),
            },
        ),
    }
}

/// Open-and-connect on the owning worker.
pub(crate) fn submit_connect(
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peer: SocketAddr,
    done: ConnectCallback,
) {
    let shared = Arc::clone(socket.shared());
    let Some(owner) = socket.owner() else {
        done(Err(NetError::Shutdown));
        return;
    };
    match local_state(&shared, owner) {
        Some(state) => state.do_connect(socket, local, peer, done),
        None => enqueue_or_fail(
            &shared,
            owner,
            NetEvent::Connect {
                socket,
                local,
                peer,
                done,
            },
        ),
    }
}

/// Bind one listener child on its owner.
pub(crate) fn submit_start_listen(child: Arc<UdpSocket>, cb: RecvCallback) {
    let shared = Arc::clone(child.shared());
    let Some(owner) = child.owner() else { return };
    match local_state(&shared, owner) {
        Some(state) => state.do_start_listen(child, cb),
        None => enqueue_or_fail(&shared, owner, NetEvent::StartListen { child, cb }),
    }
}

/// Stop a socket, running in place when the caller owns it.
pub(crate) fn stop_socket(socket: &Arc<UdpSocket>) {
    let shared = Arc::clone(socket.shared());
    let Some(owner) = socket.owner() else { return };
    match local_state(&shared, owner) {
        Some(state) => state.do_stop(socket),
        None => enqueue_or_fail(
            &shared,
            owner,
            NetEvent::Stop {
                socket: Arc::clone(socket),
            },
        ),
    }
}

/// Stop a socket strictly by enqueueing, never in place. Safe to call from
/// drop glue and callbacks, where running teardown inline could re-enter
/// state that is already borrowed further up the stack.
pub(crate) fn request_stop(socket: &Arc<UdpSocket>) {
    let shared = Arc::clone(socket.shared());
    let Some(owner) = socket.owner() else { return };
    enqueue_or_fail(
        &shared,
        owner,
        NetEvent::Stop {
            socket: Arc::clone(socket),
        },
    );
}

fn pick_child(shared: &Arc<Shared>, children: &[Arc<UdpSocket>]) -> Option<Arc<UdpSocket>> {
    if children.is_empty() {
        return None;
    }
    if let Some(worker) = local_worker(shared) {
        if let Some(child) = children.get(worker.index()) {
            return Some(Arc::clone(child));
        }
    }
    let index = rand::thread_rng().gen_range(0..children.len());
    Some(Arc::clone(&children[index]))
}

/// The worker new single-socket work should land on: the calling worker
/// when the caller is one of this manager's threads, otherwise a random one.
pub(crate) fn preferred_worker(shared: &Arc<Shared>) -> WorkerId {
    local_worker(shared).unwrap_or_else(|| {
        WorkerId::new(rand::thread_rng().gen_range(0..shared.worker_count()))
    })
}

/// Enqueue to `owner`, or complete the event in place if the worker is
/// gone. Every caller-initiated operation still reports a result this way
/// even when it races manager shutdown.
fn enqueue_or_fail(shared: &Arc<Shared>, owner: WorkerId, event: NetEvent) {
    let Some(sender) = shared.sender(owner) else {
        fail_event(shared, event);
        return;
    };
    if let Err(event) = sender.enqueue_or_return(event) {
        fail_event(shared, event);
    }
}

fn fail_event(shared: &Arc<Shared>, event: NetEvent) {
    match event {
        NetEvent::StartListen { child, .. } => {
            child.deactivate();
            if let Some(parent) = child.parent() {
                parent.note_child_bind_failed();
            }
            if child.mark_closed() {
                child.note_stopped();
            }
        }
        NetEvent::Stop { socket } => {
            if socket.mark_closed() {
                socket.note_stopped();
            }
        }
        NetEvent::Send { handle, done, .. } => {
            ManagerStats::incr(&shared.stats().send_failures);
            done(handle, Err(NetError::Shutdown));
        }
        NetEvent::Connect { socket, done, .. } => {
            socket.deactivate();
            if socket.mark_closed() {
                socket.note_stopped();
            }
            done(Err(NetError::Shutdown));
        }
        NetEvent::StartRead { socket, handle, cb } => {
            socket.end_read();
            cb(handle, Err(NetError::Shutdown));
        }
        NetEvent::CancelRead { .. } => {}
    }
}

/// Receive closure for a listener child. Handles the silent-drop rules and
/// mints a fresh handle per delivered datagram.
fn listener_recv(shared: Arc<Shared>, child: Arc<UdpSocket>, cb: RecvCallback) -> RecvFn {
    Box::new(move |source, payload| {
        let stats = shared.stats();
        let Some(source) = source else {
            ManagerStats::incr(&stats.datagrams_dropped);
            return;
        };
        if exceeds_limit(shared.config(), payload.len()) || !child.is_active() {
            ManagerStats::incr(&stats.datagrams_dropped);
            return;
        }
        let Some(local) = child.local() else {
            ManagerStats::incr(&stats.datagrams_dropped);
            return;
        };
        ManagerStats::incr(&stats.datagrams_received);
        cb(Handle::new(Arc::clone(&child), local, source), Ok(payload));
    })
}

/// Receive closure for a connected socket: routes into the worker state so
/// deliveries can consult the armed read and re-arm its timer.
fn connected_recv(state: &Rc<WorkerState>, socket: Arc<UdpSocket>) -> RecvFn {
    let weak = Rc::downgrade(state);
    Box::new(move |source, payload| {
        if let Some(state) = weak.upgrade() {
            state.deliver_connected(&socket, source, payload);
        }
    })
}

fn abandon_child(child: &Arc<UdpSocket>, parent: &Arc<UdpSocket>) {
    child.deactivate();
    parent.note_child_bind_failed();
    if child.mark_closed() {
        child.note_stopped();
    }
}

impl WorkerState {
    fn handle(self: &Rc<Self>, event: NetEvent) {
        affinity::debug_assert_on_worker(self.id, "socket event dispatch");
        match event {
            NetEvent::StartListen { child, cb } => self.do_start_listen(child, cb),
            NetEvent::Stop { socket } => self.do_stop(&socket),
            NetEvent::Send {
                socket,
                peer,
                payload,
                handle,
                done,
            } => self.do_send(&socket, peer, payload, handle, done),
            NetEvent::Connect {
                socket,
                local,
                peer,
                done,
            } => self.do_connect(socket, local, peer, done),
            NetEvent::StartRead { socket, handle, cb } => self.do_start_read(socket, handle, cb),
            NetEvent::CancelRead { socket } => self.do_cancel_read(&socket),
        }
    }

    fn note_driver_failure(&self, err: &DriverError) {
        tracing::trace!(
            target: "horizon_weft_net::udp",
            worker = self.id.index(),
            error = %err,
            "socket setup failed"
        );
        let stats = self.shared.stats();
        let counter = match err {
            DriverError::Open(_) => &stats.open_failures,
            DriverError::Bind(_) => &stats.bind_failures,
            DriverError::RecvStart(_) => &stats.recv_start_failures,
            DriverError::Connect(_) => &stats.connect_failures,
        };
        ManagerStats::incr(counter);
    }

    fn do_start_listen(&self, child: Arc<UdpSocket>, cb: RecvCallback) {
        let Some(parent) = child.parent() else { return };
        // A stop processed ahead of this start, or a manager already
        // shutting down, retires the child before it ever binds; only the
        // startup accounting is still owed.
        if !child.is_active() || !self.shared.is_active() {
            parent.note_child_bind_failed();
            return;
        }
        let Some(addr) = parent.local() else {
            abandon_child(&child, &parent);
            return;
        };

        let config = self.shared.config();
        let opened = self
            .driver
            .borrow_mut()
            .bind(addr, config.reuse, config.recv_buffer_size);
        let mut io = match opened {
            Ok(io) => io,
            Err(err) => {
                self.note_driver_failure(&err);
                abandon_child(&child, &parent);
                return;
            }
        };

        child.set_local(io.local_addr());
        let recv = listener_recv(Arc::clone(&self.shared), Arc::clone(&child), cb);
        if let Err(err) = io.recv_start(recv) {
            self.note_driver_failure(&err);
            abandon_child(&child, &parent);
            return;
        }

        ManagerStats::incr(&self.shared.stats().sockets_opened);
        self.table.borrow_mut().insert(child.id(), Entry::new(io));
        parent.note_child_bound();
    }

    fn do_stop(&self, socket: &Arc<UdpSocket>) {
        if socket.is_closed() {
            return;
        }
        socket.deactivate();

        let (read, sends) = match self.table.borrow_mut().remove(&socket.id()) {
            Some(Entry { io, read, sends, .. }) => {
                // Dropping the I/O object stops the receive loop, discards
                // send tasks the reactor has not run, and releases the OS
                // handle.
                drop(io);
                let sends = std::mem::take(&mut *sends.borrow_mut());
                (read, sends)
            }
            None => (None, BTreeMap::new()),
        };
        if let Some(ReadState { cb, handle, timer }) = read {
            if let Some(timer) = timer {
                timer.abort();
            }
            socket.end_read();
            cb(handle, Err(NetError::Canceled));
        }
        // Sends the driver never finished settle here, in issue order,
        // before the stop gate opens. Once a blocked stop call returns, no
        // completion is left to fire.
        for (_, InFlightSend { handle, done }) in sends {
            ManagerStats::incr(&self.shared.stats().send_failures);
            done(handle, Err(NetError::Canceled));
        }

        if socket.mark_closed() {
            socket.note_stopped();
        }
    }

    fn do_send(
        &self,
        socket: &Arc<UdpSocket>,
        peer: Option<SocketAddr>,
        payload: Bytes,
        handle: Handle,
        done: SendCallback,
    ) {
        let shared = Arc::clone(&self.shared);
        if !socket.is_active() {
            ManagerStats::incr(&shared.stats().send_failures);
            done(handle, Err(NetError::Canceled));
            return;
        }

        let mut table = self.table.borrow_mut();
        let Some(entry) = table.get_mut(&socket.id()) else {
            drop(table);
            ManagerStats::incr(&shared.stats().send_failures);
            done(handle, Err(NetError::Canceled));
            return;
        };

        let slot = entry.next_send;
        entry.next_send += 1;
        entry
            .sends
            .borrow_mut()
            .insert(slot, InFlightSend { handle, done });

        let sends = Rc::clone(&entry.sends);
        entry.io.send_to(
            payload,
            peer,
            Box::new(move |result| {
                // A stop may have settled this send already.
                let Some(InFlightSend { handle, done }) = sends.borrow_mut().remove(&slot) else {
                    return;
                };
                match result {
                    Ok(()) => {
                        ManagerStats::incr(&shared.stats().sends_completed);
                        done(handle, Ok(()));
                    }
                    Err(err) => {
                        ManagerStats::incr(&shared.stats().send_failures);
                        done(handle, Err(err.into()));
                    }
                }
            }),
        );
    }

    fn do_connect(
        &self,
        socket: Arc<UdpSocket>,
        local: SocketAddr,
        peer: SocketAddr,
        done: ConnectCallback,
    ) {
        // A connect that lost the race with shutdown must not open a
        // socket the closing sweep has already passed over.
        if !socket.is_active() || !self.shared.is_active() {
            socket.deactivate();
            if socket.mark_closed() {
                socket.note_stopped();
            }
            done(Err(NetError::Shutdown));
            return;
        }

        let opened = self
            .driver
            .borrow_mut()
            .connect(local, peer, self.shared.config().recv_buffer_size);
        match opened {
            Ok(io) => {
                let bound = io.local_addr();
                socket.set_local(bound);
                ManagerStats::incr(&self.shared.stats().sockets_opened);
                self.table.borrow_mut().insert(socket.id(), Entry::new(io));
                done(Ok(Handle::new(socket, bound, peer)));
            }
            Err(err) => {
                self.note_driver_failure(&err);
                socket.deactivate();
                if socket.mark_closed() {
                    socket.note_stopped();
                }
                done(Err(err.into()));
            }
        }
    }

    fn do_start_read(self: &Rc<Self>, socket: Arc<UdpSocket>, handle: Handle, cb: RecvCallback) {
        if !socket.is_active() {
            socket.end_read();
            cb(handle, Err(NetError::Canceled));
            return;
        }
        {
            let mut table = self.table.borrow_mut();
            let Some(entry) = table.get_mut(&socket.id()) else {
                drop(table);
                socket.end_read();
                cb(handle, Err(NetError::Canceled));
                return;
            };
            let recv = connected_recv(self, Arc::clone(&socket));
            if let Err(err) = entry.io.recv_start(recv) {
                drop(table);
                self.note_driver_failure(&err);
                socket.end_read();
                cb(handle, Err(err.into()));
                return;
            }
            entry.read = Some(ReadState {
                cb,
                handle,
                timer: None,
            });
        }
        self.arm_read_timer(&socket);
    }

    fn do_cancel_read(&self, socket: &Arc<UdpSocket>) {
        if let Some(ReadState { cb, handle, timer }) = self.take_read(socket.id()) {
            if let Some(timer) = timer {
                timer.abort();
            }
            socket.end_read();
            cb(handle, Err(NetError::Canceled));
        }
    }

    /// Disarm the read on `id`, stopping datagram delivery first.
    fn take_read(&self, id: u64) -> Option<ReadState> {
        let mut table = self.table.borrow_mut();
        let entry = table.get_mut(&id)?;
        let read = entry.read.take()?;
        entry.io.recv_stop();
        Some(read)
    }

    fn deliver_connected(
        self: &Rc<Self>,
        socket: &Arc<UdpSocket>,
        source: Option<SocketAddr>,
        payload: Bytes,
    ) {
        let stats = self.shared.stats();
        if source.is_none()
            || exceeds_limit(self.shared.config(), payload.len())
            || !socket.is_active()
        {
            ManagerStats::incr(&stats.datagrams_dropped);
            return;
        }

        let armed = self
            .table
            .borrow()
            .get(&socket.id())
            .and_then(|entry| entry.read.as_ref())
            .map(|read| (Arc::clone(&read.cb), read.handle.clone()));
        let Some((cb, handle)) = armed else {
            ManagerStats::incr(&stats.datagrams_dropped);
            return;
        };

        ManagerStats::incr(&stats.datagrams_received);
        cb(handle, Ok(payload));
        // Every delivery pushes the idle deadline out again; a callback
        // that canceled the read leaves nothing to re-arm.
        self.arm_read_timer(socket);
    }

    fn arm_read_timer(self: &Rc<Self>, socket: &Arc<UdpSocket>) {
        let Some(timeout) = socket.read_timeout() else {
            return;
        };
        let mut table = self.table.borrow_mut();
        let Some(read) = table.get_mut(&socket.id()).and_then(|entry| entry.read.as_mut()) else {
            return;
        };
        if let Some(old) = read.timer.take() {
            old.abort();
        }
        let weak = Rc::downgrade(self);
        let socket = Arc::clone(socket);
        read.timer = Some(tokio::task::spawn_local(async move {
            tokio::time::sleep(timeout).await;
            if let Some(state) = weak.upgrade() {
                state.read_timed_out(&socket);
            }
        }));
    }

    fn read_timed_out(&self, socket: &Arc<UdpSocket>) {
        if let Some(ReadState { cb, handle, .. }) = self.take_read(socket.id()) {
            socket.end_read();
            cb(handle, Err(NetError::TimedOut));
        }
    }
}
