//! The manager: worker pool ownership, listener setup, and shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use horizon_weft_core::{PoolConfig, WorkerId, WorkerPool, WorkerSender};
use parking_lot::Mutex;

use crate::error::{NetError, Result};
use crate::udp::config::{ConfigError, ManagerConfig};
use crate::udp::driver::{DriverFactory, TokioDriver};
use crate::udp::event::{NetEvent, RecvCallback};
use crate::udp::handle::Handle;
use crate::udp::socket::{SocketKind, UdpSocket};
use crate::udp::state::SocketState;
use crate::udp::stats::{ManagerStats, StatsSnapshot};
use crate::udp::worker;

/// State reachable from every socket, handle, and worker of one manager.
pub(crate) struct Shared {
    config: ManagerConfig,
    stats: ManagerStats,
    /// Listener parents and connected sockets, for the shutdown sweep.
    /// Children are reached through their parent.
    registry: Mutex<HashMap<u64, Weak<UdpSocket>>>,
    senders: OnceLock<Vec<WorkerSender<NetEvent>>>,
    active: AtomicBool,
}

impl Shared {
    pub(crate) fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            stats: ManagerStats::default(),
            registry: Mutex::new(HashMap::new()),
            senders: OnceLock::new(),
            active: AtomicBool::new(true),
        })
    }

    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub(crate) fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.config.workers
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_senders(&self, senders: Vec<WorkerSender<NetEvent>>) {
        let _ = self.senders.set(senders);
    }

    pub(crate) fn sender(&self, worker: WorkerId) -> Option<WorkerSender<NetEvent>> {
        self.senders
            .get()
            .and_then(|senders| senders.get(worker.index()).cloned())
    }

    pub(crate) fn register(&self, socket: &Arc<UdpSocket>) {
        self.registry.lock().insert(socket.id(), Arc::downgrade(socket));
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.registry.lock().remove(&id);
    }

    pub(crate) fn lookup(&self, id: u64) -> Option<Arc<UdpSocket>> {
        self.registry.lock().get(&id).and_then(Weak::upgrade)
    }

    fn sockets(&self) -> Vec<Arc<UdpSocket>> {
        self.registry.lock().values().filter_map(Weak::upgrade).collect()
    }
}

/// An asynchronous multi-worker UDP socket manager.
///
/// The manager owns a fixed pool of event-loop threads. Listening fans one
/// child socket per worker out over a shared local address so the kernel
/// spreads datagrams across threads; connecting pins a single socket to one
/// worker. All I/O on a socket happens on its owning worker; callers on
/// other threads reach it through that worker's event queue.
pub struct UdpManager {
    shared: Arc<Shared>,
    pool: WorkerPool<NetEvent>,
}

impl UdpManager {
    /// Start a manager with real sockets.
    pub fn new(config: ManagerConfig) -> std::result::Result<Self, ConfigError> {
        Self::with_driver(config, TokioDriver::factory())
    }

    /// Start a manager with a custom socket driver. Used with
    /// [`SimDriver`](crate::udp::driver::SimDriver) to script failures and
    /// datagram flow in tests.
    pub fn with_driver(
        config: ManagerConfig,
        driver: DriverFactory,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let shared = Shared::new(config);
        let pool = {
            let shared = Arc::clone(&shared);
            let pool_config = PoolConfig {
                thread_name: shared.config().thread_name.clone(),
                stack_size: None,
            };
            WorkerPool::spawn_with_config(shared.config().workers, pool_config, move |id| {
                worker::install(id, Arc::clone(&shared), driver(id))
            })?
        };
        shared.set_senders(pool.senders());

        tracing::trace!(
            target: "horizon_weft_net::udp",
            workers = pool.worker_count(),
            "udp manager started"
        );
        Ok(Self { shared, pool })
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Whether [`shutdown`](UdpManager::shutdown) has not yet been called.
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Current counter values.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats().snapshot()
    }

    /// Open a listener group on `addr`, one child socket per worker.
    ///
    /// `recv` fires on a worker thread for every datagram any child
    /// receives, with a fresh [`Handle`] identifying the sender. Port 0
    /// picks a free port, shared by every child.
    ///
    /// Returns once every child has either bound or failed. Children that
    /// fail are absorbed into the failure counters; the listener operates
    /// on whatever subset bound. Only when no child at all bound does the
    /// whole call fail.
    pub fn listen_udp<F>(&self, addr: SocketAddr, recv: F) -> Result<Listener>
    where
        F: Fn(Handle, Result<Bytes>) + Send + Sync + 'static,
    {
        self.listen_udp_shared(addr, Arc::new(recv))
    }

    fn listen_udp_shared(&self, addr: SocketAddr, recv: RecvCallback) -> Result<Listener> {
        if !self.shared.is_active() {
            return Err(NetError::Shutdown);
        }
        // Every child binds the same concrete address, so a wildcard port
        // has to be fixed before the fanout.
        let addr = resolve_wildcard_port(addr)?;

        let workers = self.pool.worker_count();
        let parent = UdpSocket::new_parent(&self.shared, workers);
        parent.set_local(addr);
        let children: Vec<_> = (0..workers)
            .map(|index| UdpSocket::new_child(&parent, WorkerId::new(index)))
            .collect();
        parent.set_children(children.clone());

        for child in children {
            worker::submit_start_listen(child, Arc::clone(&recv));
        }
        parent.wait_children_started();

        let bound = parent.bound_children();
        if bound == 0 {
            parent.deactivate();
            parent.mark_closed();
            return Err(NetError::AllBindsFailed);
        }
        tracing::trace!(
            target: "horizon_weft_net::udp",
            %addr,
            bound,
            workers,
            "listener started"
        );
        Ok(Listener {
            parent,
            local: addr,
        })
    }

    /// Open a socket bound to `local` and connected to `peer`.
    ///
    /// The socket is pinned to the calling worker when invoked from a pool
    /// thread, otherwise to a uniformly random worker. `done` runs on that
    /// worker with a [`Handle`] for the peer, or with the setup error. The
    /// socket closes once its last handle is dropped.
    ///
    /// `read_timeout` bounds how long an armed read may sit idle before it
    /// completes with [`NetError::TimedOut`].
    pub fn connect_udp<F>(
        &self,
        local: SocketAddr,
        peer: SocketAddr,
        read_timeout: Option<Duration>,
        done: F,
    ) where
        F: FnOnce(Result<Handle>) + Send + 'static,
    {
        if !self.shared.is_active() {
            done(Err(NetError::Shutdown));
            return;
        }
        let tid = worker::preferred_worker(&self.shared);
        let socket = UdpSocket::new_connected(&self.shared, tid, peer, read_timeout);
        worker::submit_connect(socket, local, peer, Box::new(done));
    }

    /// Stop every socket and join the worker threads. Idempotent.
    ///
    /// Blocks until all sockets report closed, so it must not be called
    /// from one of the manager's own worker threads.
    pub fn shutdown(&self) {
        if !self.shared.deactivate() {
            return;
        }
        tracing::trace!(target: "horizon_weft_net::udp", "udp manager shutting down");

        for socket in self.shared.sockets() {
            match socket.kind() {
                SocketKind::Listener => stop_listener(&socket),
                SocketKind::Connected => {
                    if socket.deactivate() {
                        worker::stop_socket(&socket);
                    }
                    socket.await_stopped();
                }
                SocketKind::Child => {}
            }
        }
        self.pool.stop_and_join();
        tracing::trace!(target: "horizon_weft_net::udp", "udp manager stopped");
    }
}

impl Drop for UdpManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for UdpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpManager")
            .field("workers", &self.pool.worker_count())
            .field("active", &self.is_active())
            .finish()
    }
}

/// A running listener group.
pub struct Listener {
    parent: Arc<UdpSocket>,
    local: SocketAddr,
}

impl Listener {
    /// The address every child is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// How many children bound successfully.
    pub fn bound_children(&self) -> usize {
        self.parent.bound_children()
    }

    /// Whether [`stop`](Listener::stop) has not yet been requested.
    pub fn is_active(&self) -> bool {
        self.parent.is_active()
    }

    /// Lifecycle state of the listener group as a whole.
    pub fn state(&self) -> SocketState {
        self.parent.state()
    }

    /// A handle that sends to `peer` through the listener group.
    ///
    /// Sends on it go out a child picked per call: the calling worker's
    /// own child from a pool thread, a random child otherwise.
    pub fn handle(&self, peer: SocketAddr) -> Handle {
        Handle::new(Arc::clone(&self.parent), self.local, peer)
    }

    /// Stop every child and wait until all of them have closed.
    ///
    /// Idempotent: the first call does the work, later calls return at
    /// once.
    ///
    /// Prefer calling this from outside the worker pool. From a pool
    /// thread, the worker's own child stops in place and the call then
    /// blocks that worker until the remaining children close; if another
    /// thread is simultaneously blocked waiting on this worker, the two
    /// waits can deadlock.
    pub fn stop(&self) {
        stop_listener(&self.parent);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local", &self.local)
            .field("state", &self.state())
            .field("bound_children", &self.bound_children())
            .finish()
    }
}

fn stop_listener(parent: &Arc<UdpSocket>) {
    if !parent.deactivate() {
        return;
    }
    for child in parent.children() {
        if child.is_closed() {
            continue;
        }
        worker::stop_socket(child);
    }
    parent.await_stopped();
    parent.mark_closed();
    tracing::trace!(
        target: "horizon_weft_net::udp",
        local = %parent.local().map(|a| a.to_string()).unwrap_or_default(),
        "listener stopped"
    );
}

fn resolve_wildcard_port(addr: SocketAddr) -> Result<SocketAddr> {
    if addr.port() != 0 {
        return Ok(addr);
    }
    let scratch = std::net::UdpSocket::bind(addr)?;
    let mut resolved = addr;
    resolved.set_port(scratch.local_addr()?.port());
    Ok(resolved)
}
