//! Socket drivers.
//!
//! A driver owns the actual I/O for one worker thread. The production
//! driver ([`TokioDriver`]) wraps nonblocking UDP sockets registered with
//! the worker's tokio reactor; [`SimDriver`] is a scriptable in-memory
//! stand-in used to test failure handling and datagram edge cases without
//! touching the network.
//!
//! Drivers are created on the worker thread they serve and are never sent
//! across threads. Two delivery rules keep worker state re-entrancy safe:
//! datagram callbacks and send completions always run from a task spawned
//! on the worker's local set, never inline inside the driver call that
//! scheduled them.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use horizon_weft_core::WorkerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::NetError;
use crate::udp::config::ReuseMode;

/// Receive buffer length for one datagram. UDP payloads cannot exceed
/// this, so a single buffer per socket suffices.
const RECV_LEN: usize = 65535;

/// Called for every datagram a socket receives. The source address is
/// `None` when the platform could not report one.
pub type RecvFn = Box<dyn FnMut(Option<SocketAddr>, Bytes)>;

/// Called exactly once per send with the transmit result.
pub type SendDoneFn = Box<dyn FnOnce(io::Result<()>)>;

/// Creates one driver per worker thread. Invoked on the worker itself.
pub type DriverFactory = Arc<dyn Fn(WorkerId) -> Box<dyn UdpDriver> + Send + Sync>;

/// Driver failures, tagged by the setup stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Creating or configuring the socket failed.
    #[error("socket open failed: {0}")]
    Open(#[source] io::Error),

    /// Binding the local address failed.
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    /// The socket bound but could not start receiving.
    #[error("could not start receiving: {0}")]
    RecvStart(#[source] io::Error),

    /// Connecting to the peer failed.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
}

impl From<DriverError> for NetError {
    fn from(err: DriverError) -> Self {
        let kind = match &err {
            DriverError::Open(io)
            | DriverError::Bind(io)
            | DriverError::RecvStart(io)
            | DriverError::Connect(io) => io.kind(),
        };
        // Keep the underlying kind visible on the wrapper and the staged
        // error reachable through source().
        NetError::Io(Arc::new(io::Error::new(kind, err)))
    }
}

/// Per-worker socket factory.
pub trait UdpDriver {
    /// Open a socket bound to `addr`, ready for [`DriverSocket::recv_start`].
    fn bind(
        &mut self,
        addr: SocketAddr,
        reuse: ReuseMode,
        recv_buffer: Option<usize>,
    ) -> Result<Box<dyn DriverSocket>, DriverError>;

    /// Open a socket bound to `local` and connected to `peer`.
    fn connect(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        recv_buffer: Option<usize>,
    ) -> Result<Box<dyn DriverSocket>, DriverError>;
}

/// One open socket. Closing is dropping; drop stops any receive in
/// progress and abandons pending sends without running their completions.
pub trait DriverSocket {
    /// The bound local address, with any wildcard port resolved.
    fn local_addr(&self) -> SocketAddr;

    /// Begin delivering datagrams to `on_datagram`. Deliveries run from a
    /// local task, never from inside this call. A socket whose receive
    /// was stopped can start again with a new callback.
    fn recv_start(&mut self, on_datagram: RecvFn) -> Result<(), DriverError>;

    /// Stop delivering datagrams. Idempotent.
    fn recv_stop(&mut self);

    /// Transmit one datagram. `peer` is `None` for connected sockets.
    /// `done` runs from a local task once the transmit succeeds or fails;
    /// dropping the socket first discards it unrun.
    fn send_to(&mut self, payload: Bytes, peer: Option<SocketAddr>, done: SendDoneFn);
}

/// Production driver: nonblocking sockets on the worker's tokio reactor.
#[derive(Debug, Default)]
pub struct TokioDriver;

impl TokioDriver {
    /// Factory handing every worker its own `TokioDriver`.
    pub fn factory() -> DriverFactory {
        Arc::new(|_worker| Box::new(TokioDriver))
    }

    fn open(
        addr: SocketAddr,
        reuse: ReuseMode,
        recv_buffer: Option<usize>,
    ) -> Result<socket2::Socket, DriverError> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
            .map_err(DriverError::Open)?;
        match reuse {
            ReuseMode::None => {}
            ReuseMode::Address => {
                socket.set_reuse_address(true).map_err(DriverError::Open)?;
            }
            ReuseMode::LoadBalanced => {
                socket.set_reuse_address(true).map_err(DriverError::Open)?;
                #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
                socket.set_reuse_port(true).map_err(DriverError::Open)?;
            }
        }
        if let Some(size) = recv_buffer {
            socket.set_recv_buffer_size(size).map_err(DriverError::Open)?;
        }
        socket.set_nonblocking(true).map_err(DriverError::Open)?;
        Ok(socket)
    }

    fn register(socket: socket2::Socket) -> Result<TokioSocket, DriverError> {
        let io = tokio::net::UdpSocket::from_std(socket.into()).map_err(DriverError::Open)?;
        let local = io.local_addr().map_err(DriverError::Open)?;
        Ok(TokioSocket {
            io: Rc::new(io),
            local,
            recv_task: None,
            send_tasks: Vec::new(),
        })
    }
}

impl UdpDriver for TokioDriver {
    fn bind(
        &mut self,
        addr: SocketAddr,
        reuse: ReuseMode,
        recv_buffer: Option<usize>,
    ) -> Result<Box<dyn DriverSocket>, DriverError> {
        let socket = Self::open(addr, reuse, recv_buffer)?;
        if let Err(err) = socket.bind(&addr.into()) {
            // An address still being configured (a just-added IPv6 alias,
            // typically) reports AddrNotAvailable. Free-bind claims it
            // anyway, so the listener comes up along with the interface.
            if err.kind() != io::ErrorKind::AddrNotAvailable || !enable_freebind(&socket, addr) {
                return Err(DriverError::Bind(err));
            }
            socket.bind(&addr.into()).map_err(DriverError::Bind)?;
        }
        Ok(Box::new(Self::register(socket)?))
    }

    fn connect(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        recv_buffer: Option<usize>,
    ) -> Result<Box<dyn DriverSocket>, DriverError> {
        let socket = Self::open(local, ReuseMode::None, recv_buffer)?;
        socket.bind(&local.into()).map_err(DriverError::Bind)?;
        socket.connect(&peer.into()).map_err(DriverError::Connect)?;
        Ok(Box::new(Self::register(socket)?))
    }
}

#[cfg(any(target_os = "android", target_os = "linux"))]
fn enable_freebind(socket: &socket2::Socket, addr: SocketAddr) -> bool {
    let set = if addr.is_ipv4() {
        socket.set_freebind(true)
    } else {
        socket.set_freebind_ipv6(true)
    };
    set.is_ok()
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn enable_freebind(_socket: &socket2::Socket, _addr: SocketAddr) -> bool {
    false
}

struct TokioSocket {
    io: Rc<tokio::net::UdpSocket>,
    local: SocketAddr,
    recv_task: Option<tokio::task::JoinHandle<()>>,
    send_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl DriverSocket for TokioSocket {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn recv_start(&mut self, mut on_datagram: RecvFn) -> Result<(), DriverError> {
        if self.recv_task.is_some() {
            return Ok(());
        }
        let io = Rc::clone(&self.io);
        self.recv_task = Some(tokio::task::spawn_local(async move {
            let mut buf = vec![0u8; RECV_LEN];
            loop {
                match io.recv_from(&mut buf).await {
                    Ok((len, peer)) => {
                        on_datagram(Some(peer), Bytes::copy_from_slice(&buf[..len]));
                    }
                    // Transient errors (ICMP unreachable surfacing on a
                    // connected socket, for one) must not kill the loop.
                    Err(_) => continue,
                }
            }
        }));
        Ok(())
    }

    fn recv_stop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }

    fn send_to(&mut self, payload: Bytes, peer: Option<SocketAddr>, done: SendDoneFn) {
        let io = Rc::clone(&self.io);
        self.send_tasks.retain(|task| !task.is_finished());
        self.send_tasks.push(tokio::task::spawn_local(async move {
            let result = match peer {
                Some(addr) => io.send_to(&payload, addr).await.map(|_| ()),
                None => io.send(&payload).await.map(|_| ()),
            };
            done(result);
        }));
    }
}

impl Drop for TokioSocket {
    fn drop(&mut self) {
        self.recv_stop();
        // Abandon sends the reactor has not run; their completions must
        // not fire once the socket is gone.
        for task in self.send_tasks.drain(..) {
            task.abort();
        }
    }
}

/// One send recorded by the simulated driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimSend {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub payload: Bytes,
}

#[derive(Default)]
struct SimInner {
    fail_open: HashSet<usize>,
    fail_bind: HashSet<usize>,
    fail_recv_start: HashSet<usize>,
    fail_connect: HashSet<usize>,
    next_port: u16,
    next_id: u64,
    sockets: Vec<SimEntry>,
    sent: Vec<SimSend>,
    deliver_local: bool,
}

struct SimEntry {
    id: u64,
    local: SocketAddr,
    inject: mpsc::UnboundedSender<(Option<SocketAddr>, Bytes)>,
}

/// Shared scripting surface for [`SimDriver`].
///
/// Failure injection is keyed by worker index, so a test can make exactly
/// the workers it chooses fail a given setup stage. Datagram injection is
/// keyed by bound local address.
pub struct SimControl {
    inner: Mutex<SimInner>,
}

impl SimControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SimInner {
                next_port: 40000,
                ..SimInner::default()
            }),
        })
    }

    /// Make socket creation fail on the given worker.
    pub fn fail_open_on(&self, worker: usize) {
        self.inner.lock().fail_open.insert(worker);
    }

    /// Make binds fail on the given worker.
    pub fn fail_bind_on(&self, worker: usize) {
        self.inner.lock().fail_bind.insert(worker);
    }

    /// Make `recv_start` fail on the given worker.
    pub fn fail_recv_start_on(&self, worker: usize) {
        self.inner.lock().fail_recv_start.insert(worker);
    }

    /// Make connects fail on the given worker.
    pub fn fail_connect_on(&self, worker: usize) {
        self.inner.lock().fail_connect.insert(worker);
    }

    /// Route sends whose destination matches a simulated socket's local
    /// address back into that socket as received datagrams.
    pub fn deliver_locally(&self) {
        self.inner.lock().deliver_local = true;
    }

    /// Deliver a datagram to the first open socket bound to `to`.
    /// Returns false if no such socket exists.
    pub fn inject(&self, to: SocketAddr, source: Option<SocketAddr>, payload: Bytes) -> bool {
        self.inject_nth(to, 0, source, payload)
    }

    /// Deliver a datagram to the `nth` open socket bound to `to`. With
    /// load-balanced listeners every child shares one address, so `nth`
    /// picks which child receives.
    pub fn inject_nth(
        &self,
        to: SocketAddr,
        nth: usize,
        source: Option<SocketAddr>,
        payload: Bytes,
    ) -> bool {
        let inner = self.inner.lock();
        inner
            .sockets
            .iter()
            .filter(|entry| entry.local == to)
            .nth(nth)
            .is_some_and(|entry| entry.inject.send((source, payload)).is_ok())
    }

    /// Deliver a copy of a datagram to every open socket bound to `to`.
    /// Returns how many sockets received it.
    pub fn inject_all(&self, to: SocketAddr, source: Option<SocketAddr>, payload: Bytes) -> usize {
        let inner = self.inner.lock();
        inner
            .sockets
            .iter()
            .filter(|entry| entry.local == to)
            .filter(|entry| entry.inject.send((source, payload.clone())).is_ok())
            .count()
    }

    /// Snapshot of every send the driver has transmitted.
    pub fn sends(&self) -> Vec<SimSend> {
        self.inner.lock().sent.clone()
    }

    /// Number of currently open simulated sockets.
    pub fn open_sockets(&self) -> usize {
        self.inner.lock().sockets.len()
    }

    fn register(
        self: &Arc<Self>,
        requested: SocketAddr,
    ) -> (u64, SocketAddr, mpsc::UnboundedReceiver<(Option<SocketAddr>, Bytes)>) {
        let mut inner = self.inner.lock();
        let mut local = requested;
        if local.port() == 0 {
            local.set_port(inner.next_port);
            inner.next_port += 1;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        inner.sockets.push(SimEntry {
            id,
            local,
            inject: tx,
        });
        (id, local, rx)
    }

    fn unregister(&self, id: u64) {
        self.inner.lock().sockets.retain(|entry| entry.id != id);
    }

    fn transmit(&self, send: SimSend) {
        let mut inner = self.inner.lock();
        if inner.deliver_local {
            let source = Some(send.from);
            if let Some(entry) = inner.sockets.iter().find(|entry| entry.local == send.to) {
                let _ = entry.inject.send((source, send.payload.clone()));
            }
        }
        inner.sent.push(send);
    }

    fn stage_fails(&self, worker: WorkerId, stage: SimStage) -> bool {
        let inner = self.inner.lock();
        let set = match stage {
            SimStage::Open => &inner.fail_open,
            SimStage::Bind => &inner.fail_bind,
            SimStage::RecvStart => &inner.fail_recv_start,
            SimStage::Connect => &inner.fail_connect,
        };
        set.contains(&worker.index())
    }
}

#[derive(Clone, Copy)]
enum SimStage {
    Open,
    Bind,
    RecvStart,
    Connect,
}

/// In-memory driver scripted through [`SimControl`].
pub struct SimDriver {
    worker: WorkerId,
    control: Arc<SimControl>,
}

impl SimDriver {
    /// Factory handing every worker a driver sharing one control surface.
    pub fn factory(control: Arc<SimControl>) -> DriverFactory {
        Arc::new(move |worker| {
            Box::new(SimDriver {
                worker,
                control: Arc::clone(&control),
            })
        })
    }

    fn open(
        &self,
        requested: SocketAddr,
        peer: Option<SocketAddr>,
    ) -> Result<SimSocket, DriverError> {
        if self.control.stage_fails(self.worker, SimStage::Open) {
            return Err(DriverError::Open(io::Error::other("simulated open failure")));
        }
        let (id, local, rx) = self.control.register(requested);
        Ok(SimSocket {
            control: Arc::clone(&self.control),
            worker: self.worker,
            id,
            local,
            peer,
            rx: Rc::new(tokio::sync::Mutex::new(rx)),
            recv_task: None,
            send_tasks: Vec::new(),
        })
    }
}

impl UdpDriver for SimDriver {
    fn bind(
        &mut self,
        addr: SocketAddr,
        _reuse: ReuseMode,
        _recv_buffer: Option<usize>,
    ) -> Result<Box<dyn DriverSocket>, DriverError> {
        if self.control.stage_fails(self.worker, SimStage::Bind) {
            return Err(DriverError::Bind(io::Error::new(
                io::ErrorKind::AddrInUse,
                "simulated bind failure",
            )));
        }
        Ok(Box::new(self.open(addr, None)?))
    }

    fn connect(
        &mut self,
        local: SocketAddr,
        peer: SocketAddr,
        _recv_buffer: Option<usize>,
    ) -> Result<Box<dyn DriverSocket>, DriverError> {
        if self.control.stage_fails(self.worker, SimStage::Connect) {
            return Err(DriverError::Connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "simulated connect failure",
            )));
        }
        Ok(Box::new(self.open(local, Some(peer))?))
    }
}

struct SimSocket {
    control: Arc<SimControl>,
    worker: WorkerId,
    id: u64,
    local: SocketAddr,
    peer: Option<SocketAddr>,
    // Held behind an async mutex so an aborted receive task releases the
    // receiver back for the next recv_start.
    rx: Rc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(Option<SocketAddr>, Bytes)>>>,
    recv_task: Option<tokio::task::JoinHandle<()>>,
    send_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl DriverSocket for SimSocket {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn recv_start(&mut self, mut on_datagram: RecvFn) -> Result<(), DriverError> {
        if self.control.stage_fails(self.worker, SimStage::RecvStart) {
            return Err(DriverError::RecvStart(io::Error::other(
                "simulated recv_start failure",
            )));
        }
        if self.recv_task.is_some() {
            return Ok(());
        }
        let rx = Rc::clone(&self.rx);
        self.recv_task = Some(tokio::task::spawn_local(async move {
            let mut rx = rx.lock().await;
            while let Some((source, payload)) = rx.recv().await {
                on_datagram(source, payload);
            }
        }));
        Ok(())
    }

    fn recv_stop(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
    }

    fn send_to(&mut self, payload: Bytes, peer: Option<SocketAddr>, done: SendDoneFn) {
        let control = Arc::clone(&self.control);
        let from = self.local;
        let to = peer.or(self.peer);
        self.send_tasks.retain(|task| !task.is_finished());
        self.send_tasks.push(tokio::task::spawn_local(async move {
            let result = match to {
                Some(to) => {
                    control.transmit(SimSend { from, to, payload });
                    Ok(())
                }
                None => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no destination address",
                )),
            };
            done(result);
        }));
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.recv_stop();
        for task in self.send_tasks.drain(..) {
            task.abort();
        }
        self.control.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_sim_register_resolves_wildcard_port() {
        let control = SimControl::new();
        let (_, first, _rx1) = control.register(addr(0));
        let (_, second, _rx2) = control.register(addr(0));
        assert_ne!(first.port(), 0);
        assert_ne!(first.port(), second.port());

        let (_, fixed, _rx3) = control.register(addr(9000));
        assert_eq!(fixed, addr(9000));
    }

    #[test]
    fn test_sim_inject_requires_open_socket() {
        let control = SimControl::new();
        assert!(!control.inject(addr(9000), None, Bytes::from_static(b"x")));

        let (id, local, mut rx) = control.register(addr(9000));
        assert!(control.inject(local, Some(addr(9001)), Bytes::from_static(b"x")));
        assert_eq!(
            rx.try_recv().ok().map(|(source, _)| source),
            Some(Some(addr(9001)))
        );

        control.unregister(id);
        assert!(!control.inject(local, None, Bytes::from_static(b"x")));
        assert_eq!(control.open_sockets(), 0);
    }

    #[test]
    fn test_driver_error_keeps_kind_and_stage_in_net_error() {
        let err = DriverError::Bind(io::Error::new(io::ErrorKind::AddrInUse, "port taken"));
        let net: NetError = err.into();
        assert_eq!(net.to_string(), "I/O error: bind failed: port taken");

        let NetError::Io(io) = &net else {
            panic!("io variant expected");
        };
        assert_eq!(io.kind(), io::ErrorKind::AddrInUse);
        assert!(std::error::Error::source(&net)
            .and_then(|source| source.downcast_ref::<io::Error>())
            .is_some());
    }

    #[test]
    fn test_sim_stage_failures_are_per_worker() {
        let control = SimControl::new();
        control.fail_bind_on(1);
        assert!(!control.stage_fails(WorkerId::new(0), SimStage::Bind));
        assert!(control.stage_fails(WorkerId::new(1), SimStage::Bind));
        assert!(!control.stage_fails(WorkerId::new(1), SimStage::Connect));
    }

    #[test]
    fn test_sim_transmit_records_and_forwards() {
        let control = SimControl::new();
        control.deliver_locally();
        let (_, local, mut rx) = control.register(addr(9000));

        control.transmit(SimSend {
            from: addr(9001),
            to: local,
            payload: Bytes::from_static(b"ping"),
        });

        let sends = control.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].to, local);
        let (source, payload) = rx.try_recv().unwrap();
        assert_eq!(source, Some(addr(9001)));
        assert_eq!(payload, Bytes::from_static(b"ping"));
    }
}
