//! Events routed to socket-owning workers.
//!
//! Every socket is owned by exactly one worker thread. Operations started
//! from any other thread are packaged as a [`NetEvent`] and enqueued to the
//! owner; operations started on the owner itself take a direct path and
//! never build an event.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::udp::handle::Handle;
use crate::udp::socket::UdpSocket;

/// Callback invoked for every datagram delivered to a read.
///
/// Shared because a listener read callback outlives any single delivery;
/// each invocation gets a fresh [`Handle`] identifying the peer.
pub type RecvCallback = Arc<dyn Fn(Handle, Result<Bytes>) + Send + Sync>;

/// Callback invoked once when a send completes or fails.
pub type SendCallback = Box<dyn FnOnce(Handle, Result<()>) + Send>;

/// Callback invoked once when a connected-socket setup completes or fails.
pub type ConnectCallback = Box<dyn FnOnce(Result<Handle>) + Send>;

pub(crate) enum NetEvent {
    /// Bind one listener child on its owning worker and begin receiving
    /// into the listener group's callback.
    StartListen {
        child: Arc<UdpSocket>,
        cb: RecvCallback,
    },
    /// Close a socket on its owning worker.
    Stop { socket: Arc<UdpSocket> },
    /// Transmit a datagram from a socket owned by another worker.
    Send {
        socket: Arc<UdpSocket>,
        peer: Option<SocketAddr>,
        payload: Bytes,
        handle: Handle,
        done: SendCallback,
    },
    /// Open and connect a socket on its owning worker.
    Connect {
        socket: Arc<UdpSocket>,
        local: SocketAddr,
        peer: SocketAddr,
        done: ConnectCallback,
    },
    /// Begin reading on a connected socket.
    StartRead {
        socket: Arc<UdpSocket>,
        handle: Handle,
        cb: RecvCallback,
    },
    /// Stop reading on a connected socket, completing the read as canceled.
    CancelRead { socket: Arc<UdpSocket> },
}

impl NetEvent {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            NetEvent::StartListen { .. } => "start_listen",
            NetEvent::Stop { .. } => "stop",
            NetEvent::Send { .. } => "send",
            NetEvent::Connect { .. } => "connect",
            NetEvent::StartRead { .. } => "start_read",
            NetEvent::CancelRead { .. } => "cancel_read",
        }
    }
}

impl fmt::Debug for NetEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetEvent").field("kind", &self.kind()).finish()
    }
}

static_assertions::assert_impl_all!(NetEvent: Send);
