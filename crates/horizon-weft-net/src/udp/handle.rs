//! Datagram handles.
//!
//! A [`Handle`] names one conversation: a socket plus the peer address on
//! the other end. The receive path mints a fresh handle for every datagram
//! it delivers; [`connect_udp`](crate::udp::UdpManager::connect_udp) hands
//! back one for the connected peer. Handles are cheap to clone and safe to
//! move across threads; a connected socket closes itself once its last
//! handle is gone.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{NetError, Result};
use crate::udp::socket::{SocketKind, UdpSocket};
use crate::udp::worker;

/// Reference to one socket/peer pairing.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl Handle {
    pub(crate) fn new(socket: Arc<UdpSocket>, local: SocketAddr, peer: SocketAddr) -> Self {
        socket.attach_handle();
        Self {
            inner: Arc::new(HandleInner {
                socket,
                local,
                peer,
            }),
        }
    }

    /// The peer this handle talks to.
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// The local address of the underlying socket.
    pub fn local(&self) -> SocketAddr {
        self.inner.local
    }

    /// Whether the underlying socket still accepts work.
    pub fn is_active(&self) -> bool {
        self.inner.socket.is_active()
    }

    /// Transmit one datagram to this handle's peer.
    ///
    /// The completion callback runs exactly once, on the worker that owns
    /// the socket the send went out on. The exception is the fault-injection
    /// datagram limit: an oversize send is swallowed and no callback runs at
    /// all. A send reaching a socket that has stopped completes with
    /// [`NetError::Canceled`].
    pub fn send<F>(&self, payload: impl Into<Bytes>, done: F)
    where
        F: FnOnce(Handle, Result<()>) + Send + 'static,
    {
        worker::submit_send(self.clone(), payload.into(), Box::new(done));
    }

    /// Begin delivering datagrams from a connected socket.
    ///
    /// The callback fires once per datagram until the read is canceled,
    /// times out, or the socket stops. Only one read may be armed at a
    /// time; arming again after a timeout or cancel is fine.
    pub fn start_read<F>(&self, cb: F) -> Result<()>
    where
        F: Fn(Handle, Result<Bytes>) + Send + Sync + 'static,
    {
        if self.inner.socket.kind() != SocketKind::Connected {
            return Err(NetError::NotConnected);
        }
        if !self.inner.socket.try_begin_read() {
            return Err(NetError::ReadInProgress);
        }
        worker::submit_start_read(self.clone(), Arc::new(cb));
        Ok(())
    }

    /// Cancel an armed read. The read callback completes with
    /// [`NetError::Canceled`] on the owning worker.
    pub fn cancel_read(&self) -> Result<()> {
        if self.inner.socket.kind() != SocketKind::Connected {
            return Err(NetError::NotConnected);
        }
        worker::submit_cancel_read(&self.inner.socket);
        Ok(())
    }

    pub(crate) fn socket(&self) -> &Arc<UdpSocket> {
        &self.inner.socket
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("socket", &self.inner.socket.id())
            .field("local", &self.inner.local)
            .field("peer", &self.inner.peer)
            .finish()
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let remaining = self.socket.detach_handle();
        // A connected socket with no handles left can never be reached
        // again, so the last drop closes it.
        if remaining == 0
            && self.socket.kind() == SocketKind::Connected
            && self.socket.deactivate()
        {
            worker::request_stop(&self.socket);
        }
    }
}

static_assertions::assert_impl_all!(Handle: Send, Sync);
