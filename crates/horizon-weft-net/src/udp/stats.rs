//! Manager-wide counters.
//!
//! Counters are updated from worker threads with relaxed atomics and read
//! as a coherent-enough snapshot for tests and monitoring. They only ever
//! increase over the life of a manager.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a [`UdpManager`](crate::udp::UdpManager).
#[derive(Debug, Default)]
pub struct ManagerStats {
    pub(crate) sockets_opened: AtomicU64,
    pub(crate) open_failures: AtomicU64,
    pub(crate) bind_failures: AtomicU64,
    pub(crate) recv_start_failures: AtomicU64,
    pub(crate) connect_failures: AtomicU64,
    pub(crate) datagrams_received: AtomicU64,
    pub(crate) datagrams_dropped: AtomicU64,
    pub(crate) sends_completed: AtomicU64,
    pub(crate) send_failures: AtomicU64,
    pub(crate) sends_dropped: AtomicU64,
}

impl ManagerStats {
    /// Capture the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sockets_opened: self.sockets_opened.load(Ordering::Relaxed),
            open_failures: self.open_failures.load(Ordering::Relaxed),
            bind_failures: self.bind_failures.load(Ordering::Relaxed),
            recv_start_failures: self.recv_start_failures.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            sends_completed: self.sends_completed.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of [`ManagerStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Sockets successfully opened and bound (children and connected).
    pub sockets_opened: u64,
    /// Socket creations that failed before binding.
    pub open_failures: u64,
    /// Bind attempts that failed.
    pub bind_failures: u64,
    /// Sockets that bound but could not start receiving.
    pub recv_start_failures: u64,
    /// Connected-socket setups that failed.
    pub connect_failures: u64,
    /// Datagrams delivered to read callbacks.
    pub datagrams_received: u64,
    /// Datagrams dropped without a callback (oversize, sourceless, or
    /// arriving on an inactive socket).
    pub datagrams_dropped: u64,
    /// Sends whose completion callback ran with `Ok`.
    pub sends_completed: u64,
    /// Sends whose completion callback ran with an error.
    pub send_failures: u64,
    /// Sends silently discarded by the datagram-size fault injection.
    pub sends_dropped: u64,
}
