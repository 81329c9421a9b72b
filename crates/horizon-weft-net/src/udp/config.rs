//! Configuration for the UDP network manager.

use horizon_weft_core::CoreError;

/// How listener children share one local address.
///
/// Load-balanced reuse asks the kernel to spread incoming datagrams across
/// the children (`SO_REUSEPORT` on platforms that have it); plain address
/// reuse still lets every child bind but leaves distribution to the
/// platform; `None` binds without reuse options, which limits a listener
/// group to a single child actually receiving on most platforms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReuseMode {
    /// No socket-reuse options.
    None,
    /// Address reuse only (`SO_REUSEADDR`).
    Address,
    /// Address reuse plus kernel load balancing where available.
    #[default]
    LoadBalanced,
}

/// Configuration for a [`UdpManager`](crate::udp::UdpManager).
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Number of worker threads. Each worker owns one child socket per
    /// listener group.
    pub workers: usize,
    /// Simulated network MTU for fault injection: datagrams longer than
    /// this are silently dropped on both the send and receive paths.
    /// `None` disables the simulation.
    pub max_datagram_size: Option<usize>,
    /// Socket-reuse mode for listener children.
    pub reuse: ReuseMode,
    /// Receive buffer size (`SO_RCVBUF`) requested for every socket.
    /// `None` keeps the platform default.
    pub recv_buffer_size: Option<usize>,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            max_datagram_size: None,
            reuse: ReuseMode::default(),
            recv_buffer_size: None,
            thread_name: "weft-net".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Create a configuration with the given worker count.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Set the simulated maximum datagram size (fault injection).
    pub fn max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = Some(size);
        self
    }

    /// Set the socket-reuse mode.
    pub fn reuse(mut self, mode: ReuseMode) -> Self {
        self.reuse = mode;
        self
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_datagram_size == Some(0) {
            return Err(ConfigError::ZeroMaxDatagramSize);
        }
        Ok(())
    }
}

/// Errors from manager construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The worker count was zero.
    #[error("worker count must be at least 1")]
    NoWorkers,

    /// The fault-injection datagram limit was zero.
    #[error("simulated max datagram size must be nonzero")]
    ZeroMaxDatagramSize,

    /// The worker pool could not be started.
    #[error("failed to start worker pool: {0}")]
    Pool(#[from] CoreError),
}
