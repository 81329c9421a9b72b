//! Error types for the network manager.

use std::fmt;
use std::sync::Arc;

/// Errors delivered by manager operations and their completion callbacks.
///
/// The I/O variant keeps the originating [`std::io::Error`] reachable
/// through [`source`](std::error::Error::source); cloning shares it.
#[derive(Debug, Clone)]
pub enum NetError {
    /// The operation was canceled because the socket stopped or a read was
    /// canceled by the caller.
    Canceled,
    /// A read on a connected socket hit its timeout.
    TimedOut,
    /// The manager has shut down and accepts no new work.
    Shutdown,
    /// Every child of a listen request failed to bind.
    AllBindsFailed,
    /// The operation requires a connected socket.
    NotConnected,
    /// A read is already pending on this socket.
    ReadInProgress,
    /// I/O error from the socket layer.
    Io(Arc<std::io::Error>),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled => write!(f, "Operation was canceled"),
            Self::TimedOut => write!(f, "Read timed out"),
            Self::Shutdown => write!(f, "Network manager has shut down"),
            Self::AllBindsFailed => write!(f, "No listener child could bind"),
            Self::NotConnected => write!(f, "Socket is not connected"),
            Self::ReadInProgress => write!(f, "A read is already pending"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// A specialized Result type for network-manager operations.
pub type Result<T> = std::result::Result<T, NetError>;
