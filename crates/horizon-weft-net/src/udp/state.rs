//! State enumerations for manager-owned sockets.

/// Lifecycle state of a socket object, derived from its flags.
///
/// The `active`/`closed` flags are authoritative; this enum is the
/// diagnostic view of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SocketState {
    /// Created but not yet bound on its worker.
    #[default]
    Created,
    /// Bound and processing traffic.
    Active,
    /// Stop requested; no new work accepted, teardown in flight.
    Stopping,
    /// OS handle released; terminal.
    Closed,
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketState::Created => write!(f, "Created"),
            SocketState::Active => write!(f, "Active"),
            SocketState::Stopping => write!(f, "Stopping"),
            SocketState::Closed => write!(f, "Closed"),
        }
    }
}
