//! Networking for Horizon Weft.
//!
//! This crate provides the asynchronous UDP substrate used by Horizon Weft
//! services:
//!
//! - **UDP manager**: a fixed pool of event-loop workers, each owning its
//!   sockets outright, with no lock on the datagram path
//! - **Listener groups**: one child socket per worker bound to a shared
//!   address, so the kernel load-balances incoming datagrams across threads
//! - **Connected sockets**: single-worker sockets with idle read timeouts
//! - **Fault injection**: a simulated driver and a max-datagram-size limit
//!   for testing lossy-network behavior deterministically
//!
//! # UDP echo server
//!
//! ```ignore
//! use horizon_weft_net::udp::{ManagerConfig, UdpManager};
//!
//! let manager = UdpManager::new(ManagerConfig::default())?;
//! let listener = manager.listen_udp("0.0.0.0:5300".parse()?, |handle, result| {
//!     if let Ok(payload) = result {
//!         handle.send(payload, |_, _| {});
//!     }
//! })?;
//! ```
//!
//! Every datagram is delivered on the worker thread owning the child socket
//! it arrived on, with a fresh [`udp::Handle`] naming the sender. Replying
//! on that handle from inside the callback stays on the same thread; sends
//! from any other thread hop through the owner's event queue.

mod error;
pub mod udp;

pub use error::{NetError, Result};

// Re-export commonly used types at the crate root
pub use udp::{Handle, Listener, ManagerConfig, StatsSnapshot, UdpManager};
