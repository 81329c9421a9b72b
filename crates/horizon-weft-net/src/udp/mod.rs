//! Multi-worker UDP networking.
//!
//! This module provides the UDP side of Horizon Weft:
//! - **UdpManager**: owns the worker pool and opens sockets
//! - **Listener**: a group of per-worker sockets sharing one address
//! - **Handle**: a cloneable reference to one socket/peer conversation
//!
//! # Example
//!
//! ```ignore
//! use horizon_weft_net::udp::{ManagerConfig, UdpManager};
//!
//! let manager = UdpManager::new(ManagerConfig::new(4))?;
//!
//! // Echo every datagram back to its sender.
//! let listener = manager.listen_udp("127.0.0.1:0".parse()?, |handle, result| {
//!     if let Ok(payload) = result {
//!         handle.send(payload, |_, _| {});
//!     }
//! })?;
//! println!("listening on {}", listener.local_addr());
//!
//! listener.stop();
//! manager.shutdown();
//! ```
//!
//! # Connected sockets
//!
//! ```ignore
//! use std::time::Duration;
//!
//! manager.connect_udp(
//!     "127.0.0.1:0".parse()?,
//!     server_addr,
//!     Some(Duration::from_secs(1)),
//!     |result| {
//!         let handle = result.expect("connect failed");
//!         handle
//!             .start_read(|_, result| match result {
//!                 Ok(payload) => println!("reply: {payload:?}"),
//!                 Err(err) => println!("read ended: {err}"),
//!             })
//!             .unwrap();
//!         handle.send(&b"ping"[..], |_, _| {});
//!     },
//! );
//! ```

mod config;
mod driver;
mod event;
mod handle;
mod manager;
mod socket;
mod state;
mod stats;
mod worker;

pub use config::{ConfigError, ManagerConfig, ReuseMode};
pub use driver::{
    DriverError, DriverFactory, DriverSocket, RecvFn, SendDoneFn, SimControl, SimDriver, SimSend,
    TokioDriver, UdpDriver,
};
pub use event::{ConnectCallback, RecvCallback, SendCallback};
pub use handle::Handle;
pub use manager::{Listener, UdpManager};
pub use state::SocketState;
pub use stats::{ManagerStats, StatsSnapshot};
