//! eventwire: an asynchronous TCP connection framework
//!
//! Building blocks:
//! - [`runtime::Eventloop`]: bounded event queue drained by a worker pool
//! - [`runtime::Connection`]: framed reads, serialized writes, safe close
//! - [`runtime::Handler`]: pluggable framing and lifecycle callbacks
//! - [`server::Server`]: accept loop with a live-connection registry
//!
//! [`protocols::packet`] is a complete example protocol that relays binary
//! packets between all connected peers.

pub mod config;
pub mod protocols;
pub mod runtime;
pub mod server;

pub use config::{Config, ConnConfig, ServerConfig};
pub use runtime::{dial, Connection, Handler, Registry};
pub use server::Server;
