//! Connection runtime.
//!
//! Building blocks shared by servers and dialed connections:
//! - `Eventloop`: bounded queue drained by a worker pool
//! - `ConcurrentMap`: registry with snapshot iteration
//! - `Connection`: read loop plus single-worker write loop over one stream
//! - `Handler`: lifecycle and framing callbacks
//! - `ConnId`: connection identity

mod connection;
mod event_loop;
mod handler;
mod map;
mod token;

pub use connection::{dial, Connection};
pub use event_loop::{AlreadyClosed, Eventloop, Shutdown};
pub use handler::Handler;
pub use map::ConcurrentMap;
pub use token::ConnId;

/// Live connections of one server, keyed by identity.
pub type Registry<T> = ConcurrentMap<ConnId, std::sync::Arc<Connection<T>>>;
