//! Protocol implementations.
//!
//! The runtime is framing-agnostic: a protocol plugs in by implementing
//! [`Handler`](crate::runtime::Handler) and cutting its own frames out of the
//! accumulated read buffer.
//!
//! - `packet`: fixed-header binary packets, relayed to every live connection

pub mod packet;
