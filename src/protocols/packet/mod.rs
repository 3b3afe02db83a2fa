//! Binary packet protocol.
//!
//! Every packet is a fixed 38-byte little-endian header followed by a body
//! of `body_size` bytes:
//!
//! ```text
//! offset  size  field
//!      0     2  status
//!      2     8  session
//!     10     4  offset
//!     14     8  body_size
//!     22     8  send_at    (unix seconds)
//!     30     8  dummy
//!     38     n  body       (n = body_size <= 6000)
//! ```
//!
//! Frames may arrive split across reads or several to a read; the parser
//! reports incomplete input instead of failing so the connection keeps
//! accumulating bytes.

pub mod handler;
pub mod parser;

pub use handler::Relay;
pub use parser::{marshal, unmarshal, Header, Packet, PacketError, HEADER_SIZE, MAX_BODY_SIZE};
