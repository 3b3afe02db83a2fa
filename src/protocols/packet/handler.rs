//! Packet relay.
//!
//! Every packet a connection sends is broadcast to all live connections in
//! the registry, the sender included.

use super::parser::{marshal, unmarshal};
use crate::runtime::{Connection, Handler, Registry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Broadcasts each decoded packet to every registered connection.
///
/// The connection field holds the session id of the last packet the peer
/// sent.
pub struct Relay {
    registry: Arc<Registry<u64>>,
    relayed: AtomicU64,
}

impl Relay {
    pub fn new(registry: Arc<Registry<u64>>) -> Self {
        Relay {
            registry,
            relayed: AtomicU64::new(0),
        }
    }

    /// Packets decoded so far.
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }
}

impl Handler<u64> for Relay {
    async fn on_read(&self, conn: &Arc<Connection<u64>>, buf: &[u8]) -> usize {
        let (packet, used) = match unmarshal(buf) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return 0,
            Err(e) => {
                warn!(conn = %conn.id(), error = %e, "Dropping peer after protocol error");
                conn.close();
                return buf.len();
            }
        };

        conn.set_field(packet.header.session);
        self.relayed.fetch_add(1, Ordering::Relaxed);

        let frame = match marshal(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(conn = %conn.id(), error = %e, "Failed to encode packet");
                return used;
            }
        };

        for (id, peer) in self.registry.snapshot() {
            if peer.is_closed() {
                continue;
            }
            // Bytes clones share the frame.
            if peer.write(frame.clone()).await.is_err() {
                trace!(conn = %id, "Skipping peer that is closing");
            }
        }

        used
    }
}
