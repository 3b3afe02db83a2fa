//! Connection lifecycle callbacks.

use crate::runtime::Connection;
use std::future::Future;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Capability set a server or dialed connection dispatches to.
///
/// Framing is entirely the handler's business: [`Handler::on_read`] is
/// offered the unconsumed bytes accumulated so far and reports how many of
/// them form the next complete unit.
pub trait Handler<T: Send>: Send + Sync + 'static {
    /// Called once the connection is set up, before its loops start.
    fn on_open(&self, conn: &Arc<Connection<T>>) -> impl Future<Output = ()> + Send {
        async move {
            debug!(conn = %conn.id(), peer = ?conn.peer_addr(), "Connection opened");
        }
    }

    /// Called exactly once after both loops have stopped.
    fn on_close(&self, conn: &Arc<Connection<T>>) -> impl Future<Output = ()> + Send {
        async move {
            debug!(conn = %conn.id(), "Connection closed");
        }
    }

    /// Consume the next frame from the front of `buf`.
    ///
    /// Return 0 when `buf` does not yet hold a complete frame, otherwise the
    /// exact length of that frame. Returning more than `buf.len()` is a
    /// contract violation and panics the connection task.
    fn on_read(&self, conn: &Arc<Connection<T>>, buf: &[u8])
        -> impl Future<Output = usize> + Send;

    /// A read failed while the connection was open.
    fn on_read_error(
        &self,
        conn: &Arc<Connection<T>>,
        err: &io::Error,
    ) -> impl Future<Output = ()> + Send {
        async move {
            warn!(conn = %conn.id(), error = %err, "Read failed");
        }
    }

    /// A write failed while the connection was open.
    fn on_write_error(
        &self,
        conn: &Arc<Connection<T>>,
        err: &io::Error,
    ) -> impl Future<Output = ()> + Send {
        async move {
            warn!(conn = %conn.id(), error = %err, "Write failed");
        }
    }
}
