//! A single TCP connection.
//!
//! Each connection runs two loops side by side:
//! - a read loop that accumulates bytes and lets the [`Handler`] cut frames
//!   off the front of the accumulated buffer, and
//! - a single-worker [`Eventloop`] that owns the write half and flushes
//!   queued buffers one at a time, so concurrent `write` callers never
//!   interleave bytes on the wire.
//!
//! Closing is idempotent and never blocks: it stops admission on the write
//! loop and stops the read loop. The write half is shut down only after the
//! write loop has drained everything admitted before the close.

use crate::config::ConnConfig;
use crate::runtime::{AlreadyClosed, ConnId, Eventloop, Handler, Shutdown};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, trace};

/// A framed, write-serialized TCP connection carrying a user field `T`.
pub struct Connection<T> {
    id: ConnId,
    peer: Option<SocketAddr>,
    field: Mutex<T>,
    config: ConnConfig,
    closed: AtomicBool,
    stop_reading: watch::Sender<bool>,
    /// Taken by `run`.
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    write_loop: Eventloop<Bytes>,
}

impl<T> Connection<T> {
    /// Identity, unique among connections of this process.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Remote address, if the socket reported one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Outbound buffers queued but not yet picked up by the writer.
    pub fn pending_writes(&self) -> usize {
        self.write_loop.len()
    }

    /// Replace the user field.
    pub fn set_field(&self, value: T) {
        *self.field.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    /// Run `f` with exclusive access to the user field.
    pub fn with_field<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.field.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Clone of the user field.
    pub fn field(&self) -> T
    where
        T: Clone,
    {
        self.with_field(|field| field.clone())
    }

    /// Stop the connection. Pending writes are flushed before the stream is
    /// shut down. Safe to call from any callback, any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(conn = %self.id, "Closing connection");
        self.write_loop.shutdown(Shutdown::Graceful);
        self.stop_reading.send_replace(true);
    }
}

impl<T: Send + 'static> Connection<T> {
    pub(crate) fn new<H>(stream: TcpStream, handler: Arc<H>, config: ConnConfig) -> Arc<Self>
    where
        T: Default,
        H: Handler<T>,
    {
        let id = ConnId::next();
        let peer = stream.peer_addr().ok();
        if config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(conn = %id, error = %e, "Failed to set TCP_NODELAY");
            }
        }
        let (reader, writer) = stream.into_split();

        Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            // One worker: a second one could reorder or interleave buffers.
            let write_loop = Eventloop::new(config.write_queue_size, 1, move |buf: Bytes| {
                let this = this.clone();
                let handler = Arc::clone(&handler);
                async move {
                    if let Some(conn) = this.upgrade() {
                        conn.flush(buf, &*handler).await;
                    }
                }
            });

            Self {
                id,
                peer,
                field: Mutex::new(T::default()),
                config,
                closed: AtomicBool::new(false),
                stop_reading: watch::channel(false).0,
                reader: Mutex::new(Some(reader)),
                writer: tokio::sync::Mutex::new(writer),
                write_loop,
            }
        })
    }

    /// Queue `buf` for sending.
    ///
    /// Waits while the outbound queue is full. Fails once the connection is
    /// closing; buffers admitted before the close are still sent.
    pub async fn write(&self, buf: impl Into<Bytes>) -> Result<(), AlreadyClosed> {
        self.write_loop.send(buf.into()).await
    }

    /// Full lifecycle: `on_open`, both loops, then `on_close`.
    ///
    /// The loops run on their own task. If they panic (for instance a
    /// handler consuming more than it was offered) the failure is logged, the
    /// connection is closed so writers stop queueing on it, and `on_close`
    /// still runs.
    pub(crate) async fn drive<H: Handler<T>>(self: Arc<Self>, handler: Arc<H>) {
        handler.on_open(&self).await;

        let loops = {
            let conn = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { conn.run(&*handler).await })
        };
        if let Err(e) = loops.await {
            error!(conn = %self.id, error = %e, "Connection task failed");
            self.close();
            if let Err(e) = self.writer.lock().await.shutdown().await {
                trace!(conn = %self.id, error = %e, "Shutdown of write half failed");
            }
        }

        handler.on_close(&self).await;
    }

    /// Drive both loops until the connection is closed and drained.
    pub(crate) async fn run<H: Handler<T>>(self: &Arc<Self>, handler: &H) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(reader) = reader else {
            debug!(conn = %self.id, "Connection is already running");
            return;
        };

        tokio::join!(
            async {
                self.read_loop(reader, handler).await;
                self.close();
            },
            async {
                self.write_loop.run().await;
                if let Err(e) = self.writer.lock().await.shutdown().await {
                    trace!(conn = %self.id, error = %e, "Shutdown of write half failed");
                }
            },
        );
    }

    async fn read_loop<H: Handler<T>>(self: &Arc<Self>, mut reader: OwnedReadHalf, handler: &H) {
        let mut stop = self.stop_reading.subscribe();
        let mut scratch = vec![0u8; self.config.buffer_size.max(1)];
        let mut pending = BytesMut::with_capacity(self.config.buffer_size);

        loop {
            let read = tokio::select! {
                biased;
                _ = stopped(&mut stop) => return,
                read = bounded(self.config.read_timeout(), reader.read(&mut scratch), "read") => read,
            };

            let n = match read {
                Ok(0) => {
                    debug!(conn = %self.id, "Peer closed the stream");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    if self.is_closed() {
                        trace!(conn = %self.id, error = %e, "Read failed while closing");
                    } else {
                        handler.on_read_error(self, &e).await;
                    }
                    return;
                }
            };

            pending.extend_from_slice(&scratch[..n]);
            let consumed = self.dispatch(&pending, handler).await;
            pending.advance(consumed);
        }
    }

    /// Offer `buf` to the handler until it asks for more bytes.
    async fn dispatch<H: Handler<T>>(self: &Arc<Self>, buf: &[u8], handler: &H) -> usize {
        let mut consumed = 0;
        while consumed < buf.len() {
            let offered = buf.len() - consumed;
            let n = handler.on_read(self, &buf[consumed..]).await;
            if n == 0 {
                break;
            }
            assert!(
                n <= offered,
                "handler consumed {n} bytes but only {offered} were offered"
            );
            consumed += n;
        }
        consumed
    }

    /// Write all of `buf`, handling partial writes.
    async fn flush<H: Handler<T>>(self: &Arc<Self>, buf: Bytes, handler: &H) {
        let mut writer = self.writer.lock().await;
        let mut written = 0;

        while written < buf.len() {
            let result =
                match bounded(self.config.write_timeout(), writer.write(&buf[written..]), "write")
                    .await
                {
                    Ok(0) => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                    result => result,
                };

            match result {
                Ok(n) => written += n,
                Err(e) => {
                    drop(writer);
                    if self.is_closed() {
                        trace!(conn = %self.id, error = %e, "Write failed while closing");
                    } else {
                        handler.on_write_error(self, &e).await;
                        self.close();
                    }
                    // The stream is broken; queued buffers are dropped.
                    self.write_loop.shutdown(Shutdown::Force);
                    return;
                }
            }
        }

        trace!(conn = %self.id, bytes = written, "Flushed");
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Run one I/O operation under `limit`, if there is one.
async fn bounded<R>(
    limit: Option<Duration>,
    op: impl Future<Output = io::Result<R>>,
    what: &str,
) -> io::Result<R> {
    let Some(limit) = limit else {
        return op.await;
    };
    timeout(limit, op).await.unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        ))
    })
}

/// Open an outbound connection.
///
/// A spawned task invokes `on_open`, runs the connection, then invokes
/// `on_close`. The returned handle can be used to write and close.
pub async fn dial<T, H>(
    addr: impl ToSocketAddrs,
    handler: Arc<H>,
    config: ConnConfig,
) -> io::Result<Arc<Connection<T>>>
where
    T: Default + Send + 'static,
    H: Handler<T>,
{
    let stream = TcpStream::connect(addr).await?;
    let conn = Connection::new(stream, Arc::clone(&handler), config);
    debug!(conn = %conn.id(), peer = ?conn.peer_addr(), "Dialed connection");

    tokio::spawn(Arc::clone(&conn).drive(handler));

    Ok(conn)
}
