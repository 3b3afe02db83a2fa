//! TCP server.
//!
//! Accepts connections, registers each one in the registry, and drives its
//! lifecycle on a dedicated task:
//! store -> `on_open` -> run -> `on_close` -> delete.

use crate::config::ServerConfig;
use crate::runtime::{Connection, Handler, Registry};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Server instance
pub struct Server<T, H> {
    config: ServerConfig,
    registry: Arc<Registry<T>>,
    handler: Arc<H>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl<T, H> Server<T, H>
where
    T: Default + Send + 'static,
    H: Handler<T>,
{
    /// Create a server with its own registry.
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self::with_registry(config, Arc::new(Registry::new()), handler)
    }

    /// Create a server that tracks its connections in `registry`.
    ///
    /// Sharing the registry with the handler lets callbacks reach every
    /// live connection.
    pub fn with_registry(config: ServerConfig, registry: Arc<Registry<T>>, handler: H) -> Self {
        Server {
            config,
            registry,
            handler: Arc::new(handler),
            closed: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
        }
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<Registry<T>> {
        &self.registry
    }

    /// Bind and accept connections until [`Server::close`] is called.
    pub async fn run(&self) -> io::Result<()> {
        let addr = self
            .config
            .listen_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = create_listener(addr, self.config.backlog)?;
        info!(address = %listener.local_addr()?, "Server listening");

        let mut shutdown = self.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    self.serve(stream);
                }
                Err(_) if self.is_closed() => break,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }

        info!("Server stopped accepting");
        Ok(())
    }

    /// Stop accepting. Connections already accepted keep running.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn serve(&self, stream: TcpStream) {
        let registry = Arc::clone(&self.registry);
        let handler = Arc::clone(&self.handler);
        let config = self.config.conn.clone();

        tokio::spawn(async move {
            let conn = Connection::new(stream, Arc::clone(&handler), config);
            let registration = Registration::new(registry, Arc::clone(&conn));
            conn.drive(handler).await;
            drop(registration);
        });
    }
}

/// Registry entry for one connection.
///
/// Dropping it closes the connection and removes the entry, so the entry
/// goes away even if a lifecycle callback panics.
struct Registration<T> {
    registry: Arc<Registry<T>>,
    conn: Arc<Connection<T>>,
}

impl<T> Registration<T> {
    fn new(registry: Arc<Registry<T>>, conn: Arc<Connection<T>>) -> Self {
        registry.store(conn.id(), Arc::clone(&conn));
        Registration { registry, conn }
    }
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        let id = self.conn.id();
        self.conn.close();
        self.registry.delete(&id);
        debug!(conn = %id, live = self.registry.len(), "Connection finished");
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}
