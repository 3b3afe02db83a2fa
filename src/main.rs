//! eventwire relay: broadcasts every packet a client sends to all clients
//!
//! Features:
//! - Fixed-header binary packets framed over plain TCP
//! - Per-connection write queues with backpressure
//! - Configuration via CLI arguments or TOML file

use eventwire::protocols::packet::Relay;
use eventwire::{Config, Registry, Server};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.server.host,
        port = config.server.port,
        buffer_size = config.server.conn.buffer_size,
        read_timeout_secs = config.server.conn.read_timeout_secs,
        write_timeout_secs = config.server.conn.write_timeout_secs,
        "Starting eventwire relay"
    );

    let registry = Arc::new(Registry::new());
    let server = Arc::new(Server::with_registry(
        config.server,
        Arc::clone(&registry),
        Relay::new(registry),
    ));

    let signal = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown signal received");
            server.close();
        })
    };

    server.run().await?;
    signal.abort();

    for (_, conn) in server.registry().snapshot() {
        conn.close();
    }
    info!(remaining = server.registry().len(), "Server stopped");
    Ok(())
}
