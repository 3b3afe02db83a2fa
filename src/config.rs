//! Configuration for eventwire servers and connections.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the relay server
#[derive(Parser, Debug, Default)]
#[command(name = "eventwire")]
#[command(version = "0.1.0")]
#[command(about = "A packet relay server built on eventwire", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Per-connection read buffer size in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Read timeout in seconds
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Write timeout in seconds
    #[arg(long)]
    pub write_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[server]` section
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnConfig {
    /// Size of the scratch buffer each read fills
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Seconds a single read may block before it fails (0 disables)
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Seconds a single write may block before it fails (0 disables)
    #[serde(default = "default_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Outbound buffers queued before `write` applies backpressure
    #[serde(default = "default_write_queue_size")]
    pub write_queue_size: usize,
    /// Disable Nagle's algorithm on the stream
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

impl ConnConfig {
    /// Read timeout, `None` when disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        timeout_from_secs(self.read_timeout_secs)
    }

    /// Write timeout, `None` when disabled.
    pub fn write_timeout(&self) -> Option<Duration> {
        timeout_from_secs(self.write_timeout_secs)
    }
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            read_timeout_secs: default_timeout_secs(),
            write_timeout_secs: default_timeout_secs(),
            write_queue_size: default_write_queue_size(),
            nodelay: default_nodelay(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    4096
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_write_queue_size() -> usize {
    16
}

fn default_nodelay() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Listener plus the settings every accepted connection inherits.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub conn: ConnConfig,
}

impl ServerConfig {
    /// Listen on `host:port` with default connection settings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            backlog: default_backlog(),
            conn: ConnConfig::default(),
        }
    }

    /// Socket address for the listener. `host` must be an IPv4 or IPv6
    /// literal.
    pub fn listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.host.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(default_host(), default_port())
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they point at (if any).
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        let mut conn = toml_config.connection;
        if let Some(size) = cli.buffer_size {
            conn.buffer_size = size;
        }
        if let Some(secs) = cli.read_timeout {
            conn.read_timeout_secs = secs;
        }
        if let Some(secs) = cli.write_timeout {
            conn.write_timeout_secs = secs;
        }

        Ok(Config {
            server: ServerConfig {
                host: cli.host.unwrap_or(toml_config.server.host),
                port: cli.port.unwrap_or(toml_config.server.port),
                backlog: toml_config.server.backlog,
                conn,
            },
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
