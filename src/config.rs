//! Configuration for memshard
//!
//! Three sources, later ones winning: memcached-compatible defaults, an
//! optional plain-text config file, and command-line flags.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line options (memcached-compatible flag names)
#[derive(Debug, Default, Parser)]
#[command(name = "memshard", version, about = "Memcached-compatible in-memory cache server")]
pub struct Options {
    /// TCP port to listen on
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Interface to listen on (default: all interfaces)
    #[arg(short = 'l', long = "listen")]
    pub listen: Option<String>,

    /// Unix socket path (overrides --port and --listen)
    #[arg(short = 's', long = "socket")]
    pub socket: Option<PathBuf>,

    /// Max memory to use for items in megabytes
    #[arg(short = 'm', long = "memory")]
    pub memory: Option<usize>,

    /// Max simultaneous connections
    #[arg(short = 'c', long = "connections")]
    pub connections: Option<usize>,

    /// Number of cache shards
    #[arg(short = 't', long = "threads")]
    pub threads: Option<usize>,

    /// Path to config file
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Address for the metrics/health HTTP server
    #[arg(long = "metrics-addr")]
    pub metrics_addr: Option<String>,

    /// Disable the metrics/health HTTP server
    #[arg(long = "no-metrics")]
    pub no_metrics: bool,
}

/// Main configuration structure
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub metrics: MetricsConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on
    pub port: u16,

    /// Interface to bind; empty means all interfaces
    pub listen: String,

    /// Unix socket path; set overrides TCP listening
    pub socket: Option<PathBuf>,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Read buffer size per connection (bytes)
    pub read_buffer_size: usize,

    /// Write buffer size per connection (bytes)
    pub write_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 11211,
            listen: String::new(),
            socket: None,
            max_connections: 1024,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
        }
    }
}

impl ServerConfig {
    /// TCP bind address built from `listen` and `port`
    pub fn tcp_addr(&self) -> String {
        if self.listen.is_empty() {
            format!("0.0.0.0:{}", self.port)
        } else {
            format!("{}:{}", self.listen, self.port)
        }
    }
}

/// Cache engine configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total memory budget in bytes, split evenly across shards
    /// (0 disables eviction)
    pub max_bytes: usize,

    /// Number of shards
    pub shards: usize,

    /// Background expiry sweep period
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            shards: 4,
            sweep_interval: Duration::from_millis(100),
        }
    }
}

/// Metrics and health check configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Enable the metrics/health HTTP server
    pub enabled: bool,

    /// Address for the metrics/health HTTP server
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

impl Config {
    /// Build the effective configuration: defaults, then the config file
    /// (if given), then explicit command-line flags.
    pub fn resolve(opts: &Options) -> crate::error::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = &opts.config {
            config.apply_file(path)?;
        }

        if let Some(port) = opts.port {
            config.server.port = port;
        }
        if let Some(listen) = &opts.listen {
            config.server.listen = listen.clone();
        }
        if let Some(socket) = &opts.socket {
            config.server.socket = Some(socket.clone());
        }
        if let Some(memory) = opts.memory {
            config.cache.max_bytes = memory * 1024 * 1024;
        }
        if let Some(connections) = opts.connections {
            config.server.max_connections = connections;
        }
        if let Some(threads) = opts.threads {
            config.cache.shards = threads;
        }
        if let Some(addr) = &opts.metrics_addr {
            config.metrics.listen_addr = addr.clone();
        }
        if opts.no_metrics {
            config.metrics.enabled = false;
        }

        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> crate::error::Result<()> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::MemshardError::Config(format!("Failed to read config file: {e}"))
        })?;
        self.apply_file_contents(&contents);
        Ok(())
    }

    /// Parse the plain `key = value` config format. Lines starting with
    /// `#` are comments, `#` also starts a trailing comment; unknown keys
    /// and unparsable values are ignored.
    fn apply_file_contents(&mut self, data: &str) {
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = match value.find('#') {
                Some(i) => value[..i].trim(),
                None => value.trim(),
            };

            match key {
                "port" => {
                    if let Ok(n) = value.parse() {
                        self.server.port = n;
                    }
                }
                "listen" => {
                    self.server.listen = value.to_string();
                }
                "memory" => {
                    if let Ok(n) = value.parse::<usize>() {
                        self.cache.max_bytes = n * 1024 * 1024;
                    }
                }
                "connections" => {
                    if let Ok(n) = value.parse() {
                        self.server.max_connections = n;
                    }
                }
                "threads" => {
                    if let Ok(n) = value.parse() {
                        self.cache.shards = n;
                    }
                }
                _ => {}
            }
        }
    }
}
