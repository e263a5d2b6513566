//! Connection acceptor for the memcached protocols
//!
//! Listens on TCP or on a Unix-domain socket (when the configured socket
//! path is set), enforces the connection cap with a semaphore, and spawns
//! one task per connection. The per-connection task sniffs the first byte
//! to pick the binary or text codec.

mod binary;
mod connection;
mod text;

use crate::cache::Cache;
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main server struct
pub struct Server {
    pub(crate) config: ServerConfig,
    pub(crate) cache: Arc<Cache>,
    pub(crate) metrics: Arc<Metrics>,
    connection_semaphore: Arc<Semaphore>,
    pub(crate) cancel_token: CancellationToken,
}

impl Server {
    /// Create a new server
    pub fn new(
        config: ServerConfig,
        cache: Arc<Cache>,
        metrics: Arc<Metrics>,
        cancel_token: CancellationToken,
    ) -> Self {
        let connection_semaphore = Arc::new(Semaphore::new(config.max_connections));

        Self {
            config,
            cache,
            metrics,
            connection_semaphore,
            cancel_token,
        }
    }

    /// Run the server until the cancellation token fires
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        match self.config.socket.clone() {
            Some(path) => self.run_unix(&path).await,
            None => self.run_tcp().await,
        }
    }

    async fn run_tcp(self: Arc<Self>) -> anyhow::Result<()> {
        let addr: SocketAddr = self.config.tcp_addr().parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Server listening on {} (max connections: {})",
            addr, self.config.max_connections
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            // Disable Nagle's algorithm for lower latency
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            debug!("Accepted connection from {}", peer_addr);
                            self.dispatch(stream);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_unix(self: Arc<Self>, path: &Path) -> anyhow::Result<()> {
        // Unlink a stale socket file from a previous run
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(
            "Server listening on unix socket {:?} (max connections: {})",
            path, self.config.max_connections
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            self.dispatch(stream);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        let _ = std::fs::remove_file(path);
        Ok(())
    }

    /// Hand an accepted stream to its own task, or refuse it at the cap
    fn dispatch<S>(self: &Arc<Self>, stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        match self.connection_semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                self.metrics.total_connections.inc();
                self.metrics.active_connections.inc();

                let server = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = connection::handle(server, stream, permit).await {
                        debug!("Connection error: {}", e);
                    }
                });
            }
            Err(_) => {
                // Connection limit reached; close without handshake
                self.metrics.rejected_connections.inc();
                warn!("Connection limit reached, rejecting connection");
                drop(stream);
            }
        }
    }
}

/// Assemble the `stats` key/value pairs shared by both protocols
pub(crate) fn stat_pairs(server: &Server) -> Vec<(&'static str, String)> {
    let engine = server.cache.stats();
    vec![
        ("pid", std::process::id().to_string()),
        ("uptime", server.cache.uptime_secs().to_string()),
        ("time", crate::cache::entry::now_secs().to_string()),
        ("version", env!("CARGO_PKG_VERSION").to_string()),
        ("curr_items", engine.curr_items.to_string()),
        ("bytes", engine.bytes.to_string()),
        ("evictions", engine.evictions.to_string()),
        ("cmd_get", engine.cmd_get.to_string()),
        ("cmd_set", engine.cmd_set.to_string()),
        ("get_hits", engine.get_hits.to_string()),
        ("get_misses", engine.get_misses.to_string()),
        ("limit_maxbytes", server.cache.limit_maxbytes().to_string()),
        ("threads", server.cache.shard_count().to_string()),
        ("curr_connections", server.metrics.active_connections.get().to_string()),
    ]
}
