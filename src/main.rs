//! memshard - memcached-compatible in-memory cache server
//!
//! Entry point: resolves configuration, builds the runtime sized to the
//! shard count, wires graceful shutdown and runs the acceptor.

// Use jemalloc for better multi-threaded allocation behavior
#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use clap::Parser;
use memshard::cache::Cache;
use memshard::config::{Config, Options};
use memshard::health::HealthServer;
use memshard::metrics::Metrics;
use memshard::server::Server;
use std::sync::Arc;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting memshard");

    let opts = Options::parse();
    let config = Config::resolve(&opts)?;
    info!("Configuration: {:?}", config);

    // One worker per shard, capped at the logical CPU count
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let worker_threads = config.cache.shards.clamp(1, cpus);
    info!("Using {} worker threads", worker_threads);

    let runtime = Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(config))
}

async fn async_main(config: Config) -> anyhow::Result<()> {
    // Cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();

    // Engine plus its background expiry sweeper
    let cache = Arc::new(Cache::new(&config.cache));
    let sweeper = Arc::clone(&cache).run_sweeper(cancel_token.clone());
    info!(
        "Cache initialized: {} shards, {} bytes budget",
        cache.shard_count(),
        cache.limit_maxbytes()
    );

    let metrics = Arc::new(Metrics::new());

    // Health/metrics endpoint in its own thread if enabled
    let health_server = if config.metrics.enabled {
        let health = Arc::new(HealthServer::new(Arc::clone(&cache), Arc::clone(&metrics)));
        let health_clone = Arc::clone(&health);
        let metrics_config = config.metrics.clone();

        std::thread::spawn(move || {
            if let Err(e) = health_clone.run(&metrics_config) {
                error!("Health server error: {}", e);
            }
        });

        Some(health)
    } else {
        None
    };

    let server = Arc::new(Server::new(
        config.server.clone(),
        Arc::clone(&cache),
        Arc::clone(&metrics),
        cancel_token.clone(),
    ));

    if let Some(ref health) = health_server {
        health.set_ready(true);
        info!("Server is ready");
    }

    // Signal handling: SIGINT and SIGTERM begin graceful shutdown
    let cancel_for_signal = cancel_token.clone();
    let health_for_signal = health_server.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = async {
                #[cfg(unix)]
                {
                    use tokio::signal::unix::{SignalKind, signal};
                    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
                    sigterm.recv().await
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<Option<()>>().await
                }
            } => {
                info!("Received SIGTERM, shutting down...");
            }
        }
        cancel_for_signal.cancel();
        if let Some(health) = health_for_signal {
            health.stop();
        }
    });

    let result = server.run().await;
    cancel_token.cancel();
    let _ = sweeper.await;

    if let Err(e) = &result {
        error!("Server error: {}", e);
    }
    info!("memshard stopped");
    result
}
