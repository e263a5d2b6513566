//! Prometheus metrics for memshard
//!
//! Wire-level and connection-level counters live here; the per-shard
//! engine counters (items, bytes, evictions, hit rates) are kept by the
//! shards themselves and surfaced both through the `stats` command and
//! through [`Metrics::gather`].

use crate::cache::EngineStats;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

/// Global metrics instance
pub struct Metrics {
    pub registry: Registry,

    // Command counters
    pub cmd_get: IntCounter,
    pub cmd_set: IntCounter,
    pub cmd_delete: IntCounter,
    pub cmd_incr: IntCounter,
    pub cmd_decr: IntCounter,
    pub cmd_touch: IntCounter,
    pub cmd_flush: IntCounter,

    // Connection metrics
    pub active_connections: IntGauge,
    pub total_connections: IntCounter,
    pub rejected_connections: IntCounter,

    // Bytes counters
    pub bytes_read: IntCounter,
    pub bytes_written: IntCounter,

    // Latency histogram over single commands
    pub cmd_latency: Histogram,

    // Error counters
    pub protocol_errors: IntCounter,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let cmd_get = IntCounter::new("memshard_cmd_get_total", "Total get commands").unwrap();
        let cmd_set =
            IntCounter::new("memshard_cmd_set_total", "Total storage commands").unwrap();
        let cmd_delete =
            IntCounter::new("memshard_cmd_delete_total", "Total delete commands").unwrap();
        let cmd_incr = IntCounter::new("memshard_cmd_incr_total", "Total incr commands").unwrap();
        let cmd_decr = IntCounter::new("memshard_cmd_decr_total", "Total decr commands").unwrap();
        let cmd_touch =
            IntCounter::new("memshard_cmd_touch_total", "Total touch commands").unwrap();
        let cmd_flush =
            IntCounter::new("memshard_cmd_flush_total", "Total flush_all commands").unwrap();

        let active_connections =
            IntGauge::new("memshard_active_connections", "Current active connections").unwrap();
        let total_connections =
            IntCounter::new("memshard_connections_total", "Total connections accepted").unwrap();
        let rejected_connections = IntCounter::new(
            "memshard_rejected_connections_total",
            "Total connections rejected at the cap",
        )
        .unwrap();

        let bytes_read = IntCounter::new("memshard_bytes_read_total", "Total bytes read").unwrap();
        let bytes_written =
            IntCounter::new("memshard_bytes_written_total", "Total bytes written").unwrap();

        let cmd_latency = Histogram::with_opts(
            HistogramOpts::new("memshard_cmd_latency_seconds", "Command latency in seconds")
                .buckets(vec![
                    0.0001, 0.0005, 0.001, 0.002, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
                ]),
        )
        .unwrap();

        let protocol_errors =
            IntCounter::new("memshard_protocol_errors_total", "Total protocol errors").unwrap();

        registry.register(Box::new(cmd_get.clone())).unwrap();
        registry.register(Box::new(cmd_set.clone())).unwrap();
        registry.register(Box::new(cmd_delete.clone())).unwrap();
        registry.register(Box::new(cmd_incr.clone())).unwrap();
        registry.register(Box::new(cmd_decr.clone())).unwrap();
        registry.register(Box::new(cmd_touch.clone())).unwrap();
        registry.register(Box::new(cmd_flush.clone())).unwrap();
        registry
            .register(Box::new(active_connections.clone()))
            .unwrap();
        registry
            .register(Box::new(total_connections.clone()))
            .unwrap();
        registry
            .register(Box::new(rejected_connections.clone()))
            .unwrap();
        registry.register(Box::new(bytes_read.clone())).unwrap();
        registry.register(Box::new(bytes_written.clone())).unwrap();
        registry.register(Box::new(cmd_latency.clone())).unwrap();
        registry
            .register(Box::new(protocol_errors.clone()))
            .unwrap();

        Self {
            registry,
            cmd_get,
            cmd_set,
            cmd_delete,
            cmd_incr,
            cmd_decr,
            cmd_touch,
            cmd_flush,
            active_connections,
            total_connections,
            rejected_connections,
            bytes_read,
            bytes_written,
            cmd_latency,
            protocol_errors,
        }
    }

    /// Render Prometheus text format, appending the engine counters
    pub fn gather(&self, engine: &EngineStats) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        let mut output = String::from_utf8(buffer).unwrap();

        for (name, help, value) in [
            ("memshard_curr_items", "Entries currently stored", engine.curr_items),
            ("memshard_bytes", "Bytes used by keys and values", engine.bytes),
            ("memshard_evictions_total", "Entries evicted under the memory budget", engine.evictions),
            ("memshard_expired_total", "Entries removed on expiry", engine.expired),
            ("memshard_get_hits_total", "Get hits", engine.get_hits),
            ("memshard_get_misses_total", "Get misses", engine.get_misses),
        ] {
            output.push_str(&format!(
                "\n# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
            ));
        }

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
