//! # memshard
//!
//! Memcached-compatible in-memory cache server with sharded LRU storage.
//!
//! ## Features
//!
//! - Memcached ASCII protocol (get/gets, set/add/replace/cas, append/
//!   prepend, delete, incr/decr, touch, flush_all, stats, version)
//! - Memcached binary protocol including quiet opcodes, GetK and GAT
//! - Sharded engine: FNV-1a key routing, per-shard LRU eviction under a
//!   byte budget, min-heap expiry with a background sweep, monotone CAS
//!   tokens
//! - TCP and Unix-domain socket listeners with a connection cap
//! - Prometheus metrics and health endpoints
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────┐   ┌───────────────────────────┐
//! │ memcache   │──▶│ acceptor         │──▶│ cache façade              │
//! │ client     │   │  ├─ text codec   │   │  ├─ router (fnv1a % N)    │
//! │ (any)      │   │  └─ binary codec │   │  └─ shard: index + LRU +  │
//! └────────────┘   └──────────────────┘   │     expiry heap + budget  │
//!                                         └───────────────────────────┘
//! ```

// Modules
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod prelude;
pub mod protocol;
pub mod server;

// Re-exports for convenience
pub use error::{CacheError, MemshardError, ProtocolError, Result};
