//! Prelude module for common imports.
//!
//! # Usage
//!
//! ```ignore
//! use memshard::prelude::*;
//! ```

// Error types
pub use crate::error::{CacheError, MemshardError, ProtocolError, Result};

// Configuration
pub use crate::config::{CacheConfig, Config, MetricsConfig, Options, ServerConfig};

// Engine
pub use crate::cache::{Cache, EngineStats, ValueView};

// Protocol
pub use crate::protocol::{Command, ParseResult, ResponseWriter};

// Metrics
pub use crate::metrics::Metrics;

// Server
pub use crate::server::Server;

// Common external crates
pub use std::sync::Arc;
pub use tracing::{debug, error, info, trace, warn};
