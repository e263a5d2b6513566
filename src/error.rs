//! Error types for memshard

use thiserror::Error;

/// Main error type for memshard
#[derive(Error, Debug)]
pub enum MemshardError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Engine-level operation failures.
///
/// Every cache operation that can fail reports one of these kinds; the
/// protocol codecs translate them to wire responses (text strings or binary
/// status codes).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    Exists,

    #[error("cas token mismatch")]
    CasMismatch,

    #[error("key too long (max 250 bytes)")]
    KeyTooLarge,

    #[error("object too large")]
    ValueTooLarge,

    #[error("cannot increment or decrement non-numeric value")]
    NotNumeric,
}

/// Protocol parsing and framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid flags")]
    InvalidFlags,

    #[error("invalid exptime")]
    InvalidExptime,

    #[error("invalid bytes length")]
    InvalidBytesLength,

    #[error("invalid cas value")]
    InvalidCas,

    #[error("invalid numeric delta argument")]
    InvalidDelta,

    #[error("key too long (max 250 bytes)")]
    KeyTooLong,

    #[error("object too large for cache")]
    ValueTooLarge,

    #[error("bad data chunk")]
    UnexpectedData,

    #[error("bad magic byte 0x{0:02x}")]
    BadMagic(u8),

    #[error("frame body length {0} exceeds limit")]
    FrameTooLarge(u32),
}

pub type Result<T> = std::result::Result<T, MemshardError>;
