//! Stored entries and memcached expiry rules
//!
//! TTL rules (memcached-compatible):
//! - 0 = never expire
//! - <= 2592000 (30 days) = relative seconds from now
//! - > 2592000 = absolute Unix timestamp in seconds
//!
//! Deadlines are stored as absolute Unix milliseconds so the expiry heap
//! orders on a single integer.

use crate::cache::index::NodeRef;
use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum key length (memcached spec)
pub const MAX_KEY_LEN: usize = 250;

/// Maximum value length (memcached default item size, 1MB)
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

/// Maximum relative TTL value (30 days in seconds)
const MAX_RELATIVE_TTL: u64 = 2_592_000;

/// One live cache entry.
///
/// `lru` is the entry's node in the shard's LRU list; it is maintained by
/// the shard and must always reference a live node while the entry is in
/// the index.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Actual data
    pub value: Bytes,
    /// Opaque client flags, echoed on retrieval
    pub flags: u32,
    /// Absolute expiry deadline in Unix milliseconds (0 = never expire)
    pub expiry_ms: u64,
    /// Version token, unique per shard for the process lifetime
    pub cas: u64,
    /// Position in the shard's LRU list
    pub(crate) lru: NodeRef,
}

impl Entry {
    /// Check whether the entry is hard-expired at `now_ms`
    #[inline]
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        self.expiry_ms != 0 && self.expiry_ms <= now_ms
    }
}

/// Decode a memcached `exptime` into an absolute millisecond deadline,
/// relative to `now_ms`.
pub fn expiry_deadline_ms(exptime: u64, now_ms: u64) -> u64 {
    if exptime == 0 {
        0
    } else if exptime <= MAX_RELATIVE_TTL {
        now_ms + exptime * 1000
    } else {
        exptime * 1000
    }
}

/// Current Unix time in milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current Unix time in seconds
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_expire() {
        assert_eq!(expiry_deadline_ms(0, now_ms()), 0);
    }

    #[test]
    fn test_relative_ttl() {
        let now = 1_000_000;
        assert_eq!(expiry_deadline_ms(60, now), now + 60_000);
    }

    #[test]
    fn test_ttl_boundary_is_relative() {
        // Exactly 30 days is still relative
        let now = 5_000;
        assert_eq!(
            expiry_deadline_ms(MAX_RELATIVE_TTL, now),
            now + MAX_RELATIVE_TTL * 1000
        );
    }

    #[test]
    fn test_ttl_above_boundary_is_absolute() {
        let now = 5_000;
        assert_eq!(
            expiry_deadline_ms(MAX_RELATIVE_TTL + 1, now),
            (MAX_RELATIVE_TTL + 1) * 1000
        );
    }

    #[test]
    fn test_absolute_timestamp() {
        let future_secs = now_secs() + 3_000_000;
        assert_eq!(expiry_deadline_ms(future_secs, now_ms()), future_secs * 1000);
    }

    #[test]
    fn test_expired_at() {
        let entry = Entry {
            value: Bytes::from_static(b"data"),
            flags: 0,
            expiry_ms: 1000,
            cas: 1,
            lru: NodeRef::NIL,
        };
        assert!(!entry.is_expired_at(999));
        assert!(entry.is_expired_at(1000));
        assert!(entry.is_expired_at(1001));

        let forever = Entry { expiry_ms: 0, ..entry };
        assert!(!forever.is_expired_at(u64::MAX));
    }
}
