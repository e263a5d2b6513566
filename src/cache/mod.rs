//! Sharded in-memory cache engine
//!
//! The [`Cache`] façade validates limits, routes each key to its shard via
//! FNV-1a, and fans cross-shard operations (flush, stats) out to every
//! shard. All protocol codecs talk to the engine exclusively through this
//! surface.

pub mod entry;
pub mod index;
pub mod router;
pub mod shard;

pub use entry::{MAX_KEY_LEN, MAX_VALUE_LEN};
pub use shard::{ShardSnapshot, ValueView};

use crate::cache::entry::{expiry_deadline_ms, now_ms};
use crate::cache::router::Router;
use crate::cache::shard::Shard;
use crate::config::CacheConfig;
use crate::error::CacheError;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Aggregated engine statistics across all shards
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub curr_items: u64,
    pub bytes: u64,
    pub evictions: u64,
    pub expired: u64,
    pub cmd_get: u64,
    pub cmd_set: u64,
    pub get_hits: u64,
    pub get_misses: u64,
}

pub struct Cache {
    shards: Vec<Shard>,
    router: Router,
    start: Instant,
    limit_maxbytes: u64,
    sweep_interval: Duration,
}

impl Cache {
    pub fn new(config: &CacheConfig) -> Self {
        let router = Router::new(config.shards);
        let n = router.shard_count();
        let per_shard = config.max_bytes / n;
        let cas_seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let shards = (0..n).map(|_| Shard::new(per_shard, cas_seed)).collect();
        Self {
            shards,
            router,
            start: Instant::now(),
            limit_maxbytes: config.max_bytes as u64,
            sweep_interval: config.sweep_interval,
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.router.shard_for(key)]
    }

    fn validate_key(key: &[u8]) -> Result<(), CacheError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(CacheError::KeyTooLarge);
        }
        Ok(())
    }

    fn validate_write(key: &[u8], value_len: usize) -> Result<(), CacheError> {
        Self::validate_key(key)?;
        if value_len > MAX_VALUE_LEN {
            return Err(CacheError::ValueTooLarge);
        }
        Ok(())
    }

    pub fn get(&self, key: &Bytes) -> Result<ValueView, CacheError> {
        Self::validate_key(key)?;
        self.shard(key).get(key, now_ms())
    }

    pub fn set(
        &self,
        key: &Bytes,
        value: Bytes,
        flags: u32,
        exptime: u64,
    ) -> Result<u64, CacheError> {
        Self::validate_write(key, value.len())?;
        let now = now_ms();
        self.shard(key)
            .set(key, value, flags, expiry_deadline_ms(exptime, now), now)
    }

    pub fn add(
        &self,
        key: &Bytes,
        value: Bytes,
        flags: u32,
        exptime: u64,
    ) -> Result<u64, CacheError> {
        Self::validate_write(key, value.len())?;
        let now = now_ms();
        self.shard(key)
            .add(key, value, flags, expiry_deadline_ms(exptime, now), now)
    }

    pub fn replace(
        &self,
        key: &Bytes,
        value: Bytes,
        flags: u32,
        exptime: u64,
    ) -> Result<u64, CacheError> {
        Self::validate_write(key, value.len())?;
        let now = now_ms();
        self.shard(key)
            .replace(key, value, flags, expiry_deadline_ms(exptime, now), now)
    }

    pub fn cas(
        &self,
        key: &Bytes,
        value: Bytes,
        flags: u32,
        exptime: u64,
        expected: u64,
    ) -> Result<u64, CacheError> {
        Self::validate_write(key, value.len())?;
        let now = now_ms();
        self.shard(key).cas(
            key,
            value,
            flags,
            expiry_deadline_ms(exptime, now),
            expected,
            now,
        )
    }

    pub fn delete(&self, key: &Bytes) -> Result<(), CacheError> {
        Self::validate_key(key)?;
        self.shard(key).delete(key, now_ms())
    }

    pub fn touch(&self, key: &Bytes, exptime: u64) -> Result<u64, CacheError> {
        Self::validate_key(key)?;
        let now = now_ms();
        self.shard(key)
            .touch(key, expiry_deadline_ms(exptime, now), now)
    }

    pub fn incr(&self, key: &Bytes, delta: u64) -> Result<(u64, u64), CacheError> {
        Self::validate_key(key)?;
        self.shard(key).incr_decr(key, delta, true, now_ms())
    }

    pub fn decr(&self, key: &Bytes, delta: u64) -> Result<(u64, u64), CacheError> {
        Self::validate_key(key)?;
        self.shard(key).incr_decr(key, delta, false, now_ms())
    }

    pub fn append(&self, key: &Bytes, data: &[u8]) -> Result<u64, CacheError> {
        Self::validate_write(key, data.len())?;
        self.shard(key).concat(key, data, false, now_ms())
    }

    pub fn prepend(&self, key: &Bytes, data: &[u8]) -> Result<u64, CacheError> {
        Self::validate_write(key, data.len())?;
        self.shard(key).concat(key, data, true, now_ms())
    }

    /// Clear every shard. Not atomic across shards: writes racing the
    /// flush land before or after their own shard is cleared.
    pub fn flush_all(&self) {
        for shard in &self.shards {
            shard.flush_all();
        }
    }

    /// Sum the per-shard snapshots. Counters are read relaxed, so the
    /// aggregate may trail in-flight operations slightly.
    pub fn stats(&self) -> EngineStats {
        let mut total = EngineStats::default();
        for shard in &self.shards {
            let snap = shard.snapshot();
            total.curr_items += snap.curr_items;
            total.bytes += snap.bytes;
            total.evictions += snap.evictions;
            total.expired += snap.expired;
            total.cmd_get += snap.cmd_get;
            total.cmd_set += snap.cmd_set;
            total.get_hits += snap.get_hits;
            total.get_misses += snap.get_misses;
        }
        total
    }

    pub fn shard_count(&self) -> usize {
        self.router.shard_count()
    }

    pub fn limit_maxbytes(&self) -> u64 {
        self.limit_maxbytes
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    /// Run the periodic expiry sweep until the token is cancelled.
    ///
    /// Each tick drains every shard's expiry heap of entries whose
    /// deadline has passed.
    pub fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Expiry sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let now = now_ms();
                        let mut removed = 0;
                        for shard in &self.shards {
                            removed += shard.sweep_expired(now);
                        }
                        if removed > 0 {
                            debug!(removed, "Expiry sweep removed entries");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;

    fn cache() -> Cache {
        Cache::new(&CacheConfig {
            max_bytes: 0,
            shards: 4,
            sweep_interval: Duration::from_millis(100),
        })
    }

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn val(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_set_get_across_shards() {
        let c = cache();
        for i in 0..100 {
            let k = key(&format!("key{i:02}"));
            c.set(&k, val(&format!("value{i}")), 0, 0).unwrap();
        }
        for i in 0..100 {
            let k = key(&format!("key{i:02}"));
            assert_eq!(c.get(&k).unwrap().value, val(&format!("value{i}")));
        }
        assert_eq!(c.stats().curr_items, 100);
    }

    #[test]
    fn test_key_length_limits() {
        let c = cache();
        let max_key = Bytes::from(vec![b'k'; MAX_KEY_LEN]);
        c.set(&max_key, val("v"), 0, 0).unwrap();
        assert!(c.get(&max_key).is_ok());

        let too_long = Bytes::from(vec![b'k'; MAX_KEY_LEN + 1]);
        assert_eq!(
            c.set(&too_long, val("v"), 0, 0),
            Err(CacheError::KeyTooLarge)
        );
        assert_eq!(c.get(&too_long), Err(CacheError::KeyTooLarge));
        assert_eq!(c.get(&Bytes::new()), Err(CacheError::KeyTooLarge));
    }

    #[test]
    fn test_value_length_limits() {
        let c = cache();
        let max_val = Bytes::from(vec![b'v'; MAX_VALUE_LEN]);
        c.set(&key("k"), max_val, 0, 0).unwrap();

        let too_big = Bytes::from(vec![b'v'; MAX_VALUE_LEN + 1]);
        assert_eq!(
            c.set(&key("k"), too_big, 0, 0),
            Err(CacheError::ValueTooLarge)
        );
    }

    #[test]
    fn test_flush_all_clears_every_shard() {
        let c = cache();
        for i in 0..64 {
            c.set(&key(&format!("k{i}")), val("v"), 0, 0).unwrap();
        }
        c.flush_all();
        assert_eq!(c.stats().curr_items, 0);
        for i in 0..64 {
            assert_eq!(c.get(&key(&format!("k{i}"))), Err(CacheError::NotFound));
        }
        // Flushing an empty cache is a no-op
        c.flush_all();
        assert_eq!(c.stats().curr_items, 0);
    }

    #[test]
    fn test_stats_aggregate() {
        let c = cache();
        c.set(&key("a"), val("12345"), 0, 0).unwrap();
        c.set(&key("b"), val("xy"), 0, 0).unwrap();
        c.get(&key("a")).unwrap();
        c.get(&key("missing")).unwrap_err();

        let stats = c.stats();
        assert_eq!(stats.curr_items, 2);
        assert_eq!(stats.bytes, (1 + 5) + (1 + 2));
        assert_eq!(stats.cmd_set, 2);
        assert_eq!(stats.cmd_get, 2);
        assert_eq!(stats.get_hits, 1);
        assert_eq!(stats.get_misses, 1);
    }

    #[test]
    fn test_cas_race_every_task_wins_once() {
        let c = std::sync::Arc::new(cache());
        let counter = key("counter");
        c.set(&counter, val("0"), 0, 0).unwrap();

        const TASKS: usize = 32;
        std::thread::scope(|scope| {
            for _ in 0..TASKS {
                let c = std::sync::Arc::clone(&c);
                let counter = counter.clone();
                scope.spawn(move || {
                    loop {
                        let view = c.get(&counter).unwrap();
                        let current: u64 =
                            std::str::from_utf8(&view.value).unwrap().parse().unwrap();
                        let next = Bytes::from((current + 1).to_string());
                        match c.cas(&counter, next, 0, 0, view.cas) {
                            Ok(_) => break,
                            Err(CacheError::CasMismatch) => continue,
                            Err(e) => panic!("unexpected cas error: {e}"),
                        }
                    }
                });
            }
        });

        let final_value: u64 = std::str::from_utf8(&c.get(&counter).unwrap().value)
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(final_value, TASKS as u64);
    }

    #[test]
    fn test_last_writer_wins_per_key() {
        let c = cache();
        for i in 0..50 {
            c.set(&key("k"), val(&format!("v{i}")), 0, 0).unwrap();
        }
        assert_eq!(c.get(&key("k")).unwrap().value, val("v49"));
        assert_eq!(c.stats().curr_items, 1);
    }

    #[tokio::test]
    async fn test_sweeper_task_removes_expired() {
        let c = Arc::new(Cache::new(&CacheConfig {
            max_bytes: 0,
            shards: 2,
            sweep_interval: Duration::from_millis(10),
        }));
        // Absolute deadline one second in the past
        let past = crate::cache::entry::now_secs() - 1;
        c.set(&key("dead"), val("x"), 0, past).unwrap();
        c.set(&key("alive"), val("y"), 0, 0).unwrap();

        let cancel = CancellationToken::new();
        let handle = Arc::clone(&c).run_sweeper(cancel.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(c.stats().curr_items, 1);
        assert!(c.get(&key("alive")).is_ok());

        cancel.cancel();
        handle.await.unwrap();
    }
}
