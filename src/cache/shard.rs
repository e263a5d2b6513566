//! A single cache shard
//!
//! Each shard exclusively owns one [`ShardIndex`] plus its byte accounting
//! and CAS counter, all behind one mutex. Every operation runs start to
//! finish under that lock, which is what makes compound operations
//! (cas, incr, append) atomic without finer-grained locking. Operation
//! counters live outside the lock as relaxed atomics so stats snapshots
//! never contend with the hot path.

use crate::cache::entry::MAX_VALUE_LEN;
use crate::cache::index::ShardIndex;
use crate::error::CacheError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// A successful read: the value plus the metadata echoed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueView {
    pub value: Bytes,
    pub flags: u32,
    pub cas: u64,
}

/// Lock-free operation counters, updated only while holding the shard lock
/// but readable at any time.
#[derive(Debug, Default)]
pub struct ShardCounters {
    pub cmd_get: AtomicU64,
    pub cmd_set: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expired: AtomicU64,
}

/// Point-in-time stats for one shard
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardSnapshot {
    pub curr_items: u64,
    pub bytes: u64,
    pub evictions: u64,
    pub expired: u64,
    pub cmd_get: u64,
    pub cmd_set: u64,
    pub get_hits: u64,
    pub get_misses: u64,
}

struct ShardState {
    index: ShardIndex,
    used_bytes: usize,
    cas_counter: u64,
}

pub struct Shard {
    state: Mutex<ShardState>,
    counters: ShardCounters,
    /// Per-shard ceiling in bytes; 0 disables eviction
    max_bytes: usize,
}

impl Shard {
    pub fn new(max_bytes: usize, cas_seed: u64) -> Self {
        Self {
            state: Mutex::new(ShardState {
                index: ShardIndex::new(),
                used_bytes: 0,
                cas_counter: cas_seed,
            }),
            counters: ShardCounters::default(),
            max_bytes,
        }
    }

    fn mint(state: &mut ShardState) -> u64 {
        state.cas_counter += 1;
        state.cas_counter
    }

    /// Lazily drop a hard-expired entry, refunding its memory.
    fn expire_if_needed(&self, state: &mut ShardState, key: &Bytes, now_ms: u64) {
        let expired = matches!(state.index.get(key), Some(e) if e.is_expired_at(now_ms));
        if expired
            && let Some(e) = state.index.remove(key)
        {
            state.used_bytes -= key.len() + e.value.len();
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict from the LRU head until `needed` more bytes fit under the
    /// budget. A single entry larger than the whole budget is allowed
    /// through; it becomes the next victim.
    fn evict_for(&self, state: &mut ShardState, needed: usize) {
        if self.max_bytes == 0 {
            return;
        }
        while state.used_bytes + needed > self.max_bytes {
            let Some(victim) = state.index.eviction_victim() else {
                break;
            };
            if let Some(e) = state.index.remove(&victim) {
                state.used_bytes -= victim.len() + e.value.len();
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Shared tail of every storing write: evict, mint, upsert, account.
    fn store(
        &self,
        state: &mut ShardState,
        key: &Bytes,
        value: Bytes,
        flags: u32,
        expiry_ms: u64,
    ) -> u64 {
        let new_size = key.len() + value.len();
        let old_size = state
            .index
            .get(key)
            .map(|e| key.len() + e.value.len())
            .unwrap_or(0);
        self.evict_for(state, new_size.saturating_sub(old_size));

        // Eviction may have claimed the key itself; account from scratch.
        let cas = Self::mint(state);
        let displaced = state.index.upsert(key, value, flags, expiry_ms, cas);
        let displaced_size = displaced.map(|v| key.len() + v.len()).unwrap_or(0);
        state.used_bytes = state.used_bytes - displaced_size + new_size;
        cas
    }

    pub fn get(&self, key: &Bytes, now_ms: u64) -> Result<ValueView, CacheError> {
        self.counters.cmd_get.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();

        enum Lookup {
            Miss,
            Expired,
            Hit(ValueView),
        }
        let lookup = match state.index.get(key) {
            None => Lookup::Miss,
            Some(e) if e.is_expired_at(now_ms) => Lookup::Expired,
            Some(e) => Lookup::Hit(ValueView {
                value: e.value.clone(),
                flags: e.flags,
                cas: e.cas,
            }),
        };
        match lookup {
            Lookup::Hit(view) => {
                state.index.touch_lru(key);
                self.counters.get_hits.fetch_add(1, Ordering::Relaxed);
                Ok(view)
            }
            Lookup::Expired => {
                self.expire_if_needed(&mut state, key, now_ms);
                self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::NotFound)
            }
            Lookup::Miss => {
                self.counters.get_misses.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::NotFound)
            }
        }
    }

    pub fn set(
        &self,
        key: &Bytes,
        value: Bytes,
        flags: u32,
        expiry_ms: u64,
        now_ms: u64,
    ) -> Result<u64, CacheError> {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.expire_if_needed(&mut state, key, now_ms);
        Ok(self.store(&mut state, key, value, flags, expiry_ms))
    }

    pub fn add(
        &self,
        key: &Bytes,
        value: Bytes,
        flags: u32,
        expiry_ms: u64,
        now_ms: u64,
    ) -> Result<u64, CacheError> {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.expire_if_needed(&mut state, key, now_ms);
        if state.index.get(key).is_some() {
            return Err(CacheError::Exists);
        }
        Ok(self.store(&mut state, key, value, flags, expiry_ms))
    }

    pub fn replace(
        &self,
        key: &Bytes,
        value: Bytes,
        flags: u32,
        expiry_ms: u64,
        now_ms: u64,
    ) -> Result<u64, CacheError> {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.expire_if_needed(&mut state, key, now_ms);
        if state.index.get(key).is_none() {
            return Err(CacheError::NotFound);
        }
        Ok(self.store(&mut state, key, value, flags, expiry_ms))
    }

    pub fn cas(
        &self,
        key: &Bytes,
        value: Bytes,
        flags: u32,
        expiry_ms: u64,
        expected: u64,
        now_ms: u64,
    ) -> Result<u64, CacheError> {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.expire_if_needed(&mut state, key, now_ms);
        match state.index.get(key).map(|e| e.cas) {
            None => Err(CacheError::NotFound),
            Some(cas) if cas != expected => Err(CacheError::CasMismatch),
            Some(_) => Ok(self.store(&mut state, key, value, flags, expiry_ms)),
        }
    }

    pub fn delete(&self, key: &Bytes, now_ms: u64) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        self.expire_if_needed(&mut state, key, now_ms);
        match state.index.remove(key) {
            Some(e) => {
                state.used_bytes -= key.len() + e.value.len();
                Ok(())
            }
            None => Err(CacheError::NotFound),
        }
    }

    pub fn touch(&self, key: &Bytes, expiry_ms: u64, now_ms: u64) -> Result<u64, CacheError> {
        let mut state = self.state.lock();
        self.expire_if_needed(&mut state, key, now_ms);
        if state.index.get(key).is_none() {
            return Err(CacheError::NotFound);
        }
        let cas = Self::mint(&mut state);
        state.index.touch(key, expiry_ms, cas);
        Ok(cas)
    }

    /// Increment or decrement a decimal value. Increment saturates at
    /// `u64::MAX`; decrement floors at 0. Expiry and flags are preserved.
    pub fn incr_decr(
        &self,
        key: &Bytes,
        delta: u64,
        increment: bool,
        now_ms: u64,
    ) -> Result<(u64, u64), CacheError> {
        let mut state = self.state.lock();
        self.expire_if_needed(&mut state, key, now_ms);

        let (current, flags, expiry_ms, old_len) = match state.index.get(key) {
            None => return Err(CacheError::NotFound),
            Some(e) => {
                let text =
                    std::str::from_utf8(&e.value).map_err(|_| CacheError::NotNumeric)?;
                let current: u64 = text.parse().map_err(|_| CacheError::NotNumeric)?;
                (current, e.flags, e.expiry_ms, e.value.len())
            }
        };

        let new = if increment {
            current.saturating_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        let mut buf = itoa::Buffer::new();
        let rendered = Bytes::copy_from_slice(buf.format(new).as_bytes());

        self.evict_for(&mut state, rendered.len().saturating_sub(old_len));
        if state.index.get(key).is_none() {
            return Err(CacheError::NotFound);
        }
        let cas = self.store(&mut state, key, rendered, flags, expiry_ms);
        Ok((new, cas))
    }

    /// Concatenate onto an existing value. Expiry and flags are preserved.
    pub fn concat(
        &self,
        key: &Bytes,
        data: &[u8],
        prepend: bool,
        now_ms: u64,
    ) -> Result<u64, CacheError> {
        self.counters.cmd_set.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.expire_if_needed(&mut state, key, now_ms);

        let (old_value, flags, expiry_ms) = match state.index.get(key) {
            None => return Err(CacheError::NotFound),
            Some(e) => (e.value.clone(), e.flags, e.expiry_ms),
        };
        if old_value.len() + data.len() > MAX_VALUE_LEN {
            return Err(CacheError::ValueTooLarge);
        }

        self.evict_for(&mut state, data.len());
        if state.index.get(key).is_none() {
            return Err(CacheError::NotFound);
        }

        let mut joined = Vec::with_capacity(old_value.len() + data.len());
        if prepend {
            joined.extend_from_slice(data);
            joined.extend_from_slice(&old_value);
        } else {
            joined.extend_from_slice(&old_value);
            joined.extend_from_slice(data);
        }
        let cas = self.store(&mut state, key, Bytes::from(joined), flags, expiry_ms);
        Ok(cas)
    }

    pub fn flush_all(&self) {
        let mut state = self.state.lock();
        state.index.clear();
        state.used_bytes = 0;
    }

    /// Drain expired heap roots; called by the background sweeper.
    pub fn sweep_expired(&self, now_ms: u64) -> u64 {
        let mut state = self.state.lock();
        let (freed, removed) = state.index.sweep_expired(now_ms);
        state.used_bytes -= freed;
        self.counters.expired.fetch_add(removed, Ordering::Relaxed);
        removed
    }

    pub fn snapshot(&self) -> ShardSnapshot {
        let (curr_items, bytes) = {
            let state = self.state.lock();
            (state.index.len() as u64, state.used_bytes as u64)
        };
        ShardSnapshot {
            curr_items,
            bytes,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            cmd_get: self.counters.cmd_get.load(Ordering::Relaxed),
            cmd_set: self.counters.cmd_set.load(Ordering::Relaxed),
            get_hits: self.counters.get_hits.load(Ordering::Relaxed),
            get_misses: self.counters.get_misses.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    #[cfg(test)]
    pub(crate) fn entry(&self, key: &Bytes) -> Option<crate::cache::entry::Entry> {
        self.state.lock().index.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> Shard {
        Shard::new(0, 1000)
    }

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn val(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_set_get_roundtrip() {
        let s = shard();
        let cas = s.set(&key("k"), val("value1"), 7, 0, 0).unwrap();
        assert!(cas > 1000);

        let view = s.get(&key("k"), 0).unwrap();
        assert_eq!(view.value, val("value1"));
        assert_eq!(view.flags, 7);
        assert_eq!(view.cas, cas);
    }

    #[test]
    fn test_cas_strictly_increases() {
        let s = shard();
        let mut last = 0;
        for i in 0..20 {
            let cas = s
                .set(&key("k"), val(&format!("v{i}")), 0, 0, 0)
                .unwrap();
            assert!(cas > last, "cas must strictly increase");
            last = cas;
        }
        let cas = s.touch(&key("k"), 0, 0).unwrap();
        assert!(cas > last);
    }

    #[test]
    fn test_add_only_when_absent() {
        let s = shard();
        s.add(&key("k"), val("first"), 0, 0, 0).unwrap();
        assert_eq!(
            s.add(&key("k"), val("second"), 0, 0, 0),
            Err(CacheError::Exists)
        );
        assert_eq!(s.get(&key("k"), 0).unwrap().value, val("first"));
    }

    #[test]
    fn test_add_succeeds_on_expired_key() {
        let s = shard();
        s.set(&key("k"), val("old"), 0, 100, 0).unwrap();
        // Hard-expired at t=100; add treats it as absent
        let cas = s.add(&key("k"), val("new"), 0, 0, 100).unwrap();
        assert!(cas > 0);
        assert_eq!(s.get(&key("k"), 100).unwrap().value, val("new"));
    }

    #[test]
    fn test_replace_requires_presence() {
        let s = shard();
        assert_eq!(
            s.replace(&key("k"), val("v"), 0, 0, 0),
            Err(CacheError::NotFound)
        );
        s.set(&key("k"), val("original"), 0, 0, 0).unwrap();
        s.replace(&key("k"), val("replaced"), 0, 0, 0).unwrap();
        assert_eq!(s.get(&key("k"), 0).unwrap().value, val("replaced"));
    }

    #[test]
    fn test_cas_mismatch_leaves_value() {
        let s = shard();
        let cas = s.set(&key("k"), val("original"), 0, 0, 0).unwrap();

        assert_eq!(
            s.cas(&key("k"), val("wrong"), 0, 0, cas + 1, 0),
            Err(CacheError::CasMismatch)
        );
        assert_eq!(s.get(&key("k"), 0).unwrap().value, val("original"));

        let new_cas = s.cas(&key("k"), val("updated"), 0, 0, cas, 0).unwrap();
        assert!(new_cas > cas);
        assert_eq!(s.get(&key("k"), 0).unwrap().value, val("updated"));
    }

    #[test]
    fn test_cas_missing_key() {
        let s = shard();
        assert_eq!(
            s.cas(&key("k"), val("v"), 0, 0, 42, 0),
            Err(CacheError::NotFound)
        );
    }

    #[test]
    fn test_delete_idempotent() {
        let s = shard();
        assert_eq!(s.delete(&key("k"), 0), Err(CacheError::NotFound));
        s.set(&key("k"), val("v"), 0, 0, 0).unwrap();
        s.delete(&key("k"), 0).unwrap();
        assert_eq!(s.delete(&key("k"), 0), Err(CacheError::NotFound));
        assert_eq!(s.used_bytes(), 0);
    }

    #[test]
    fn test_incr_decr() {
        let s = shard();
        assert_eq!(
            s.incr_decr(&key("n"), 1, true, 0),
            Err(CacheError::NotFound)
        );

        s.set(&key("n"), val("10"), 0, 0, 0).unwrap();
        let (new, cas) = s.incr_decr(&key("n"), 5, true, 0).unwrap();
        assert_eq!(new, 15);
        assert!(cas > 0);

        let (new, _) = s.incr_decr(&key("n"), 3, false, 0).unwrap();
        assert_eq!(new, 12);

        // Decrement floors at zero
        let (new, _) = s.incr_decr(&key("n"), 100, false, 0).unwrap();
        assert_eq!(new, 0);
        assert_eq!(s.get(&key("n"), 0).unwrap().value, val("0"));
    }

    #[test]
    fn test_incr_saturates() {
        let s = shard();
        s.set(&key("n"), val(&u64::MAX.to_string()), 0, 0, 0).unwrap();
        let (new, _) = s.incr_decr(&key("n"), 10, true, 0).unwrap();
        assert_eq!(new, u64::MAX);
    }

    #[test]
    fn test_incr_non_numeric() {
        let s = shard();
        s.set(&key("k"), val("abc"), 0, 0, 0).unwrap();
        assert_eq!(
            s.incr_decr(&key("k"), 1, true, 0),
            Err(CacheError::NotNumeric)
        );
    }

    #[test]
    fn test_incr_preserves_expiry() {
        let s = shard();
        s.set(&key("n"), val("1"), 0, 5_000, 0).unwrap();
        s.incr_decr(&key("n"), 1, true, 0).unwrap();
        assert_eq!(s.entry(&key("n")).unwrap().expiry_ms, 5_000);
    }

    #[test]
    fn test_append_prepend() {
        let s = shard();
        assert_eq!(
            s.concat(&key("k"), b"x", false, 0),
            Err(CacheError::NotFound)
        );

        s.set(&key("k"), val("hello"), 3, 0, 0).unwrap();
        s.concat(&key("k"), b" world", false, 0).unwrap();
        assert_eq!(s.get(&key("k"), 0).unwrap().value, val("hello world"));

        s.concat(&key("k"), b">> ", true, 0).unwrap();
        let view = s.get(&key("k"), 0).unwrap();
        assert_eq!(view.value, val(">> hello world"));
        assert_eq!(view.flags, 3, "append/prepend keep flags");
    }

    #[test]
    fn test_concat_over_value_limit() {
        let s = shard();
        s.set(&key("k"), Bytes::from(vec![b'a'; MAX_VALUE_LEN - 1]), 0, 0, 0)
            .unwrap();
        assert_eq!(s.concat(&key("k"), b"x", false, 0).map(|_| ()), Ok(()));
        assert_eq!(
            s.concat(&key("k"), b"x", false, 0),
            Err(CacheError::ValueTooLarge)
        );
    }

    #[test]
    fn test_lazy_expiry_refunds_memory() {
        let s = shard();
        s.set(&key("k"), val("value"), 0, 100, 0).unwrap();
        assert_eq!(s.used_bytes(), 1 + 5);

        assert_eq!(s.get(&key("k"), 99).map(|v| v.value), Ok(val("value")));
        assert_eq!(s.get(&key("k"), 100), Err(CacheError::NotFound));
        assert_eq!(s.used_bytes(), 0);
        assert_eq!(s.snapshot().curr_items, 0);
    }

    #[test]
    fn test_sweep_removes_due_entries() {
        let s = shard();
        s.set(&key("a"), val("1"), 0, 100, 0).unwrap();
        s.set(&key("b"), val("2"), 0, 200, 0).unwrap();
        s.set(&key("c"), val("3"), 0, 0, 0).unwrap();

        assert_eq!(s.sweep_expired(150), 1);
        assert_eq!(s.snapshot().curr_items, 2);
        assert_eq!(s.used_bytes(), 2 * (1 + 1));

        assert_eq!(s.sweep_expired(1_000), 1);
        assert_eq!(s.snapshot().curr_items, 1);
    }

    #[test]
    fn test_eviction_under_budget() {
        // Budget fits roughly 4 of these 10-byte entries
        let s = Shard::new(40, 0);
        for i in 0..10 {
            // key "k0".."k9" (2 bytes) + 8-byte value = 10 bytes each
            s.set(&key(&format!("k{i}")), val("01234567"), 0, 0, 0)
                .unwrap();
        }
        let snap = s.snapshot();
        assert!(snap.evictions >= 6);
        assert!(s.used_bytes() <= 40);
        // The most recently set key survived, the oldest did not
        assert!(s.get(&key("k9"), 0).is_ok());
        assert_eq!(s.get(&key("k0"), 0), Err(CacheError::NotFound));
    }

    #[test]
    fn test_get_protects_from_eviction() {
        let s = Shard::new(40, 0);
        for i in 0..4 {
            s.set(&key(&format!("k{i}")), val("01234567"), 0, 0, 0)
                .unwrap();
        }
        // Touch the oldest so it moves off the LRU head
        s.get(&key("k0"), 0).unwrap();
        s.set(&key("k4"), val("01234567"), 0, 0, 0).unwrap();

        assert!(s.get(&key("k0"), 0).is_ok());
        assert_eq!(s.get(&key("k1"), 0), Err(CacheError::NotFound));
    }

    #[test]
    fn test_oversize_entry_is_stored_then_evicted() {
        let s = Shard::new(10, 0);
        // 2 + 16 bytes exceeds the whole budget; the write still proceeds
        s.set(&key("big"), val("0123456789abcdef"), 0, 0, 0).unwrap();
        assert!(s.used_bytes() > 10);
        assert!(s.get(&key("big"), 0).is_ok());

        // The next write evicts it immediately
        s.set(&key("x"), val("y"), 0, 0, 0).unwrap();
        assert_eq!(s.get(&key("big"), 0), Err(CacheError::NotFound));
        assert!(s.used_bytes() <= 10);
    }

    #[test]
    fn test_used_bytes_tracks_every_operation() {
        let s = shard();
        let expected = |s: &Shard| {
            // Recompute from observable state
            s.snapshot().bytes as usize
        };

        s.set(&key("a"), val("12345"), 0, 0, 0).unwrap();
        assert_eq!(s.used_bytes(), 1 + 5);
        s.set(&key("a"), val("123"), 0, 0, 0).unwrap();
        assert_eq!(s.used_bytes(), 1 + 3);
        s.concat(&key("a"), b"6789", false, 0).unwrap();
        assert_eq!(s.used_bytes(), 1 + 7);
        s.incr_decr(&key("a"), 0, true, 0).unwrap();
        assert_eq!(s.used_bytes(), 1 + 7);
        s.delete(&key("a"), 0).unwrap();
        assert_eq!(s.used_bytes(), 0);
        assert_eq!(s.used_bytes(), expected(&s));
    }

    #[test]
    fn test_flush_all_resets() {
        let s = shard();
        s.set(&key("a"), val("1"), 0, 0, 0).unwrap();
        s.set(&key("b"), val("2"), 0, 1_000_000, 0).unwrap();
        s.flush_all();
        assert_eq!(s.snapshot().curr_items, 0);
        assert_eq!(s.used_bytes(), 0);
        assert_eq!(s.get(&key("a"), 0), Err(CacheError::NotFound));

        // Idempotent
        s.flush_all();
        assert_eq!(s.snapshot().curr_items, 0);
    }

    #[test]
    fn test_counters() {
        let s = shard();
        s.set(&key("k"), val("v"), 0, 0, 0).unwrap();
        s.get(&key("k"), 0).unwrap();
        s.get(&key("missing"), 0).unwrap_err();

        let snap = s.snapshot();
        assert_eq!(snap.cmd_set, 1);
        assert_eq!(snap.cmd_get, 2);
        assert_eq!(snap.get_hits, 1);
        assert_eq!(snap.get_misses, 1);
    }

    #[test]
    fn test_binary_safe_keys_and_values() {
        let s = shard();
        let k = Bytes::from_static(b"\x00\x01\xff");
        let v = Bytes::from_static(b"\x00\xfe\x00\x00\x7f");
        s.set(&k, v.clone(), 0, 0, 0).unwrap();
        assert_eq!(s.get(&k, 0).unwrap().value, v);
        // A different binary key does not alias
        assert_eq!(
            s.get(&Bytes::from_static(b"\x00\x01"), 0),
            Err(CacheError::NotFound)
        );
    }
}
