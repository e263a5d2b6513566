//! Per-shard index structures
//!
//! Three structures kept mutually consistent under the shard's lock:
//!
//! - `entries`: the primary key -> [`Entry`] map
//! - `lru`: an arena-backed doubly linked list ordered from least- to
//!   most-recently-used; entries hold a [`NodeRef`] into it for O(1)
//!   unlink and move-to-back
//! - `expiry`: a binary min-heap on the absolute expiry deadline with a
//!   key -> heap-position side map for O(log n) update and removal
//!
//! Invariant: every key in `entries` has exactly one LRU node, and exactly
//! one heap slot iff its `expiry_ms != 0`.

use crate::cache::entry::Entry;
use bytes::Bytes;
use std::collections::HashMap;

/// Handle to a node in the LRU arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeRef(u32);

impl NodeRef {
    pub(crate) const NIL: NodeRef = NodeRef(u32::MAX);

    #[inline]
    fn is_nil(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Node {
    key: Bytes,
    prev: NodeRef,
    next: NodeRef,
}

/// Intrusive LRU list over an arena of nodes.
///
/// Freed slots are recycled through a free list, so handles stay compact
/// and no per-node allocation happens after warm-up.
#[derive(Debug)]
struct LruList {
    nodes: Vec<Node>,
    free: Vec<u32>,
    head: NodeRef,
    tail: NodeRef,
}

impl LruList {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NodeRef::NIL,
            tail: NodeRef::NIL,
        }
    }

    fn push_back(&mut self, key: Bytes) -> NodeRef {
        let node = Node {
            key,
            prev: self.tail,
            next: NodeRef::NIL,
        };
        let r = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = node;
                NodeRef(slot)
            }
            None => {
                self.nodes.push(node);
                NodeRef((self.nodes.len() - 1) as u32)
            }
        };
        if self.tail.is_nil() {
            self.head = r;
        } else {
            self.nodes[self.tail.idx()].next = r;
        }
        self.tail = r;
        r
    }

    fn detach(&mut self, r: NodeRef) {
        let (prev, next) = {
            let n = &self.nodes[r.idx()];
            (n.prev, n.next)
        };
        if prev.is_nil() {
            self.head = next;
        } else {
            self.nodes[prev.idx()].next = next;
        }
        if next.is_nil() {
            self.tail = prev;
        } else {
            self.nodes[next.idx()].prev = prev;
        }
    }

    fn unlink(&mut self, r: NodeRef) {
        self.detach(r);
        self.nodes[r.idx()].key = Bytes::new();
        self.free.push(r.0);
    }

    fn move_to_back(&mut self, r: NodeRef) {
        if self.tail == r {
            return;
        }
        self.detach(r);
        let tail = self.tail;
        {
            let n = &mut self.nodes[r.idx()];
            n.prev = tail;
            n.next = NodeRef::NIL;
        }
        if tail.is_nil() {
            self.head = r;
        } else {
            self.nodes[tail.idx()].next = r;
        }
        self.tail = r;
    }

    /// Key of the least recently used entry (the eviction victim)
    fn front_key(&self) -> Option<&Bytes> {
        if self.head.is_nil() {
            None
        } else {
            Some(&self.nodes[self.head.idx()].key)
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = NodeRef::NIL;
        self.tail = NodeRef::NIL;
    }
}

#[derive(Debug)]
struct HeapSlot {
    expiry_ms: u64,
    key: Bytes,
}

/// Min-heap on expiry deadline with a key -> position side map.
#[derive(Debug)]
struct ExpiryHeap {
    slots: Vec<HeapSlot>,
    pos: HashMap<Bytes, usize>,
}

impl ExpiryHeap {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            pos: HashMap::new(),
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.slots.swap(i, j);
        self.pos.insert(self.slots[i].key.clone(), i);
        self.pos.insert(self.slots[j].key.clone(), j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.slots[i].expiry_ms >= self.slots[parent].expiry_ms {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < self.slots.len()
                && self.slots[left].expiry_ms < self.slots[smallest].expiry_ms
            {
                smallest = left;
            }
            if right < self.slots.len()
                && self.slots[right].expiry_ms < self.slots[smallest].expiry_ms
            {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    /// Insert a key or update its deadline in place
    fn insert(&mut self, key: &Bytes, expiry_ms: u64) {
        if let Some(&i) = self.pos.get(key) {
            self.slots[i].expiry_ms = expiry_ms;
            self.sift_up(i);
            self.sift_down(i);
        } else {
            self.slots.push(HeapSlot {
                expiry_ms,
                key: key.clone(),
            });
            let i = self.slots.len() - 1;
            self.pos.insert(key.clone(), i);
            self.sift_up(i);
        }
    }

    fn remove(&mut self, key: &Bytes) {
        let Some(i) = self.pos.remove(key) else {
            return;
        };
        self.slots.swap_remove(i);
        if i < self.slots.len() {
            self.pos.insert(self.slots[i].key.clone(), i);
            self.sift_down(i);
            self.sift_up(i);
        }
    }

    fn peek(&self) -> Option<(&Bytes, u64)> {
        self.slots.first().map(|s| (&s.key, s.expiry_ms))
    }

    fn pop(&mut self) -> Option<(Bytes, u64)> {
        if self.slots.is_empty() {
            return None;
        }
        let root = self.slots.swap_remove(0);
        self.pos.remove(&root.key);
        if !self.slots.is_empty() {
            self.pos.insert(self.slots[0].key.clone(), 0);
            self.sift_down(0);
        }
        Some((root.key, root.expiry_ms))
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.pos.clear();
    }
}

/// The full per-shard index
#[derive(Debug)]
pub struct ShardIndex {
    entries: HashMap<Bytes, Entry>,
    lru: LruList,
    expiry: ExpiryHeap,
}

impl ShardIndex {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruList::new(),
            expiry: ExpiryHeap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &Bytes) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Insert or overwrite an entry, keeping LRU and heap in sync.
    ///
    /// Returns the displaced value on overwrite so the caller can adjust
    /// its byte accounting.
    pub fn upsert(
        &mut self,
        key: &Bytes,
        value: Bytes,
        flags: u32,
        expiry_ms: u64,
        cas: u64,
    ) -> Option<Bytes> {
        let Self {
            entries,
            lru,
            expiry,
        } = self;
        match entries.get_mut(key) {
            Some(e) => {
                let old_value = std::mem::replace(&mut e.value, value);
                let old_expiry = e.expiry_ms;
                e.flags = flags;
                e.expiry_ms = expiry_ms;
                e.cas = cas;
                lru.move_to_back(e.lru);
                if expiry_ms != 0 {
                    expiry.insert(key, expiry_ms);
                } else if old_expiry != 0 {
                    expiry.remove(key);
                }
                Some(old_value)
            }
            None => {
                let node = lru.push_back(key.clone());
                entries.insert(
                    key.clone(),
                    Entry {
                        value,
                        flags,
                        expiry_ms,
                        cas,
                        lru: node,
                    },
                );
                if expiry_ms != 0 {
                    expiry.insert(key, expiry_ms);
                }
                None
            }
        }
    }

    /// Remove an entry, unlinking it from the LRU and the heap
    pub fn remove(&mut self, key: &Bytes) -> Option<Entry> {
        let e = self.entries.remove(key)?;
        self.lru.unlink(e.lru);
        if e.expiry_ms != 0 {
            self.expiry.remove(key);
        }
        Some(e)
    }

    /// Update expiry and cas of an existing entry (Touch), with LRU touch
    pub fn touch(&mut self, key: &Bytes, expiry_ms: u64, cas: u64) -> bool {
        let Self {
            entries,
            lru,
            expiry,
        } = self;
        let Some(e) = entries.get_mut(key) else {
            return false;
        };
        let old_expiry = e.expiry_ms;
        e.expiry_ms = expiry_ms;
        e.cas = cas;
        lru.move_to_back(e.lru);
        if expiry_ms != 0 {
            expiry.insert(key, expiry_ms);
        } else if old_expiry != 0 {
            expiry.remove(key);
        }
        true
    }

    /// Move an entry to the most-recently-used end (Get path)
    pub fn touch_lru(&mut self, key: &Bytes) {
        if let Some(e) = self.entries.get(key) {
            self.lru.move_to_back(e.lru);
        }
    }

    /// Key of the current eviction victim
    pub fn eviction_victim(&self) -> Option<Bytes> {
        self.lru.front_key().cloned()
    }

    /// Drain every heap root whose deadline has passed, removing the
    /// matching entries. Returns `(freed_bytes, removed_count)`.
    ///
    /// An entry is only removed when its live deadline still equals the
    /// popped one; otherwise the heap slot was stale and the live deadline
    /// is reinstated.
    pub fn sweep_expired(&mut self, now_ms: u64) -> (usize, u64) {
        let mut freed = 0usize;
        let mut removed = 0u64;
        loop {
            match self.expiry.peek() {
                Some((_, deadline)) if deadline <= now_ms => {}
                _ => break,
            }
            let Some((key, deadline)) = self.expiry.pop() else {
                break;
            };
            match self.entries.get(&key).map(|e| e.expiry_ms) {
                Some(live) if live == deadline => {
                    if let Some(e) = self.entries.remove(&key) {
                        self.lru.unlink(e.lru);
                        freed += key.len() + e.value.len();
                        removed += 1;
                    }
                }
                Some(live) if live != 0 => {
                    // Stale slot; reinstate the live deadline
                    self.expiry.insert(&key, live);
                }
                _ => {}
            }
        }
        (freed, removed)
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
        self.expiry.clear();
    }

    #[cfg(test)]
    pub(crate) fn heap_len(&self) -> usize {
        self.expiry.slots.len()
    }
}
