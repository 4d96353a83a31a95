//! Fixed-capacity LRU cache used as a shard's storage engine.
//!
//! Entries live in an arena and are threaded through two intrusive lists by
//! index: a per-bucket chain for lookup and a recency list for eviction.
//! Promotion to most-recently-used and eviction from the tail are both O(1)
//! relinks; only the bucket walk on lookup depends on chain length.
//!
//! The cache is not synchronised. Shards wrap it in a mutex.

use thiserror::Error;

use crate::hashing::djb2;

const NIL: usize = usize::MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache capacity must be at least 1")]
    ZeroCapacity,
    #[error("key of {len} bytes exceeds the {max} byte limit")]
    KeyTooLong { len: usize, max: usize },
}

/// An entry pushed out of the cache to make room for a new key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub key: String,
    pub value: i32,
}

#[derive(Debug)]
struct Entry {
    key: String,
    value: i32,
    bucket: usize,
    bucket_prev: usize,
    bucket_next: usize,
    lru_prev: usize,
    lru_next: usize,
}

#[derive(Debug)]
pub struct LruCache {
    entries: Vec<Entry>,
    free: Vec<usize>,
    buckets: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
    capacity: usize,
    max_key_len: Option<usize>,
}

impl LruCache {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::ZeroCapacity);
        }
        Ok(Self {
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
            buckets: vec![NIL; capacity],
            head: NIL,
            tail: NIL,
            len: 0,
            capacity,
            max_key_len: None,
        })
    }

    /// Rejects keys longer than `max` bytes on `put`.
    pub fn with_max_key_len(mut self, max: usize) -> Self {
        self.max_key_len = Some(max);
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Membership test that leaves recency untouched.
    pub fn contains(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// Returns the cached value and marks the key most recently used.
    pub fn get(&mut self, key: &str) -> Option<i32> {
        let idx = self.find(key)?;
        self.promote(idx);
        Some(self.entries[idx].value)
    }

    /// Inserts or updates `key`.
    ///
    /// Updating an existing key never evicts. Inserting a new key into a full
    /// cache evicts the least recently used entry first and hands it back.
    pub fn put(&mut self, key: &str, value: i32) -> Result<Option<Evicted>, CacheError> {
        if let Some(max) = self.max_key_len {
            if key.len() > max {
                return Err(CacheError::KeyTooLong {
                    len: key.len(),
                    max,
                });
            }
        }

        if let Some(idx) = self.find(key) {
            self.entries[idx].value = value;
            self.promote(idx);
            return Ok(None);
        }

        let evicted = if self.len == self.capacity {
            Some(self.evict_tail())
        } else {
            None
        };

        let bucket = self.bucket_of(key);
        let entry = Entry {
            key: key.to_owned(),
            value,
            bucket,
            bucket_prev: NIL,
            bucket_next: NIL,
            lru_prev: NIL,
            lru_next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.entries[idx] = entry;
                idx
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        self.link_bucket_tail(idx);
        self.link_head(idx);
        self.len += 1;
        Ok(evicted)
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while cur != NIL {
            keys.push(self.entries[cur].key.clone());
            cur = self.entries[cur].lru_next;
        }
        keys
    }

    fn bucket_of(&self, key: &str) -> usize {
        (djb2(key) % self.capacity as u64) as usize
    }

    fn find(&self, key: &str) -> Option<usize> {
        let mut cur = self.buckets[self.bucket_of(key)];
        while cur != NIL {
            if self.entries[cur].key == key {
                return Some(cur);
            }
            cur = self.entries[cur].bucket_next;
        }
        None
    }

    fn promote(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink_lru(idx);
        self.link_head(idx);
    }

    fn evict_tail(&mut self) -> Evicted {
        let idx = self.tail;
        self.unlink_lru(idx);
        self.unlink_bucket(idx);
        self.len -= 1;
        self.free.push(idx);
        let entry = &mut self.entries[idx];
        Evicted {
            key: std::mem::take(&mut entry.key),
            value: entry.value,
        }
    }

    fn link_head(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let entry = &mut self.entries[idx];
            entry.lru_prev = NIL;
            entry.lru_next = old_head;
        }
        if old_head != NIL {
            self.entries[old_head].lru_prev = idx;
        } else {
            self.tail = idx;
        }
        self.head = idx;
    }

    fn unlink_lru(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = &self.entries[idx];
            (entry.lru_prev, entry.lru_next)
        };
        if prev != NIL {
            self.entries[prev].lru_next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.entries[next].lru_prev = prev;
        } else {
            self.tail = prev;
        }
        let entry = &mut self.entries[idx];
        entry.lru_prev = NIL;
        entry.lru_next = NIL;
    }

    fn link_bucket_tail(&mut self, idx: usize) {
        let bucket = self.entries[idx].bucket;
        let mut cur = self.buckets[bucket];
        if cur == NIL {
            self.buckets[bucket] = idx;
            return;
        }
        while self.entries[cur].bucket_next != NIL {
            cur = self.entries[cur].bucket_next;
        }
        self.entries[cur].bucket_next = idx;
        self.entries[idx].bucket_prev = cur;
    }

    fn unlink_bucket(&mut self, idx: usize) {
        let (bucket, prev, next) = {
            let entry = &self.entries[idx];
            (entry.bucket, entry.bucket_prev, entry.bucket_next)
        };
        if prev != NIL {
            self.entries[prev].bucket_next = next;
        } else {
            self.buckets[bucket] = next;
        }
        if next != NIL {
            self.entries[next].bucket_prev = prev;
        }
        let entry = &mut self.entries[idx];
        entry.bucket_prev = NIL;
        entry.bucket_next = NIL;
    }

    /// Walks both link structures and panics on any broken invariant.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        use std::collections::HashSet;

        let mut in_buckets = HashSet::new();
        for (bucket, &first) in self.buckets.iter().enumerate() {
            let mut prev = NIL;
            let mut cur = first;
            while cur != NIL {
                let entry = &self.entries[cur];
                assert_eq!(entry.bucket, bucket, "entry chained in the wrong bucket");
                assert_eq!(entry.bucket_prev, prev, "bucket back-link broken");
                assert!(in_buckets.insert(cur), "entry chained twice");
                prev = cur;
                cur = entry.bucket_next;
            }
        }

        let mut in_lru = HashSet::new();
        let mut prev = NIL;
        let mut cur = self.head;
        while cur != NIL {
            let entry = &self.entries[cur];
            assert_eq!(entry.lru_prev, prev, "recency back-link broken");
            assert!(in_lru.insert(cur), "entry listed twice in recency list");
            prev = cur;
            cur = entry.lru_next;
        }
        assert_eq!(self.tail, prev, "tail does not end the recency list");

        assert_eq!(in_buckets, in_lru, "bucket chains and recency list disagree");
        assert_eq!(in_lru.len(), self.len, "len does not match live entries");
        assert!(self.len <= self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::thread;

    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(3).unwrap();
        for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
            assert_eq!(cache.put(key, value).unwrap(), None);
        }

        let evicted = cache.put("d", 4).unwrap();
        assert_eq!(
            evicted,
            Some(Evicted {
                key: "a".into(),
                value: 1
            })
        );
        assert_eq!(cache.keys_by_recency(), vec!["d", "c", "b"]);
        assert_eq!(cache.get("a"), None);
        cache.assert_consistent();
    }

    #[test]
    fn get_protects_an_entry_from_eviction() {
        let mut cache = LruCache::new(3).unwrap();
        cache.put("a", 1).unwrap();
        cache.put("b", 2).unwrap();
        cache.put("c", 3).unwrap();

        assert_eq!(cache.get("a"), Some(1));
        let evicted = cache.put("d", 4).unwrap().unwrap();

        assert_eq!(evicted.key, "b");
        assert_eq!(cache.keys_by_recency(), vec!["d", "a", "c"]);
        cache.assert_consistent();
    }

    #[test]
    fn update_moves_to_front_without_evicting() {
        let mut cache = LruCache::new(2).unwrap();
        cache.put("a", 1).unwrap();
        cache.put("b", 2).unwrap();

        assert_eq!(cache.put("a", 10).unwrap(), None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.keys_by_recency(), vec!["a", "b"]);
        assert_eq!(cache.get("a"), Some(10));
        cache.assert_consistent();
    }

    #[test]
    fn capacity_one_replaces_its_only_entry() {
        let mut cache = LruCache::new(1).unwrap();
        cache.put("a", 1).unwrap();
        let evicted = cache.put("b", 2).unwrap().unwrap();
        assert_eq!(evicted.key, "a");
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.len(), 1);
        cache.assert_consistent();
    }

    #[test]
    fn colliding_keys_share_a_bucket_chain() {
        // capacity 1 forces every key into bucket 0
        let mut cache = LruCache::new(1).unwrap();
        cache.put("x", 1).unwrap();
        cache.put("x", 2).unwrap();
        assert_eq!(cache.get("x"), Some(2));

        let mut cache = LruCache::new(4).unwrap();
        let keys: Vec<String> = (0..64).map(|i| format!("k{i}")).collect();
        for (i, key) in keys.iter().enumerate() {
            cache.put(key, i as i32).unwrap();
            cache.assert_consistent();
        }
        assert_eq!(cache.len(), 4);
        for key in &keys[60..] {
            assert!(cache.contains(key));
        }
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(LruCache::new(0).unwrap_err(), CacheError::ZeroCapacity);
    }

    #[test]
    fn oversized_keys_leave_the_cache_untouched() {
        let mut cache = LruCache::new(2).unwrap().with_max_key_len(4);
        cache.put("abcd", 1).unwrap();
        assert_eq!(
            cache.put("abcde", 2),
            Err(CacheError::KeyTooLong { len: 5, max: 4 })
        );
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains("abcde"));
    }

    #[test]
    fn contains_does_not_promote() {
        let mut cache = LruCache::new(2).unwrap();
        cache.put("a", 1).unwrap();
        cache.put("b", 2).unwrap();
        assert!(cache.contains("a"));
        assert_eq!(cache.put("c", 3).unwrap().unwrap().key, "a");
    }

    #[test]
    fn concurrent_writers_on_disjoint_keys_keep_structure_intact() {
        let cache = Arc::new(Mutex::new(LruCache::new(64).unwrap()));
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("w{worker}-{}", i % 40);
                        cache.lock().put(&key, i).unwrap();
                        let _ = cache.lock().get(&format!("w{worker}-{}", i % 7));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let cache = cache.lock();
        cache.assert_consistent();
        assert_eq!(cache.len(), 64);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, i32),
        Get(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..12, any::<i32>()).prop_map(|(k, v)| Op::Put(k, v)),
            (0u8..12).prop_map(Op::Get),
        ]
    }

    proptest! {
        /// The cache agrees with a naive recency-ordered model on every step.
        #[test]
        fn prop_matches_reference_model(
            capacity in 1usize..6,
            ops in prop::collection::vec(op_strategy(), 0..200),
        ) {
            let mut cache = LruCache::new(capacity).unwrap();
            // front = most recently used
            let mut model: VecDeque<(String, i32)> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Put(k, v) => {
                        let key = format!("key-{k}");
                        let evicted = cache.put(&key, v).unwrap();
                        let existing = model.iter().position(|(mk, _)| *mk == key);
                        let expected = if let Some(pos) = existing {
                            model.remove(pos);
                            None
                        } else if model.len() == capacity {
                            model.pop_back().map(|(key, value)| Evicted { key, value })
                        } else {
                            None
                        };
                        model.push_front((key, v));
                        prop_assert_eq!(evicted, expected);
                    }
                    Op::Get(k) => {
                        let key = format!("key-{k}");
                        let expected = model.iter().position(|(mk, _)| *mk == key).map(|pos| {
                            let entry = model.remove(pos).unwrap();
                            let value = entry.1;
                            model.push_front(entry);
                            value
                        });
                        prop_assert_eq!(cache.get(&key), expected);
                    }
                }
                cache.assert_consistent();
            }

            let model_keys: Vec<String> = model.into_iter().map(|(k, _)| k).collect();
            prop_assert_eq!(cache.keys_by_recency(), model_keys);
        }
    }
}
