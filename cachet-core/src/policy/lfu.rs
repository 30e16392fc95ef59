//! Least-frequently-used policy with exact counters.
//!
//! Entries live in per-frequency deques; an access transfers the node to the
//! next bucket in O(1). The victim is the oldest node in the lowest bucket,
//! so ties within a frequency fall back to LRU order.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;

use super::list::{LinkedDeque, NodeArena};
use super::EvictionPolicy;
use crate::entry::CacheEntry;
use crate::sketch::FrequencySketch;

pub(crate) struct LfuPolicy<K, V> {
    arena: NodeArena<K, V>,
    buckets: BTreeMap<u64, LinkedDeque>,
    index: HashMap<Arc<K>, usize, RandomState>,
    tracked: usize,
}

impl<K, V> LfuPolicy<K, V>
where
    K: Hash + Eq,
{
    pub(crate) fn new() -> Self {
        LfuPolicy {
            arena: NodeArena::new(),
            buckets: BTreeMap::new(),
            index: HashMap::with_hasher(RandomState::new()),
            tracked: 0,
        }
    }

    fn transfer(&mut self, idx: usize, from: u64, to: u64) {
        if let Some(bucket) = self.buckets.get_mut(&from) {
            bucket.unlink(&mut self.arena, idx);
            if bucket.len() == 0 {
                self.buckets.remove(&from);
            }
        }
        self.arena.get_mut(idx).tag = to;
        self.buckets
            .entry(to)
            .or_default()
            .push_back(&mut self.arena, idx);
    }
}

impl<K, V> EvictionPolicy<K, V> for LfuPolicy<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
{
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn record_insert(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(&idx) = self.index.get(entry.key()) {
            let node = self.arena.get_mut(idx);
            node.entry = Arc::clone(entry);
            node.weight = entry.weight();
            return;
        }
        let idx = self.arena.alloc(Arc::clone(entry), entry.weight(), 1);
        self.buckets
            .entry(1)
            .or_default()
            .push_back(&mut self.arena, idx);
        self.index.insert(Arc::clone(entry.key()), idx);
        self.tracked += 1;
    }

    fn record_access(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(&idx) = self.index.get(entry.key()) {
            let freq = self.arena.get(idx).tag;
            self.transfer(idx, freq, freq.saturating_add(1));
        }
    }

    fn record_removal(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(&idx) = self.index.get(entry.key()) {
            if !Arc::ptr_eq(&self.arena.get(idx).entry, entry) {
                return;
            }
            let freq = self.arena.get(idx).tag;
            if let Some(bucket) = self.buckets.get_mut(&freq) {
                bucket.unlink(&mut self.arena, idx);
                if bucket.len() == 0 {
                    self.buckets.remove(&freq);
                }
            }
            self.index.remove(entry.key());
            self.arena.release(idx);
            self.tracked -= 1;
        }
    }

    fn pop_victim(&mut self, _sketch: Option<&FrequencySketch>) -> Option<Arc<CacheEntry<K, V>>> {
        let (&freq, _) = self.buckets.iter().next()?;
        let bucket = self.buckets.get_mut(&freq)?;
        let idx = bucket.pop_front(&mut self.arena)?;
        if bucket.len() == 0 {
            self.buckets.remove(&freq);
        }
        let node = self.arena.release(idx);
        self.index.remove(node.entry.key());
        self.tracked -= 1;
        Some(node.entry)
    }

    fn tracked_len(&self) -> usize {
        self.tracked
    }

    fn clear(&mut self) {
        self.arena.clear();
        self.buckets.clear();
        self.index.clear();
        self.tracked = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str) -> Arc<CacheEntry<String, u32>> {
        Arc::new(CacheEntry::new(
            Arc::new(key.to_string()),
            0,
            Arc::new(0),
            1,
            1,
            None,
        ))
    }

    #[test]
    fn victim_is_least_frequent() {
        let mut policy = LfuPolicy::new();
        let a = entry("a");
        let b = entry("b");
        policy.record_insert(&a);
        policy.record_insert(&b);
        policy.record_access(&a);
        policy.record_access(&a);
        policy.record_access(&b);

        let victim = policy.pop_victim(None).unwrap();
        assert!(Arc::ptr_eq(&victim, &b));
    }

    #[test]
    fn frequency_ties_break_by_age() {
        let mut policy = LfuPolicy::new();
        let a = entry("a");
        let b = entry("b");
        policy.record_insert(&a);
        policy.record_insert(&b);

        let victim = policy.pop_victim(None).unwrap();
        assert!(Arc::ptr_eq(&victim, &a));
    }

    #[test]
    fn empty_buckets_are_garbage_collected() {
        let mut policy = LfuPolicy::new();
        let a = entry("a");
        policy.record_insert(&a);
        for _ in 0..5 {
            policy.record_access(&a);
        }
        assert_eq!(policy.buckets.len(), 1);
        assert_eq!(*policy.buckets.keys().next().unwrap(), 6);

        policy.record_removal(&a);
        assert!(policy.buckets.is_empty());
        assert_eq!(policy.tracked_len(), 0);
    }
}
