//! Least-recently-used policy: one deque, touch moves to the tail, the head
//! is always the victim.

use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;

use super::list::{LinkedDeque, NodeArena};
use super::EvictionPolicy;
use crate::entry::CacheEntry;
use crate::sketch::FrequencySketch;

pub(crate) struct LruPolicy<K, V> {
    arena: NodeArena<K, V>,
    order: LinkedDeque,
    index: HashMap<Arc<K>, usize, RandomState>,
}

impl<K, V> LruPolicy<K, V>
where
    K: Hash + Eq,
{
    pub(crate) fn new() -> Self {
        LruPolicy {
            arena: NodeArena::new(),
            order: LinkedDeque::new(),
            index: HashMap::with_hasher(RandomState::new()),
        }
    }
}

impl<K, V> EvictionPolicy<K, V> for LruPolicy<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
{
    fn name(&self) -> &'static str {
        "lru"
    }

    fn record_insert(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(&idx) = self.index.get(entry.key()) {
            let node = self.arena.get_mut(idx);
            node.entry = Arc::clone(entry);
            node.weight = entry.weight();
            self.order.move_to_back(&mut self.arena, idx);
            return;
        }
        let idx = self.arena.alloc(Arc::clone(entry), entry.weight(), 0);
        self.order.push_back(&mut self.arena, idx);
        self.index.insert(Arc::clone(entry.key()), idx);
    }

    fn record_access(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(&idx) = self.index.get(entry.key()) {
            self.order.move_to_back(&mut self.arena, idx);
        }
    }

    fn record_removal(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(&idx) = self.index.get(entry.key()) {
            if !Arc::ptr_eq(&self.arena.get(idx).entry, entry) {
                return;
            }
            self.index.remove(entry.key());
            self.order.unlink(&mut self.arena, idx);
            self.arena.release(idx);
        }
    }

    fn pop_victim(&mut self, _sketch: Option<&FrequencySketch>) -> Option<Arc<CacheEntry<K, V>>> {
        let idx = self.order.pop_front(&mut self.arena)?;
        let node = self.arena.release(idx);
        self.index.remove(node.entry.key());
        Some(node.entry)
    }

    fn tracked_len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.arena.clear();
        self.order.reset();
        self.index.clear();
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
    fn victim_is_least_recently_used() {
        let mut policy = LruPolicy::new();
        let a = entry("a");
        let b = entry("b");
        let c = entry("c");
        policy.record_insert(&a);
        policy.record_insert(&b);
        policy.record_insert(&c);
        policy.record_access(&a);

        let victim = policy.pop_victim(None).unwrap();
        assert!(Arc::ptr_eq(&victim, &b));
        assert_eq!(policy.tracked_len(), 2);
    }

    #[test]
    fn reinsert_refreshes_position() {
        let mut policy = LruPolicy::new();
        let a = entry("a");
        let b = entry("b");
        policy.record_insert(&a);
        policy.record_insert(&b);
        policy.record_insert(&a);

        let victim = policy.pop_victim(None).unwrap();
        assert!(Arc::ptr_eq(&victim, &b));
    }

    #[test]
    fn stale_removal_is_ignored() {
        let mut policy = LruPolicy::new();
        let current = entry("a");
        let stale = entry("a");
        policy.record_insert(&current);
        policy.record_removal(&stale);
        assert_eq!(policy.tracked_len(), 1);

        policy.record_removal(&current);
        assert_eq!(policy.tracked_len(), 0);
        assert!(policy.pop_victim(None).is_none());
    }
}
