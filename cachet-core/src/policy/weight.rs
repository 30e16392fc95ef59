//! Weight-ordered policy: the heaviest entry is always the next victim.
//!
//! An ordered index over (weight, insertion sequence) gives O(log n)
//! updates; ties between equal weights evict the older insert first.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;

use super::list::NodeArena;
use super::EvictionPolicy;
use crate::entry::CacheEntry;
use crate::sketch::FrequencySketch;

pub(crate) struct WeightPolicy<K, V> {
    arena: NodeArena<K, V>,
    // (weight, sequence) -> arena slot; the maximum key is the victim.
    order: BTreeMap<(u32, u64), usize>,
    index: HashMap<Arc<K>, usize, RandomState>,
    next_seq: u64,
}

impl<K, V> WeightPolicy<K, V>
where
    K: Hash + Eq,
{
    pub(crate) fn new() -> Self {
        WeightPolicy {
            arena: NodeArena::new(),
            order: BTreeMap::new(),
            index: HashMap::with_hasher(RandomState::new()),
            next_seq: 0,
        }
    }
}

impl<K, V> EvictionPolicy<K, V> for WeightPolicy<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
{
    fn name(&self) -> &'static str {
        "weight"
    }

    fn record_insert(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        let weight = entry.weight();
        if let Some(&idx) = self.index.get(entry.key()) {
            let (old_weight, seq) = {
                let node = self.arena.get_mut(idx);
                let old = (node.weight, node.tag);
                node.entry = Arc::clone(entry);
                node.weight = weight;
                old
            };
            if old_weight != weight {
                self.order.remove(&(old_weight, seq));
                self.order.insert((weight, seq), idx);
            }
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let idx = self.arena.alloc(Arc::clone(entry), weight, seq);
        self.order.insert((weight, seq), idx);
        self.index.insert(Arc::clone(entry.key()), idx);
    }

    fn record_access(&mut self, _entry: &Arc<CacheEntry<K, V>>) {}

    fn record_removal(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(&idx) = self.index.get(entry.key()) {
            if !Arc::ptr_eq(&self.arena.get(idx).entry, entry) {
                return;
            }
            let (weight, seq) = {
                let node = self.arena.get(idx);
                (node.weight, node.tag)
            };
            self.order.remove(&(weight, seq));
            self.index.remove(entry.key());
            self.arena.release(idx);
        }
    }

    fn pop_victim(&mut self, _sketch: Option<&FrequencySketch>) -> Option<Arc<CacheEntry<K, V>>> {
        let (&(weight, _), _) = self.order.iter().next_back()?;
        // Among entries sharing the maximum weight, take the oldest insert.
        let (&order_key, &victim_idx) = self.order.range((weight, 0)..).next()?;
        self.order.remove(&order_key);
        let node = self.arena.release(victim_idx);
        self.index.remove(node.entry.key());
        Some(node.entry)
    }

    fn tracked_len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.arena.clear();
        self.order.clear();
        self.index.clear();
        self.next_seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, weight: u32) -> Arc<CacheEntry<String, u32>> {
        Arc::new(CacheEntry::new(
            Arc::new(key.to_string()),
            0,
            Arc::new(0),
            weight,
            1,
            None,
        ))
    }

    #[test]
    fn heaviest_entry_is_victim() {
        let mut policy = WeightPolicy::new();
        let small = entry("small", 1);
        let large = entry("large", 10);
        let medium = entry("medium", 5);
        policy.record_insert(&small);
        policy.record_insert(&large);
        policy.record_insert(&medium);

        let victim = policy.pop_victim(None).unwrap();
        assert!(Arc::ptr_eq(&victim, &large));
        let victim = policy.pop_victim(None).unwrap();
        assert!(Arc::ptr_eq(&victim, &medium));
    }

    #[test]
    fn equal_weights_evict_older_first() {
        let mut policy = WeightPolicy::new();
        let first = entry("first", 4);
        let second = entry("second", 4);
        policy.record_insert(&first);
        policy.record_insert(&second);

        let victim = policy.pop_victim(None).unwrap();
        assert!(Arc::ptr_eq(&victim, &first));
    }

    #[test]
    fn weight_update_reorders() {
        let mut policy = WeightPolicy::new();
        let a = entry("a", 1);
        let b = entry("b", 5);
        policy.record_insert(&a);
        policy.record_insert(&b);

        let grown = entry("a", 9);
        policy.record_insert(&grown);
        let victim = policy.pop_victim(None).unwrap();
        assert_eq!(victim.key().as_ref(), "a");
    }
}
