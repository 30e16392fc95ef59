//! W-TinyLFU: a small recency window in front of a segmented main region.
//!
//! Fresh inserts land in the window (plain LRU, ≈1% of capacity). Window
//! overflow migrates entries into the main region while it has room; once
//! the cache is full, a migrating candidate must beat the main region's
//! next victim on sketch frequency or be evicted itself. Ties keep the
//! incumbent.
//!
//! The main region is a segmented LRU: entries enter probation and are
//! promoted to the protected segment (20% of main) on their next access;
//! protected overflow demotes back to probation. Victims come from
//! probation first, so one burst of cold keys cannot flush frequent ones.

use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;

use super::list::{LinkedDeque, NodeArena};
use super::EvictionPolicy;
use crate::entry::CacheEntry;
use crate::sketch::FrequencySketch;

/// Share of total capacity given to the admission window, in percent.
const WINDOW_PERCENT: u64 = 1;

/// Share of the main region given to the protected segment, in percent.
const PROTECTED_PERCENT: u64 = 20;

const SEG_WINDOW: u64 = 0;
const SEG_PROBATION: u64 = 1;
const SEG_PROTECTED: u64 = 2;

pub(crate) struct TinyLfuPolicy<K, V> {
    arena: NodeArena<K, V>,
    window: LinkedDeque,
    probation: LinkedDeque,
    protected: LinkedDeque,
    index: HashMap<Arc<K>, usize, RandomState>,
    window_cap: u64,
    main_cap: u64,
    protected_cap: u64,
    window_weight: u64,
    probation_weight: u64,
    protected_weight: u64,
}

impl<K, V> TinyLfuPolicy<K, V>
where
    K: Hash + Eq,
{
    /// Segments the policy against `capacity` weight units.
    pub(crate) fn new(capacity: u64) -> Self {
        let window_cap = (capacity * WINDOW_PERCENT / 100).max(1);
        let main_cap = capacity.saturating_sub(window_cap);
        let protected_cap = main_cap * PROTECTED_PERCENT / 100;

        TinyLfuPolicy {
            arena: NodeArena::new(),
            window: LinkedDeque::new(),
            probation: LinkedDeque::new(),
            protected: LinkedDeque::new(),
            index: HashMap::with_hasher(RandomState::new()),
            window_cap,
            main_cap,
            protected_cap,
            window_weight: 0,
            probation_weight: 0,
            protected_weight: 0,
        }
    }

    fn segment_weight(&mut self, tag: u64) -> &mut u64 {
        match tag {
            SEG_WINDOW => &mut self.window_weight,
            SEG_PROBATION => &mut self.probation_weight,
            _ => &mut self.protected_weight,
        }
    }

    /// Unlinks a node from its segment and frees it.
    fn evict_node(&mut self, idx: usize) -> Arc<CacheEntry<K, V>> {
        let (tag, weight) = {
            let node = self.arena.get(idx);
            (node.tag, node.weight as u64)
        };
        match tag {
            SEG_WINDOW => self.window.unlink(&mut self.arena, idx),
            SEG_PROBATION => self.probation.unlink(&mut self.arena, idx),
            _ => self.protected.unlink(&mut self.arena, idx),
        }
        *self.segment_weight(tag) -= weight;
        let node = self.arena.release(idx);
        self.index.remove(node.entry.key());
        node.entry
    }

    /// Moves a node between segments, keeping the weight totals right.
    fn transfer(&mut self, idx: usize, to: u64) {
        let (from, weight) = {
            let node = self.arena.get(idx);
            (node.tag, node.weight as u64)
        };
        match from {
            SEG_WINDOW => self.window.unlink(&mut self.arena, idx),
            SEG_PROBATION => self.probation.unlink(&mut self.arena, idx),
            _ => self.protected.unlink(&mut self.arena, idx),
        }
        *self.segment_weight(from) -= weight;
        self.arena.get_mut(idx).tag = to;
        match to {
            SEG_WINDOW => self.window.push_back(&mut self.arena, idx),
            SEG_PROBATION => self.probation.push_back(&mut self.arena, idx),
            _ => self.protected.push_back(&mut self.arena, idx),
        }
        *self.segment_weight(to) += weight;
    }

    /// Drains window overflow into the main region while it has room.
    ///
    /// When the main region is full the overflow stays in the window; the
    /// admission showdown in [`Self::pop_victim`] settles it.
    fn migrate_window(&mut self) {
        while self.window_weight > self.window_cap {
            let Some(idx) = self.window.front() else {
                break;
            };
            let weight = self.arena.get(idx).weight as u64;
            if self.probation_weight + self.protected_weight + weight > self.main_cap {
                break;
            }
            self.transfer(idx, SEG_PROBATION);
        }
    }

    /// Demotes protected overflow back to probation.
    fn shrink_protected(&mut self) {
        while self.protected_weight > self.protected_cap {
            let Some(idx) = self.protected.front() else {
                break;
            };
            self.transfer(idx, SEG_PROBATION);
        }
    }

    fn frequency(sketch: Option<&FrequencySketch>, entry: &Arc<CacheEntry<K, V>>) -> u8 {
        sketch.map(|s| s.frequency(entry.hash())).unwrap_or(0)
    }
}

impl<K, V> EvictionPolicy<K, V> for TinyLfuPolicy<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
{
    fn name(&self) -> &'static str {
        "tiny-lfu"
    }

    fn record_insert(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(&idx) = self.index.get(entry.key()) {
            let (tag, old_weight, new_weight) = {
                let node = self.arena.get_mut(idx);
                let old = node.weight as u64;
                node.entry = Arc::clone(entry);
                node.weight = entry.weight();
                (node.tag, old, entry.weight() as u64)
            };
            let total = self.segment_weight(tag);
            *total = *total - old_weight + new_weight;
            self.record_access(entry);
            return;
        }

        let idx = self
            .arena
            .alloc(Arc::clone(entry), entry.weight(), SEG_WINDOW);
        self.window.push_back(&mut self.arena, idx);
        self.window_weight += entry.weight() as u64;
        self.index.insert(Arc::clone(entry.key()), idx);
        self.migrate_window();
    }

    fn record_access(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        let Some(&idx) = self.index.get(entry.key()) else {
            return;
        };
        match self.arena.get(idx).tag {
            SEG_WINDOW => self.window.move_to_back(&mut self.arena, idx),
            SEG_PROBATION => {
                self.transfer(idx, SEG_PROTECTED);
                self.shrink_protected();
            }
            _ => self.protected.move_to_back(&mut self.arena, idx),
        }
    }

    fn record_removal(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(&idx) = self.index.get(entry.key()) {
            if !Arc::ptr_eq(&self.arena.get(idx).entry, entry) {
                return;
            }
            self.evict_node(idx);
            self.migrate_window();
        }
    }

    fn pop_victim(&mut self, sketch: Option<&FrequencySketch>) -> Option<Arc<CacheEntry<K, V>>> {
        if self.window_weight > self.window_cap {
            if let Some(candidate_idx) = self.window.front() {
                let victim_idx = self.probation.front().or_else(|| self.protected.front());
                return match victim_idx {
                    None => Some(self.evict_node(candidate_idx)),
                    Some(victim_idx) => {
                        let candidate_freq =
                            Self::frequency(sketch, &self.arena.get(candidate_idx).entry);
                        let victim_freq =
                            Self::frequency(sketch, &self.arena.get(victim_idx).entry);
                        if candidate_freq > victim_freq {
                            let victim = self.evict_node(victim_idx);
                            self.transfer(candidate_idx, SEG_PROBATION);
                            Some(victim)
                        } else {
                            Some(self.evict_node(candidate_idx))
                        }
                    }
                };
            }
        }

        let idx = self
            .probation
            .front()
            .or_else(|| self.protected.front())
            .or_else(|| self.window.front())?;
        Some(self.evict_node(idx))
    }

    fn tracked_len(&self) -> usize {
        self.window.len() + self.probation.len() + self.protected.len()
    }

    fn clear(&mut self) {
        self.arena.clear();
        self.window.reset();
        self.probation.reset();
        self.protected.reset();
        self.index.clear();
        self.window_weight = 0;
        self.probation_weight = 0;
        self.protected_weight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sketch::SketchMode;

    fn entry(key: &str) -> Arc<CacheEntry<String, u32>> {
        entry_hashed(key, key.len() as u64)
    }

    fn entry_hashed(key: &str, hash: u64) -> Arc<CacheEntry<String, u32>> {
        Arc::new(CacheEntry::new(
            Arc::new(key.to_string()),
            hash,
            Arc::new(0),
            1,
            1,
            None,
        ))
    }

    #[test]
    fn segments_derive_from_capacity() {
        let policy: TinyLfuPolicy<String, u32> = TinyLfuPolicy::new(1000);
        assert_eq!(policy.window_cap, 10);
        assert_eq!(policy.main_cap, 990);
        assert_eq!(policy.protected_cap, 198);

        let tiny: TinyLfuPolicy<String, u32> = TinyLfuPolicy::new(1);
        assert_eq!(tiny.window_cap, 1);
        assert_eq!(tiny.main_cap, 0);
    }

    #[test]
    fn window_overflow_migrates_into_probation() {
        let mut policy: TinyLfuPolicy<String, u32> = TinyLfuPolicy::new(100);
        for key in ["a", "b", "c"] {
            policy.record_insert(&entry(key));
        }
        // Window cap is 1, so the two older inserts moved to probation.
        assert_eq!(policy.window.len(), 1);
        assert_eq!(policy.probation.len(), 2);
    }

    #[test]
    fn access_promotes_probation_to_protected() {
        let mut policy: TinyLfuPolicy<String, u32> = TinyLfuPolicy::new(100);
        let a = entry("a");
        policy.record_insert(&a);
        policy.record_insert(&entry("b"));
        assert_eq!(policy.arena.get(policy.probation.front().unwrap()).tag, SEG_PROBATION);

        policy.record_access(&a);
        assert_eq!(policy.protected.len(), 1);
        assert_eq!(policy.probation.len(), 0);
    }

    #[test]
    fn frequent_incumbent_beats_cold_candidate() {
        // Window cap 1, main cap 1: `hot` migrates to probation, then the
        // main region is full and later inserts pile up in the window.
        let mut policy: TinyLfuPolicy<String, u32> = TinyLfuPolicy::new(2);
        let mut sketch = FrequencySketch::new(SketchMode::Basic, 2);

        let hot = entry_hashed("hot", 11);
        let cold = entry_hashed("cold", 22);
        for _ in 0..10 {
            sketch.record(hot.hash());
        }
        sketch.record(cold.hash());

        policy.record_insert(&hot);
        policy.record_insert(&cold);
        policy.record_insert(&entry_hashed("filler", 33));

        // Candidate `cold` (window LRU) loses to incumbent `hot`.
        let victim = policy.pop_victim(Some(&sketch)).unwrap();
        assert!(Arc::ptr_eq(&victim, &cold));
        assert_eq!(policy.tracked_len(), 2);
        assert!(Arc::ptr_eq(
            &policy.arena.get(policy.probation.front().unwrap()).entry,
            &hot
        ));
    }

    #[test]
    fn hot_candidate_displaces_cold_incumbent() {
        let mut policy: TinyLfuPolicy<String, u32> = TinyLfuPolicy::new(2);
        let mut sketch = FrequencySketch::new(SketchMode::Basic, 2);

        let cold = entry_hashed("cold", 11);
        let hot = entry_hashed("hot", 22);
        sketch.record(cold.hash());
        for _ in 0..10 {
            sketch.record(hot.hash());
        }

        policy.record_insert(&cold);
        policy.record_insert(&hot);
        policy.record_insert(&entry_hashed("filler", 33));

        // Candidate `hot` beats incumbent `cold` and takes its place.
        let victim = policy.pop_victim(Some(&sketch)).unwrap();
        assert!(Arc::ptr_eq(&victim, &cold));
        assert!(Arc::ptr_eq(
            &policy.arena.get(policy.probation.front().unwrap()).entry,
            &hot
        ));
    }

    #[test]
    fn frequency_tie_keeps_incumbent() {
        let mut policy: TinyLfuPolicy<String, u32> = TinyLfuPolicy::new(2);
        let sketch = FrequencySketch::new(SketchMode::Basic, 2);

        let incumbent = entry_hashed("incumbent", 11);
        let candidate = entry_hashed("candidate", 22);
        policy.record_insert(&incumbent);
        policy.record_insert(&candidate);
        policy.record_insert(&entry_hashed("filler", 33));

        let victim = policy.pop_victim(Some(&sketch)).unwrap();
        assert!(Arc::ptr_eq(&victim, &candidate));
    }

    #[test]
    fn protected_overflow_demotes_to_probation() {
        let mut policy: TinyLfuPolicy<String, u32> = TinyLfuPolicy::new(10);
        // window_cap=1, main_cap=9, protected_cap=1.
        let a = entry("a");
        let b = entry("b");
        policy.record_insert(&a);
        policy.record_insert(&b);
        policy.record_insert(&entry("c"));

        policy.record_access(&a);
        policy.record_access(&b);
        // Protecting `b` pushed `a` back out to probation.
        assert_eq!(policy.protected.len(), 1);
        assert!(Arc::ptr_eq(
            &policy.arena.get(policy.protected.front().unwrap()).entry,
            &b
        ));
    }
}
