//! # Storage Map
//!
//! Sharded concurrent key→entry mapping. Shards are plain hash maps behind
//! per-shard locks; the shard for a key is picked by masking its hash, so
//! unrelated keys contend only when they land on the same shard.
//!
//! ## Design Principles
//!
//! 1. **Sharded Locks**: Per-shard `RwLock`s keep mutations shard-local.
//! 2. **Shared Hash State**: One `RandomState` seeds every shard and the
//!    frequency sketch, so a key hashes identically everywhere.
//! 3. **Mark Before Unlink**: Removal flips the entry to `Removed` while the
//!    shard lock is held, so stale handles can detect the race.

use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::entry::{CacheEntry, EntryState};

/// Minimum number of shards regardless of the concurrency hint.
const MIN_SHARDS: usize = 4;

/// Multiplier applied to the concurrency hint when sizing shards.
const SHARD_MULTIPLIER: usize = 4;

/// Decision returned by a [`StorageMap::compute`] closure.
pub(crate) enum ComputeOp<V> {
    /// Leave the mapping untouched.
    Keep,
    /// Remove the mapping if present.
    Remove,
    /// Install `value`, either into the existing entry or a fresh one.
    Write {
        /// Value to store.
        value: Arc<V>,
        /// Weight recorded for the value.
        weight: u32,
        /// Absolute expiration deadline, when one applies.
        expires_at: Option<u64>,
    },
}

/// What a [`StorageMap::compute`] call did, reported to the facade for
/// weight accounting and event emission.
pub(crate) struct ComputeOutcome<K, V> {
    /// Value observed before the operation, if the entry held one.
    pub previous: Option<Arc<V>>,
    /// Weight of the entry before the operation; 0 when absent.
    pub previous_weight: u32,
    /// Entry mapped to the key after the operation.
    pub entry: Option<Arc<CacheEntry<K, V>>>,
    /// A `Write` op was applied.
    pub wrote: bool,
    /// A brand-new entry was linked into the map.
    pub inserted: bool,
    /// An existing `Loading` placeholder was promoted to `Normal`.
    pub activated: bool,
    /// Entry that was unlinked by the operation.
    pub removed: Option<Arc<CacheEntry<K, V>>>,
}

struct Shard<K, V> {
    inner: RwLock<HashMap<Arc<K>, Arc<CacheEntry<K, V>>, RandomState>>,
}

/// Sharded concurrent map from keys to live entries.
pub(crate) struct StorageMap<K, V> {
    shards: Box<[Shard<K, V>]>,
    shard_mask: u64,
    hash_state: RandomState,
    entries: AtomicUsize,
}

impl<K, V> StorageMap<K, V>
where
    K: std::hash::Hash + Eq,
{
    /// Creates a map sized from the concurrency and capacity hints.
    pub(crate) fn new(concurrency_level: usize, initial_capacity: usize) -> Self {
        let shard_count = shard_count(concurrency_level);
        let per_shard = initial_capacity.div_ceil(shard_count);
        let hash_state = RandomState::new();

        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Shard {
                inner: RwLock::new(HashMap::with_capacity_and_hasher(
                    per_shard,
                    hash_state.clone(),
                )),
            });
        }

        StorageMap {
            shards: shards.into_boxed_slice(),
            shard_mask: (shard_count - 1) as u64,
            hash_state,
            entries: AtomicUsize::new(0),
        }
    }

    /// Hashes a key with the map's hasher.
    ///
    /// The same hash feeds shard selection, the access recorder, and the
    /// frequency sketch.
    pub(crate) fn hash(&self, key: &K) -> u64 {
        let mut hasher = self.hash_state.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    fn shard_for(&self, hash: u64) -> &Shard<K, V> {
        &self.shards[(hash & self.shard_mask) as usize]
    }

    /// Non-blocking lookup; never touches entry metadata.
    pub(crate) fn get(&self, key: &K) -> Option<Arc<CacheEntry<K, V>>> {
        let hash = self.hash(key);
        let shard = self.shard_for(hash).inner.read();
        shard.get(key).cloned()
    }

    /// Atomically inserts `entry` unless the key is already mapped.
    ///
    /// Returns the existing entry when the insert lost the race.
    pub(crate) fn put_if_absent(
        &self,
        entry: Arc<CacheEntry<K, V>>,
    ) -> Option<Arc<CacheEntry<K, V>>> {
        let shard = self.shard_for(entry.hash());
        let mut inner = shard.inner.write();
        if let Some(existing) = inner.get(entry.key().as_ref()) {
            return Some(Arc::clone(existing));
        }
        inner.insert(Arc::clone(entry.key()), entry);
        self.entries.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Swaps `expected` for `next` iff the key still maps to `expected`.
    ///
    /// Identity comparison, not value equality: a concurrent replace of the
    /// same logical value still defeats the swap.
    pub(crate) fn replace(
        &self,
        key: &K,
        expected: &Arc<CacheEntry<K, V>>,
        next: Arc<CacheEntry<K, V>>,
    ) -> bool {
        let hash = self.hash(key);
        let shard = self.shard_for(hash);
        let mut inner = shard.inner.write();
        match inner.get_mut(key) {
            Some(slot) if Arc::ptr_eq(slot, expected) => {
                expected.set_state(EntryState::Removed);
                *slot = next;
                true
            }
            _ => false,
        }
    }

    /// Removes the mapping, optionally only when it still holds `expected`.
    ///
    /// The entry is flipped to `Removed` before it is unlinked, while the
    /// shard lock is held.
    pub(crate) fn remove(
        &self,
        key: &K,
        expected: Option<&Arc<CacheEntry<K, V>>>,
    ) -> Option<Arc<CacheEntry<K, V>>> {
        let hash = self.hash(key);
        let shard = self.shard_for(hash);
        let mut inner = shard.inner.write();

        if let Some(current) = inner.get(key) {
            if let Some(expected) = expected {
                if !Arc::ptr_eq(current, expected) {
                    return None;
                }
            }
            current.set_state(EntryState::Removed);
            let removed = inner.remove(key);
            self.entries.fetch_sub(1, Ordering::Relaxed);
            return removed;
        }
        None
    }

    /// Runs `f` against the mapping under the shard's write lock.
    ///
    /// At most one closure runs for a given key at a time, which is what
    /// gives `compute` its per-key at-most-once guarantee.
    pub(crate) fn compute<F>(&self, key: Arc<K>, now: u64, f: F) -> ComputeOutcome<K, V>
    where
        F: FnOnce(Option<&Arc<CacheEntry<K, V>>>) -> ComputeOp<V>,
    {
        let hash = self.hash(key.as_ref());
        let shard = self.shard_for(hash);
        let mut inner = shard.inner.write();

        let existing = inner.get(key.as_ref()).cloned();
        let previous = existing.as_ref().and_then(|entry| entry.value());
        let previous_weight = existing.as_ref().map(|entry| entry.weight()).unwrap_or(0);

        match f(existing.as_ref()) {
            ComputeOp::Keep => ComputeOutcome {
                previous,
                previous_weight,
                entry: existing,
                wrote: false,
                inserted: false,
                activated: false,
                removed: None,
            },
            ComputeOp::Remove => {
                let removed = existing.map(|entry| {
                    entry.set_state(EntryState::Removed);
                    inner.remove(key.as_ref());
                    self.entries.fetch_sub(1, Ordering::Relaxed);
                    entry
                });
                ComputeOutcome {
                    previous,
                    previous_weight,
                    entry: None,
                    wrote: false,
                    inserted: false,
                    activated: false,
                    removed,
                }
            }
            ComputeOp::Write {
                value,
                weight,
                expires_at,
            } => match existing {
                Some(entry) => {
                    entry.set_value(value, weight, now);
                    entry.set_expires_at(expires_at);
                    let activated = entry.transition(EntryState::Loading, EntryState::Normal);
                    ComputeOutcome {
                        previous,
                        previous_weight,
                        entry: Some(entry),
                        wrote: true,
                        inserted: false,
                        activated,
                        removed: None,
                    }
                }
                None => {
                    let entry = Arc::new(CacheEntry::new(
                        Arc::clone(&key),
                        hash,
                        value,
                        weight,
                        now,
                        expires_at,
                    ));
                    inner.insert(key, Arc::clone(&entry));
                    self.entries.fetch_add(1, Ordering::Relaxed);
                    ComputeOutcome {
                        previous: None,
                        previous_weight: 0,
                        entry: Some(entry),
                        wrote: true,
                        inserted: true,
                        activated: false,
                        removed: None,
                    }
                }
            },
        }
    }

    /// Weakly consistent iteration: each shard is snapshotted in turn, so
    /// the visitor may see entries from different instants.
    pub(crate) fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<CacheEntry<K, V>>),
    {
        for shard in self.shards.iter() {
            let snapshot: Vec<_> = shard.inner.read().values().cloned().collect();
            for entry in &snapshot {
                f(entry);
            }
        }
    }

    /// Total mapped entries, including `Loading` placeholders.
    pub(crate) fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    /// Unlinks every entry and returns them for event delivery.
    pub(crate) fn clear(&self) -> Vec<Arc<CacheEntry<K, V>>> {
        let mut drained = Vec::new();
        for shard in self.shards.iter() {
            let mut inner = shard.inner.write();
            for (_, entry) in inner.drain() {
                entry.set_state(EntryState::Removed);
                self.entries.fetch_sub(1, Ordering::Relaxed);
                drained.push(entry);
            }
        }
        drained
    }
}

/// Normalizes the concurrency hint to a power-of-two shard count.
fn shard_count(concurrency_level: usize) -> usize {
    concurrency_level
        .max(1)
        .saturating_mul(SHARD_MULTIPLIER)
        .max(MIN_SHARDS)
        .next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> StorageMap<String, u32> {
        StorageMap::new(2, 16)
    }

    fn entry(map: &StorageMap<String, u32>, key: &str, value: u32) -> Arc<CacheEntry<String, u32>> {
        let key = Arc::new(key.to_string());
        let hash = map.hash(&key);
        Arc::new(CacheEntry::new(key, hash, Arc::new(value), 1, 1, None))
    }

    #[test]
    fn shard_count_is_power_of_two() {
        assert_eq!(shard_count(0), 4);
        assert_eq!(shard_count(1), 4);
        assert_eq!(shard_count(3), 16);
        assert_eq!(shard_count(8), 32);
    }

    #[test]
    fn put_if_absent_wins_once() {
        let map = map();
        let first = entry(&map, "alpha", 1);
        let second = entry(&map, "alpha", 2);

        assert!(map.put_if_absent(Arc::clone(&first)).is_none());
        let existing = map.put_if_absent(second).expect("first insert holds");
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_marks_entry_removed() {
        let map = map();
        let entry = entry(&map, "alpha", 1);
        map.put_if_absent(Arc::clone(&entry));

        let removed = map.remove(&"alpha".to_string(), None).expect("present");
        assert!(Arc::ptr_eq(&removed, &entry));
        assert_eq!(removed.state(), EntryState::Removed);
        assert!(map.get(&"alpha".to_string()).is_none());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn conditional_remove_requires_identity() {
        let map = map();
        let stored = entry(&map, "alpha", 1);
        let other = entry(&map, "alpha", 1);
        map.put_if_absent(Arc::clone(&stored));

        assert!(map.remove(&"alpha".to_string(), Some(&other)).is_none());
        assert!(map.remove(&"alpha".to_string(), Some(&stored)).is_some());
    }

    #[test]
    fn replace_requires_identity() {
        let map = map();
        let stored = entry(&map, "alpha", 1);
        let next = entry(&map, "alpha", 2);
        let stranger = entry(&map, "alpha", 3);
        map.put_if_absent(Arc::clone(&stored));

        assert!(!map.replace(&"alpha".to_string(), &stranger, Arc::clone(&next)));
        assert!(map.replace(&"alpha".to_string(), &stored, Arc::clone(&next)));
        assert_eq!(stored.state(), EntryState::Removed);

        let current = map.get(&"alpha".to_string()).expect("mapped");
        assert!(Arc::ptr_eq(&current, &next));
    }

    #[test]
    fn compute_inserts_updates_and_removes() {
        let map = map();
        let key = Arc::new("alpha".to_string());

        let outcome = map.compute(Arc::clone(&key), 1, |existing| {
            assert!(existing.is_none());
            ComputeOp::Write {
                value: Arc::new(1),
                weight: 1,
                expires_at: None,
            }
        });
        assert!(outcome.inserted);
        assert_eq!(outcome.previous, None);

        let outcome = map.compute(Arc::clone(&key), 2, |existing| {
            assert!(existing.is_some());
            ComputeOp::Write {
                value: Arc::new(2),
                weight: 1,
                expires_at: None,
            }
        });
        assert!(!outcome.inserted);
        assert_eq!(outcome.previous.as_deref(), Some(&1));

        let outcome = map.compute(Arc::clone(&key), 3, |_| ComputeOp::Remove);
        assert!(outcome.removed.is_some());
        assert!(map.get(&key).is_none());
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn compute_promotes_loading_placeholder() {
        let map = map();
        let key = Arc::new("alpha".to_string());
        let hash = map.hash(&key);
        let sentinel = Arc::new(CacheEntry::loading(Arc::clone(&key), hash, 1));
        map.put_if_absent(sentinel);

        let outcome = map.compute(Arc::clone(&key), 2, |_| ComputeOp::Write {
            value: Arc::new(5),
            weight: 1,
            expires_at: None,
        });
        assert!(outcome.activated);
        assert_eq!(outcome.entry.unwrap().state(), EntryState::Normal);
    }

    #[test]
    fn clear_drains_every_shard() {
        let map = map();
        for (i, key) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            map.put_if_absent(entry(&map, key, i as u32));
        }
        let drained = map.clear();
        assert_eq!(drained.len(), 5);
        assert_eq!(map.len(), 0);
        assert!(drained.iter().all(|e| e.state() == EntryState::Removed));
    }

    #[test]
    fn for_each_sees_live_entries() {
        let map = map();
        map.put_if_absent(entry(&map, "a", 1));
        map.put_if_absent(entry(&map, "b", 2));

        let mut seen = Vec::new();
        map.for_each(|entry| seen.push(entry.key().as_ref().clone()));
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
    }
}
