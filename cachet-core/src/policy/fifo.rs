//! Insertion-order policies: FIFO evicts the oldest insert, FILO the newest.
//! Reads never reorder anything.

use std::hash::Hash;
use std::sync::Arc;

use ahash::RandomState;
use hashbrown::HashMap;

use super::list::{LinkedDeque, NodeArena};
use super::EvictionPolicy;
use crate::entry::CacheEntry;
use crate::sketch::FrequencySketch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Order {
    Queue,
    Stack,
}

pub(crate) struct FifoPolicy<K, V> {
    arena: NodeArena<K, V>,
    order: LinkedDeque,
    index: HashMap<Arc<K>, usize, RandomState>,
    mode: Order,
}

impl<K, V> FifoPolicy<K, V>
where
    K: Hash + Eq,
{
    /// First-in first-out: the oldest insert is the victim.
    pub(crate) fn queue() -> Self {
        Self::with_mode(Order::Queue)
    }

    /// First-in last-out: the newest insert is the victim.
    pub(crate) fn stack() -> Self {
        Self::with_mode(Order::Stack)
    }

    fn with_mode(mode: Order) -> Self {
        FifoPolicy {
            arena: NodeArena::new(),
            order: LinkedDeque::new(),
            index: HashMap::with_hasher(RandomState::new()),
            mode,
        }
    }
}

impl<K, V> EvictionPolicy<K, V> for FifoPolicy<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
{
    fn name(&self) -> &'static str {
        match self.mode {
            Order::Queue => "fifo",
            Order::Stack => "filo",
        }
    }

    fn record_insert(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(&idx) = self.index.get(entry.key()) {
            // Value replacement keeps the original insertion position.
            let node = self.arena.get_mut(idx);
            node.entry = Arc::clone(entry);
            node.weight = entry.weight();
            return;
        }
        let idx = self.arena.alloc(Arc::clone(entry), entry.weight(), 0);
        self.order.push_back(&mut self.arena, idx);
        self.index.insert(Arc::clone(entry.key()), idx);
    }

    fn record_access(&mut self, _entry: &Arc<CacheEntry<K, V>>) {}

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
        let idx = match self.mode {
            Order::Queue => self.order.pop_front(&mut self.arena)?,
            Order::Stack => self.order.pop_back(&mut self.arena)?,
        };
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
