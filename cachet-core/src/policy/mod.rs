//! # Eviction Policies
//!
//! Policy state is owned exclusively by the maintenance task, so every
//! implementation here is plain single-threaded data: an index arena of
//! nodes, one or more deques over it, and a key→slot map.
//!
//! A policy tracks entries it has been told about and, when the cache is
//! over its bound, surrenders victims one at a time. The W-TinyLFU policy
//! additionally consults the frequency sketch to decide whether a fresh
//! candidate deserves a slot in the main region.

use std::hash::Hash;
use std::sync::Arc;

use crate::entry::CacheEntry;
use crate::sketch::FrequencySketch;

mod fifo;
mod lfu;
mod list;
mod lru;
mod tinylfu;
mod weight;

pub(crate) use fifo::FifoPolicy;
pub(crate) use lfu::LfuPolicy;
pub(crate) use lru::LruPolicy;
pub(crate) use tinylfu::TinyLfuPolicy;
pub(crate) use weight::WeightPolicy;

/// Which eviction policy a cache runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Evict the least recently used entry.
    Lru,
    /// Evict the least frequently used entry (exact counters).
    Lfu,
    /// Evict in insertion order.
    Fifo,
    /// Evict the most recently inserted entry.
    Filo,
    /// Evict the largest entry first.
    Weight,
    /// Recency window plus sketch-gated main region (default).
    TinyLfu,
}

impl PolicyKind {
    /// Stable lowercase name used in logs and diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            PolicyKind::Lru => "lru",
            PolicyKind::Lfu => "lfu",
            PolicyKind::Fifo => "fifo",
            PolicyKind::Filo => "filo",
            PolicyKind::Weight => "weight",
            PolicyKind::TinyLfu => "tiny-lfu",
        }
    }
}

/// Capability the maintenance task drives to track and evict entries.
///
/// Implementations may be handed stale entries (already removed from the
/// map); they detect this by entry identity and ignore the call. Victims
/// returned from [`Self::pop_victim`] are no longer tracked.
pub(crate) trait EvictionPolicy<K, V>: Send {
    /// Stable policy name for logs.
    fn name(&self) -> &'static str;

    /// Tracks a newly written entry, or refreshes the tracked handle and
    /// weight when the key is already present.
    fn record_insert(&mut self, entry: &Arc<CacheEntry<K, V>>);

    /// Applies one read to the policy order.
    fn record_access(&mut self, entry: &Arc<CacheEntry<K, V>>);

    /// Stops tracking an entry that left the map.
    fn record_removal(&mut self, entry: &Arc<CacheEntry<K, V>>);

    /// Surrenders the next victim, or `None` when nothing is tracked.
    fn pop_victim(&mut self, sketch: Option<&FrequencySketch>)
        -> Option<Arc<CacheEntry<K, V>>>;

    /// Number of tracked entries.
    fn tracked_len(&self) -> usize;

    /// Drops all tracked state.
    fn clear(&mut self);
}

/// Builds the policy implementation for `kind`.
///
/// `capacity` is the bound the policy segments itself against: the maximum
/// weight when a weigher is configured, otherwise the maximum size.
pub(crate) fn build_policy<K, V>(kind: PolicyKind, capacity: u64) -> Box<dyn EvictionPolicy<K, V>>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    match kind {
        PolicyKind::Lru => Box::new(LruPolicy::new()),
        PolicyKind::Lfu => Box::new(LfuPolicy::new()),
        PolicyKind::Fifo => Box::new(FifoPolicy::queue()),
        PolicyKind::Filo => Box::new(FifoPolicy::stack()),
        PolicyKind::Weight => Box::new(WeightPolicy::new()),
        PolicyKind::TinyLfu => Box::new(TinyLfuPolicy::new(capacity)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(PolicyKind::Lru.name(), "lru");
        assert_eq!(PolicyKind::Lfu.name(), "lfu");
        assert_eq!(PolicyKind::Fifo.name(), "fifo");
        assert_eq!(PolicyKind::Filo.name(), "filo");
        assert_eq!(PolicyKind::Weight.name(), "weight");
        assert_eq!(PolicyKind::TinyLfu.name(), "tiny-lfu");
    }

    #[test]
    fn build_policy_matches_kind() {
        let policy = build_policy::<String, u32>(PolicyKind::Lru, 10);
        assert_eq!(policy.name(), "lru");
        let policy = build_policy::<String, u32>(PolicyKind::TinyLfu, 10);
        assert_eq!(policy.name(), "tiny-lfu");
    }
}
