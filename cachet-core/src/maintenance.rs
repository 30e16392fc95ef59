//! # Maintenance State
//!
//! State owned by the single maintenance consumer: the eviction policy, the
//! frequency sketch, and the expiration queue. The facade drains access
//! events into this state and asks it for expired entries and victims.
//!
//! Everything here is single-threaded by construction; the facade serializes
//! access behind one mutex and the buffer's drain status.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::buffer::{AccessEvent, AccessKind};
use crate::entry::CacheEntry;
use crate::policy::EvictionPolicy;
use crate::sketch::FrequencySketch;

/// Scheduled expiration check for one entry.
///
/// Items are compared by deadline only; the heap is a min-heap via
/// `Reverse`. Entries whose deadline moved after scheduling are lazily
/// re-queued when they surface.
struct ExpiryItem<K, V> {
    deadline: u64,
    entry: Arc<CacheEntry<K, V>>,
}

impl<K, V> PartialEq for ExpiryItem<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl<K, V> Eq for ExpiryItem<K, V> {}

impl<K, V> PartialOrd for ExpiryItem<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K, V> Ord for ExpiryItem<K, V> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

/// Consumer-side cache state: policy, sketch, and expiration queue.
pub(crate) struct MaintenanceState<K, V> {
    pub(crate) policy: Box<dyn EvictionPolicy<K, V>>,
    pub(crate) sketch: Option<FrequencySketch>,
    expiry: BinaryHeap<Reverse<ExpiryItem<K, V>>>,
    /// Victim requests the policy could not satisfy; logged, never raised.
    pub(crate) eviction_failures: u64,
}

impl<K, V> MaintenanceState<K, V> {
    pub(crate) fn new(
        policy: Box<dyn EvictionPolicy<K, V>>,
        sketch: Option<FrequencySketch>,
    ) -> Self {
        MaintenanceState {
            policy,
            sketch,
            expiry: BinaryHeap::new(),
            eviction_failures: 0,
        }
    }

    /// Applies one drained event to the sketch, the policy, and the entry's
    /// lazy metadata.
    ///
    /// `access_ttl` is the expire-after-access duration in nanoseconds.
    pub(crate) fn apply(&mut self, event: AccessEvent<K, V>, now: u64, access_ttl: Option<u64>) {
        let entry = event.entry;
        match event.kind {
            AccessKind::Read => {
                if entry.is_dead() {
                    return;
                }
                if let Some(sketch) = &mut self.sketch {
                    sketch.record(entry.hash());
                }
                self.policy.record_access(&entry);
                entry.record_access(now);
                if let Some(ttl) = access_ttl {
                    entry.set_expires_at(Some(now + ttl));
                    self.schedule(&entry);
                }
            }
            AccessKind::Write => {
                if entry.is_dead() {
                    return;
                }
                if let Some(sketch) = &mut self.sketch {
                    sketch.record(entry.hash());
                }
                self.policy.record_insert(&entry);
                self.schedule(&entry);
            }
            AccessKind::Remove => {
                self.policy.record_removal(&entry);
            }
        }
    }

    /// Queues the entry's current deadline, if it has one.
    pub(crate) fn schedule(&mut self, entry: &Arc<CacheEntry<K, V>>) {
        if let Some(deadline) = entry.expires_at() {
            self.expiry.push(Reverse(ExpiryItem {
                deadline,
                entry: Arc::clone(entry),
            }));
        }
    }

    /// Pops the next entry whose deadline has passed.
    ///
    /// Entries whose deadline moved since scheduling are re-queued under
    /// the new deadline; dead entries are dropped.
    pub(crate) fn pop_due(&mut self, now: u64) -> Option<Arc<CacheEntry<K, V>>> {
        loop {
            let Reverse(head) = self.expiry.peek()?;
            if head.deadline > now {
                return None;
            }
            let Reverse(item) = self.expiry.pop()?;
            if item.entry.is_dead() {
                continue;
            }
            match item.entry.expires_at() {
                None => continue,
                Some(deadline) if deadline <= now => return Some(item.entry),
                Some(deadline) => {
                    self.expiry.push(Reverse(ExpiryItem {
                        deadline,
                        entry: item.entry,
                    }));
                }
            }
        }
    }

    /// Number of queued expiration checks (duplicates included).
    pub(crate) fn scheduled_expirations(&self) -> usize {
        self.expiry.len()
    }

    /// Drops everything tracked; used by `clear` and `close`.
    pub(crate) fn reset(&mut self) {
        self.policy.clear();
        self.expiry.clear();
    }
}
