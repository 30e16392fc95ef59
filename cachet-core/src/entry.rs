//! # Cache Entries
//!
//! Per-entry metadata for the storage map: timestamps, weight, a saturating
//! access counter, and a lifecycle state flag.
//!
//! ## Design Principles
//!
//! 1. **Hot-Path Reads Stay Read-Only**: `get` never mutates metadata; the
//!    maintenance task applies access timestamps and counters when it drains
//!    the recorder.
//! 2. **Monotonic Nanos**: Timestamps are nanoseconds on a cache-local
//!    monotonic clock, so wall-clock adjustments cannot expire entries early.
//! 3. **Atomic Fields Over Locks**: Every mutable metadata field is a relaxed
//!    atomic; only the value slot takes a lock, and only on writes.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Upper bound of the per-entry access counter.
///
/// Four bits of frequency are enough for admission decisions; the counter
/// saturates instead of wrapping.
pub const MAX_ACCESS_COUNT: u8 = 15;

/// Sentinel for "no expiration" in the atomic deadline field.
const NO_EXPIRY: u64 = 0;

/// Monotonic clock anchored at cache construction.
///
/// All entry timestamps are nanoseconds since this anchor, which keeps them
/// in a single `u64` and comparable with plain integer math.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    epoch: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the cache epoch, starting at 1.
    ///
    /// The offset keeps 0 free as the "unset" sentinel for deadline fields.
    pub(crate) fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64 + 1
    }
}

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    /// Live entry visible to readers.
    Normal = 0,
    /// Placeholder installed while a loader runs; carries no value.
    Loading = 1,
    /// Marked expired by the sweep; removal is imminent.
    Expired = 2,
    /// Unlinked from the map; stale handles must ignore it.
    Removed = 3,
}

impl EntryState {
    fn from_u8(raw: u8) -> EntryState {
        match raw {
            0 => EntryState::Normal,
            1 => EntryState::Loading,
            2 => EntryState::Expired,
            _ => EntryState::Removed,
        }
    }
}

/// A single key/value slot with its metadata.
///
/// The map owns the entry; the access recorder and eviction policy hold
/// non-owning `Arc` handles and must check `state` before acting on them.
#[derive(Debug)]
pub struct CacheEntry<K, V> {
    /// Shared key handle; also stored as the map key.
    key: Arc<K>,
    /// Key hash under the map's hasher, cached for the sketch and policy.
    hash: u64,
    /// Value slot; `None` only while the entry is in `Loading` state.
    value: RwLock<Option<Arc<V>>>,
    /// Creation timestamp, never updated.
    created_at: u64,
    /// Timestamp of the latest write (insert, replace, refresh).
    written_at: AtomicU64,
    /// Timestamp of the latest read, applied lazily by maintenance.
    accessed_at: AtomicU64,
    /// Absolute expiration deadline; `NO_EXPIRY` when unbounded.
    expires_at: AtomicU64,
    /// Entry weight under the configured weigher.
    weight: AtomicU32,
    /// Saturating access counter in `0..=MAX_ACCESS_COUNT`.
    access_count: AtomicU8,
    /// Lifecycle state.
    state: AtomicU8,
}

impl<K, V> CacheEntry<K, V> {
    /// Creates a live entry holding `value`.
    pub(crate) fn new(
        key: Arc<K>,
        hash: u64,
        value: Arc<V>,
        weight: u32,
        now: u64,
        expires_at: Option<u64>,
    ) -> Self {
        CacheEntry {
            key,
            hash,
            value: RwLock::new(Some(value)),
            created_at: now,
            written_at: AtomicU64::new(now),
            accessed_at: AtomicU64::new(now),
            expires_at: AtomicU64::new(expires_at.unwrap_or(NO_EXPIRY)),
            weight: AtomicU32::new(weight),
            access_count: AtomicU8::new(0),
            state: AtomicU8::new(EntryState::Normal as u8),
        }
    }

    /// Creates a `Loading` placeholder for an in-flight load.
    pub(crate) fn loading(key: Arc<K>, hash: u64, now: u64) -> Self {
        CacheEntry {
            key,
            hash,
            value: RwLock::new(None),
            created_at: now,
            written_at: AtomicU64::new(now),
            accessed_at: AtomicU64::new(now),
            expires_at: AtomicU64::new(NO_EXPIRY),
            weight: AtomicU32::new(0),
            access_count: AtomicU8::new(0),
            state: AtomicU8::new(EntryState::Loading as u8),
        }
    }

    /// Shared key handle.
    pub fn key(&self) -> &Arc<K> {
        &self.key
    }

    /// Key hash under the cache's hasher.
    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }

    /// Current value, or `None` while loading or after removal cleared it.
    pub fn value(&self) -> Option<Arc<V>> {
        self.value.read().clone()
    }

    /// Replaces the value and stamps the write time.
    ///
    /// Returns the previous value so callers can report weight deltas.
    pub(crate) fn set_value(&self, value: Arc<V>, weight: u32, now: u64) -> Option<Arc<V>> {
        let mut slot = self.value.write();
        let previous = slot.replace(value);
        self.weight.store(weight, Ordering::Relaxed);
        self.written_at.store(now, Ordering::Relaxed);
        previous
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Unconditionally sets the lifecycle state.
    pub(crate) fn set_state(&self, state: EntryState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Transitions `expected -> next`; returns false when another thread won.
    pub(crate) fn transition(&self, expected: EntryState, next: EntryState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// True once the entry left the map.
    pub(crate) fn is_dead(&self) -> bool {
        matches!(self.state(), EntryState::Removed | EntryState::Expired)
    }

    /// Creation timestamp in cache nanos.
    pub(crate) fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Latest write timestamp in cache nanos.
    pub(crate) fn written_at(&self) -> u64 {
        self.written_at.load(Ordering::Relaxed)
    }

    /// Latest recorded read timestamp in cache nanos.
    pub(crate) fn accessed_at(&self) -> u64 {
        self.accessed_at.load(Ordering::Relaxed)
    }

    /// Entry weight under the configured weigher.
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Saturating access count in `0..=MAX_ACCESS_COUNT`.
    pub fn access_count(&self) -> u8 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Absolute expiration deadline, when one is set.
    pub(crate) fn expires_at(&self) -> Option<u64> {
        match self.expires_at.load(Ordering::Relaxed) {
            NO_EXPIRY => None,
            deadline => Some(deadline),
        }
    }

    /// Sets or clears the absolute expiration deadline.
    pub(crate) fn set_expires_at(&self, deadline: Option<u64>) {
        self.expires_at
            .store(deadline.unwrap_or(NO_EXPIRY), Ordering::Relaxed);
    }

    /// True when a deadline is set and `now` has reached it.
    pub(crate) fn is_expired(&self, now: u64) -> bool {
        match self.expires_at.load(Ordering::Relaxed) {
            NO_EXPIRY => false,
            deadline => now >= deadline,
        }
    }

    /// Applies one read to the lazy metadata: access time and counter.
    ///
    /// Called only from the maintenance drain, never on the hot path.
    pub(crate) fn record_access(&self, now: u64) {
        self.accessed_at.store(now, Ordering::Relaxed);
        let mut current = self.access_count.load(Ordering::Relaxed);
        while current < MAX_ACCESS_COUNT {
            match self.access_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Age of the latest write relative to `now`.
    pub(crate) fn time_since_write(&self, now: u64) -> Duration {
        Duration::from_nanos(now.saturating_sub(self.written_at()))
    }
}
