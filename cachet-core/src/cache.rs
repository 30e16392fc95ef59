//! # Cache Facade
//!
//! The public cache type: bounded concurrent storage with pluggable
//! eviction, expiration, statistics, listeners, and at-most-once async
//! loading.
//!
//! ## Design Principles
//!
//! 1. **Non-Blocking Hot Path**: `get` takes one shard read lock and pushes
//!    one event into the access recorder; it never mutates policy state.
//! 2. **Cooperative Maintenance**: a background worker drains the recorder
//!    on an interval, and writers opportunistically run a cycle when the
//!    recorder demands one, so bounds are enforced promptly either way.
//! 3. **Composition Over Hierarchy**: the facade owns a storage map, a
//!    policy, and an optional loader as capabilities; there is no dynamic
//!    dispatch on the read path.
//!
//! ## Structure Overview
//!
//! ```text
//! Cache
//!   └── CacheInner
//!         ├── map: StorageMap            (sharded key -> entry)
//!         ├── buffer: StripedBuffer      (hot-path access events)
//!         ├── maint: Mutex<MaintenanceState>
//!         │     ├── policy  (lru / lfu / fifo / filo / weight / tiny-lfu)
//!         │     ├── sketch  (count-min frequency estimates)
//!         │     └── expiry  (deadline min-heap)
//!         ├── inflight: InflightTable    (at-most-once loads)
//!         └── stats / listeners / clock
//! ```

use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::{AccessEvent, AccessKind, StripedBuffer};
use crate::config::{CacheBuilder, ValidatorFn, WeigherFn};
use crate::entry::{CacheEntry, Clock, EntryState};
use crate::error::{CacheError, CacheResult};
use crate::event::{CacheEvent, EventListener, EvictionReason};
use crate::loader::{CacheLoader, InflightTable, JoinOutcome};
use crate::maintenance::MaintenanceState;
use crate::map::{ComputeOp, ComputeOutcome, StorageMap};
use crate::policy::build_policy;
use crate::sketch::FrequencySketch;
use crate::stats::{CacheStats, StatsRecorder};

/// Concurrent bounded cache.
///
/// Handles are cheap to clone and share one underlying cache. Dropping the
/// last handle stops the maintenance worker; [`Cache::close`] does so
/// eagerly and fails all later operations with `InvalidState`.
pub struct Cache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Cache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> std::fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("policy", &self.inner.policy_name)
            .field("entries", &self.inner.live.load(Ordering::Relaxed))
            .finish()
    }
}

pub(crate) struct CacheInner<K, V> {
    map: StorageMap<K, V>,
    buffer: StripedBuffer<K, V>,
    maint: Mutex<MaintenanceState<K, V>>,
    stats: StatsRecorder,
    listeners: Box<[EventListener<K, V>]>,
    weigher: Option<WeigherFn<K, V>>,
    validator: Option<ValidatorFn<K, V>>,
    loader: Option<Arc<dyn CacheLoader<K, V>>>,
    inflight: InflightTable<K, V>,
    clock: Clock,
    maximum_size: Option<u64>,
    maximum_weight: Option<u64>,
    expire_after_write: Option<u64>,
    expire_after_access: Option<u64>,
    refresh_after_write: Option<u64>,
    load_timeout: Option<Duration>,
    policy_name: &'static str,
    bounded: bool,
    /// Count of `Normal` entries.
    live: AtomicU64,
    /// Sum of `Normal` entry weights.
    weight: AtomicU64,
    closed: AtomicBool,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Starts configuring a new cache.
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::default()
    }

    pub(crate) fn from_builder(builder: CacheBuilder<K, V>) -> Cache<K, V> {
        let concurrency = builder.concurrency_level.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|count| count.get())
                .unwrap_or(1)
        });

        let sketch = builder.sketch.map(|mode| {
            let sized_for = builder
                .maximum_size
                .or(builder.maximum_weight)
                .unwrap_or(65_536)
                .min(1 << 20);
            FrequencySketch::new(mode, sized_for)
        });
        let policy = build_policy::<K, V>(builder.policy, builder.capacity_bound());
        let bounded = builder.is_bounded();

        let inner = Arc::new(CacheInner {
            map: StorageMap::new(concurrency, builder.initial_capacity),
            buffer: StripedBuffer::new(),
            maint: Mutex::new(MaintenanceState::new(policy, sketch)),
            stats: StatsRecorder::new(builder.record_stats),
            listeners: builder.listeners.into_boxed_slice(),
            weigher: builder.weigher,
            validator: builder.validator,
            loader: builder.loader,
            inflight: InflightTable::new(),
            clock: Clock::new(),
            maximum_size: builder.maximum_size,
            maximum_weight: builder.maximum_weight,
            expire_after_write: builder.expire_after_write.map(|d| d.as_nanos() as u64),
            expire_after_access: builder.expire_after_access.map(|d| d.as_nanos() as u64),
            refresh_after_write: builder.refresh_after_write.map(|d| d.as_nanos() as u64),
            load_timeout: builder.load_timeout,
            policy_name: builder.policy.name(),
            bounded,
            live: AtomicU64::new(0),
            weight: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        });

        if builder.background_maintenance {
            let weak = Arc::downgrade(&inner);
            let shutdown = Arc::clone(&inner.shutdown);
            let interval = builder.maintenance_interval;
            let handle = std::thread::Builder::new()
                .name("cachet-maintenance".to_string())
                .spawn(move || maintenance_worker(weak, shutdown, interval))
                .expect("spawn maintenance worker");
            *inner.worker.lock() = Some(handle);
        }

        Cache { inner }
    }

    /// Returns the value mapped to `key`, without triggering a load.
    ///
    /// Expired and still-loading entries read as absent.
    pub fn get(&self, key: &K) -> CacheResult<Option<Arc<V>>> {
        self.inner.check_open()?;
        self.inner.validate(key, None)?;
        let now = self.inner.clock.now();

        match self.inner.map.get(key) {
            Some(entry) if entry.state() == EntryState::Normal => {
                if entry.is_expired(now) {
                    self.inner.stats.record_miss();
                    self.inner.maintain();
                    return Ok(None);
                }
                let value = entry.value();
                self.inner.stats.record_hit();
                self.inner.record_event(AccessKind::Read, &entry);
                maybe_refresh(&self.inner, &entry, now);
                Ok(value)
            }
            _ => {
                self.inner.stats.record_miss();
                Ok(None)
            }
        }
    }

    /// Inserts or replaces the value for `key`.
    pub fn put(&self, key: K, value: V) -> CacheResult<()> {
        self.inner.check_open()?;
        self.inner.validate(&key, Some(&value))?;

        let key = Arc::new(key);
        let value = Arc::new(value);
        let weight = self.inner.weigh(&key, &value);
        let now = self.inner.clock.now();
        let expires_at = self.inner.write_deadline(now);

        let outcome = self.inner.map.compute(Arc::clone(&key), now, |_| ComputeOp::Write {
            value: Arc::clone(&value),
            weight,
            expires_at,
        });

        self.inner.apply_write(&outcome, weight);
        self.inner.emit(&CacheEvent::Put {
            key,
            value,
        });
        if let Some(entry) = &outcome.entry {
            self.inner.record_event(AccessKind::Write, entry);
        }
        self.inner.maintain();
        Ok(())
    }

    /// Inserts `value` unless the key already holds a live one, which is
    /// returned instead.
    pub fn put_if_absent(&self, key: K, value: V) -> CacheResult<Option<Arc<V>>> {
        self.inner.check_open()?;
        self.inner.validate(&key, Some(&value))?;

        let key = Arc::new(key);
        let value = Arc::new(value);
        let weight = self.inner.weigh(&key, &value);
        let now = self.inner.clock.now();
        let expires_at = self.inner.write_deadline(now);

        let outcome = self
            .inner
            .map
            .compute(Arc::clone(&key), now, |existing| match existing {
                Some(entry)
                    if entry.state() == EntryState::Normal && !entry.is_expired(now) =>
                {
                    ComputeOp::Keep
                }
                _ => ComputeOp::Write {
                    value: Arc::clone(&value),
                    weight,
                    expires_at,
                },
            });

        if !outcome.wrote {
            return Ok(outcome.previous);
        }

        self.inner.apply_write(&outcome, weight);
        self.inner.emit(&CacheEvent::Put {
            key,
            value,
        });
        if let Some(entry) = &outcome.entry {
            self.inner.record_event(AccessKind::Write, entry);
        }
        self.inner.maintain();
        Ok(None)
    }

    /// Removes the mapping for `key`, returning the removed live value.
    pub fn remove(&self, key: K) -> CacheResult<Option<Arc<V>>> {
        self.inner.check_open()?;
        self.inner.validate(&key, None)?;

        let key = Arc::new(key);
        let now = self.inner.clock.now();
        let outcome = self
            .inner
            .map
            .compute(Arc::clone(&key), now, |existing| match existing {
                Some(_) => ComputeOp::Remove,
                None => ComputeOp::Keep,
            });

        let Some(removed) = outcome.removed else {
            return Ok(None);
        };

        match removed.value() {
            None => {
                // A loading placeholder was removed; abort its load.
                self.inner.inflight.cancel(&key);
                Ok(None)
            }
            Some(value) => {
                self.inner.on_entry_gone(&removed);
                self.inner.record_event(AccessKind::Remove, &removed);
                if removed.is_expired(now) {
                    self.inner.stats.record_expiration();
                    self.inner.emit(&CacheEvent::Expire {
                        key,
                        value,
                    });
                    Ok(None)
                } else {
                    self.inner.emit(&CacheEvent::Remove {
                        key,
                        value: Arc::clone(&value),
                    });
                    Ok(Some(value))
                }
            }
        }
    }

    /// Atomically rewrites the mapping for `key`.
    ///
    /// `f` receives the current live value and decides the new one: `None`
    /// removes the mapping. At most one `compute` runs per key at a time;
    /// keep `f` short, it executes under the key's shard lock.
    pub fn compute<F>(&self, key: K, f: F) -> CacheResult<Option<Arc<V>>>
    where
        F: FnOnce(&K, Option<Arc<V>>) -> Option<V>,
    {
        self.inner.check_open()?;
        self.inner.validate(&key, None)?;

        let key = Arc::new(key);
        let now = self.inner.clock.now();
        let weigher = self.inner.weigher.clone();
        let expires_at = self.inner.write_deadline(now);

        let mut new_weight = 0u32;
        let outcome = {
            let key_for_f = Arc::clone(&key);
            let new_weight = &mut new_weight;
            self.inner.map.compute(Arc::clone(&key), now, move |existing| {
                let current = existing.and_then(|entry| {
                    if entry.state() == EntryState::Normal && !entry.is_expired(now) {
                        entry.value()
                    } else {
                        None
                    }
                });
                match f(key_for_f.as_ref(), current) {
                    Some(value) => {
                        let weight = weigher
                            .as_ref()
                            .map(|w| w(key_for_f.as_ref(), &value))
                            .unwrap_or(1);
                        *new_weight = weight;
                        ComputeOp::Write {
                            value: Arc::new(value),
                            weight,
                            expires_at,
                        }
                    }
                    None if existing.is_some() => ComputeOp::Remove,
                    None => ComputeOp::Keep,
                }
            })
        };

        if outcome.wrote {
            self.inner.apply_write(&outcome, new_weight);
            let entry = outcome.entry.as_ref().expect("write outcome has an entry");
            let value = entry.value().expect("written entry has a value");
            self.inner.emit(&CacheEvent::Put {
                key,
                value: Arc::clone(&value),
            });
            self.inner.record_event(AccessKind::Write, entry);
            self.inner.maintain();
            return Ok(Some(value));
        }

        if let Some(removed) = outcome.removed {
            if let Some(value) = removed.value() {
                self.inner.on_entry_gone(&removed);
                self.inner.record_event(AccessKind::Remove, &removed);
                if removed.is_expired(now) {
                    self.inner.stats.record_expiration();
                    self.inner.emit(&CacheEvent::Expire {
                        key,
                        value,
                    });
                } else {
                    self.inner.emit(&CacheEvent::Remove {
                        key,
                        value,
                    });
                }
            } else {
                self.inner.inflight.cancel(&key);
            }
            return Ok(None);
        }

        Ok(None)
    }

    /// Returns the cached value for `key`, loading it with the configured
    /// loader on a miss.
    ///
    /// Concurrent callers for the same key share a single loader run and
    /// all observe its outcome.
    pub async fn get_with(&self, key: K) -> CacheResult<Arc<V>> {
        self.inner.check_open()?;
        self.inner.validate(&key, None)?;
        let loader = self
            .inner
            .loader
            .clone()
            .ok_or_else(|| CacheError::configuration("get_with requires a loader"))?;

        let key = Arc::new(key);
        let now = self.inner.clock.now();

        if let Some(entry) = self.inner.map.get(&key) {
            if entry.state() == EntryState::Normal && !entry.is_expired(now) {
                if let Some(value) = entry.value() {
                    self.inner.stats.record_hit();
                    self.inner.record_event(AccessKind::Read, &entry);
                    maybe_refresh(&self.inner, &entry, now);
                    return Ok(value);
                }
            }
        }
        self.inner.stats.record_miss();

        let inner = Arc::clone(&self.inner);
        let outcome = self.inner.inflight.join_or_start(&key, |cancelled, notify| {
            let key = Arc::clone(&key);
            run_load(inner, key, loader, cancelled, notify)
        });
        let load = match outcome {
            JoinOutcome::Started(load) | JoinOutcome::Joined(load) => load,
        };
        load.shared.clone().await
    }

    /// Cancels the in-flight load for `key`, if any.
    ///
    /// Waiters observe `LoadCancelled`; a loader already running finishes
    /// but its result is discarded.
    pub fn cancel_load(&self, key: &K) -> bool {
        let cancelled = self.inner.inflight.cancel(key);
        if let Some(entry) = self.inner.map.get(key) {
            if entry.state() == EntryState::Loading {
                self.inner.map.remove(key, Some(&entry));
            }
        }
        cancelled
    }

    /// True when `key` maps to a live, unexpired value.
    ///
    /// Does not count as a read: no statistics, no recency update.
    pub fn contains_key(&self, key: &K) -> bool {
        let now = self.inner.clock.now();
        matches!(
            self.inner.map.get(key),
            Some(entry) if entry.state() == EntryState::Normal && !entry.is_expired(now)
        )
    }

    /// Number of live entries.
    pub fn size(&self) -> u64 {
        self.inner.live.load(Ordering::Relaxed)
    }

    /// Sum of live entry weights.
    pub fn weight(&self) -> u64 {
        self.inner.weight.load(Ordering::Relaxed)
    }

    /// Removes every entry and emits one `Clear` event.
    pub fn clear(&self) -> CacheResult<()> {
        self.inner.check_open()?;
        let drained = self.inner.map.clear();
        for entry in &drained {
            if entry.value().is_some() {
                self.inner.on_entry_gone(entry);
            }
        }
        self.inner.maint.lock().reset();
        self.inner.emit(&CacheEvent::Clear);
        Ok(())
    }

    /// Alias of [`Cache::clear`].
    pub fn invalidate_all(&self) -> CacheResult<()> {
        self.clear()
    }

    /// Visits every live entry; weakly consistent.
    pub fn for_each<F>(&self, mut f: F) -> CacheResult<()>
    where
        F: FnMut(&K, &Arc<V>),
    {
        self.inner.check_open()?;
        let now = self.inner.clock.now();
        self.inner.map.for_each(|entry| {
            if entry.state() == EntryState::Normal && !entry.is_expired(now) {
                if let Some(value) = entry.value() {
                    f(entry.key(), &value);
                }
            }
        });
        Ok(())
    }

    /// Snapshot of the hit/miss/eviction/load counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    /// Stable name of the configured eviction policy.
    pub fn policy_name(&self) -> &'static str {
        self.inner.policy_name
    }

    /// Drains pending access events, expires due entries, and enforces the
    /// configured bounds on the calling thread.
    pub fn run_pending_tasks(&self) {
        self.inner.force_maintain();
    }

    /// Closes the cache: later operations fail with `InvalidState`, pending
    /// maintenance is drained, and in-flight loads are cancelled.
    ///
    /// Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let worker = self.inner.worker.lock().take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
        self.inner.inflight.cancel_all();
        self.inner.force_maintain();
        tracing::debug!(policy = self.inner.policy_name, "cache closed");
    }

    /// True once [`Cache::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn check_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(CacheError::InvalidState)
        } else {
            Ok(())
        }
    }

    fn validate(&self, key: &K, value: Option<&V>) -> CacheResult<()> {
        match &self.validator {
            Some(validator) => validator(key, value),
            None => Ok(()),
        }
    }

    fn weigh(&self, key: &K, value: &V) -> u32 {
        self.weigher
            .as_ref()
            .map(|weigher| weigher(key, value))
            .unwrap_or(1)
    }

    fn write_deadline(&self, now: u64) -> Option<u64> {
        self.expire_after_write
            .or(self.expire_after_access)
            .map(|ttl| now + ttl)
    }

    /// Applies live-count and weight accounting after a `Write` outcome.
    fn apply_write(&self, outcome: &ComputeOutcome<K, V>, new_weight: u32) {
        if outcome.inserted || outcome.activated {
            self.live.fetch_add(1, Ordering::Relaxed);
            self.weight.fetch_add(new_weight as u64, Ordering::Relaxed);
        } else if outcome.wrote {
            self.weight.fetch_add(new_weight as u64, Ordering::Relaxed);
            self.weight
                .fetch_sub(outcome.previous_weight as u64, Ordering::Relaxed);
        }
    }

    /// Reverses accounting for a live entry that left the map.
    fn on_entry_gone(&self, entry: &Arc<CacheEntry<K, V>>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        self.weight
            .fetch_sub(entry.weight() as u64, Ordering::Relaxed);
    }

    fn emit(&self, event: &CacheEvent<K, V>) {
        for listener in self.listeners.iter() {
            listener(event);
        }
    }

    /// Pushes an access event; writes and removals are never dropped.
    fn record_event(&self, kind: AccessKind, entry: &Arc<CacheEntry<K, V>>) {
        let offered = self.buffer.offer(AccessEvent {
            kind,
            entry: Arc::clone(entry),
        });
        if !offered {
            if kind == AccessKind::Read {
                // Reads are lossy; just help drain.
                self.maintain();
            } else {
                self.force_maintain();
                let _ = self.buffer.offer(AccessEvent {
                    kind,
                    entry: Arc::clone(entry),
                });
            }
        } else if self.buffer.is_drain_required() {
            self.maintain();
        }
    }

    /// Runs a maintenance cycle unless another consumer owns it.
    fn maintain(&self) {
        if let Some(mut state) = self.maint.try_lock() {
            self.run_cycle(&mut state);
        }
    }

    /// Runs a maintenance cycle, waiting for the consumer slot.
    fn force_maintain(&self) {
        let mut state = self.maint.lock();
        self.run_cycle(&mut state);
    }

    fn run_cycle(&self, state: &mut MaintenanceState<K, V>) {
        let now = self.clock.now();

        if self.buffer.try_begin_drain() {
            self.buffer
                .drain(|event| state.apply(event, now, self.expire_after_access));
        }

        while let Some(entry) = state.pop_due(now) {
            if !entry.transition(EntryState::Normal, EntryState::Expired) {
                continue;
            }
            if let Some(removed) = self.map.remove(entry.key(), Some(&entry)) {
                self.on_entry_gone(&removed);
                state.policy.record_removal(&removed);
                self.stats.record_expiration();
                if let Some(value) = removed.value() {
                    self.emit(&CacheEvent::Expire {
                        key: Arc::clone(removed.key()),
                        value,
                    });
                }
            }
        }

        if self.bounded {
            self.enforce_bounds(state);
        }
    }

    fn enforce_bounds(&self, state: &mut MaintenanceState<K, V>) {
        loop {
            let over_size = self
                .maximum_size
                .map(|max| self.live.load(Ordering::Relaxed) > max)
                .unwrap_or(false);
            let over_weight = self
                .maximum_weight
                .map(|max| self.weight.load(Ordering::Relaxed) > max)
                .unwrap_or(false);
            if !over_size && !over_weight {
                return;
            }

            match state.policy.pop_victim(state.sketch.as_ref()) {
                Some(victim) => {
                    if victim.is_dead() {
                        continue;
                    }
                    if let Some(removed) = self.map.remove(victim.key(), Some(&victim)) {
                        self.on_entry_gone(&removed);
                        self.stats.record_eviction();
                        let reason = if over_size {
                            EvictionReason::Size
                        } else {
                            EvictionReason::Weight
                        };
                        if let Some(value) = removed.value() {
                            self.emit(&CacheEvent::Evict {
                                key: Arc::clone(removed.key()),
                                value,
                                reason,
                            });
                        }
                    }
                }
                None => {
                    state.eviction_failures += 1;
                    tracing::warn!(
                        policy = self.policy_name,
                        live = self.live.load(Ordering::Relaxed),
                        "eviction failure: policy has no victim while over bound"
                    );
                    return;
                }
            }
        }
    }

}

/// Schedules an asynchronous reload when the entry has aged past the
/// refresh threshold. The stale value keeps being served meanwhile.
fn maybe_refresh<K, V>(inner: &Arc<CacheInner<K, V>>, entry: &Arc<CacheEntry<K, V>>, now: u64)
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let Some(threshold) = inner.refresh_after_write else {
        return;
    };
    let Some(loader) = inner.loader.clone() else {
        return;
    };
    if entry.time_since_write(now) < Duration::from_nanos(threshold) {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        // No runtime on this thread; the stale value stands until a caller
        // inside one trips the refresh.
        return;
    };

    let key = Arc::clone(entry.key());
    let refresh_inner = Arc::clone(inner);
    let started = inner.inflight.start_if_vacant(&key, |cancelled, notify| {
        run_refresh(refresh_inner, Arc::clone(&key), loader, cancelled, notify)
    });
    if let Some(load) = started {
        let _ = handle.spawn(load.shared);
    }
}

/// Background worker: periodically runs maintenance until the cache is
/// dropped or shut down.
fn maintenance_worker<K, V>(
    cache: Weak<CacheInner<K, V>>,
    shutdown: Arc<AtomicBool>,
    interval: Duration,
) where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(interval);
        match cache.upgrade() {
            Some(inner) => {
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                inner.force_maintain();
            }
            None => return,
        }
    }
}

/// Drives one at-most-once load: installs the loading placeholder, runs the
/// loader, and publishes the outcome.
async fn run_load<K, V>(
    inner: Arc<CacheInner<K, V>>,
    key: Arc<K>,
    loader: Arc<dyn CacheLoader<K, V>>,
    cancelled: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
) -> Result<Arc<V>, CacheError>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let result = drive_load(&inner, &key, &loader, &cancelled, &notify).await;
    inner.inflight.complete(&key);
    result
}

async fn drive_load<K, V>(
    inner: &Arc<CacheInner<K, V>>,
    key: &Arc<K>,
    loader: &Arc<dyn CacheLoader<K, V>>,
    cancelled: &AtomicBool,
    notify: &tokio::sync::Notify,
) -> Result<Arc<V>, CacheError>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // Install (or adopt) the loading placeholder.
    let sentinel = loop {
        let now = inner.clock.now();
        let hash = inner.map.hash(key);
        let fresh = Arc::new(CacheEntry::loading(Arc::clone(key), hash, now));
        match inner.map.put_if_absent(Arc::clone(&fresh)) {
            None => break fresh,
            Some(existing) => match existing.state() {
                EntryState::Loading => break existing,
                EntryState::Normal if !existing.is_expired(now) => {
                    if let Some(value) = existing.value() {
                        return Ok(value);
                    }
                }
                EntryState::Normal => {
                    if let Some(removed) = inner.map.remove(key, Some(&existing)) {
                        inner.on_entry_gone(&removed);
                        inner.stats.record_expiration();
                        inner.record_event(AccessKind::Remove, &removed);
                        if let Some(value) = removed.value() {
                            inner.emit(&CacheEvent::Expire {
                                key: Arc::clone(key),
                                value,
                            });
                        }
                    }
                }
                _ => {}
            },
        }
        // A dying entry is mid-removal; let its owner finish.
        tokio::task::yield_now().await;
    };

    if cancelled.load(Ordering::Acquire) {
        discard_sentinel(inner, key, &sentinel);
        return Err(CacheError::LoadCancelled);
    }

    let started = Instant::now();
    let outcome = tokio::select! {
        _ = notify.notified() => None,
        result = call_loader(loader, key, inner.load_timeout) => Some(result),
    };
    let elapsed = started.elapsed();

    match outcome {
        None => {
            discard_sentinel(inner, key, &sentinel);
            Err(CacheError::LoadCancelled)
        }
        Some(Ok(value)) => {
            let value = Arc::new(value);
            let weight = inner.weigh(key, &value);
            let now = inner.clock.now();
            let expires_at = inner.write_deadline(now);

            let compute_outcome =
                inner
                    .map
                    .compute(Arc::clone(key), now, |existing| match existing {
                        Some(entry) if Arc::ptr_eq(entry, &sentinel) => ComputeOp::Write {
                            value: Arc::clone(&value),
                            weight,
                            expires_at,
                        },
                        // A racing put installed a value, or the key was
                        // removed while loading; either way the load result
                        // is not installed.
                        _ => ComputeOp::Keep,
                    });

            inner.stats.record_load_success(elapsed);
            if compute_outcome.wrote {
                inner.apply_write(&compute_outcome, weight);
                let entry = compute_outcome
                    .entry
                    .as_ref()
                    .expect("write outcome has an entry");
                inner.emit(&CacheEvent::Load {
                    key: Arc::clone(key),
                    value: Arc::clone(&value),
                });
                inner.record_event(AccessKind::Write, entry);
                inner.maintain();
                Ok(value)
            } else {
                // Serve whatever won the race, falling back to the loaded
                // value for our own waiters.
                match compute_outcome.entry.as_ref().and_then(|e| e.value()) {
                    Some(current) => Ok(current),
                    None => Ok(value),
                }
            }
        }
        Some(Err(error)) => {
            discard_sentinel(inner, key, &sentinel);
            inner.stats.record_load_failure(elapsed);
            inner.emit(&CacheEvent::LoadError {
                key: Arc::clone(key),
            });
            Err(error)
        }
    }
}

/// Refresh-after-write: reload in the background and swap the value in
/// place if the entry is still live.
async fn run_refresh<K, V>(
    inner: Arc<CacheInner<K, V>>,
    key: Arc<K>,
    loader: Arc<dyn CacheLoader<K, V>>,
    cancelled: Arc<AtomicBool>,
    notify: Arc<tokio::sync::Notify>,
) -> Result<Arc<V>, CacheError>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    let result = async {
        if cancelled.load(Ordering::Acquire) {
            return Err(CacheError::LoadCancelled);
        }
        let started = Instant::now();
        let outcome = tokio::select! {
            _ = notify.notified() => None,
            result = call_loader(&loader, &key, inner.load_timeout) => Some(result),
        };
        let elapsed = started.elapsed();

        match outcome {
            None => Err(CacheError::LoadCancelled),
            Some(Ok(value)) => {
                let value = Arc::new(value);
                let weight = inner.weigh(&key, &value);
                let now = inner.clock.now();
                let expires_at = inner.write_deadline(now);

                let compute_outcome =
                    inner
                        .map
                        .compute(Arc::clone(&key), now, |existing| match existing {
                            Some(entry) if entry.state() == EntryState::Normal => {
                                ComputeOp::Write {
                                    value: Arc::clone(&value),
                                    weight,
                                    expires_at,
                                }
                            }
                            // The entry left the cache while refreshing; do
                            // not resurrect it.
                            _ => ComputeOp::Keep,
                        });

                inner.stats.record_load_success(elapsed);
                if compute_outcome.wrote {
                    inner.apply_write(&compute_outcome, weight);
                    let entry = compute_outcome
                        .entry
                        .as_ref()
                        .expect("write outcome has an entry");
                    inner.emit(&CacheEvent::Load {
                        key: Arc::clone(&key),
                        value: Arc::clone(&value),
                    });
                    inner.record_event(AccessKind::Write, entry);
                }
                Ok(value)
            }
            Some(Err(error)) => {
                // The stale value stays in place.
                inner.stats.record_load_failure(elapsed);
                inner.emit(&CacheEvent::LoadError {
                    key: Arc::clone(&key),
                });
                Err(error)
            }
        }
    }
    .await;
    inner.inflight.complete(&key);
    result
}

async fn call_loader<K, V>(
    loader: &Arc<dyn CacheLoader<K, V>>,
    key: &K,
    limit: Option<Duration>,
) -> Result<V, CacheError>
where
    K: Send + Sync,
    V: Send + Sync,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, loader.load(key)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(CacheError::load_failed(error.to_string())),
            Err(_) => Err(CacheError::load_timeout()),
        },
        None => loader
            .load(key)
            .await
            .map_err(|error| CacheError::load_failed(error.to_string())),
    }
}

fn discard_sentinel<K, V>(
    inner: &CacheInner<K, V>,
    key: &K,
    sentinel: &Arc<CacheEntry<K, V>>,
) where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    if let Some(entry) = inner.map.get(key) {
        if Arc::ptr_eq(&entry, sentinel) && entry.state() == EntryState::Loading {
            inner.map.remove(key, Some(sentinel));
        }
    }
}
