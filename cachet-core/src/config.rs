//! # Cache Configuration
//!
//! Builder for cache options. Every option is validated once at `build`;
//! a nonsensical combination fails construction instead of misbehaving at
//! runtime.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::error::{CacheError, CacheResult};
use crate::event::EventListener;
use crate::loader::CacheLoader;
use crate::policy::PolicyKind;
use crate::sketch::SketchMode;

/// Computes the weight of an entry; invoked on every write.
pub type WeigherFn<K, V> = Arc<dyn Fn(&K, &V) -> u32 + Send + Sync>;

/// Screens keys (and values, on writes) before they touch the cache.
///
/// A rejection propagates to the caller as `InvalidKey`/`InvalidValue` and
/// leaves the cache untouched.
pub type ValidatorFn<K, V> = Arc<dyn Fn(&K, Option<&V>) -> CacheResult<()> + Send + Sync>;

/// Default interval of the background maintenance worker.
const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(50);

/// Default initial capacity hint for the storage map.
const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// Options for a [`Cache`]; obtained through [`Cache::builder`].
pub struct CacheBuilder<K, V> {
    pub(crate) maximum_size: Option<u64>,
    pub(crate) maximum_weight: Option<u64>,
    pub(crate) weigher: Option<WeigherFn<K, V>>,
    pub(crate) expire_after_write: Option<Duration>,
    pub(crate) expire_after_access: Option<Duration>,
    pub(crate) refresh_after_write: Option<Duration>,
    pub(crate) load_timeout: Option<Duration>,
    pub(crate) policy: PolicyKind,
    pub(crate) sketch: Option<SketchMode>,
    pub(crate) initial_capacity: usize,
    pub(crate) concurrency_level: Option<usize>,
    pub(crate) record_stats: bool,
    pub(crate) listeners: Vec<EventListener<K, V>>,
    pub(crate) validator: Option<ValidatorFn<K, V>>,
    pub(crate) loader: Option<Arc<dyn CacheLoader<K, V>>>,
    pub(crate) maintenance_interval: Duration,
    pub(crate) background_maintenance: bool,
}

impl<K, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        CacheBuilder {
            maximum_size: None,
            maximum_weight: None,
            weigher: None,
            expire_after_write: None,
            expire_after_access: None,
            refresh_after_write: None,
            load_timeout: None,
            policy: PolicyKind::TinyLfu,
            sketch: Some(SketchMode::Basic),
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            concurrency_level: None,
            record_stats: false,
            listeners: Vec::new(),
            validator: None,
            loader: None,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            background_maintenance: true,
        }
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: std::hash::Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Bounds the cache at `size` live entries.
    pub fn maximum_size(mut self, size: u64) -> Self {
        self.maximum_size = Some(size);
        self
    }

    /// Bounds the cache at `weight` total weight units; requires a weigher.
    pub fn maximum_weight(mut self, weight: u64) -> Self {
        self.maximum_weight = Some(weight);
        self
    }

    /// Sets the function that weighs each entry.
    pub fn weigher(mut self, weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static) -> Self {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Expires entries `duration` after their latest write.
    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        self.expire_after_write = Some(duration);
        self
    }

    /// Expires entries `duration` after their latest recorded access.
    pub fn expire_after_access(mut self, duration: Duration) -> Self {
        self.expire_after_access = Some(duration);
        self
    }

    /// Schedules an asynchronous reload once a read finds an entry older
    /// than `duration`; the stale value keeps being served meanwhile.
    pub fn refresh_after_write(mut self, duration: Duration) -> Self {
        self.refresh_after_write = Some(duration);
        self
    }

    /// Fails loads that run longer than `duration` with a timeout error.
    pub fn load_timeout(mut self, duration: Duration) -> Self {
        self.load_timeout = Some(duration);
        self
    }

    /// Selects the eviction policy; the default is W-TinyLFU.
    pub fn eviction_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    /// Selects the frequency sketch precision, or `None` to disable it.
    pub fn frequency_sketch(mut self, mode: Option<SketchMode>) -> Self {
        self.sketch = mode;
        self
    }

    /// Pre-sizes the storage map for about `capacity` entries.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Hints how many threads will mutate the cache concurrently; guides
    /// the shard count.
    pub fn concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = Some(level);
        self
    }

    /// Enables the hit/miss/eviction/load counters.
    pub fn record_stats(mut self, enabled: bool) -> Self {
        self.record_stats = enabled;
        self
    }

    /// Registers a listener for cache events; may be called repeatedly.
    pub fn listener(mut self, listener: impl Fn(&crate::event::CacheEvent<K, V>) + Send + Sync + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Installs a validator consulted before reads and writes.
    pub fn validator(
        mut self,
        validator: impl Fn(&K, Option<&V>) -> CacheResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Installs the loader used by `get_with` and refresh-after-write.
    pub fn loader(mut self, loader: Arc<dyn CacheLoader<K, V>>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Overrides the background maintenance cadence.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Disables the dedicated maintenance worker; drains then run only
    /// opportunistically on caller threads.
    pub fn background_maintenance(mut self, enabled: bool) -> Self {
        self.background_maintenance = enabled;
        self
    }

    /// Validates the options and constructs the cache.
    pub fn build(self) -> CacheResult<Cache<K, V>> {
        self.validate()?;
        Ok(Cache::from_builder(self))
    }

    fn validate(&self) -> CacheResult<()> {
        if self.maximum_size == Some(0) {
            return Err(CacheError::configuration("maximum_size must be positive"));
        }
        if self.maximum_weight == Some(0) {
            return Err(CacheError::configuration("maximum_weight must be positive"));
        }
        if self.maximum_size.is_some() && self.maximum_weight.is_some() {
            return Err(CacheError::configuration(
                "maximum_size and maximum_weight are mutually exclusive",
            ));
        }
        if self.maximum_weight.is_some() && self.weigher.is_none() {
            return Err(CacheError::configuration(
                "maximum_weight requires a weigher",
            ));
        }
        if self.weigher.is_some() && self.maximum_weight.is_none() {
            return Err(CacheError::configuration(
                "a weigher requires maximum_weight",
            ));
        }
        for (label, duration) in [
            ("expire_after_write", self.expire_after_write),
            ("expire_after_access", self.expire_after_access),
            ("refresh_after_write", self.refresh_after_write),
            ("load_timeout", self.load_timeout),
        ] {
            if duration == Some(Duration::ZERO) {
                return Err(CacheError::configuration(format!(
                    "{label} must be positive"
                )));
            }
        }
        if self.refresh_after_write.is_some() && self.loader.is_none() {
            return Err(CacheError::configuration(
                "refresh_after_write requires a loader",
            ));
        }
        if let (Some(refresh), Some(expire)) = (self.refresh_after_write, self.expire_after_write) {
            if refresh >= expire {
                return Err(CacheError::configuration(
                    "refresh_after_write must be shorter than expire_after_write",
                ));
            }
        }
        if self.policy == PolicyKind::TinyLfu && self.sketch.is_none() {
            return Err(CacheError::configuration(
                "the tiny-lfu policy requires a frequency sketch",
            ));
        }
        if self.maintenance_interval == Duration::ZERO {
            return Err(CacheError::configuration(
                "maintenance_interval must be positive",
            ));
        }
        Ok(())
    }

    /// The bound the eviction policy segments itself against.
    pub(crate) fn capacity_bound(&self) -> u64 {
        self.maximum_size
            .or(self.maximum_weight)
            .unwrap_or(u64::MAX / 2)
    }

    /// Whether any bound makes eviction possible at all.
    pub(crate) fn is_bounded(&self) -> bool {
        self.maximum_size.is_some() || self.maximum_weight.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CacheBuilder<String, u32> {
        Cache::builder()
    }

    fn reason(result: CacheResult<Cache<String, u32>>) -> String {
        match result {
            Err(CacheError::Configuration { reason }) => reason,
            Err(other) => panic!("expected configuration error, got {other:?}"),
            Ok(_) => panic!("expected configuration error"),
        }
    }

    #[test]
    fn default_build_succeeds() {
        assert!(builder().build().is_ok());
    }

    #[test]
    fn zero_bounds_are_rejected() {
        assert!(reason(builder().maximum_size(0).build()).contains("maximum_size"));
        assert!(
            reason(builder().maximum_weight(0).weigher(|_, _| 1).build())
                .contains("maximum_weight")
        );
    }

    #[test]
    fn weigher_and_weight_must_pair() {
        assert!(reason(builder().maximum_weight(10).build()).contains("weigher"));
        assert!(reason(builder().weigher(|_, _| 1).build()).contains("maximum_weight"));
    }

    #[test]
    fn size_and_weight_are_exclusive() {
        let result = builder()
            .maximum_size(10)
            .maximum_weight(10)
            .weigher(|_, _| 1)
            .build();
        assert!(reason(result).contains("mutually exclusive"));
    }

    #[test]
    fn refresh_requires_loader_and_headroom() {
        assert!(reason(
            builder()
                .refresh_after_write(Duration::from_secs(1))
                .build()
        )
        .contains("loader"));

        struct Noop;
        #[async_trait::async_trait]
        impl CacheLoader<String, u32> for Noop {
            async fn load(&self, _key: &String) -> Result<u32, crate::loader::LoadError> {
                Ok(0)
            }
        }
        let result = builder()
            .loader(Arc::new(Noop))
            .refresh_after_write(Duration::from_secs(2))
            .expire_after_write(Duration::from_secs(1))
            .build();
        assert!(reason(result).contains("shorter"));
    }

    #[test]
    fn tinylfu_requires_a_sketch() {
        let result = builder().frequency_sketch(None).build();
        assert!(reason(result).contains("sketch"));

        assert!(builder()
            .eviction_policy(PolicyKind::Lru)
            .frequency_sketch(None)
            .build()
            .is_ok());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let result = builder().expire_after_write(Duration::ZERO).build();
        assert!(reason(result).contains("expire_after_write"));
    }
}
