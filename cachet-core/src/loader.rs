//! # Async Loading
//!
//! The loader capability plus the per-key in-flight table that guarantees
//! at-most-once concurrent computation.
//!
//! The in-flight table maps each loading key to a shared future. The first
//! caller registers the future; everyone else clones and awaits the same
//! one. Because the future is shared, any still-interested caller can drive
//! it to completion — abandoning one waiter never strands the rest.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::CacheError;

/// Error type loaders may fail with.
pub type LoadError = Box<dyn std::error::Error + Send + Sync>;

/// Computes the value for a missing key.
///
/// Implementations must be safe to call concurrently for distinct keys; the
/// cache itself guarantees at most one in-flight call per key.
#[async_trait]
pub trait CacheLoader<K, V>: Send + Sync {
    /// Produces the value for `key`, or fails with a loader error.
    async fn load(&self, key: &K) -> Result<V, LoadError>;
}

/// Outcome future shared by every caller waiting on one key.
pub(crate) type SharedLoad<V> = Shared<BoxFuture<'static, Result<Arc<V>, CacheError>>>;

/// One registered load with its cancellation hook.
pub(crate) struct InflightLoad<V> {
    /// Future every waiter awaits.
    pub shared: SharedLoad<V>,
    /// Set once [`InflightTable::cancel`] fires.
    pub cancelled: Arc<AtomicBool>,
    /// Wakes the driving future so it can observe the cancellation.
    pub notify: Arc<Notify>,
}

impl<V> Clone for InflightLoad<V> {
    fn clone(&self) -> Self {
        InflightLoad {
            shared: self.shared.clone(),
            cancelled: Arc::clone(&self.cancelled),
            notify: Arc::clone(&self.notify),
        }
    }
}

/// How a caller came to hold an [`InflightLoad`].
pub(crate) enum JoinOutcome<V> {
    /// This caller registered the load and its future runs the loader.
    Started(InflightLoad<V>),
    /// Another caller owns the load; this future only observes it.
    Joined(InflightLoad<V>),
}

/// Per-key registry of in-flight loads.
///
/// The table's mutex is the per-key synchronization point: whoever inserts
/// first owns the load for that key until it is completed or cancelled.
pub(crate) struct InflightTable<K, V> {
    loads: Mutex<HashMap<Arc<K>, InflightLoad<V>, RandomState>>,
}

impl<K, V> InflightTable<K, V>
where
    K: Hash + Eq,
    V: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        InflightTable {
            loads: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Joins the key's in-flight load, or registers a new one built by
    /// `make_future`.
    ///
    /// `make_future` receives the cancellation pair so the driving future
    /// can observe [`Self::cancel`].
    pub(crate) fn join_or_start<F, Fut>(&self, key: &Arc<K>, make_future: F) -> JoinOutcome<V>
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> Fut,
        Fut: Future<Output = Result<Arc<V>, CacheError>> + Send + 'static,
    {
        let mut loads = self.loads.lock();
        if let Some(existing) = loads.get(key) {
            return JoinOutcome::Joined(existing.clone());
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let future = make_future(Arc::clone(&cancelled), Arc::clone(&notify));
        let load = InflightLoad {
            shared: future.boxed().shared(),
            cancelled,
            notify,
        };
        loads.insert(Arc::clone(key), load.clone());
        JoinOutcome::Started(load)
    }

    /// Registers a load only when the key has no in-flight one.
    ///
    /// Used by refresh-after-write, which must never pile onto an existing
    /// load.
    pub(crate) fn start_if_vacant<F, Fut>(
        &self,
        key: &Arc<K>,
        make_future: F,
    ) -> Option<InflightLoad<V>>
    where
        F: FnOnce(Arc<AtomicBool>, Arc<Notify>) -> Fut,
        Fut: Future<Output = Result<Arc<V>, CacheError>> + Send + 'static,
    {
        match self.join_or_start(key, make_future) {
            JoinOutcome::Started(load) => Some(load),
            JoinOutcome::Joined(_) => None,
        }
    }

    /// Drops the key's registration; called by the driving future once the
    /// outcome is decided.
    pub(crate) fn complete(&self, key: &K) {
        self.loads.lock().remove(key);
    }

    /// Cancels the key's in-flight load, if any.
    ///
    /// The loader itself may still run to completion, but its result is
    /// discarded and every waiter observes `LoadCancelled`.
    pub(crate) fn cancel(&self, key: &K) -> bool {
        let load = self.loads.lock().remove(key);
        match load {
            Some(load) => {
                load.cancelled.store(true, Ordering::Release);
                load.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Cancels everything; used by `close`.
    pub(crate) fn cancel_all(&self) {
        let mut loads = self.loads.lock();
        for (_, load) in loads.drain() {
            load.cancelled.store(true, Ordering::Release);
            load.notify.notify_one();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.loads.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> Arc<String> {
        Arc::new(name.to_string())
    }

    #[tokio::test]
    async fn second_caller_joins_the_first() {
        let table: InflightTable<String, u32> = InflightTable::new();
        let k = key("alpha");

        let first = table.join_or_start(&k, |_, _| async { Ok(Arc::new(1)) });
        let second = table.join_or_start(&k, |_, _| async { Ok(Arc::new(2)) });

        let (first, second) = match (first, second) {
            (JoinOutcome::Started(a), JoinOutcome::Joined(b)) => (a, b),
            _ => panic!("first must start, second must join"),
        };

        let a = first.shared.await.unwrap();
        let b = second.shared.await.unwrap();
        assert_eq!(*a, 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn complete_clears_the_slot() {
        let table: InflightTable<String, u32> = InflightTable::new();
        let k = key("alpha");

        let load = match table.join_or_start(&k, |_, _| async { Ok(Arc::new(1)) }) {
            JoinOutcome::Started(load) => load,
            JoinOutcome::Joined(_) => panic!("table was empty"),
        };
        load.shared.await.unwrap();
        table.complete(&k);
        assert_eq!(table.len(), 0);

        match table.join_or_start(&k, |_, _| async { Ok(Arc::new(2)) }) {
            JoinOutcome::Started(load) => {
                assert_eq!(*load.shared.await.unwrap(), 2);
            }
            JoinOutcome::Joined(_) => panic!("slot should have been vacated"),
        }
    }

    #[tokio::test]
    async fn cancel_wakes_the_driver() {
        let table: InflightTable<String, u32> = InflightTable::new();
        let k = key("alpha");

        let load = match table.join_or_start(&k, |cancelled, notify| async move {
            notify.notified().await;
            if cancelled.load(Ordering::Acquire) {
                Err(CacheError::LoadCancelled)
            } else {
                Ok(Arc::new(1))
            }
        }) {
            JoinOutcome::Started(load) => load,
            JoinOutcome::Joined(_) => panic!("table was empty"),
        };

        assert!(table.cancel(&k));
        assert!(matches!(load.shared.await, Err(CacheError::LoadCancelled)));
        assert!(!table.cancel(&k));
    }

    #[test]
    fn start_if_vacant_skips_busy_keys() {
        let table: InflightTable<String, u32> = InflightTable::new();
        let k = key("alpha");

        assert!(table
            .start_if_vacant(&k, |_, _| async { Ok(Arc::new(1)) })
            .is_some());
        assert!(table
            .start_if_vacant(&k, |_, _| async { Ok(Arc::new(2)) })
            .is_none());
    }
}
