//! # Cache Registry
//!
//! Explicit registry of named caches. Hosting layers that used to reach for
//! a process-wide manager hold one of these instead and pass it through
//! their construction boundary.
//!
//! Caches of different key/value types share one registry; lookups are
//! type-checked at runtime and return `None` on a type mismatch.

use std::any::Any;
use std::hash::Hash;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::cache::Cache;
use crate::config::CacheBuilder;
use crate::error::{CacheError, CacheResult};

struct Registered {
    cache: Box<dyn Any + Send + Sync>,
    close: Box<dyn Fn() + Send + Sync>,
}

/// Named-cache registry.
#[derive(Default)]
pub struct CacheRegistry {
    caches: RwLock<HashMap<String, Registered>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        CacheRegistry {
            caches: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `cache` under `name`; fails if the name is taken.
    pub fn register<K, V>(&self, name: impl Into<String>, cache: Cache<K, V>) -> CacheResult<()>
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let name = name.into();
        let mut caches = self.caches.write();
        if caches.contains_key(&name) {
            return Err(CacheError::configuration(format!(
                "cache name already registered: {name}"
            )));
        }
        let close_handle = cache.clone();
        caches.insert(
            name,
            Registered {
                cache: Box::new(cache),
                close: Box::new(move || close_handle.close()),
            },
        );
        Ok(())
    }

    /// Returns the cache registered under `name`, if the types match.
    pub fn get<K, V>(&self, name: &str) -> Option<Cache<K, V>>
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let caches = self.caches.read();
        caches
            .get(name)
            .and_then(|registered| registered.cache.downcast_ref::<Cache<K, V>>())
            .cloned()
    }

    /// Returns the named cache, building and registering it on first use.
    pub fn get_or_build<K, V, F>(&self, name: &str, configure: F) -> CacheResult<Cache<K, V>>
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: Send + Sync + 'static,
        F: FnOnce() -> CacheBuilder<K, V>,
    {
        if let Some(cache) = self.get::<K, V>(name) {
            return Ok(cache);
        }
        let cache = configure().build()?;
        match self.register(name, cache.clone()) {
            Ok(()) => Ok(cache),
            // Lost a race with another builder; theirs wins.
            Err(_) => {
                cache.close();
                self.get::<K, V>(name).ok_or_else(|| {
                    CacheError::configuration(format!(
                        "cache registered under a different type: {name}"
                    ))
                })
            }
        }
    }

    /// Unregisters and closes the named cache.
    pub fn remove(&self, name: &str) -> bool {
        match self.caches.write().remove(name) {
            Some(registered) => {
                (registered.close)();
                true
            }
            None => false,
        }
    }

    /// Registered names, unordered.
    pub fn names(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    /// Closes every registered cache and empties the registry.
    pub fn close_all(&self) {
        let mut caches = self.caches.write();
        for (_, registered) in caches.drain() {
            (registered.close)();
        }
    }
}
