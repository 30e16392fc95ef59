//! # Listener Events
//!
//! One tagged event type delivered through plain callbacks after the
//! corresponding state change has committed. Listeners are side-effect
//! observers; the cache never reacts to anything they do or return.

use std::fmt;
use std::sync::Arc;

/// Why an entry left the cache without an explicit caller request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// The entry count exceeded the configured maximum size.
    Size,
    /// The weight sum exceeded the configured maximum weight.
    Weight,
    /// The entry's time bound elapsed.
    Expired,
    /// The entry's value was replaced by a newer write.
    Replaced,
    /// The entry was removed by an explicit caller request.
    Explicit,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EvictionReason::Size => "size",
            EvictionReason::Weight => "weight",
            EvictionReason::Expired => "expired",
            EvictionReason::Replaced => "replaced",
            EvictionReason::Explicit => "explicit",
        };
        f.write_str(label)
    }
}

/// Cache lifecycle event delivered to registered listeners.
///
/// Keys and values are shared handles so delivery never copies user data.
#[derive(Debug, Clone)]
pub enum CacheEvent<K, V> {
    /// A value was inserted or replaced by `put`/`put_if_absent`/`compute`.
    Put {
        /// Affected key.
        key: Arc<K>,
        /// The value now stored.
        value: Arc<V>,
    },
    /// A value was removed by an explicit request.
    Remove {
        /// Affected key.
        key: Arc<K>,
        /// The value that was removed.
        value: Arc<V>,
    },
    /// A value was evicted by the maintenance task.
    Evict {
        /// Affected key.
        key: Arc<K>,
        /// The value that was evicted.
        value: Arc<V>,
        /// Why the policy selected this entry.
        reason: EvictionReason,
    },
    /// A value expired and was swept out.
    Expire {
        /// Affected key.
        key: Arc<K>,
        /// The value that expired.
        value: Arc<V>,
    },
    /// A loader produced a value for this key.
    Load {
        /// Affected key.
        key: Arc<K>,
        /// The freshly loaded value.
        value: Arc<V>,
    },
    /// A loader failed for this key.
    LoadError {
        /// Affected key.
        key: Arc<K>,
    },
    /// The whole cache was cleared.
    Clear,
}

/// Callback type invoked for every [`CacheEvent`].
///
/// Listeners run on the thread that committed the change. A panicking
/// listener propagates to that caller, but the state change it observed has
/// already committed.
pub type EventListener<K, V> = Arc<dyn Fn(&CacheEvent<K, V>) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_labels_are_lowercase() {
        assert_eq!(EvictionReason::Size.to_string(), "size");
        assert_eq!(EvictionReason::Weight.to_string(), "weight");
        assert_eq!(EvictionReason::Expired.to_string(), "expired");
        assert_eq!(EvictionReason::Replaced.to_string(), "replaced");
        assert_eq!(EvictionReason::Explicit.to_string(), "explicit");
    }

    #[test]
    fn events_clone_shared_handles() {
        let event: CacheEvent<String, u32> = CacheEvent::Put {
            key: Arc::new("alpha".to_string()),
            value: Arc::new(7),
        };
        let copy = event.clone();
        match (event, copy) {
            (CacheEvent::Put { key: a, .. }, CacheEvent::Put { key: b, .. }) => {
                assert!(Arc::ptr_eq(&a, &b));
            }
            _ => panic!("clone changed the variant"),
        }
    }
}
