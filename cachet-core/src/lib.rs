//! # cachet-core
//!
//! Concurrent in-process cache with pluggable eviction (W-TinyLFU by
//! default), time-based expiration, weight accounting, at-most-once async
//! loading, and lock-free access recording.
//!
//! ## Quick start
//!
//! ```
//! use cachet_core::{Cache, PolicyKind};
//!
//! let cache: Cache<String, u32> = Cache::builder()
//!     .maximum_size(10_000)
//!     .eviction_policy(PolicyKind::TinyLfu)
//!     .record_stats(true)
//!     .build()
//!     .unwrap();
//!
//! cache.put("answer".to_string(), 42).unwrap();
//! assert_eq!(cache.get(&"answer".to_string()).unwrap().as_deref(), Some(&42));
//! cache.close();
//! ```

mod buffer;
mod cache;
mod config;
mod entry;
mod error;
mod event;
mod loader;
mod maintenance;
mod map;
mod policy;
mod registry;
mod sketch;
mod stats;

pub use cache::Cache;
pub use config::{CacheBuilder, ValidatorFn, WeigherFn};
pub use error::{CacheError, CacheResult};
pub use event::{CacheEvent, EventListener, EvictionReason};
pub use loader::{CacheLoader, LoadError};
pub use policy::PolicyKind;
pub use registry::CacheRegistry;
pub use sketch::SketchMode;
pub use stats::CacheStats;
