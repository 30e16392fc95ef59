//! # Cache Errors
//!
//! One sum type covers every failure a cache operation can surface, each
//! variant carrying a stable numeric code so callers and wire protocols can
//! match on kind without string parsing.
//!
//! ## Design Principles
//!
//! 1. **Single Sum Type**: Callers match one enum instead of a hierarchy.
//! 2. **Stable Codes**: `code()` values are part of the public contract and
//!    never change meaning between releases.
//! 3. **Retry Hints**: `is_retryable()` tells callers whether repeating the
//!    operation can succeed without intervention.

use std::sync::Arc;

use thiserror::Error;

/// Result alias used across the cache facade.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by cache construction and operations.
///
/// Variants are cheap to clone so a single load failure can be fanned out to
/// every caller waiting on the same key.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Invalid options detected while building a cache.
    #[error("invalid configuration: {reason}")]
    Configuration {
        /// Human-readable description of the rejected option.
        reason: String,
    },

    /// A key was rejected by the configured validator.
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// Why the key was rejected.
        reason: String,
    },

    /// A value was rejected by the configured validator.
    #[error("invalid value: {reason}")]
    InvalidValue {
        /// Why the value was rejected.
        reason: String,
    },

    /// The cache was closed before or during the operation.
    #[error("cache is closed")]
    InvalidState,

    /// The loader returned an error or exceeded its deadline.
    #[error("load failed: {reason}")]
    LoadFailed {
        /// Message reported by the loader (or the timeout description).
        reason: Arc<str>,
        /// True when the failure was a deadline expiry rather than a loader error.
        timed_out: bool,
    },

    /// An in-flight load was cancelled before completion.
    #[error("load cancelled")]
    LoadCancelled,

    /// The eviction policy could not produce a victim while over capacity.
    ///
    /// This is logged and counted inside the maintenance task; it only
    /// reaches callers through diagnostics, never from public operations.
    #[error("eviction failure: {reason}")]
    EvictionFailure {
        /// Description of the violated policy invariant.
        reason: String,
    },
}

impl CacheError {
    /// Builds a configuration error from any displayable reason.
    pub fn configuration(reason: impl Into<String>) -> Self {
        CacheError::Configuration {
            reason: reason.into(),
        }
    }

    /// Builds a load failure from a loader error message.
    pub fn load_failed(reason: impl AsRef<str>) -> Self {
        CacheError::LoadFailed {
            reason: Arc::from(reason.as_ref()),
            timed_out: false,
        }
    }

    /// Builds a load failure that represents an expired deadline.
    pub fn load_timeout() -> Self {
        CacheError::LoadFailed {
            reason: Arc::from("loader timeout: deadline elapsed"),
            timed_out: true,
        }
    }

    /// Returns the stable numeric code for this error kind.
    pub fn code(&self) -> u16 {
        match self {
            CacheError::Configuration { .. } => 100,
            CacheError::InvalidKey { .. } => 101,
            CacheError::InvalidValue { .. } => 102,
            CacheError::InvalidState => 103,
            CacheError::LoadFailed { timed_out: false, .. } => 200,
            CacheError::LoadFailed { timed_out: true, .. } => 201,
            CacheError::LoadCancelled => 202,
            CacheError::EvictionFailure { .. } => 300,
        }
    }

    /// Returns true when retrying the failed operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::LoadFailed { .. } | CacheError::EvictionFailure { .. }
        )
    }
}
