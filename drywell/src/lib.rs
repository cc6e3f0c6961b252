//! Freshness-aware, single-flight cache for expensive derived computations.
//!
//! Callers ask for a key together with a [`FreshnessPolicy`] and a
//! [`Compute`] implementation. The cache decides whether the stored value
//! is still good enough, runs at most one computation per key at a time,
//! and serves the previous value when a refresh fails.

// Public API
pub mod clock;
pub mod domain;
pub mod events;
pub mod planes;
pub mod ports;
pub mod store;

mod metrics;

// Re-export commonly used types
pub use clock::{ManualClock, SystemClock};
pub use domain::metrics::{CacheStats, HealthMetrics};
pub use domain::response::{EntrySnapshot, Lookup, Origin};
pub use domain::{
    CacheEntry, CacheKey, CacheSettings, Computed, ContentFingerprint, DataClass,
    FreshnessPolicy, PolicyTable, SourceFreshness,
};
pub use events::CacheEvent;
pub use planes::control::AdminOperations;
pub use planes::data::FreshnessCache;
pub use ports::{Clock, Compute, ComputeFn, EntryStore, InsertOutcome, compute_fn};
pub use shared::config::Config;
pub use shared::{ComputeError, Error, Result};
pub use store::LruEntryStore;
pub use tokio_util::sync::CancellationToken;
