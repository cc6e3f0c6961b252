#![deny(clippy::all)]

use crate::domain::{CacheEntry, CacheKey, Computed, SourceFreshness};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::ComputeError;
use std::future::Future;
use tokio_util::sync::CancellationToken;

// Ports are the pluggable extension points around the cache core

/// Port for the work the cache guards: fetch every upstream source, derive
/// the indicators, calibrate confidence. Opaque to the cache.
#[async_trait]
pub trait Compute<V>: Send + Sync + 'static {
    /// Produce a fresh value. `ctx` is cancelled only when the cache shuts
    /// down, never because one waiting caller gave up.
    async fn compute(&self, ctx: CancellationToken) -> Result<Computed<V>, ComputeError>;

    /// Cheap probe of how fresh the upstream data currently is.
    /// `None` disables early refresh for this call.
    async fn probe_freshness(&self) -> Option<SourceFreshness> {
        None
    }
}

/// Closure-backed [`Compute`], see [`compute_fn`].
pub struct ComputeFn<F> {
    f: F,
    hint: Option<SourceFreshness>,
}

/// Wrap an async closure as a [`Compute`] implementation.
pub fn compute_fn<V, F, Fut>(f: F) -> ComputeFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Computed<V>, ComputeError>> + Send + 'static,
{
    ComputeFn { f, hint: None }
}

impl<F> ComputeFn<F> {
    /// Report `hint` as the current upstream freshness when probed.
    pub fn with_freshness_hint(mut self, hint: SourceFreshness) -> Self {
        self.hint = Some(hint);
        self
    }
}

#[async_trait]
impl<V, F, Fut> Compute<V> for ComputeFn<F>
where
    V: Send + 'static,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Computed<V>, ComputeError>> + Send + 'static,
{
    async fn compute(&self, ctx: CancellationToken) -> Result<Computed<V>, ComputeError> {
        (self.f)(ctx).await
    }

    async fn probe_freshness(&self) -> Option<SourceFreshness> {
        self.hint
    }
}

/// Entries pushed out while inserting.
#[derive(Debug)]
pub struct InsertOutcome<V> {
    pub replaced: Option<CacheEntry<V>>,
    pub evicted: Vec<(CacheKey, CacheEntry<V>)>,
}

/// Port for the bounded entry map.
///
/// Implementations must be safe for concurrent use and keep every call
/// short: the cache never holds a store call open across a computation.
pub trait EntryStore<V>: Send + Sync + 'static {
    /// Read without touching access bookkeeping.
    fn peek(&self, key: &CacheKey) -> Option<CacheEntry<V>>;

    /// Record a read at `now` and return the updated entry.
    fn touch(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry<V>>;

    /// Insert or replace. Evicts least-recently-accessed entries first so
    /// the size never exceeds `capacity()`.
    fn insert(&self, key: CacheKey, entry: CacheEntry<V>) -> InsertOutcome<V>;

    fn remove(&self, key: &CacheKey) -> Option<CacheEntry<V>>;

    /// Remove every entry the predicate selects, returning the removed keys.
    fn remove_where(&self, predicate: &dyn Fn(&CacheKey, &CacheEntry<V>) -> bool) -> Vec<CacheKey>;

    fn clear(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    fn entries(&self) -> Vec<(CacheKey, CacheEntry<V>)>;
}

/// Port for the time source, so freshness rules can be exercised without sleeping.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}
