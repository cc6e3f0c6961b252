#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use drywell::{
    CacheKey, CacheSettings, Compute, ComputeError, Computed, FreshnessCache, LruEntryStore,
    ManualClock, SourceFreshness, compute_fn,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::Level;

pub const HOUR: Duration = Duration::from_secs(3600);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn key(name: &str) -> CacheKey {
    CacheKey::new(name).unwrap()
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
}

/// Cache driven by a manual clock.
pub fn manual_cache(max_entries: usize) -> (FreshnessCache<String>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(epoch()));
    let settings = CacheSettings::new().with_max_entries(max_entries);
    let cache = FreshnessCache::with_parts(
        settings,
        Arc::new(LruEntryStore::new(max_entries)),
        clock.clone(),
    );
    (cache, clock)
}

/// Computation that counts its runs and yields `value` after a short pause.
pub fn counting(calls: &Arc<AtomicUsize>, value: &str, freshness_hours: f64) -> impl Compute<String> + use<> {
    let calls = Arc::clone(calls);
    let value = value.to_string();
    compute_fn(move |_ctx| {
        let calls = Arc::clone(&calls);
        let value = value.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, ComputeError>(Computed::new(value, SourceFreshness::hours(freshness_hours)))
        }
    })
}

/// Computation that finishes immediately.
pub fn instant(calls: &Arc<AtomicUsize>, value: &str, freshness_hours: f64) -> drywell::ComputeFn<impl Fn(drywell::CancellationToken) -> std::future::Ready<Result<Computed<String>, ComputeError>> + Send + Sync + 'static> {
    let calls = Arc::clone(calls);
    let value = value.to_string();
    compute_fn(move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(Computed::new(
            value.clone(),
            SourceFreshness::hours(freshness_hours),
        )))
    })
}

/// Computation that blocks until `gate` is notified.
pub fn gated(calls: &Arc<AtomicUsize>, gate: &Arc<Notify>, value: &str) -> impl Compute<String> {
    let calls = Arc::clone(calls);
    let gate = Arc::clone(gate);
    let value = value.to_string();
    compute_fn(move |_ctx| {
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        let value = value.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            Ok::<_, ComputeError>(Computed::new(value, SourceFreshness::hours(1.0)))
        }
    })
}

/// Computation that always fails.
pub fn failing(calls: &Arc<AtomicUsize>, message: &'static str) -> impl Compute<String> {
    let calls = Arc::clone(calls);
    compute_fn(move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Err::<Computed<String>, _>(ComputeError::msg(message)))
    })
}

pub fn count(calls: &Arc<AtomicUsize>) -> usize {
    calls.load(Ordering::SeqCst)
}
