use crate::domain::metrics::CacheStats;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) single_flight_collapses: AtomicU64,
    pub(crate) forced_refreshes: AtomicU64,
    pub(crate) stale_served: AtomicU64,
    pub(crate) compute_failures: AtomicU64,
    pub(crate) expirations: AtomicU64,
    pub(crate) invalidations: AtomicU64,
    pub(crate) refreshes_prevented: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

impl Metrics {
    pub(crate) fn snapshot(&self, size: usize, max_size: usize) -> CacheStats {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            size: size as u64,
            max_size: max_size as u64,
            hits: read(&self.hits),
            misses: read(&self.misses),
            evictions: read(&self.evictions),
            single_flight_collapses: read(&self.single_flight_collapses),
            forced_refreshes: read(&self.forced_refreshes),
            stale_served: read(&self.stale_served),
            compute_failures: read(&self.compute_failures),
            expirations: read(&self.expirations),
            invalidations: read(&self.invalidations),
            refreshes_prevented: read(&self.refreshes_prevented),
        }
    }
}
