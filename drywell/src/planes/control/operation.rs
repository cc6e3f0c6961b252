use crate::domain::CacheKey;
use crate::domain::metrics::{CacheStats, HealthMetrics};
use crate::domain::response::EntrySnapshot;

/// Operator-facing maintenance of a cache, independent of its value type,
/// so one admin surface can hold `Arc<dyn AdminOperations>` for every cache.
///
/// Invalidation removes stored entries only. A computation already running
/// for a removed key is not cancelled and stores its value when it lands:
/// the last write wins.
pub trait AdminOperations: Send + Sync + 'static {
    /// Remove one key. Returns whether it was present; repeating is a no-op.
    /// An in-flight computation for the key still stores its result.
    fn invalidate_key(&self, key: &CacheKey) -> bool;

    /// Remove every key the predicate selects and return how many went.
    fn invalidate_matching(&self, predicate: &dyn Fn(&CacheKey) -> bool) -> usize;

    /// Remove every key containing `pattern` as a substring.
    fn invalidate_pattern(&self, pattern: &str) -> usize {
        self.invalidate_matching(&|key| key.as_str().contains(pattern))
    }

    /// Drop every entry. Counters are kept. In-flight computations still
    /// store their results afterwards.
    fn clear(&self) -> usize;

    /// Remove entries past their ttl that nobody has read for the grace period.
    fn sweep_expired(&self) -> usize;

    fn stats(&self) -> CacheStats;

    fn health(&self) -> HealthMetrics {
        HealthMetrics::from(&self.stats())
    }

    fn entries(&self) -> Vec<EntrySnapshot>;

    fn contains(&self, key: &CacheKey) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
