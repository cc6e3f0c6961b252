use crate::domain::CacheKey;
use crate::domain::metrics::CacheStats;
use crate::domain::response::EntrySnapshot;
use crate::events::CacheEvent;
use crate::metrics;
use crate::planes::control::AdminOperations;
use crate::planes::data::FreshnessCache;
use crate::planes::data::freshness_cache::Inner;
use tracing::{debug, info};

impl<V> Inner<V>
where
    V: Send + Sync + 'static,
{
    pub(crate) fn stats(&self) -> CacheStats {
        self.metrics.snapshot(self.store.len(), self.store.capacity())
    }

    /// Entries past their ttl and idle for at least the grace period go.
    /// Keys with a computation in flight stay so a failing refresh can
    /// still fall back to them.
    pub(crate) fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let grace = self.settings.janitor_grace;
        let removed = self.store.remove_where(&|key, entry| {
            entry.is_expired(now) && entry.idle(now) >= grace && !self.flights.is_in_flight(key)
        });

        metrics::add(&self.metrics.expirations, removed.len());
        for key in removed.iter().cloned() {
            debug!(key = %key, "Expired entry removed");
            self.events.publish(CacheEvent::Expired {
                key,
                timestamp: now,
            });
        }
        removed.len()
    }

    fn invalidate_where(&self, predicate: &dyn Fn(&CacheKey) -> bool) -> usize {
        let removed = self.store.remove_where(&|key, _| predicate(key));
        if removed.is_empty() {
            return 0;
        }

        let now = self.clock.now();
        metrics::add(&self.metrics.invalidations, removed.len());
        for key in removed.iter().cloned() {
            self.events.publish(CacheEvent::Invalidated {
                key,
                timestamp: now,
            });
        }
        info!("Invalidated {} cache entries", removed.len());
        removed.len()
    }
}

impl<V> AdminOperations for FreshnessCache<V>
where
    V: Send + Sync + 'static,
{
    fn invalidate_key(&self, key: &CacheKey) -> bool {
        let inner = self.inner();
        if inner.store.remove(key).is_none() {
            return false;
        }
        metrics::bump(&inner.metrics.invalidations);
        debug!(key = %key, "Invalidated cache entry");
        inner.events.publish(CacheEvent::Invalidated {
            key: key.clone(),
            timestamp: inner.clock.now(),
        });
        true
    }

    fn invalidate_matching(&self, predicate: &dyn Fn(&CacheKey) -> bool) -> usize {
        self.inner().invalidate_where(predicate)
    }

    fn clear(&self) -> usize {
        let inner = self.inner();
        let removed = inner.store.clear();
        info!("Cleared {} cache entries", removed);
        inner.events.publish(CacheEvent::Cleared {
            removed,
            timestamp: inner.clock.now(),
        });
        removed
    }

    fn sweep_expired(&self) -> usize {
        self.inner().sweep_expired()
    }

    fn stats(&self) -> CacheStats {
        self.inner().stats()
    }

    fn entries(&self) -> Vec<EntrySnapshot> {
        let inner = self.inner();
        let now = inner.clock.now();
        let mut snapshots: Vec<EntrySnapshot> = inner
            .store
            .entries()
            .iter()
            .map(|(key, entry)| entry.snapshot(key, now))
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.inner().store.peek(key).is_some()
    }

    fn len(&self) -> usize {
        self.inner().store.len()
    }
}
