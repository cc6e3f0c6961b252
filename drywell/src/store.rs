use crate::domain::{CacheEntry, CacheKey};
use crate::ports::{EntryStore, InsertOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;

/// Eviction order: oldest `last_accessed`, then oldest `computed_at`, then
/// whichever was touched first.
type Recency = (DateTime<Utc>, DateTime<Utc>, u64, CacheKey);

struct Slot<V> {
    entry: CacheEntry<V>,
    seq: u64,
}

impl<V> Slot<V> {
    fn recency(&self, key: &CacheKey) -> Recency {
        (
            self.entry.last_accessed(),
            self.entry.computed_at(),
            self.seq,
            key.clone(),
        )
    }
}

struct Inner<V> {
    slots: HashMap<CacheKey, Slot<V>>,
    order: BTreeSet<Recency>,
    next_seq: u64,
}

impl<V> Inner<V> {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn take(&mut self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.recency(key));
        Some(slot.entry)
    }

    fn pop_least_recent(&mut self) -> Option<(CacheKey, CacheEntry<V>)> {
        let (_, _, _, key) = self.order.pop_first()?;
        let slot = self.slots.remove(&key)?;
        Some((key, slot.entry))
    }
}

/// Bounded in-memory entry map with exact least-recently-accessed eviction.
///
/// All operations take one short mutex; none of them await.
pub struct LruEntryStore<V> {
    inner: Mutex<Inner<V>>,
    capacity: usize,
}

impl<V> LruEntryStore<V> {
    /// Create a store holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                order: BTreeSet::new(),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
        }
    }
}

impl<V> EntryStore<V> for LruEntryStore<V>
where
    V: Send + Sync + 'static,
{
    fn peek(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.inner.lock().slots.get(key).map(|slot| slot.entry.clone())
    }

    fn touch(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<CacheEntry<V>> {
        let mut inner = self.inner.lock();
        let mut slot = inner.slots.remove(key)?;
        inner.order.remove(&slot.recency(key));

        slot.entry.record_access(now);
        slot.seq = inner.next_seq();
        let entry = slot.entry.clone();

        inner.order.insert(slot.recency(key));
        inner.slots.insert(key.clone(), slot);
        Some(entry)
    }

    fn insert(&self, key: CacheKey, entry: CacheEntry<V>) -> InsertOutcome<V> {
        let mut inner = self.inner.lock();
        let replaced = inner.take(&key);

        let mut evicted = Vec::new();
        while inner.slots.len() >= self.capacity {
            match inner.pop_least_recent() {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }

        let slot = Slot {
            entry,
            seq: inner.next_seq(),
        };
        inner.order.insert(slot.recency(&key));
        inner.slots.insert(key, slot);

        InsertOutcome { replaced, evicted }
    }

    fn remove(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        self.inner.lock().take(key)
    }

    fn remove_where(&self, predicate: &dyn Fn(&CacheKey, &CacheEntry<V>) -> bool) -> Vec<CacheKey> {
        let mut inner = self.inner.lock();
        let doomed: Vec<CacheKey> = inner
            .slots
            .iter()
            .filter(|(key, slot)| predicate(key, &slot.entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.take(key);
        }
        doomed
    }

    fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.slots.len();
        inner.slots.clear();
        inner.order.clear();
        removed
    }

    fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn entries(&self) -> Vec<(CacheKey, CacheEntry<V>)> {
        self.inner
            .lock()
            .slots
            .iter()
            .map(|(key, slot)| (key.clone(), slot.entry.clone()))
            .collect()
    }
}

impl<V> Debug for LruEntryStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruEntryStore")
            .field("entry_count", &self.inner.lock().slots.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
