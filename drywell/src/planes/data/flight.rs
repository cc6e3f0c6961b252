//! Per-key single-flight registry.
//!
//! The first caller for a key registers a flight and becomes its leader;
//! everyone arriving while it is registered follows it. Outcomes travel over
//! a `watch` channel so late joiners still see a result published before
//! they started waiting.

use crate::domain::{CacheEntry, CacheKey};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use shared::ComputeError;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// A value that landed in the map, plus whether its content changed.
#[derive(Debug)]
pub(crate) struct Landed<V> {
    pub(crate) entry: CacheEntry<V>,
    pub(crate) changed: bool,
}

impl<V> Clone for Landed<V> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            changed: self.changed,
        }
    }
}

pub(crate) type FlightOutcome<V> = Result<Landed<V>, ComputeError>;

type Slot<V> = Option<FlightOutcome<V>>;

struct Flight<V> {
    id: u64,
    outcome: watch::Receiver<Slot<V>>,
}

pub(crate) struct FlightGroup<V> {
    flights: DashMap<CacheKey, Flight<V>>,
    next_id: AtomicU64,
}

pub(crate) enum Role<V> {
    Leader(Leader<V>),
    Follower(Waiter<V>),
}

impl<V> FlightGroup<V>
where
    V: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            flights: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Follow the flight registered for `key`, or register one and lead it.
    pub(crate) fn join_or_lead(&self, key: &CacheKey) -> Role<V> {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(flight) => Role::Follower(Waiter {
                outcome: flight.get().outcome.clone(),
            }),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (sender, outcome) = watch::channel(None);
                slot.insert(Flight {
                    id,
                    outcome: outcome.clone(),
                });
                Role::Leader(Leader {
                    id,
                    key: key.clone(),
                    sender,
                    outcome,
                })
            }
        }
    }

    pub(crate) fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.flights.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.flights.len()
    }

    /// Deregister a flight, leaving any newer flight for the key alone.
    fn land(&self, key: &CacheKey, id: u64) {
        self.flights.remove_if(key, |_, flight| flight.id == id);
    }
}

/// Handle of the caller that owns a flight and must publish its outcome.
pub(crate) struct Leader<V> {
    id: u64,
    key: CacheKey,
    sender: watch::Sender<Slot<V>>,
    outcome: watch::Receiver<Slot<V>>,
}

impl<V> Leader<V>
where
    V: Send + Sync + 'static,
{
    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    /// A waiter on this flight's outcome, used by the leader's own caller.
    pub(crate) fn waiter(&self) -> Waiter<V> {
        Waiter {
            outcome: self.outcome.clone(),
        }
    }

    /// Guard that deregisters the flight when dropped, including on panic.
    pub(crate) fn landing<'a>(&self, group: &'a FlightGroup<V>) -> Landing<'a, V> {
        Landing {
            group,
            key: self.key.clone(),
            id: self.id,
        }
    }

    /// Publish the outcome. Callers deregister first so nobody joins a
    /// flight that has already finished.
    pub(crate) fn publish(self, outcome: FlightOutcome<V>) {
        // Every waiter may have given up; the outcome is already in the map.
        let _ = self.sender.send(Some(outcome));
    }

    /// Deregister and publish in one step.
    pub(crate) fn finish(self, group: &FlightGroup<V>, outcome: FlightOutcome<V>) {
        drop(self.landing(group));
        self.publish(outcome);
    }
}

pub(crate) struct Landing<'a, V>
where
    V: Send + Sync + 'static,
{
    group: &'a FlightGroup<V>,
    key: CacheKey,
    id: u64,
}

impl<V> Drop for Landing<'_, V>
where
    V: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.group.land(&self.key, self.id);
    }
}

pub(crate) struct Waiter<V> {
    outcome: watch::Receiver<Slot<V>>,
}

impl<V> Waiter<V> {
    /// Wait for the flight to publish. A leader that vanished without
    /// publishing (its task panicked) surfaces as a compute error.
    pub(crate) async fn wait(mut self) -> FlightOutcome<V> {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(slot) => match slot.as_ref() {
                Some(outcome) => outcome.clone(),
                None => Err(ComputeError::msg("computation finished without a result")),
            },
            Err(_) => Err(ComputeError::msg(
                "computation aborted before producing a result",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SourceFreshness;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name).unwrap()
    }

    fn landed(value: &str) -> Landed<String> {
        Landed {
            entry: CacheEntry::new(
                Arc::new(value.to_string()),
                Utc::now(),
                Duration::from_secs(60),
                SourceFreshness::hours(1.0),
                None,
            ),
            changed: true,
        }
    }

    #[tokio::test]
    async fn test_second_caller_follows() {
        let group: FlightGroup<String> = FlightGroup::new();
        let Role::Leader(leader) = group.join_or_lead(&key("k")) else {
            panic!("first caller must lead");
        };
        let Role::Follower(follower) = group.join_or_lead(&key("k")) else {
            panic!("second caller must follow");
        };
        assert!(group.is_in_flight(&key("k")));

        leader.finish(&group, Ok(landed("v")));
        assert!(!group.is_in_flight(&key("k")));

        let outcome = follower.wait().await.unwrap();
        assert_eq!(outcome.entry.value(), "v");
    }

    #[tokio::test]
    async fn test_distinct_keys_lead_independently() {
        let group: FlightGroup<String> = FlightGroup::new();
        assert!(matches!(group.join_or_lead(&key("a")), Role::Leader(_)));
        assert!(matches!(group.join_or_lead(&key("b")), Role::Leader(_)));
        assert_eq!(group.len(), 2);
    }

    #[tokio::test]
    async fn test_error_reaches_every_waiter() {
        let group: FlightGroup<String> = FlightGroup::new();
        let Role::Leader(leader) = group.join_or_lead(&key("k")) else {
            panic!("first caller must lead");
        };
        let own = leader.waiter();
        let Role::Follower(follower) = group.join_or_lead(&key("k")) else {
            panic!("second caller must follow");
        };

        leader.finish(&group, Err(ComputeError::msg("upstream down")));
        assert_eq!(own.wait().await.unwrap_err().to_string(), "upstream down");
        assert_eq!(follower.wait().await.unwrap_err().to_string(), "upstream down");
    }

    #[tokio::test]
    async fn test_dropped_leader_releases_waiters() {
        let group: FlightGroup<String> = FlightGroup::new();
        let Role::Leader(leader) = group.join_or_lead(&key("k")) else {
            panic!("first caller must lead");
        };
        let waiter = leader.waiter();
        {
            let _landing = leader.landing(&group);
        }
        drop(leader);

        assert!(waiter.wait().await.is_err());
        assert!(matches!(group.join_or_lead(&key("k")), Role::Leader(_)));
    }

    #[tokio::test]
    async fn test_stale_landing_keeps_newer_flight() {
        let group: FlightGroup<String> = FlightGroup::new();
        let Role::Leader(first) = group.join_or_lead(&key("k")) else {
            panic!("first caller must lead");
        };
        drop(first.landing(&group));

        let Role::Leader(_second) = group.join_or_lead(&key("k")) else {
            panic!("flight was deregistered");
        };
        // The first leader landing again must not remove the second flight.
        drop(first.landing(&group));
        assert!(group.is_in_flight(&key("k")));
    }
}
