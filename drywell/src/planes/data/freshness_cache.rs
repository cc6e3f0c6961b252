use crate::clock::SystemClock;
use crate::domain::response::{Lookup, Origin};
use crate::domain::{
    CacheEntry, CacheKey, CacheSettings, Computed, ContentFingerprint, FreshnessPolicy,
    SourceFreshness,
};
use crate::events::{CacheEvent, EventBus};
use crate::metrics::{self, Metrics};
use crate::planes::control::janitor;
use crate::planes::data::decision::{self, RefreshCause, Verdict};
use crate::planes::data::flight::{FlightGroup, FlightOutcome, Landed, Leader, Role};
use crate::ports::{Clock, Compute, EntryStore};
use crate::store::LruEntryStore;
use futures::stream::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use shared::{ComputeError, Error, Result};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct Inner<V> {
    pub(crate) store: Arc<dyn EntryStore<V>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) flights: FlightGroup<V>,
    pub(crate) metrics: Metrics,
    pub(crate) events: EventBus,
    pub(crate) settings: CacheSettings,
    pub(crate) shutdown: CancellationToken,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        // Stops the janitor and any computation still running.
        self.shutdown.cancel();
    }
}

/// Freshness-aware, single-flight cache for expensive computations.
///
/// Cheap to clone; every clone shares the same entries, flights and counters.
/// The last clone to go away shuts the instance down.
pub struct FreshnessCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for FreshnessCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> FreshnessCache<V>
where
    V: Send + Sync + 'static,
{
    /// Create a cache backed by an exact LRU store and the system clock.
    /// No janitor runs until [`start_janitor`](Self::start_janitor).
    pub fn new(settings: CacheSettings) -> Self {
        let store = Arc::new(LruEntryStore::new(settings.max_entries));
        Self::with_parts(settings, store, Arc::new(SystemClock))
    }

    pub fn with_parts(
        settings: CacheSettings,
        store: Arc<dyn EntryStore<V>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            max_entries = store.capacity(),
            janitor_interval_secs = settings.janitor_interval.as_secs(),
            "Freshness cache created"
        );
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                flights: FlightGroup::new(),
                metrics: Metrics::default(),
                events: EventBus::new(settings.event_capacity),
                settings,
                shutdown: CancellationToken::new(),
                janitor: Mutex::new(None),
            }),
        }
    }

    /// Create a cache and start its janitor. Must run inside a tokio runtime.
    pub fn start(settings: CacheSettings) -> Self {
        let cache = Self::new(settings);
        cache.start_janitor();
        cache
    }

    /// Spawn the periodic expiry sweep. Calling it again is a no-op.
    pub fn start_janitor(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let mut slot = self.inner.janitor.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(janitor::spawn(
            Arc::downgrade(&self.inner),
            self.inner.settings.janitor_interval,
            self.inner.shutdown.clone(),
        ));
    }

    /// Stop the janitor, cancel running computations and reject further
    /// `get_or_compute` calls with [`Error::Closed`]. Entries stay readable.
    pub fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let _ = self.inner.janitor.lock().take();
        info!("Freshness cache closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Read the current value without computing. Entries past their ttl
    /// read as absent but stay in the map until swept or replaced.
    pub fn get(&self, key: &CacheKey) -> Option<Lookup<V>> {
        let now = self.inner.clock.now();
        let live = self
            .inner
            .store
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now));
        let touched = if live { self.inner.store.touch(key, now) } else { None };
        match touched {
            Some(entry) => {
                metrics::bump(&self.inner.metrics.hits);
                Some(Lookup::from_entry(&entry, Origin::Cache, false))
            }
            None => {
                metrics::bump(&self.inner.metrics.misses);
                None
            }
        }
    }

    /// Receive every [`CacheEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Like [`subscribe`](Self::subscribe), as a stream that skips over lag.
    pub fn events(&self) -> impl Stream<Item = CacheEvent> + Send + use<V> {
        self.inner.events.stream()
    }

    /// Number of keys with a computation currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.len()
    }
}

impl<V> FreshnessCache<V>
where
    V: Serialize + Send + Sync + 'static,
{
    /// Return the value for `key`, computing it at most once across all
    /// concurrent callers when the policy says the stored value will not do.
    ///
    /// Cancelling `ctx` abandons only this caller's wait. A computation
    /// already running keeps going for everyone else and still lands in
    /// the map. When a refresh fails and an earlier value exists, that
    /// value is returned with [`Origin::Stale`] instead of the error.
    pub async fn get_or_compute<C>(
        &self,
        ctx: &CancellationToken,
        key: CacheKey,
        policy: &FreshnessPolicy,
        compute: C,
    ) -> Result<Lookup<V>>
    where
        C: Compute<V>,
    {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        policy.validate()?;

        let cached = self.inner.store.peek(&key);
        let mut probed: Option<SourceFreshness> = None;
        let cause = match decision::evaluate(cached.as_ref(), policy, self.inner.clock.now()) {
            // A floor hit only prevents a refresh when early refresh could have asked for one.
            Verdict::Floor => match self.serve_hit(&key, decision::early_refresh_enabled(policy)) {
                Some(lookup) => return Ok(lookup),
                None => RefreshCause::Missing,
            },
            Verdict::Fresh => match self.serve_hit(&key, false) {
                Some(lookup) => return Ok(lookup),
                None => RefreshCause::Missing,
            },
            Verdict::Probe => {
                probed = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return Err(cancelled(&key)),
                    hint = compute.probe_freshness() => hint,
                };
                let fresher = cached
                    .as_ref()
                    .is_some_and(|entry| decision::source_is_fresher(entry, probed, policy));
                if fresher {
                    RefreshCause::SourceFresher
                } else {
                    match self.serve_hit(&key, probed.is_some()) {
                        Some(lookup) => return Ok(lookup),
                        None => RefreshCause::Missing,
                    }
                }
            }
            Verdict::Refresh(RefreshCause::Forced) => {
                metrics::bump(&self.inner.metrics.forced_refreshes);
                RefreshCause::Forced
            }
            Verdict::Refresh(cause) => cause,
        };

        self.compute_path(ctx, key, policy, compute, cause, probed).await
    }

    /// Store a value computed outside the cache, as if a computation had
    /// produced it now. Returns whether the content differs from what it
    /// replaced.
    pub fn insert(
        &self,
        key: CacheKey,
        value: V,
        ttl: Duration,
        source_freshness: SourceFreshness,
    ) -> bool {
        self.inner
            .store_value(&key, Arc::new(value), ttl, source_freshness)
            .changed
    }

    fn serve_hit(&self, key: &CacheKey, prevented_refresh: bool) -> Option<Lookup<V>> {
        let entry = self.touch_hit(key, prevented_refresh)?;
        Some(Lookup::from_entry(&entry, Origin::Cache, false))
    }

    fn touch_hit(&self, key: &CacheKey, prevented_refresh: bool) -> Option<CacheEntry<V>> {
        let entry = self.inner.store.touch(key, self.inner.clock.now())?;
        metrics::bump(&self.inner.metrics.hits);
        if prevented_refresh {
            metrics::bump(&self.inner.metrics.refreshes_prevented);
        }
        debug!(key = %key, "Cache hit");
        Some(entry)
    }

    async fn compute_path<C>(
        &self,
        ctx: &CancellationToken,
        key: CacheKey,
        policy: &FreshnessPolicy,
        compute: C,
        cause: RefreshCause,
        probed: Option<SourceFreshness>,
    ) -> Result<Lookup<V>>
    where
        C: Compute<V>,
    {
        let (waiter, origin) = match self.inner.flights.join_or_lead(&key) {
            Role::Follower(waiter) => {
                metrics::bump(&self.inner.metrics.misses);
                metrics::bump(&self.inner.metrics.single_flight_collapses);
                debug!(key = %key, "Joined in-flight computation");
                (waiter, Origin::Shared)
            }
            Role::Leader(leader) => {
                // Another leader may have landed between our read and taking the flight.
                if let Some(entry) = self.recheck(&leader, policy, cause, probed) {
                    let lookup = Lookup::from_entry(&entry, Origin::Cache, false);
                    leader.finish(&self.inner.flights, Ok(Landed { entry, changed: false }));
                    return Ok(lookup);
                }
                metrics::bump(&self.inner.metrics.misses);
                debug!(key = %key, cause = ?cause, "Computing value");
                let waiter = leader.waiter();
                self.launch(leader, compute, policy.ttl);
                (waiter, Origin::Computed)
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!(key = %key, "Caller stopped waiting for computation");
                return Err(cancelled(&key));
            }
            outcome = waiter.wait() => outcome,
        };

        match outcome {
            Ok(landed) => Ok(Lookup::from_entry(&landed.entry, origin, landed.changed)),
            Err(error) => self.degrade_or_fail(&key, error),
        }
    }

    /// Re-evaluate under flight ownership against whatever landed since the
    /// first read. A source-driven refresh reuses the freshness it already
    /// probed instead of asking the source again. Forced refreshes always
    /// compute.
    fn recheck(
        &self,
        leader: &Leader<V>,
        policy: &FreshnessPolicy,
        cause: RefreshCause,
        probed: Option<SourceFreshness>,
    ) -> Option<CacheEntry<V>> {
        if cause == RefreshCause::Forced {
            return None;
        }
        let current = self.inner.store.peek(leader.key())?;
        let source_driven = cause == RefreshCause::SourceFresher;
        match decision::evaluate(Some(&current), policy, self.inner.clock.now()) {
            Verdict::Refresh(_) => None,
            Verdict::Probe
                if source_driven && decision::source_is_fresher(&current, probed, policy) =>
            {
                None
            }
            Verdict::Floor | Verdict::Probe => self.touch_hit(leader.key(), source_driven),
            Verdict::Fresh => self.touch_hit(leader.key(), false),
        }
    }

    /// Run the computation on its own task so a caller that stops waiting
    /// cannot cancel it for the others.
    fn launch<C>(&self, leader: Leader<V>, compute: C, ttl: Duration)
    where
        C: Compute<V>,
    {
        let inner = Arc::clone(&self.inner);
        let token = inner.shutdown.child_token();
        tokio::spawn(async move {
            let landing = leader.landing(&inner.flights);
            let result = compute.compute(token).await;
            let outcome = inner.settle(leader.key(), result, ttl);
            drop(landing);
            leader.publish(outcome);
        });
    }

    fn degrade_or_fail(&self, key: &CacheKey, error: ComputeError) -> Result<Lookup<V>> {
        let now = self.inner.clock.now();
        match self.inner.store.touch(key, now) {
            Some(stale) => {
                metrics::bump(&self.inner.metrics.stale_served);
                debug!(
                    key = %key,
                    age_secs = stale.age(now).as_secs(),
                    "Serving stale value after failed computation"
                );
                Ok(Lookup::from_entry(&stale, Origin::Stale, false))
            }
            None => Err(Error::ComputeFailed {
                key: key.to_string(),
                source: error,
            }),
        }
    }
}

fn cancelled(key: &CacheKey) -> Error {
    Error::ComputeCancelled {
        key: key.to_string(),
    }
}

impl<V> Inner<V>
where
    V: Serialize + Send + Sync + 'static,
{
    /// Record a finished computation and produce the outcome for its waiters.
    fn settle(
        &self,
        key: &CacheKey,
        result: std::result::Result<Computed<V>, ComputeError>,
        ttl: Duration,
    ) -> FlightOutcome<V> {
        match result {
            Ok(computed) => Ok(self.store_value(
                key,
                Arc::new(computed.value),
                ttl,
                computed.source_freshness,
            )),
            Err(error) => {
                metrics::bump(&self.metrics.compute_failures);
                let now = self.clock.now();
                match self.store.peek(key) {
                    Some(previous) => {
                        let stale_age = previous.age(now);
                        warn!(
                            key = %key,
                            error = %error,
                            stale_age_secs = stale_age.as_secs(),
                            "Computation failed, previous value stays in service"
                        );
                        self.events.publish(CacheEvent::Degraded {
                            key: key.clone(),
                            error: error.to_string(),
                            stale_age_secs: stale_age.as_secs(),
                            timestamp: now,
                        });
                    }
                    None => warn!(key = %key, error = %error, "Computation failed"),
                }
                Err(error)
            }
        }
    }

    pub(crate) fn store_value(
        &self,
        key: &CacheKey,
        value: Arc<V>,
        ttl: Duration,
        source_freshness: SourceFreshness,
    ) -> Landed<V> {
        let now = self.clock.now();
        let fingerprint = ContentFingerprint::of(value.as_ref());
        let entry = CacheEntry::new(value, now, ttl, source_freshness, fingerprint);
        let outcome = self.store.insert(key.clone(), entry.clone());

        for (victim, _) in outcome.evicted {
            metrics::bump(&self.metrics.evictions);
            debug!(key = %victim, "Evicted least recently used entry");
            self.events.publish(CacheEvent::Evicted {
                key: victim,
                timestamp: now,
            });
        }

        let changed = match &outcome.replaced {
            Some(previous) => previous.differs_from(&entry),
            None => true,
        };
        let event = if outcome.replaced.is_some() {
            debug!(key = %key, changed, "Refreshed value");
            CacheEvent::Refreshed {
                key: key.clone(),
                changed,
                source_freshness_hours: source_freshness.as_hours(),
                timestamp: now,
            }
        } else {
            debug!(key = %key, "Stored new value");
            CacheEvent::Computed {
                key: key.clone(),
                source_freshness_hours: source_freshness.as_hours(),
                timestamp: now,
            }
        };
        self.events.publish(event);

        Landed { entry, changed }
    }
}

impl<V> FreshnessCache<V> {
    pub(crate) fn inner(&self) -> &Inner<V> {
        &self.inner
    }
}

impl<V> Debug for FreshnessCache<V>
where
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreshnessCache")
            .field("entry_count", &self.inner.store.len())
            .field("max_entries", &self.inner.store.capacity())
            .field("in_flight", &self.inner.flights.len())
            .field("closed", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}
