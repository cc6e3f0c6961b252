use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const HOUR: u64 = 3600;

pub mod response {
    use super::{CacheEntry, CacheKey, ContentFingerprint, SourceFreshness, elapsed};
    use chrono::{DateTime, Utc};
    use serde::Serialize;
    use std::sync::Arc;
    use std::time::Duration;

    /// Where the value handed to a caller came from.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Origin {
        /// Served from the entry map, no computation ran.
        Cache,
        /// This call ran the computation.
        Computed,
        /// Another caller's computation for the same key produced it.
        Shared,
        /// The computation failed and the previous value was served instead.
        Stale,
    }

    /// Result of `get_or_compute` and `get`.
    #[derive(Debug)]
    pub struct Lookup<V> {
        value: Arc<V>,
        origin: Origin,
        computed_at: DateTime<Utc>,
        source_freshness: SourceFreshness,
        changed: bool,
    }

    impl<V> Clone for Lookup<V> {
        fn clone(&self) -> Self {
            Self {
                value: Arc::clone(&self.value),
                origin: self.origin,
                computed_at: self.computed_at,
                source_freshness: self.source_freshness,
                changed: self.changed,
            }
        }
    }

    impl<V> Lookup<V> {
        pub(crate) fn from_entry(entry: &CacheEntry<V>, origin: Origin, changed: bool) -> Self {
            Self {
                value: entry.value_handle(),
                origin,
                computed_at: entry.computed_at(),
                source_freshness: entry.source_freshness(),
                changed,
            }
        }

        pub fn value(&self) -> &V {
            &self.value
        }

        /// Shared immutable handle to the stored value.
        pub fn into_value(self) -> Arc<V> {
            self.value
        }

        pub fn origin(&self) -> Origin {
            self.origin
        }

        /// True iff this call did not run the computation itself.
        pub fn was_cached(&self) -> bool {
            self.origin != Origin::Computed
        }

        /// True when a failed refresh fell back to the previous value.
        pub fn is_stale(&self) -> bool {
            self.origin == Origin::Stale
        }

        pub fn computed_at(&self) -> DateTime<Utc> {
            self.computed_at
        }

        pub fn source_freshness(&self) -> SourceFreshness {
            self.source_freshness
        }

        /// Whether the computation behind this value produced content
        /// different from the value it replaced. Always true for a first
        /// computation, false for map hits and stale fallbacks.
        pub fn changed(&self) -> bool {
            self.changed
        }

        /// Age of the value relative to `now`.
        pub fn staleness(&self, now: DateTime<Utc>) -> Duration {
            elapsed(self.computed_at, now)
        }
    }

    /// Point-in-time view of one entry, for operators and health pages.
    #[derive(Clone, Debug, Serialize)]
    pub struct EntrySnapshot {
        pub key: CacheKey,
        pub age: Duration,
        pub ttl: Duration,
        pub idle: Duration,
        pub access_count: u64,
        pub source_freshness_hours: f64,
        pub fingerprint: Option<ContentFingerprint>,
    }
}

pub mod metrics {
    use serde::Serialize;

    /// Counters exposed by `stats()`. All monotonic except `size`.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
    pub struct CacheStats {
        pub size: u64,
        pub max_size: u64,
        pub hits: u64,
        pub misses: u64,
        pub evictions: u64,
        pub single_flight_collapses: u64,
        pub forced_refreshes: u64,
        pub stale_served: u64,
        pub compute_failures: u64,
        pub expirations: u64,
        pub invalidations: u64,
        pub refreshes_prevented: u64,
    }

    impl CacheStats {
        /// Calculate the hit rate (0.0 to 1.0).
        pub fn hit_rate(&self) -> f64 {
            let total = self.hits + self.misses;
            if total == 0 {
                0.0
            } else {
                self.hits as f64 / total as f64
            }
        }

        pub fn total_requests(&self) -> u64 {
            self.hits + self.misses
        }
    }

    /// Summary polled by an external health endpoint.
    #[derive(Clone, Debug, PartialEq, Serialize)]
    pub struct HealthMetrics {
        pub hit_rate: f64,
        pub total_requests: u64,
        pub size: u64,
        pub max_size: u64,
    }

    impl From<&CacheStats> for HealthMetrics {
        fn from(stats: &CacheStats) -> Self {
            Self {
                hit_rate: stats.hit_rate(),
                total_requests: stats.total_requests(),
                size: stats.size,
                max_size: stats.max_size,
            }
        }
    }
}

/// Opaque identifier of one cacheable unit of work.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        Ok(Self(Arc::from(key)))
    }

    /// Join non-empty segments with `:`, e.g. `["drought", "-43.53", "172.63"]`.
    pub fn compose<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = segments
            .into_iter()
            .filter(|s| !s.as_ref().is_empty())
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(":");
        Self::new(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:?})", &*self.0)
    }
}

impl Serialize for CacheKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl TryFrom<&str> for CacheKey {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

/// Age of the upstream data a computation used, in hours. Smaller is fresher.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceFreshness(f64);

impl SourceFreshness {
    pub fn hours(hours: f64) -> Self {
        if hours.is_finite() && hours > 0.0 {
            Self(hours)
        } else {
            Self(0.0)
        }
    }

    pub fn as_hours(&self) -> f64 {
        self.0
    }

    /// True if `self` is strictly fresher than `cached` and at most
    /// `fraction` of its age. A fraction of zero disables the check.
    pub fn is_fresher_than(&self, cached: SourceFreshness, fraction: f64) -> bool {
        if fraction <= 0.0 {
            return false;
        }
        self.0 < cached.0 && self.0 <= cached.0 * fraction
    }
}

/// Caller-supplied rules governing reuse versus recompute.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    pub ttl: Duration,
    pub early_refresh_if_source_fresher_by: f64,
    pub min_age_before_refresh: Duration,
    pub force_refresh: bool,
}

impl FreshnessPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            early_refresh_if_source_fresher_by: 0.0,
            min_age_before_refresh: Duration::ZERO,
            force_refresh: false,
        }
    }

    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age_before_refresh = min_age;
        self
    }

    pub fn with_early_refresh(mut self, fraction: f64) -> Self {
        self.early_refresh_if_source_fresher_by = fraction;
        self
    }

    /// Same policy, but the next lookup recomputes unconditionally.
    pub fn forced(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(Error::InvalidPolicy("ttl must be greater than zero".to_string()));
        }
        if self.min_age_before_refresh >= self.ttl {
            return Err(Error::InvalidPolicy(format!(
                "min_age_before_refresh ({:?}) must be shorter than ttl ({:?})",
                self.min_age_before_refresh, self.ttl
            )));
        }
        let fraction = self.early_refresh_if_source_fresher_by;
        if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
            return Err(Error::InvalidPolicy(format!(
                "early_refresh_if_source_fresher_by must be within 0.0..=1.0, got {}",
                fraction
            )));
        }
        Ok(())
    }
}

/// Caller-declared category of cached data; each gets its own policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    Weather,
    SoilMoisture,
    Indicators,
    Historical,
}

impl DataClass {
    pub const ALL: [DataClass; 4] = [
        DataClass::Weather,
        DataClass::SoilMoisture,
        DataClass::Indicators,
        DataClass::Historical,
    ];

    pub fn default_policy(&self) -> FreshnessPolicy {
        let (ttl_hours, min_age_secs) = match self {
            DataClass::Weather => (6, 30 * 60),
            DataClass::SoilMoisture => (12, 2 * HOUR),
            DataClass::Indicators => (12, 2 * HOUR),
            DataClass::Historical => (168, 24 * HOUR),
        };
        FreshnessPolicy::new(Duration::from_secs(ttl_hours * HOUR))
            .with_min_age(Duration::from_secs(min_age_secs))
            .with_early_refresh(0.5)
    }
}

/// Per-class policies, seeded with each class's defaults.
#[derive(Clone, Debug)]
pub struct PolicyTable {
    policies: HashMap<DataClass, FreshnessPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            policies: DataClass::ALL
                .iter()
                .map(|class| (*class, class.default_policy()))
                .collect(),
        }
    }
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, class: DataClass, policy: FreshnessPolicy) -> Result<Self> {
        policy.validate()?;
        self.policies.insert(class, policy);
        Ok(self)
    }

    pub fn policy_for(&self, class: DataClass) -> FreshnessPolicy {
        self.policies
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_policy())
    }
}

/// What a compute callback hands back on success.
#[derive(Clone, Debug)]
pub struct Computed<V> {
    pub value: V,
    pub source_freshness: SourceFreshness,
}

impl<V> Computed<V> {
    pub fn new(value: V, source_freshness: SourceFreshness) -> Self {
        Self {
            value,
            source_freshness,
        }
    }
}

/// Hex SHA-256 of a value's JSON serialization.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn of<V: Serialize>(value: &V) -> Option<Self> {
        let bytes = serde_json::to_vec(value).ok()?;
        Some(Self(hex::encode(Sha256::digest(&bytes))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One stored computation result. The value is never mutated after the
/// entry is built; only access bookkeeping changes.
#[derive(Debug)]
pub struct CacheEntry<V> {
    value: Arc<V>,
    computed_at: DateTime<Utc>,
    ttl: Duration,
    source_freshness: SourceFreshness,
    last_accessed: DateTime<Utc>,
    access_count: u64,
    fingerprint: Option<ContentFingerprint>,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            computed_at: self.computed_at,
            ttl: self.ttl,
            source_freshness: self.source_freshness,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            fingerprint: self.fingerprint.clone(),
        }
    }
}

impl<V> CacheEntry<V> {
    pub fn new(
        value: Arc<V>,
        computed_at: DateTime<Utc>,
        ttl: Duration,
        source_freshness: SourceFreshness,
        fingerprint: Option<ContentFingerprint>,
    ) -> Self {
        Self {
            value,
            computed_at,
            ttl,
            source_freshness,
            last_accessed: computed_at,
            access_count: 0,
            fingerprint,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn value_handle(&self) -> Arc<V> {
        Arc::clone(&self.value)
    }

    pub fn computed_at(&self) -> DateTime<Utc> {
        self.computed_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn source_freshness(&self) -> SourceFreshness {
        self.source_freshness
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.last_accessed
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn fingerprint(&self) -> Option<&ContentFingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.computed_at, now)
    }

    pub fn idle(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.last_accessed, now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) >= self.ttl
    }

    /// Record a successful read. `last_accessed` never moves before `computed_at`.
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.last_accessed = now.max(self.computed_at).max(self.last_accessed);
        self.access_count += 1;
    }

    /// Whether `other` carries different content. Missing fingerprints count as changed.
    pub fn differs_from(&self, other: &CacheEntry<V>) -> bool {
        match (&self.fingerprint, &other.fingerprint) {
            (Some(a), Some(b)) => a != b,
            _ => true,
        }
    }

    pub fn snapshot(&self, key: &CacheKey, now: DateTime<Utc>) -> response::EntrySnapshot {
        response::EntrySnapshot {
            key: key.clone(),
            age: self.age(now),
            ttl: self.ttl,
            idle: self.idle(now),
            access_count: self.access_count,
            source_freshness_hours: self.source_freshness.as_hours(),
            fingerprint: self.fingerprint.clone(),
        }
    }
}

/// Sizing and maintenance settings for one cache instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub janitor_interval: Duration,
    pub janitor_grace: Duration,
    pub event_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&shared::config::Config::default())
    }
}

impl From<&shared::config::Config> for CacheSettings {
    fn from(config: &shared::config::Config) -> Self {
        Self {
            max_entries: config.max_entries.max(1),
            janitor_interval: config.janitor_interval.max(Self::MIN_JANITOR_INTERVAL),
            janitor_grace: config.janitor_grace,
            event_capacity: config.event_capacity.max(1),
        }
    }
}

impl CacheSettings {
    /// Shortest janitor period; zero would spin the sweep loop.
    pub const MIN_JANITOR_INTERVAL: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }

    pub fn with_janitor_interval(mut self, interval: Duration) -> Self {
        self.janitor_interval = interval.max(Self::MIN_JANITOR_INTERVAL);
        self
    }

    pub fn with_janitor_grace(mut self, grace: Duration) -> Self {
        self.janitor_grace = grace;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

/// `now - then`, clamped at zero.
pub(crate) fn elapsed(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}
