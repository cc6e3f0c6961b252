//! Reuse-versus-recompute rules, evaluated once per lookup.
//!
//! Order matters: a missing entry or a forced refresh always recomputes,
//! the min-age floor beats every other signal, the ttl ceiling beats the
//! freshness probe.

use crate::domain::{CacheEntry, FreshnessPolicy, SourceFreshness};
use chrono::{DateTime, Utc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RefreshCause {
    Missing,
    Forced,
    Expired,
    SourceFresher,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Younger than the min-age floor, serve it.
    Floor,
    /// Within ttl with early refresh disabled, serve it.
    Fresh,
    /// Within ttl; serve it unless the freshness probe reports fresher upstream data.
    Probe,
    Refresh(RefreshCause),
}

pub(crate) fn evaluate<V>(
    entry: Option<&CacheEntry<V>>,
    policy: &FreshnessPolicy,
    now: DateTime<Utc>,
) -> Verdict {
    let Some(entry) = entry else {
        return Verdict::Refresh(RefreshCause::Missing);
    };
    if policy.force_refresh {
        return Verdict::Refresh(RefreshCause::Forced);
    }

    let age = entry.age(now);
    if age < policy.min_age_before_refresh {
        return Verdict::Floor;
    }
    if age >= policy.ttl {
        return Verdict::Refresh(RefreshCause::Expired);
    }
    if early_refresh_enabled(policy) {
        Verdict::Probe
    } else {
        Verdict::Fresh
    }
}

/// Whether a freshness probe can ever change a verdict under `policy`.
pub(crate) fn early_refresh_enabled(policy: &FreshnessPolicy) -> bool {
    policy.early_refresh_if_source_fresher_by > 0.0
}

/// Early-refresh rule. No probe result means no early refresh.
pub(crate) fn source_is_fresher<V>(
    entry: &CacheEntry<V>,
    probed: Option<SourceFreshness>,
    policy: &FreshnessPolicy,
) -> bool {
    probed.is_some_and(|probed| {
        probed.is_fresher_than(
            entry.source_freshness(),
            policy.early_refresh_if_source_fresher_by,
        )
    })
}
