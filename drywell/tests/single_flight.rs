mod common;

use common::*;
use async_trait::async_trait;
use drywell::{
    AdminOperations, CacheEvent, CacheSettings, CancellationToken, Clock, Compute, ComputeError,
    Computed, Error, FreshnessCache, FreshnessPolicy, Origin, SourceFreshness,
};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Reports fresh upstream data, but only once the test releases it.
struct HeldHint {
    entered: Arc<Notify>,
    release: Arc<Notify>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Compute<String> for HeldHint {
    async fn compute(&self, _ctx: CancellationToken) -> Result<Computed<String>, ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Computed::new("held".to_string(), SourceFreshness::hours(5.0)))
    }

    async fn probe_freshness(&self) -> Option<SourceFreshness> {
        self.entered.notify_one();
        self.release.notified().await;
        Some(SourceFreshness::hours(5.0))
    }
}

#[tokio::test]
async fn test_concurrent_callers_share_one_computation() {
    init_tracing();
    let cache: FreshnessCache<String> = FreshnessCache::new(CacheSettings::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = FreshnessPolicy::new(HOUR);
    let ctx = CancellationToken::new();

    let lookups = join_all((0..50).map(|_| {
        cache.get_or_compute(&ctx, key("drought:-43.53:172.63"), &policy, counting(&calls, "A", 3.0))
    }))
    .await;

    assert_eq!(count(&calls), 1);
    let lookups: Vec<_> = lookups.into_iter().map(|r| r.unwrap()).collect();
    assert!(lookups.iter().all(|l| l.value() == "A"));
    assert_eq!(lookups.iter().filter(|l| l.origin() == Origin::Computed).count(), 1);
    assert_eq!(lookups.iter().filter(|l| l.origin() == Origin::Shared).count(), 49);
    assert!(lookups.iter().filter(|l| l.origin() == Origin::Shared).all(|l| l.was_cached()));

    let stats = cache.stats();
    assert_eq!(stats.single_flight_collapses, 49);
    assert_eq!(stats.misses, 50);
    assert_eq!(cache.in_flight(), 0);
}

#[tokio::test]
async fn test_distinct_keys_compute_independently() {
    let cache: FreshnessCache<String> = FreshnessCache::new(CacheSettings::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = FreshnessPolicy::new(HOUR);
    let ctx = CancellationToken::new();

    let results = join_all((0..40).map(|i| {
        let name = format!("weather:site-{}", i % 4);
        cache.get_or_compute(&ctx, key(&name), &policy, counting(&calls, &name, 1.0))
    }))
    .await;

    assert_eq!(count(&calls), 4);
    for result in results {
        let lookup = result.unwrap();
        assert!(lookup.value().starts_with("weather:site-"));
    }
    assert_eq!(cache.len(), 4);
}

#[tokio::test]
async fn test_second_call_is_a_hit() {
    let cache: FreshnessCache<String> = FreshnessCache::new(CacheSettings::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = FreshnessPolicy::new(HOUR);
    let ctx = CancellationToken::new();

    let first = cache
        .get_or_compute(&ctx, key("k"), &policy, instant(&calls, "A", 2.0))
        .await
        .unwrap();
    assert!(!first.was_cached());
    assert!(first.changed());

    let second = cache
        .get_or_compute(&ctx, key("k"), &policy, instant(&calls, "B", 2.0))
        .await
        .unwrap();
    assert_eq!(second.value(), "A");
    assert_eq!(second.origin(), Origin::Cache);
    assert!(!second.changed());
    assert_eq!(count(&calls), 1);
    assert_eq!(cache.stats().hits, 1);
}

#[tokio::test]
async fn test_leader_cancellation_does_not_starve_followers() {
    init_tracing();
    let cache: FreshnessCache<String> = FreshnessCache::new(CacheSettings::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let policy = FreshnessPolicy::new(HOUR);
    let leader_ctx = CancellationToken::new();

    let leader = {
        let cache = cache.clone();
        let ctx = leader_ctx.clone();
        let compute = gated(&calls, &gate, "A");
        tokio::spawn(async move { cache.get_or_compute(&ctx, key("k"), &policy, compute).await })
    };
    while cache.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    let follower = {
        let cache = cache.clone();
        let compute = gated(&calls, &gate, "never used");
        tokio::spawn(async move {
            cache
                .get_or_compute(&CancellationToken::new(), key("k"), &policy, compute)
                .await
        })
    };
    while cache.stats().single_flight_collapses == 0 {
        tokio::task::yield_now().await;
    }

    leader_ctx.cancel();
    let leader_result = leader.await.unwrap();
    assert!(leader_result.unwrap_err().is_cancelled());

    gate.notify_one();
    let lookup = follower.await.unwrap().unwrap();
    assert_eq!(lookup.value(), "A");
    assert_eq!(lookup.origin(), Origin::Shared);
    assert_eq!(count(&calls), 1);

    // The abandoned leader's computation still landed.
    assert_eq!(cache.get(&key("k")).unwrap().value(), "A");
}

#[tokio::test]
async fn test_refresh_landing_during_slow_freshness_check_is_reused() {
    init_tracing();
    let (cache, clock) = manual_cache(8);
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = FreshnessPolicy::new(HOUR * 12)
        .with_min_age(HOUR * 2)
        .with_early_refresh(0.5);
    let ctx = CancellationToken::new();

    cache
        .get_or_compute(&ctx, key("k"), &policy, instant(&calls, "A", 12.0))
        .await
        .unwrap();
    clock.advance(HOUR * 3);

    // Caller B sees the 3h old entry and stalls while checking the source.
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let held_calls = Arc::new(AtomicUsize::new(0));
    let slow = {
        let cache = cache.clone();
        let compute = HeldHint {
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
            calls: Arc::clone(&held_calls),
        };
        tokio::spawn(async move {
            cache
                .get_or_compute(&CancellationToken::new(), key("k"), &policy, compute)
                .await
        })
    };
    entered.notified().await;

    // Meanwhile another caller refreshes from the same fresher source.
    let refreshed = cache
        .get_or_compute(
            &ctx,
            key("k"),
            &policy,
            instant(&calls, "A2", 5.0).with_freshness_hint(SourceFreshness::hours(5.0)),
        )
        .await
        .unwrap();
    assert_eq!(refreshed.value(), "A2");
    assert_eq!(refreshed.origin(), Origin::Computed);
    assert_eq!(count(&calls), 2);

    // The new entry is inside the floor, so B serves it instead of recomputing.
    release.notify_one();
    let lookup = slow.await.unwrap().unwrap();
    assert_eq!(lookup.value(), "A2");
    assert!(lookup.was_cached());
    assert_eq!(count(&held_calls), 0);
    assert_eq!(count(&calls), 2);
    assert_eq!(cache.stats().refreshes_prevented, 1);
}

#[tokio::test]
async fn test_cancelled_sole_caller_leaves_result_in_cache() {
    let cache: FreshnessCache<String> = FreshnessCache::new(CacheSettings::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let policy = FreshnessPolicy::new(HOUR);
    let ctx = CancellationToken::new();
    ctx.cancel();

    let result = cache
        .get_or_compute(&ctx, key("k"), &policy, gated(&calls, &gate, "A"))
        .await;
    assert!(matches!(result, Err(Error::ComputeCancelled { .. })));

    let mut events = cache.subscribe();
    gate.notify_one();
    let event = events.recv().await.unwrap();
    assert!(matches!(event, CacheEvent::Computed { .. }));
    assert!(cache.contains(&key("k")));
}

#[tokio::test]
async fn test_failure_degrades_to_previous_value() {
    init_tracing();
    let (cache, clock) = manual_cache(8);
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = FreshnessPolicy::new(HOUR);
    let ctx = CancellationToken::new();

    cache
        .get_or_compute(&ctx, key("k"), &policy, instant(&calls, "A", 6.0))
        .await
        .unwrap();
    clock.advance(HOUR * 2);

    let mut events = cache.subscribe();
    let lookup = cache
        .get_or_compute(&ctx, key("k"), &policy, failing(&calls, "upstream timed out"))
        .await
        .unwrap();

    assert_eq!(lookup.value(), "A");
    assert_eq!(lookup.origin(), Origin::Stale);
    assert!(lookup.is_stale());
    assert_eq!(lookup.staleness(clock.now()), HOUR * 2);

    let stats = cache.stats();
    assert_eq!(stats.compute_failures, 1);
    assert_eq!(stats.stale_served, 1);

    match events.recv().await.unwrap() {
        CacheEvent::Degraded { error, stale_age_secs, .. } => {
            assert_eq!(error, "upstream timed out");
            assert_eq!(stale_age_secs, 7200);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_failure_without_previous_value_errors() {
    let cache: FreshnessCache<String> = FreshnessCache::new(CacheSettings::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = FreshnessPolicy::new(HOUR);
    let ctx = CancellationToken::new();

    let err = cache
        .get_or_compute(&ctx, key("k"), &policy, failing(&calls, "no stations reporting"))
        .await
        .unwrap_err();
    match err {
        Error::ComputeFailed { key, source } => {
            assert_eq!(key, "k");
            assert_eq!(source.to_string(), "no stations reporting");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(cache.is_empty());

    // Nothing was cached, so the next caller computes again.
    cache
        .get_or_compute(&ctx, key("k"), &policy, instant(&calls, "A", 1.0))
        .await
        .unwrap();
    assert_eq!(count(&calls), 2);
}

#[tokio::test]
async fn test_closed_cache_rejects_computation() {
    let cache: FreshnessCache<String> = FreshnessCache::new(CacheSettings::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = FreshnessPolicy::new(HOUR);
    let ctx = CancellationToken::new();

    cache
        .get_or_compute(&ctx, key("k"), &policy, instant(&calls, "A", 1.0))
        .await
        .unwrap();
    cache.close();
    cache.close();

    let result = cache
        .get_or_compute(&ctx, key("other"), &policy, instant(&calls, "B", 1.0))
        .await;
    assert!(matches!(result, Err(Error::Closed)));
    assert!(cache.is_closed());
    assert_eq!(count(&calls), 1);
    assert_eq!(cache.get(&key("k")).unwrap().value(), "A");
}

#[tokio::test]
async fn test_invalid_policy_rejected_before_compute() {
    let cache: FreshnessCache<String> = FreshnessCache::new(CacheSettings::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = FreshnessPolicy::new(HOUR).with_min_age(HOUR * 2);

    let result = cache
        .get_or_compute(&CancellationToken::new(), key("k"), &policy, instant(&calls, "A", 1.0))
        .await;
    assert!(matches!(result, Err(Error::InvalidPolicy(_))));
    assert_eq!(count(&calls), 0);
}

#[tokio::test]
async fn test_event_stream_reports_lifecycle() {
    use futures::StreamExt;

    let cache: FreshnessCache<String> = FreshnessCache::new(CacheSettings::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = FreshnessPolicy::new(HOUR);
    let ctx = CancellationToken::new();
    let mut events = Box::pin(cache.events());

    cache
        .get_or_compute(&ctx, key("k"), &policy, instant(&calls, "A", 1.0))
        .await
        .unwrap();
    cache.invalidate_key(&key("k"));
    cache.clear();

    let kinds: Vec<&str> = events.by_ref().take(3).map(|e| e.kind()).collect().await;
    assert_eq!(kinds, vec!["computed", "invalidated", "cleared"]);
}
