use crate::domain::CacheSettings;
use crate::planes::data::freshness_cache::Inner;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Spawn the periodic expiry sweep. It holds only a weak handle, so it
/// never keeps a dropped cache alive, and exits on `shutdown`. Periods
/// below [`CacheSettings::MIN_JANITOR_INTERVAL`] are raised to it.
pub(crate) fn spawn<V>(
    cache: Weak<Inner<V>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    V: Send + Sync + 'static,
{
    if interval < CacheSettings::MIN_JANITOR_INTERVAL {
        warn!(
            requested_ms = interval.as_millis() as u64,
            "Janitor interval too short, using {}s",
            CacheSettings::MIN_JANITOR_INTERVAL.as_secs()
        );
    }
    let interval = interval.max(CacheSettings::MIN_JANITOR_INTERVAL);

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Cache janitor started");
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(inner) = cache.upgrade() else {
                break;
            };
            let removed = inner.sweep_expired();
            let remaining = inner.stats().size;
            if removed > 0 {
                info!(
                    "Cache maintenance: removed {} expired entries, {} remaining",
                    removed, remaining
                );
            } else {
                debug!("Cache maintenance: nothing expired, {} entries", remaining);
            }
        }

        info!("Cache janitor stopped");
    })
}
