use crate::domain::CacheKey;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Notable changes to the entry map, for dashboards and degradation alerts.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    /// A key received its first value.
    Computed {
        key: CacheKey,
        source_freshness_hours: f64,
        timestamp: DateTime<Utc>,
    },
    /// A key's value was replaced by a newer computation.
    Refreshed {
        key: CacheKey,
        changed: bool,
        source_freshness_hours: f64,
        timestamp: DateTime<Utc>,
    },
    /// A refresh failed and the previous value stays in service.
    Degraded {
        key: CacheKey,
        error: String,
        stale_age_secs: u64,
        timestamp: DateTime<Utc>,
    },
    Evicted {
        key: CacheKey,
        timestamp: DateTime<Utc>,
    },
    Expired {
        key: CacheKey,
        timestamp: DateTime<Utc>,
    },
    Invalidated {
        key: CacheKey,
        timestamp: DateTime<Utc>,
    },
    Cleared {
        removed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl CacheEvent {
    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            CacheEvent::Computed { key, .. }
            | CacheEvent::Refreshed { key, .. }
            | CacheEvent::Degraded { key, .. }
            | CacheEvent::Evicted { key, .. }
            | CacheEvent::Expired { key, .. }
            | CacheEvent::Invalidated { key, .. } => Some(key),
            CacheEvent::Cleared { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::Computed { .. } => "computed",
            CacheEvent::Refreshed { .. } => "refreshed",
            CacheEvent::Degraded { .. } => "degraded",
            CacheEvent::Evicted { .. } => "evicted",
            CacheEvent::Expired { .. } => "expired",
            CacheEvent::Invalidated { .. } => "invalidated",
            CacheEvent::Cleared { .. } => "cleared",
        }
    }
}

/// Fan-out of [`CacheEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn publish(&self, event: CacheEvent) {
        // Nobody listening is the normal case for a library cache.
        if let Ok(subscribers) = self.sender.send(event) {
            tracing::trace!("Broadcasted cache event to {} subscriber(s)", subscribers);
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream. Lagging subscribers skip the missed events.
    pub(crate) fn stream(&self) -> impl Stream<Item = CacheEvent> + Send + use<> {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|result| async move {
            match result {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    tracing::warn!("Cache event subscriber lagged by {} events", n);
                    None
                }
            }
        })
    }
}
