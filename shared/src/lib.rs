// shared/src/lib.rs

use std::fmt;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cache key must not be empty")]
    EmptyKey,
    #[error("compute failed for key '{key}': {source}")]
    ComputeFailed {
        key: String,
        #[source]
        source: ComputeError,
    },
    #[error("compute cancelled for key '{key}'")]
    ComputeCancelled { key: String },
    #[error("cache is closed")]
    Closed,
    #[error("invalid freshness policy: {0}")]
    InvalidPolicy(String),
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// True when the caller gave up, as opposed to the upstream failing.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::ComputeCancelled { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a compute callback.
///
/// Cheap to clone so every caller waiting on the same computation receives
/// the same error.
#[derive(Clone)]
pub struct ComputeError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl ComputeError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self(Arc::new(Message(message.into())))
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComputeError").field(&self.0.to_string()).finish()
    }
}

impl std::error::Error for ComputeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

pub mod config;
