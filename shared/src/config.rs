use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::{Error, Result};

/// Cache settings supplied by the embedding service's environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub max_entries: usize,
    pub janitor_interval: Duration,
    pub janitor_grace: Duration,
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: Self::DEFAULT_MAX_ENTRIES,
            janitor_interval: Duration::from_secs(Self::DEFAULT_JANITOR_INTERVAL_SECS),
            janitor_grace: Duration::from_secs(Self::DEFAULT_JANITOR_GRACE_SECS),
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Config {
    const DEFAULT_MAX_ENTRIES: usize = 1000;
    const DEFAULT_JANITOR_INTERVAL_SECS: u64 = 3600;
    const DEFAULT_JANITOR_GRACE_SECS: u64 = 3600;
    const DEFAULT_EVENT_CAPACITY: usize = 256;

    /// Read a `.env` file if present, then the process environment, and validate.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => info!("Loaded environment variables from {}", path.display()),
            Err(_) => info!("No .env file found, using system environment variables"),
        }
        let config = Self::from_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unparsable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_entries = parse_or(&lookup, "DRYWELL_MAX_ENTRIES", Self::DEFAULT_MAX_ENTRIES);
        let janitor_interval = parse_or(
            &lookup,
            "DRYWELL_JANITOR_INTERVAL_SECS",
            Self::DEFAULT_JANITOR_INTERVAL_SECS,
        );
        let janitor_grace = parse_or(
            &lookup,
            "DRYWELL_JANITOR_GRACE_SECS",
            Self::DEFAULT_JANITOR_GRACE_SECS,
        );
        let event_capacity = parse_or(
            &lookup,
            "DRYWELL_EVENT_CAPACITY",
            Self::DEFAULT_EVENT_CAPACITY,
        );

        Self {
            max_entries,
            janitor_interval: Duration::from_secs(janitor_interval),
            janitor_grace: Duration::from_secs(janitor_grace),
            event_capacity,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::Config("max_entries must be at least 1".to_string()));
        }
        if self.janitor_interval.is_zero() {
            return Err(Error::Config(
                "janitor_interval must be greater than zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", name, raw, default);
            default
        }),
    }
}
