pub(crate) mod decision;
pub(crate) mod flight;
pub mod freshness_cache;

pub use freshness_cache::FreshnessCache;
