//! Wrapped Stats Server Library
//!
//! Yearly listening retrospectives: play storage, aggregation, refresh
//! scheduling, the result cache and the HTTP API over them. Exposed for the binaries and tests.

pub mod aggregate;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod derived;
pub mod manager;
pub mod metrics;
pub mod play_store;
pub mod refresh;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use aggregate::{AggregateKey, YearlyAggregate};
pub use cache::{ResultCache, SqliteResultCache};
pub use manager::{MissPolicy, StatsView, WrappedManager};
pub use play_store::{PlayStore, SqlitePlayStore};
pub use refresh::{RefreshHandle, RetryStore, SqliteRetryStore};
