//! Result cache: the last successfully computed aggregate per key.

mod schema;
mod store;

pub use store::{CacheEntry, CachedKey, ResultCache, SqliteResultCache};
