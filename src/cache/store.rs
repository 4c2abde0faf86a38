use super::schema::RESULT_CACHE_VERSIONED_SCHEMAS;
use crate::aggregate::{AggregateKey, YearlyAggregate};
use crate::sqlite_persistence::{open_in_memory, open_versioned};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A successfully computed aggregate and when it was computed.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: AggregateKey,
    pub aggregate: YearlyAggregate,
    pub computed_at: DateTime<Utc>,
}

/// Listing row for operators; the payload is not decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedKey {
    pub key: AggregateKey,
    pub computed_at: DateTime<Utc>,
    pub payload_bytes: usize,
}

/// Keyed store of the latest computed aggregates.
///
/// There is no expiry: an entry stays until it is replaced or invalidated.
pub trait ResultCache: Send + Sync {
    fn get(&self, key: &AggregateKey) -> Result<Option<CacheEntry>>;

    /// Stores `aggregate` unless the cache already holds a result computed
    /// after `computed_at`. Returns whether the entry was written.
    fn put(
        &self,
        key: &AggregateKey,
        aggregate: &YearlyAggregate,
        computed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Returns whether an entry was removed.
    fn invalidate(&self, key: &AggregateKey) -> Result<bool>;

    fn list(&self) -> Result<Vec<CachedKey>>;
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("Invalid computed_at {}", ms))
}

pub struct SqliteResultCache {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResultCache {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, RESULT_CACHE_VERSIONED_SCHEMAS, "result cache")?;
        Ok(SqliteResultCache {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(SqliteResultCache {
            conn: Arc::new(Mutex::new(open_in_memory(RESULT_CACHE_VERSIONED_SCHEMAS)?)),
        })
    }
}

impl ResultCache for SqliteResultCache {
    fn get(&self, key: &AggregateKey) -> Result<Option<CacheEntry>> {
        let (scope, user_id, year) = key.to_columns();
        let row: Option<(String, i64)> = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT payload, computed_at FROM result_cache
                 WHERE scope = ?1 AND user_id = ?2 AND year = ?3",
                params![scope, user_id, year],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };
        let Some((payload, computed_at)) = row else {
            return Ok(None);
        };

        // An unreadable payload is a miss; the next refresh overwrites it.
        match YearlyAggregate::from_json(key, &payload) {
            Ok(aggregate) => Ok(Some(CacheEntry {
                key: key.clone(),
                aggregate,
                computed_at: millis_to_datetime(computed_at)?,
            })),
            Err(e) => {
                warn!("Ignoring unreadable cache entry for {}: {:#}", key, e);
                Ok(None)
            }
        }
    }

    fn put(
        &self,
        key: &AggregateKey,
        aggregate: &YearlyAggregate,
        computed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let payload = aggregate.to_json()?;
        let (scope, user_id, year) = key.to_columns();
        let conn = self.conn.lock().unwrap();
        // Single statement, so readers see either the old or the new payload.
        let changed = conn.execute(
            "INSERT INTO result_cache (scope, user_id, year, payload, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (scope, user_id, year) DO UPDATE
             SET payload = excluded.payload, computed_at = excluded.computed_at
             WHERE excluded.computed_at >= result_cache.computed_at",
            params![scope, user_id, year, payload, computed_at.timestamp_millis()],
        )?;
        if changed == 0 {
            debug!("Kept newer cache entry for {}", key);
        }
        Ok(changed > 0)
    }

    fn invalidate(&self, key: &AggregateKey) -> Result<bool> {
        let (scope, user_id, year) = key.to_columns();
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM result_cache WHERE scope = ?1 AND user_id = ?2 AND year = ?3",
            params![scope, user_id, year],
        )?;
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<CachedKey>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT scope, user_id, year, computed_at, LENGTH(payload) FROM result_cache
             ORDER BY year DESC, scope ASC, user_id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i32>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(scope, user_id, year, computed_at, bytes)| {
                Ok(CachedKey {
                    key: AggregateKey::from_columns(&scope, &user_id, year)?,
                    computed_at: millis_to_datetime(computed_at)?,
                    payload_bytes: bytes.max(0) as usize,
                })
            })
            .collect()
    }
}
