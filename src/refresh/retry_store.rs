//! Durable retry queue and cross-process refresh requests.

use super::retry_policy::RetryPolicy;
use super::schema::REFRESH_STATE_VERSIONED_SCHEMAS;
use super::state::DirtyReason;
use crate::aggregate::AggregateKey;
use crate::sqlite_persistence::{open_in_memory, open_versioned};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Waiting for the next automatic attempt.
    Backoff,
    /// Out of attempts; needs an operator.
    Exhausted,
}

impl RetryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryOutcome::Backoff => "backoff",
            RetryOutcome::Exhausted => "exhausted",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "backoff" => Ok(RetryOutcome::Backoff),
            "exhausted" => Ok(RetryOutcome::Exhausted),
            other => bail!("Unknown retry outcome {:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryState {
    pub key: AggregateKey,
    pub attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
    /// None once the key is exhausted.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub outcome: RetryOutcome,
    pub last_error: String,
}

/// Persistence for failed keys and for dirty marks coming from other processes.
pub trait RetryStore: Send + Sync {
    /// Counts one more failure of `key` and schedules the next attempt per
    /// `policy`. The increment is atomic per key.
    fn record_failure(
        &self,
        key: &AggregateKey,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryState>;

    fn get(&self, key: &AggregateKey) -> Result<Option<RetryState>>;

    /// Deletes the retry state of `key`. Returns whether there was one.
    fn clear(&self, key: &AggregateKey) -> Result<bool>;

    fn clear_all(&self) -> Result<usize>;

    fn list(&self, exhausted_only: bool) -> Result<Vec<RetryState>>;

    /// Keys in backoff whose next attempt is at or before `now`.
    fn due(&self, now: DateTime<Utc>) -> Result<Vec<RetryState>>;

    /// Queues a dirty mark for the running scheduler. Repeated marks of the
    /// same key collapse into one request.
    fn enqueue_request(&self, key: &AggregateKey, reason: DirtyReason) -> Result<()>;

    /// Removes and returns every queued request.
    fn take_requests(&self) -> Result<Vec<(AggregateKey, DirtyReason)>>;
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("Invalid timestamp {}", ms))
}

struct RetryRow {
    scope: String,
    user_id: String,
    year: i32,
    attempts: i64,
    last_attempt_at: i64,
    next_attempt_at: Option<i64>,
    outcome: String,
    last_error: String,
}

const RETRY_COLUMNS: &str =
    "scope, user_id, year, attempts, last_attempt_at, next_attempt_at, outcome, last_error";

impl RetryRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(RetryRow {
            scope: row.get(0)?,
            user_id: row.get(1)?,
            year: row.get(2)?,
            attempts: row.get(3)?,
            last_attempt_at: row.get(4)?,
            next_attempt_at: row.get(5)?,
            outcome: row.get(6)?,
            last_error: row.get(7)?,
        })
    }

    fn into_state(self) -> Result<RetryState> {
        Ok(RetryState {
            key: AggregateKey::from_columns(&self.scope, &self.user_id, self.year)?,
            attempts: self.attempts.max(0) as u32,
            last_attempt_at: millis_to_datetime(self.last_attempt_at)?,
            next_attempt_at: self.next_attempt_at.map(millis_to_datetime).transpose()?,
            outcome: RetryOutcome::parse(&self.outcome)?,
            last_error: self.last_error,
        })
    }
}

pub struct SqliteRetryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRetryStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, REFRESH_STATE_VERSIONED_SCHEMAS, "refresh state")?;
        Ok(SqliteRetryStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(SqliteRetryStore {
            conn: Arc::new(Mutex::new(open_in_memory(REFRESH_STATE_VERSIONED_SCHEMAS)?)),
        })
    }

    fn query_states(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<RetryState>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, RetryRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RetryRow::into_state).collect()
    }
}

impl RetryStore for SqliteRetryStore {
    fn record_failure(
        &self,
        key: &AggregateKey,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryState> {
        let (scope, user_id, year) = key.to_columns();
        let mut conn = self.conn.lock().unwrap();
        // another process may record a failure for the same key concurrently
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let attempts: i64 = tx.query_row(
            "INSERT INTO refresh_retries
                 (scope, user_id, year, attempts, last_attempt_at, next_attempt_at, outcome, last_error)
             VALUES (?1, ?2, ?3, 1, ?4, NULL, ?5, ?6)
             ON CONFLICT (scope, user_id, year) DO UPDATE SET
                 attempts = refresh_retries.attempts + 1,
                 last_attempt_at = excluded.last_attempt_at,
                 last_error = excluded.last_error
             RETURNING attempts",
            params![
                scope,
                user_id,
                year,
                now.timestamp_millis(),
                RetryOutcome::Backoff.as_str(),
                error,
            ],
            |row| row.get(0),
        )?;
        let attempts = attempts.max(1) as u32;

        let (outcome, next_attempt_at) = if policy.should_retry(attempts) {
            (
                RetryOutcome::Backoff,
                Some(policy.next_retry_at(attempts, now)),
            )
        } else {
            (RetryOutcome::Exhausted, None)
        };

        tx.execute(
            "UPDATE refresh_retries SET next_attempt_at = ?4, outcome = ?5
             WHERE scope = ?1 AND user_id = ?2 AND year = ?3",
            params![
                scope,
                user_id,
                year,
                next_attempt_at.map(|t| t.timestamp_millis()),
                outcome.as_str(),
            ],
        )?;
        tx.commit()?;

        Ok(RetryState {
            key: key.clone(),
            attempts,
            last_attempt_at: now,
            next_attempt_at,
            outcome,
            last_error: error.to_string(),
        })
    }

    fn get(&self, key: &AggregateKey) -> Result<Option<RetryState>> {
        let (scope, user_id, year) = key.to_columns();
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM refresh_retries
                     WHERE scope = ?1 AND user_id = ?2 AND year = ?3",
                    RETRY_COLUMNS
                ),
                params![scope, user_id, year],
                RetryRow::from_row,
            )
            .optional()?;
        row.map(RetryRow::into_state).transpose()
    }

    fn clear(&self, key: &AggregateKey) -> Result<bool> {
        let (scope, user_id, year) = key.to_columns();
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM refresh_retries WHERE scope = ?1 AND user_id = ?2 AND year = ?3",
            params![scope, user_id, year],
        )?;
        Ok(removed > 0)
    }

    fn clear_all(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM refresh_retries", [])?)
    }

    fn list(&self, exhausted_only: bool) -> Result<Vec<RetryState>> {
        let conn = self.conn.lock().unwrap();
        let filter = if exhausted_only {
            "WHERE outcome = 'exhausted'"
        } else {
            ""
        };
        Self::query_states(
            &conn,
            &format!(
                "SELECT {} FROM refresh_retries {} ORDER BY last_attempt_at DESC",
                RETRY_COLUMNS, filter
            ),
            &[],
        )
    }

    fn due(&self, now: DateTime<Utc>) -> Result<Vec<RetryState>> {
        let conn = self.conn.lock().unwrap();
        Self::query_states(
            &conn,
            &format!(
                "SELECT {} FROM refresh_retries
                 WHERE outcome = 'backoff' AND next_attempt_at <= ?1
                 ORDER BY next_attempt_at ASC",
                RETRY_COLUMNS
            ),
            &[&now.timestamp_millis()],
        )
    }

    fn enqueue_request(&self, key: &AggregateKey, reason: DirtyReason) -> Result<()> {
        let (scope, user_id, year) = key.to_columns();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO refresh_requests (scope, user_id, year, reason)
             VALUES (?1, ?2, ?3, ?4)",
            params![scope, user_id, year, reason.as_str()],
        )?;
        Ok(())
    }

    fn take_requests(&self) -> Result<Vec<(AggregateKey, DirtyReason)>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare(
                "SELECT scope, user_id, year, reason FROM refresh_requests
                 ORDER BY requested_at ASC, rowid ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i32>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        tx.execute("DELETE FROM refresh_requests", [])?;
        tx.commit()?;

        rows.into_iter()
            .map(|(scope, user_id, year, reason)| {
                let key = AggregateKey::from_columns(&scope, &user_id, year)?;
                let reason = reason.parse().unwrap_or(DirtyReason::Requested);
                Ok((key, reason))
            })
            .collect()
    }
}
