//! Database schema for refresh_state.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};

/// Retry state of keys whose last refresh failed. Timestamps are unix millis.
const REFRESH_RETRIES_TABLE_V0: Table = Table {
    name: "refresh_retries",
    columns: &[
        sqlite_column!("scope", &SqlType::Text, non_null = true),
        sqlite_column!("user_id", &SqlType::Text, non_null = true),
        sqlite_column!("year", &SqlType::Integer, non_null = true),
        sqlite_column!("attempts", &SqlType::Integer, non_null = true),
        sqlite_column!("last_attempt_at", &SqlType::Integer, non_null = true),
        sqlite_column!("next_attempt_at", &SqlType::Integer),
        // backoff | exhausted
        sqlite_column!("outcome", &SqlType::Text, non_null = true),
        sqlite_column!("last_error", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_refresh_retries_outcome", "outcome, next_attempt_at")],
    unique_constraints: &[&["scope", "user_id", "year"]],
};

/// Dirty marks written by other processes, drained by the scheduler.
const REFRESH_REQUESTS_TABLE_V0: Table = Table {
    name: "refresh_requests",
    columns: &[
        sqlite_column!("scope", &SqlType::Text, non_null = true),
        sqlite_column!("user_id", &SqlType::Text, non_null = true),
        sqlite_column!("year", &SqlType::Integer, non_null = true),
        sqlite_column!("reason", &SqlType::Text, non_null = true),
        sqlite_column!(
            "requested_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[],
    unique_constraints: &[&["scope", "user_id", "year"]],
};

pub const REFRESH_STATE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[REFRESH_RETRIES_TABLE_V0, REFRESH_REQUESTS_TABLE_V0],
    migration: None,
}];
