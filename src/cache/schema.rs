//! Database schema for wrapped_cache.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

/// Last successfully computed aggregate per key. The global key stores an
/// empty `user_id`.
const RESULT_CACHE_TABLE_V0: Table = Table {
    name: "result_cache",
    columns: &[
        sqlite_column!("scope", &SqlType::Text, non_null = true),
        sqlite_column!("user_id", &SqlType::Text, non_null = true),
        sqlite_column!("year", &SqlType::Integer, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true),
        // unix millis
        sqlite_column!("computed_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_result_cache_year", "year")],
    unique_constraints: &[&["scope", "user_id", "year"]],
};

pub const RESULT_CACHE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[RESULT_CACHE_TABLE_V0],
    migration: None,
}];
