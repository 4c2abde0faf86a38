//! Database schema for plays.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    ForeignKey, OnDelete, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};

/// One row per ingested play; `uri` is the dedup key.
const PLAYS_TABLE_V0: Table = Table {
    name: "plays",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("uri", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("user_id", &SqlType::Text, non_null = true),
        sqlite_column!("track_name", &SqlType::Text, non_null = true),
        sqlite_column!("track_key", &SqlType::Text, non_null = true),
        sqlite_column!("primary_artist_key", &SqlType::Text, non_null = true),
        sqlite_column!("recording_id", &SqlType::Text),
        sqlite_column!("release_id", &SqlType::Text),
        sqlite_column!("release_name", &SqlType::Text),
        sqlite_column!("release_key", &SqlType::Text),
        sqlite_column!("duration_ms", &SqlType::Integer),
        sqlite_column!("played_at", &SqlType::Integer, non_null = true),
        sqlite_column!("year", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "ingested_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_plays_user_year", "user_id, year, played_at, id"),
        ("idx_plays_year", "year"),
        ("idx_plays_track_key", "track_key, primary_artist_key"),
        ("idx_plays_release_key", "release_key"),
    ],
    unique_constraints: &[],
};

/// Ordered artist credits of a play.
const PLAY_ARTISTS_TABLE_V0: Table = Table {
    name: "play_artists",
    columns: &[
        sqlite_column!(
            "play_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "plays",
                foreign_column: "id",
                on_delete: OnDelete::Cascade,
            })
        ),
        sqlite_column!("position", &SqlType::Integer, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("name_key", &SqlType::Text, non_null = true),
        sqlite_column!("external_id", &SqlType::Text),
    ],
    indices: &[
        ("idx_play_artists_play", "play_id"),
        ("idx_play_artists_name_key", "name_key"),
    ],
    unique_constraints: &[&["play_id", "position"]],
};

pub const PLAY_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[PLAYS_TABLE_V0, PLAY_ARTISTS_TABLE_V0],
    migration: None,
}];
