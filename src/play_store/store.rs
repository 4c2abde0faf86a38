//! Append-only play storage.

use super::models::{
    ArtistCredit, ArtistListening, PlayCursor, PlayEvent, PlayRecord, RecordOutcome,
};
use super::normalize::normalize_name;
use super::schema::PLAY_STORE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{open_in_memory, open_versioned};
use anyhow::Result;
use chrono::{DateTime, Datelike, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Trait for play storage.
///
/// There is no update or delete: corrections arrive as new plays.
pub trait PlayStore: Send + Sync {
    /// Stores a play unless its `uri` is already present.
    fn record(&self, play: &PlayEvent) -> Result<RecordOutcome>;

    /// Returns up to `limit` plays of `user_id` in `year`, ordered by
    /// `(played_at, id)`, starting strictly after `after`.
    fn plays_page(
        &self,
        user_id: &str,
        year: i32,
        after: Option<PlayCursor>,
        limit: usize,
    ) -> Result<Vec<(PlayCursor, PlayRecord)>>;

    /// Users with at least one play in `year`, sorted.
    fn users_for_year(&self, year: i32) -> Result<Vec<String>>;

    /// Years with at least one play, ascending.
    fn years(&self) -> Result<Vec<i32>>;

    /// Per (user, artist) totals for `year`, every credited artist counted
    /// once per play.
    fn artist_listening(&self, year: i32, fallback_ms: u32) -> Result<Vec<ArtistListening>>;

    /// Number of plays, optionally restricted to one user.
    fn count_plays(&self, user_id: Option<&str>, year: i32) -> Result<usize>;
}

/// Lazily walks a key's plays page by page.
///
/// The stream remembers the last position it yielded, so a consumer can
/// resume it later with [`PlayStream::resume`].
pub struct PlayStream {
    store: Arc<dyn PlayStore>,
    user_id: String,
    year: i32,
    page_size: usize,
    position: Option<PlayCursor>,
    buffer: std::vec::IntoIter<(PlayCursor, PlayRecord)>,
    exhausted: bool,
}

impl PlayStream {
    pub fn new(store: Arc<dyn PlayStore>, user_id: &str, year: i32, page_size: usize) -> Self {
        Self::resume(store, user_id, year, page_size, None)
    }

    pub fn resume(
        store: Arc<dyn PlayStore>,
        user_id: &str,
        year: i32,
        page_size: usize,
        after: Option<PlayCursor>,
    ) -> Self {
        Self {
            store,
            user_id: user_id.to_string(),
            year,
            page_size: page_size.max(1),
            position: after,
            buffer: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    /// Cursor of the last play yielded, if any.
    pub fn position(&self) -> Option<PlayCursor> {
        self.position
    }
}

impl Iterator for PlayStream {
    type Item = Result<PlayRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((cursor, record)) = self.buffer.next() {
            self.position = Some(cursor);
            return Some(Ok(record));
        }
        if self.exhausted {
            return None;
        }

        let page = match self
            .store
            .plays_page(&self.user_id, self.year, self.position, self.page_size)
        {
            Ok(page) => page,
            Err(e) => {
                self.exhausted = true;
                return Some(Err(e));
            }
        };
        if page.is_empty() || page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer = page.into_iter();
        let (cursor, record) = self.buffer.next()?;
        self.position = Some(cursor);
        Some(Ok(record))
    }
}

struct StoredRow {
    id: i64,
    uri: String,
    user_id: String,
    track_name: String,
    recording_id: Option<String>,
    release_id: Option<String>,
    release_name: Option<String>,
    duration_ms: Option<i64>,
    played_at: i64,
    year: i32,
    artist: Option<ArtistCredit>,
}

impl StoredRow {
    fn cursor(&self) -> PlayCursor {
        PlayCursor {
            played_at_ms: self.played_at,
            id: self.id,
        }
    }
}

pub struct SqlitePlayStore {
    conn: Arc<Mutex<Connection>>,
    inherit_external_ids: bool,
}

impl SqlitePlayStore {
    /// Opens an existing database or creates a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P, inherit_external_ids: bool) -> Result<Self> {
        let conn = open_versioned(db_path, PLAY_STORE_VERSIONED_SCHEMAS, "play store")?;
        Ok(SqlitePlayStore {
            conn: Arc::new(Mutex::new(conn)),
            inherit_external_ids,
        })
    }

    pub fn in_memory(inherit_external_ids: bool) -> Result<Self> {
        Ok(SqlitePlayStore {
            conn: Arc::new(Mutex::new(open_in_memory(PLAY_STORE_VERSIONED_SCHEMAS)?)),
            inherit_external_ids,
        })
    }

    fn inherited_artist_id(tx: &Transaction, name_key: &str) -> Result<Option<String>> {
        Ok(tx
            .query_row(
                "SELECT external_id FROM play_artists
                 WHERE name_key = ?1 AND external_id IS NOT NULL
                 ORDER BY play_id ASC LIMIT 1",
                params![name_key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn inherited_recording_id(
        tx: &Transaction,
        track_key: &str,
        primary_artist_key: &str,
    ) -> Result<Option<String>> {
        Ok(tx
            .query_row(
                "SELECT recording_id FROM plays
                 WHERE track_key = ?1 AND primary_artist_key = ?2 AND recording_id IS NOT NULL
                 ORDER BY id ASC LIMIT 1",
                params![track_key, primary_artist_key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn inherited_release_id(tx: &Transaction, release_key: &str) -> Result<Option<String>> {
        Ok(tx
            .query_row(
                "SELECT release_id FROM plays
                 WHERE release_key = ?1 AND release_id IS NOT NULL
                 ORDER BY id ASC LIMIT 1",
                params![release_key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Fills missing identifiers from earlier plays of the same normalised names.
    fn inherit_ids(
        tx: &Transaction,
        play: &PlayEvent,
        track_key: &str,
        primary_artist_key: &str,
        release_key: Option<&str>,
    ) -> Result<(Vec<ArtistCredit>, Option<String>, Option<String>)> {
        let mut artists = play.artists.clone();
        for artist in artists.iter_mut().filter(|a| a.external_id.is_none()) {
            artist.external_id = Self::inherited_artist_id(tx, &normalize_name(&artist.name))?;
        }

        let recording_id = match &play.recording_id {
            Some(id) => Some(id.clone()),
            None => Self::inherited_recording_id(tx, track_key, primary_artist_key)?,
        };

        let release_id = match (&play.release_id, release_key) {
            (Some(id), _) => Some(id.clone()),
            (None, Some(key)) if !key.is_empty() => Self::inherited_release_id(tx, key)?,
            (None, _) => None,
        };

        Ok((artists, recording_id, release_id))
    }

    fn decode_record(row: StoredRow, artists: Vec<ArtistCredit>) -> PlayRecord {
        let uri = row.uri;
        let Some(played_at) = DateTime::<Utc>::from_timestamp_millis(row.played_at) else {
            return PlayRecord::Malformed {
                uri,
                reason: format!("played_at {} out of range", row.played_at),
            };
        };
        if played_at.year() != row.year {
            return PlayRecord::Malformed {
                uri,
                reason: format!("played_at {} outside of year {}", played_at, row.year),
            };
        }
        if row.track_name.trim().is_empty() {
            return PlayRecord::Malformed {
                uri,
                reason: "empty track name".to_string(),
            };
        }
        let duration_ms = match row.duration_ms {
            None => None,
            Some(ms) if (0..=u32::MAX as i64).contains(&ms) => {
                Some(ms as u32).filter(|ms| *ms > 0)
            }
            Some(ms) => {
                return PlayRecord::Malformed {
                    uri,
                    reason: format!("invalid duration {}", ms),
                }
            }
        };
        PlayRecord::Valid(PlayEvent {
            user_id: row.user_id,
            uri,
            track_name: row.track_name,
            artists,
            recording_id: row.recording_id,
            release_id: row.release_id,
            release_name: row.release_name,
            duration_ms,
            played_at,
        })
    }
}

impl PlayStore for SqlitePlayStore {
    fn record(&self, play: &PlayEvent) -> Result<RecordOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let exists: bool = tx
            .query_row("SELECT 1 FROM plays WHERE uri = ?1", params![play.uri], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if exists {
            debug!("Play {} already recorded, ignoring", play.uri);
            return Ok(RecordOutcome::Duplicate);
        }

        let track_key = normalize_name(&play.track_name);
        let primary_artist_key = play
            .primary_artist()
            .map(|a| normalize_name(&a.name))
            .unwrap_or_default();
        let release_key = play.release_name.as_deref().map(normalize_name);

        let (artists, recording_id, release_id) = if self.inherit_external_ids {
            Self::inherit_ids(&tx, play, &track_key, &primary_artist_key, release_key.as_deref())?
        } else {
            (
                play.artists.clone(),
                play.recording_id.clone(),
                play.release_id.clone(),
            )
        };

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO plays (
                uri, user_id, track_name, track_key, primary_artist_key,
                recording_id, release_id, release_name, release_key,
                duration_ms, played_at, year
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                play.uri,
                play.user_id,
                play.track_name,
                track_key,
                primary_artist_key,
                recording_id,
                release_id,
                play.release_name,
                release_key,
                play.duration_ms,
                play.played_at.timestamp_millis(),
                play.year(),
            ],
        )?;
        if inserted == 0 {
            return Ok(RecordOutcome::Duplicate);
        }

        let play_id = tx.last_insert_rowid();
        let mut credited = HashSet::new();
        let credits = artists
            .iter()
            .filter(|artist| credited.insert(normalize_name(&artist.name)));
        for (position, artist) in credits.enumerate() {
            tx.execute(
                "INSERT INTO play_artists (play_id, position, name, name_key, external_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    play_id,
                    position as i64,
                    artist.name,
                    normalize_name(&artist.name),
                    artist.external_id
                ],
            )?;
        }
        tx.commit()?;
        Ok(RecordOutcome::Inserted)
    }

    fn plays_page(
        &self,
        user_id: &str,
        year: i32,
        after: Option<PlayCursor>,
        limit: usize,
    ) -> Result<Vec<(PlayCursor, PlayRecord)>> {
        let (after_played_at, after_id) = after
            .map(|c| (c.played_at_ms, c.id))
            .unwrap_or((i64::MIN, i64::MIN));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT p.id, p.uri, p.user_id, p.track_name, p.recording_id, p.release_id,
                    p.release_name, p.duration_ms, p.played_at, p.year,
                    a.name, a.external_id
             FROM (
                SELECT * FROM plays
                WHERE user_id = ?1 AND year = ?2
                  AND (played_at > ?3 OR (played_at = ?3 AND id > ?4))
                ORDER BY played_at ASC, id ASC
                LIMIT ?5
             ) p
             LEFT JOIN play_artists a ON a.play_id = p.id
             ORDER BY p.played_at ASC, p.id ASC, a.position ASC",
        )?;

        let rows = stmt
            .query_map(
                params![user_id, year, after_played_at, after_id, limit as i64],
                |row| {
                    let artist_name: Option<String> = row.get(10)?;
                    let artist_id: Option<String> = row.get(11)?;
                    Ok(StoredRow {
                        id: row.get(0)?,
                        uri: row.get(1)?,
                        user_id: row.get(2)?,
                        track_name: row.get(3)?,
                        recording_id: row.get(4)?,
                        release_id: row.get(5)?,
                        release_name: row.get(6)?,
                        duration_ms: row.get(7)?,
                        played_at: row.get(8)?,
                        year: row.get(9)?,
                        artist: artist_name.map(|name| ArtistCredit {
                            name,
                            external_id: artist_id,
                        }),
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<StoredRow>>>()?;

        // One row per artist credit; fold them back into plays.
        let mut page: Vec<(PlayCursor, PlayRecord)> = Vec::new();
        let mut current: Option<StoredRow> = None;
        let mut artists: Vec<ArtistCredit> = Vec::new();
        for mut row in rows {
            let artist = row.artist.take();
            let same_play = current.as_ref().is_some_and(|open| open.id == row.id);
            if !same_play {
                if let Some(done) = current.take() {
                    let cursor = done.cursor();
                    let record = Self::decode_record(done, std::mem::take(&mut artists));
                    page.push((cursor, record));
                }
                current = Some(row);
            }
            if let Some(artist) = artist {
                artists.push(artist);
            }
        }
        if let Some(done) = current.take() {
            page.push((done.cursor(), Self::decode_record(done, artists)));
        }

        Ok(page)
    }

    fn users_for_year(&self, year: i32) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT user_id FROM plays WHERE year = ?1 ORDER BY user_id")?;
        let users = stmt
            .query_map(params![year], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(users)
    }

    fn years(&self) -> Result<Vec<i32>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT year FROM plays ORDER BY year")?;
        let years = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i32>>>()?;
        Ok(years)
    }

    fn artist_listening(&self, year: i32, fallback_ms: u32) -> Result<Vec<ArtistListening>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT p.user_id, a.name, COUNT(*), SUM(COALESCE(p.duration_ms, ?2)), MIN(p.played_at)
             FROM plays p
             JOIN play_artists a ON a.play_id = p.id
             WHERE p.year = ?1
             GROUP BY p.user_id, a.name
             ORDER BY p.user_id ASC, a.name ASC",
        )?;
        let rows = stmt
            .query_map(params![year, fallback_ms], |row| {
                Ok(ArtistListening {
                    user_id: row.get(0)?,
                    artist: row.get(1)?,
                    plays: row.get::<_, i64>(2)? as u32,
                    duration_ms: row.get::<_, i64>(3)?.max(0) as u64,
                    first_played_at_ms: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn count_plays(&self, user_id: Option<&str>, year: i32) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = match user_id {
            Some(user_id) => conn.query_row(
                "SELECT COUNT(*) FROM plays WHERE user_id = ?1 AND year = ?2",
                params![user_id, year],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM plays WHERE year = ?1",
                params![year],
                |row| row.get(0),
            )?,
        };
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play_store::IncomingPlay;
    use tempfile::TempDir;

    fn play(uri: &str, user: &str, at: &str, track: &str, artist: &str) -> PlayEvent {
        IncomingPlay {
            user_id: user.to_string(),
            uri: uri.to_string(),
            track_name: track.to_string(),
            artists: vec![ArtistCredit {
                name: artist.to_string(),
                external_id: None,
            }],
            duration_ms: Some(120_000),
            played_at: Some(at.to_string()),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    fn valid(record: &PlayRecord) -> &PlayEvent {
        match record {
            PlayRecord::Valid(play) => play,
            PlayRecord::Malformed { uri, reason } => panic!("{} malformed: {}", uri, reason),
        }
    }

    #[test]
    fn record_then_duplicate() {
        let store = SqlitePlayStore::in_memory(true).unwrap();
        let p = play("uri-1", "u", "2025-01-01T10:00:00Z", "Song", "Band");

        assert_eq!(store.record(&p).unwrap(), RecordOutcome::Inserted);
        assert_eq!(store.record(&p).unwrap(), RecordOutcome::Duplicate);

        let mut changed = p.clone();
        changed.track_name = "Other".to_string();
        assert_eq!(store.record(&changed).unwrap(), RecordOutcome::Duplicate);

        assert_eq!(store.count_plays(Some("u"), 2025).unwrap(), 1);
        let page = store.plays_page("u", 2025, None, 10).unwrap();
        assert_eq!(valid(&page[0].1).track_name, "Song");
    }

    #[test]
    fn plays_are_ordered_by_time_with_artists() {
        let store = SqlitePlayStore::in_memory(false).unwrap();
        store
            .record(&play("b", "u", "2025-02-01T00:00:00Z", "Second", "X"))
            .unwrap();
        let mut multi = play("a", "u", "2025-01-01T00:00:00Z", "First", "Y");
        multi.artists.push(ArtistCredit {
            name: "Z".to_string(),
            external_id: Some("z-id".to_string()),
        });
        store.record(&multi).unwrap();
        store
            .record(&play("c", "other", "2025-01-15T00:00:00Z", "Else", "X"))
            .unwrap();

        let page = store.plays_page("u", 2025, None, 10).unwrap();
        let titles: Vec<_> = page.iter().map(|(_, r)| valid(r).track_name.clone()).collect();
        assert_eq!(titles, vec!["First", "Second"]);
        assert_eq!(valid(&page[0].1).artists, multi.artists);
    }

    #[test]
    fn stream_pages_and_resumes() {
        let store: Arc<dyn PlayStore> = Arc::new(SqlitePlayStore::in_memory(false).unwrap());
        for day in 1..=7 {
            store
                .record(&play(
                    &format!("uri-{}", day),
                    "u",
                    &format!("2025-03-{:02}T12:00:00Z", day),
                    &format!("Track {}", day),
                    "A",
                ))
                .unwrap();
        }

        let mut stream = PlayStream::new(Arc::clone(&store), "u", 2025, 3);
        let first: Vec<_> = stream.by_ref().take(4).map(|r| r.unwrap()).collect();
        assert_eq!(first.len(), 4);
        let position = stream.position();

        let rest: Vec<_> = PlayStream::resume(Arc::clone(&store), "u", 2025, 3, position)
            .map(|r| r.unwrap())
            .collect();
        let titles: Vec<_> = rest.iter().map(|r| valid(r).track_name.clone()).collect();
        assert_eq!(titles, vec!["Track 5", "Track 6", "Track 7"]);

        let all = PlayStream::new(store, "u", 2025, 7).count();
        assert_eq!(all, 7);
    }

    #[test]
    fn inherits_missing_identifiers() {
        let store = SqlitePlayStore::in_memory(true).unwrap();
        let mut first = play("1", "u", "2025-01-01T00:00:00Z", "Song!", "The Band");
        first.artists[0].external_id = Some("artist-mbid".to_string());
        first.recording_id = Some("rec-mbid".to_string());
        first.release_name = Some("Album".to_string());
        first.release_id = Some("rel-mbid".to_string());
        store.record(&first).unwrap();

        let mut second = play("2", "v", "2025-01-02T00:00:00Z", "song", "Band");
        second.release_name = Some("ALBUM".to_string());
        store.record(&second).unwrap();

        let page = store.plays_page("v", 2025, None, 10).unwrap();
        let stored = valid(&page[0].1);
        assert_eq!(stored.artists[0].external_id.as_deref(), Some("artist-mbid"));
        assert_eq!(stored.recording_id.as_deref(), Some("rec-mbid"));
        assert_eq!(stored.release_id.as_deref(), Some("rel-mbid"));
        assert_eq!(stored.artists[0].name, "Band");
    }

    #[test]
    fn inheritance_can_be_disabled() {
        let store = SqlitePlayStore::in_memory(false).unwrap();
        let mut first = play("1", "u", "2025-01-01T00:00:00Z", "Song", "Band");
        first.recording_id = Some("rec".to_string());
        store.record(&first).unwrap();
        store
            .record(&play("2", "u", "2025-01-02T00:00:00Z", "Song", "Band"))
            .unwrap();

        let page = store.plays_page("u", 2025, None, 10).unwrap();
        assert_eq!(valid(&page[1].1).recording_id, None);
    }

    #[test]
    fn malformed_rows_are_reported_not_fatal() {
        let store = SqlitePlayStore::in_memory(false).unwrap();
        store
            .record(&play("ok", "u", "2025-01-01T00:00:00Z", "Song", "Band"))
            .unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO plays (uri, user_id, track_name, track_key, primary_artist_key, played_at, year)
                 VALUES ('bad', 'u', '   ', '', '', 1735776000000, 2025)",
                [],
            )
            .unwrap();
        }

        let page = store.plays_page("u", 2025, None, 10).unwrap();
        assert_eq!(page.len(), 2);
        assert!(matches!(page[1].1, PlayRecord::Malformed { ref uri, .. } if uri == "bad"));
    }

    #[test]
    fn year_listing_and_artist_totals() {
        let store = SqlitePlayStore::in_memory(false).unwrap();
        store
            .record(&play("1", "u", "2024-12-31T23:00:00Z", "Old", "A"))
            .unwrap();
        store
            .record(&play("2", "u", "2025-01-01T00:00:00Z", "New", "A"))
            .unwrap();
        let mut unknown_length = play("3", "v", "2025-06-01T00:00:00Z", "New", "A");
        unknown_length.duration_ms = None;
        store.record(&unknown_length).unwrap();

        assert_eq!(store.years().unwrap(), vec![2024, 2025]);
        assert_eq!(store.users_for_year(2025).unwrap(), vec!["u", "v"]);

        let rows = store.artist_listening(2025, 210_000).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].user_id, "u");
        assert_eq!(rows[0].duration_ms, 120_000);
        assert_eq!(rows[1].duration_ms, 210_000);
    }

    #[test]
    fn repeated_credits_are_stored_once() {
        let store = SqlitePlayStore::in_memory(false).unwrap();
        let mut p = play("1", "u", "2025-01-01T00:00:00Z", "Song", "A");
        for name in ["B", "a", "the A"] {
            p.artists.push(ArtistCredit {
                name: name.to_string(),
                external_id: None,
            });
        }
        store.record(&p).unwrap();

        let page = store.plays_page("u", 2025, None, 10).unwrap();
        let names: Vec<_> = valid(&page[0].1).artists.iter().map(|a| a.name.clone()).collect();
        assert_eq!(names, vec!["A", "B"]);

        let rows = store.artist_listening(2025, 210_000).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.plays == 1 && row.duration_ms == 120_000));
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plays.db");
        {
            let store = SqlitePlayStore::new(&path, true).unwrap();
            store
                .record(&play("1", "u", "2025-01-01T00:00:00Z", "Song", "A"))
                .unwrap();
        }
        let store = SqlitePlayStore::new(&path, true).unwrap();
        assert_eq!(
            store
                .record(&play("1", "u", "2025-01-01T00:00:00Z", "Song", "A"))
                .unwrap(),
            RecordOutcome::Duplicate
        );
        assert_eq!(store.count_plays(None, 2025).unwrap(), 1);
    }
}
