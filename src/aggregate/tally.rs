//! Single pass over one listener's plays for one year.

use crate::derived::{Rankable, TimedPlay};
use crate::play_store::{normalize_name, PlayEvent, PlayRecord};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct TrackStat {
    pub title: String,
    pub artist: String,
    pub plays: u32,
    pub duration_ms: u64,
    pub first_seen: u64,
    pub recording_id: Option<String>,
    pub release_name: Option<String>,
    pub release_id: Option<String>,
    /// Last known length of the track itself, not the listening total.
    pub track_length_ms: Option<u32>,
}

impl Rankable for TrackStat {
    fn plays(&self) -> u32 {
        self.plays
    }
    fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
    fn first_seen(&self) -> u64 {
        self.first_seen
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtistStat {
    pub name: String,
    pub external_id: Option<String>,
    pub plays: u32,
    pub duration_ms: u64,
    pub first_seen: u64,
}

impl Rankable for ArtistStat {
    fn plays(&self) -> u32 {
        self.plays
    }
    fn duration_ms(&self) -> u64 {
        self.duration_ms
    }
    fn first_seen(&self) -> u64 {
        self.first_seen
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayStat {
    pub plays: u32,
    pub duration_ms: u64,
}

/// Accumulates the raw counters of a personal aggregate.
///
/// Plays must be pushed in `played_at` order for first-seen tie breaking to
/// follow listening order; the play store yields them that way. Artists
/// credited on the same play are first seen in credit order, and an artist
/// credited twice on one play counts once.
#[derive(Debug, Clone)]
pub struct ListenerTally {
    user_id: String,
    year: i32,
    fallback_ms: u32,
    total_plays: u32,
    total_ms: u64,
    verified_ms: u64,
    skipped: u32,
    artists: HashMap<String, ArtistStat>,
    primary_artists: HashSet<String>,
    tracks: HashMap<(String, String), TrackStat>,
    daily: BTreeMap<NaiveDate, DayStat>,
    hourly: [u32; 24],
    timed: Vec<TimedPlay>,
}

impl ListenerTally {
    pub fn new(user_id: &str, year: i32, fallback_ms: u32) -> Self {
        Self {
            user_id: user_id.to_string(),
            year,
            fallback_ms,
            total_plays: 0,
            total_ms: 0,
            verified_ms: 0,
            skipped: 0,
            artists: HashMap::new(),
            primary_artists: HashSet::new(),
            tracks: HashMap::new(),
            daily: BTreeMap::new(),
            hourly: [0; 24],
            timed: Vec::new(),
        }
    }

    pub fn push(&mut self, record: PlayRecord) {
        match record {
            PlayRecord::Valid(play) => self.push_play(&play),
            PlayRecord::Malformed { uri, reason } => {
                debug!("Skipping malformed play {}: {}", uri, reason);
                self.skipped += 1;
            }
        }
    }

    /// Counts a play that cannot be read at all, e.g. a failed decode upstream.
    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    fn push_play(&mut self, play: &PlayEvent) {
        if play.year() != self.year || play.user_id != self.user_id {
            debug!(
                "Skipping play {} outside {}/{}",
                play.uri, self.user_id, self.year
            );
            self.skipped += 1;
            return;
        }

        let ms = play.effective_duration_ms(self.fallback_ms);

        self.total_plays += 1;
        self.total_ms += ms;
        if play.recording_id.is_some() {
            self.verified_ms += ms;
        }

        let mut credited = HashSet::new();
        for credit in &play.artists {
            if !credited.insert(normalize_name(&credit.name)) {
                continue;
            }
            let first_seen = self.artists.len() as u64;
            let stat = self
                .artists
                .entry(credit.name.clone())
                .or_insert_with(|| ArtistStat {
                    name: credit.name.clone(),
                    external_id: None,
                    plays: 0,
                    duration_ms: 0,
                    first_seen,
                });
            stat.plays += 1;
            stat.duration_ms += ms;
            if stat.external_id.is_none() {
                stat.external_id = credit.external_id.clone();
            }
        }

        let artist = play
            .primary_artist()
            .map(|a| a.name.clone())
            .unwrap_or_default();
        if !artist.is_empty() {
            self.primary_artists.insert(artist.clone());
        }
        let first_seen = self.tracks.len() as u64;
        let track = self
            .tracks
            .entry((play.track_name.clone(), artist.clone()))
            .or_insert_with(|| TrackStat {
                title: play.track_name.clone(),
                artist,
                plays: 0,
                duration_ms: 0,
                first_seen,
                recording_id: None,
                release_name: None,
                release_id: None,
                track_length_ms: None,
            });
        track.plays += 1;
        track.duration_ms += ms;
        if play.recording_id.is_some() {
            track.recording_id = play.recording_id.clone();
        }
        if play.release_id.is_some() {
            track.release_id = play.release_id.clone();
        }
        if play.release_name.is_some() {
            track.release_name = play.release_name.clone();
        }
        if play.duration_ms.is_some() {
            track.track_length_ms = play.duration_ms;
        }

        let day = self.daily.entry(play.date()).or_default();
        day.plays += 1;
        day.duration_ms += ms;
        self.hourly[play.hour()] += 1;
        self.timed.push(TimedPlay {
            started_at_ms: play.played_at.timestamp_millis(),
            duration_ms: ms,
        });
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn total_plays(&self) -> u32 {
        self.total_plays
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    /// Listening time of plays that carry a recording id.
    pub fn verified_ms(&self) -> u64 {
        self.verified_ms
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    /// Distinct artists credited first on at least one play.
    pub fn unique_primary_artists(&self) -> usize {
        self.primary_artists.len()
    }

    pub fn unique_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn artists(&self) -> impl Iterator<Item = &ArtistStat> {
        self.artists.values()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackStat> {
        self.tracks.values()
    }

    pub fn daily(&self) -> &BTreeMap<NaiveDate, DayStat> {
        &self.daily
    }

    pub fn hourly(&self) -> &[u32; 24] {
        &self.hourly
    }

    pub fn timed_plays(&self) -> &[TimedPlay] {
        &self.timed
    }

    pub fn is_empty(&self) -> bool {
        self.total_plays == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play_store::ArtistCredit;
    use chrono::{TimeZone, Utc};

    fn play(
        uri: &str,
        user: &str,
        track: &str,
        artists: &[&str],
        at: (i32, u32, u32),
    ) -> PlayRecord {
        PlayRecord::Valid(PlayEvent {
            user_id: user.to_string(),
            uri: uri.to_string(),
            track_name: track.to_string(),
            artists: artists
                .iter()
                .map(|name| ArtistCredit {
                    name: name.to_string(),
                    external_id: None,
                })
                .collect(),
            recording_id: None,
            release_id: None,
            release_name: None,
            duration_ms: Some(60_000),
            played_at: Utc.with_ymd_and_hms(at.0, at.1, at.2, 12, 0, 0).unwrap(),
        })
    }

    #[test]
    fn every_credited_artist_gets_the_play() {
        let mut tally = ListenerTally::new("u", 2025, 210_000);
        tally.push(play("1", "u", "Duet", &["A", "B"], (2025, 3, 1)));
        tally.push(play("2", "u", "Solo", &["A"], (2025, 3, 1)));

        assert_eq!(tally.total_plays(), 2);
        assert_eq!(tally.artists().count(), 2);
        assert_eq!(tally.unique_primary_artists(), 1);
        assert_eq!(tally.unique_tracks(), 2);
        let a = tally.artists().find(|a| a.name == "A").unwrap();
        assert_eq!(a.plays, 2);
        let duet = tally.tracks().find(|t| t.title == "Duet").unwrap();
        assert_eq!(duet.artist, "A");
        assert_eq!(tally.hourly()[12], 2);
        assert_eq!(tally.daily().len(), 1);
    }

    #[test]
    fn repeated_credit_counts_once() {
        let mut tally = ListenerTally::new("u", 2025, 210_000);
        tally.push(play("1", "u", "Echo", &["A", "A", "the a"], (2025, 3, 1)));

        let artists: Vec<&ArtistStat> = tally.artists().collect();
        assert_eq!(artists.len(), 1);
        assert_eq!(artists[0].plays, 1);
        assert_eq!(artists[0].duration_ms, 60_000);
        assert!(artists[0].plays <= tally.total_plays());
    }

    #[test]
    fn primary_artists_ignore_featured_credits() {
        let mut tally = ListenerTally::new("u", 2025, 210_000);
        tally.push(play("1", "u", "Posse Cut", &["A", "B", "C"], (2025, 3, 1)));
        tally.push(play("2", "u", "Remix", &["B", "A"], (2025, 3, 2)));

        assert_eq!(tally.unique_primary_artists(), 2);
        assert_eq!(tally.artists().count(), 3);
    }

    #[test]
    fn plays_outside_the_key_are_skipped() {
        let mut tally = ListenerTally::new("u", 2025, 210_000);
        tally.push(play("1", "u", "Old", &["A"], (2024, 12, 31)));
        tally.push(play("2", "someone-else", "X", &["A"], (2025, 1, 1)));
        tally.push(PlayRecord::Malformed {
            uri: "3".to_string(),
            reason: "blank track".to_string(),
        });

        assert!(tally.is_empty());
        assert_eq!(tally.skipped(), 3);
    }

    #[test]
    fn unknown_duration_uses_fallback() {
        let mut tally = ListenerTally::new("u", 2025, 210_000);
        let mut record = play("1", "u", "T", &["A"], (2025, 5, 5));
        if let PlayRecord::Valid(p) = &mut record {
            p.duration_ms = None;
        }
        tally.push(record);
        assert_eq!(tally.total_ms(), 210_000);
        assert_eq!(tally.verified_ms(), 0);
    }
}
