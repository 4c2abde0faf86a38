//! Cross-listener aggregate of one year, built from per-listener tallies.

use super::models::{
    Distribution, GlobalAggregate, GlobalArtist, GlobalTrack, PersonalAggregate, TopListener,
};
use super::tally::ListenerTally;
use crate::config::AggregationSettings;
use crate::derived::{ms_to_minutes, percentile_grid, rank_top, standing_in_grid, Rankable};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
struct MergedStat {
    name: String,
    artist: String,
    plays: u32,
    duration_ms: u64,
    first_seen: u64,
    listeners: HashSet<String>,
    external_id: Option<String>,
}

impl Rankable for MergedStat {
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

#[derive(Default)]
struct Merger {
    entries: HashMap<(String, String), MergedStat>,
}

impl Merger {
    fn add(
        &mut self,
        name: &str,
        artist: &str,
        user_id: &str,
        plays: u32,
        duration_ms: u64,
        external_id: Option<&String>,
    ) {
        let first_seen = self.entries.len() as u64;
        let entry = self
            .entries
            .entry((name.to_string(), artist.to_string()))
            .or_insert_with(|| MergedStat {
                name: name.to_string(),
                artist: artist.to_string(),
                plays: 0,
                duration_ms: 0,
                first_seen,
                listeners: HashSet::new(),
                external_id: None,
            });
        entry.plays += plays;
        entry.duration_ms += duration_ms;
        entry.listeners.insert(user_id.to_string());
        if entry.external_id.is_none() {
            entry.external_id = external_id.cloned();
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn top(self, limit: usize) -> Vec<MergedStat> {
        rank_top(self.entries.into_values().collect(), limit)
    }
}

/// Builds the global aggregate of `year` from the listeners' tallies.
///
/// Tallies are visited in user id order so first-seen tie breaking does not
/// depend on the order they were handed in. Listeners without a valid play
/// contribute only their skipped events.
pub fn build_global(
    year: i32,
    tallies: &[ListenerTally],
    settings: &AggregationSettings,
) -> GlobalAggregate {
    let mut ordered: Vec<&ListenerTally> = tallies.iter().collect();
    ordered.sort_by(|a, b| a.user_id().cmp(b.user_id()));
    let skipped_events = ordered.iter().map(|t| t.skipped()).sum();
    ordered.retain(|t| !t.is_empty());

    let mut artists = Merger::default();
    let mut tracks = Merger::default();
    for tally in &ordered {
        let mut own_artists: Vec<_> = tally.artists().collect();
        own_artists.sort_by_key(|a| a.first_seen);
        for a in own_artists {
            artists.add(
                &a.name,
                "",
                tally.user_id(),
                a.plays,
                a.duration_ms,
                a.external_id.as_ref(),
            );
        }
        let mut own_tracks: Vec<_> = tally.tracks().collect();
        own_tracks.sort_by_key(|t| t.first_seen);
        for t in own_tracks {
            tracks.add(
                &t.title,
                &t.artist,
                tally.user_id(),
                t.plays,
                t.duration_ms,
                t.recording_id.as_ref(),
            );
        }
    }

    let mut by_minutes = ordered.clone();
    by_minutes.sort_by(|a, b| {
        b.total_ms()
            .cmp(&a.total_ms())
            .then_with(|| b.total_plays().cmp(&a.total_plays()))
            .then_with(|| a.user_id().cmp(b.user_id()))
    });
    let top_users = by_minutes
        .iter()
        .take(settings.top_users)
        .map(|t| TopListener {
            user_id: t.user_id().to_string(),
            plays: t.total_plays(),
            minutes: ms_to_minutes(t.total_ms()),
        })
        .collect();

    let step = settings.percentile_step;
    let distribution = Distribution {
        minutes_percentiles: percentile_grid(
            ordered.iter().map(|t| ms_to_minutes(t.total_ms())).collect(),
            step,
        ),
        plays_percentiles: percentile_grid(ordered.iter().map(|t| t.total_plays()).collect(), step),
        artists_percentiles: percentile_grid(
            ordered.iter().map(|t| t.unique_primary_artists() as u32).collect(),
            step,
        ),
        tracks_percentiles: percentile_grid(
            ordered.iter().map(|t| t.unique_tracks() as u32).collect(),
            step,
        ),
    };

    let unique_artists = artists.len() as u32;
    let unique_tracks = tracks.len() as u32;

    GlobalAggregate {
        year,
        total_users: ordered.len() as u32,
        total_plays: ordered.iter().map(|t| t.total_plays() as u64).sum(),
        total_minutes: ms_to_minutes(ordered.iter().map(|t| t.total_ms()).sum()),
        verified_minutes: ms_to_minutes(ordered.iter().map(|t| t.verified_ms()).sum()),
        unique_artists,
        unique_tracks,
        top_users,
        top_artists: artists
            .top(settings.top_artists)
            .into_iter()
            .map(|a| GlobalArtist {
                minutes: ms_to_minutes(a.duration_ms),
                listeners: a.listeners.len() as u32,
                name: a.name,
                plays: a.plays,
                external_id: a.external_id,
            })
            .collect(),
        top_tracks: tracks
            .top(settings.top_tracks)
            .into_iter()
            .map(|t| GlobalTrack {
                minutes: ms_to_minutes(t.duration_ms),
                listeners: t.listeners.len() as u32,
                title: t.name,
                artist: t.artist,
                plays: t.plays,
                recording_id: t.external_id,
            })
            .collect(),
        distribution,
        skipped_events,
    }
}

/// Where a listener stands among all listeners of the year: for each
/// statistic, the percent of listeners with a strictly lower value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ListenerStanding {
    pub minutes: u8,
    pub plays: u8,
    pub artists: u8,
    pub tracks: u8,
}

impl ListenerStanding {
    /// Estimates the standing from the grid points of a global distribution.
    pub fn from_distribution(distribution: &Distribution, personal: &PersonalAggregate) -> Self {
        Self {
            minutes: standing_in_grid(&distribution.minutes_percentiles, personal.total_minutes),
            plays: standing_in_grid(&distribution.plays_percentiles, personal.total_plays),
            artists: standing_in_grid(
                &distribution.artists_percentiles,
                personal.new_artists_count,
            ),
            tracks: standing_in_grid(&distribution.tracks_percentiles, personal.unique_tracks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::builder::{build_personal, tally_events};
    use crate::play_store::{ArtistCredit, PlayEvent, PlayRecord};
    use chrono::{TimeZone, Utc};

    fn play(user: &str, n: u32, track: &str, artist: &str, recorded: bool) -> PlayRecord {
        PlayRecord::Valid(PlayEvent {
            user_id: user.to_string(),
            uri: format!("{}/{}", user, n),
            track_name: track.to_string(),
            artists: vec![ArtistCredit {
                name: artist.to_string(),
                external_id: None,
            }],
            recording_id: recorded.then(|| format!("rec-{}", track)),
            release_id: None,
            release_name: None,
            duration_ms: Some(60_000),
            played_at: Utc.with_ymd_and_hms(2025, 2, 1, 8, n, 0).unwrap(),
        })
    }

    fn tallies() -> Vec<ListenerTally> {
        let settings = AggregationSettings::default();
        vec![
            tally_events(
                "bob",
                2025,
                vec![
                    play("bob", 0, "Hit", "Star", true),
                    play("bob", 1, "Hit", "Star", true),
                ],
                &settings,
            ),
            tally_events(
                "amy",
                2025,
                vec![
                    play("amy", 0, "Hit", "Star", false),
                    play("amy", 1, "Deep Cut", "Indie", false),
                    play("amy", 2, "Deep Cut", "Indie", false),
                ],
                &settings,
            ),
            tally_events("idle", 2025, Vec::new(), &settings),
        ]
    }

    #[test]
    fn merges_listeners() {
        let global = build_global(2025, &tallies(), &AggregationSettings::default());

        assert_eq!(global.total_users, 2);
        assert_eq!(global.total_plays, 5);
        assert_eq!(global.total_minutes, 5.0);
        assert_eq!(global.verified_minutes, 2.0);
        assert_eq!(global.unique_artists, 2);
        assert_eq!(global.unique_tracks, 2);

        assert_eq!(global.top_artists[0].name, "Star");
        assert_eq!(global.top_artists[0].plays, 3);
        assert_eq!(global.top_artists[0].listeners, 2);
        assert_eq!(global.top_tracks[0].title, "Hit");
        assert_eq!(global.top_tracks[0].recording_id.as_deref(), Some("rec-Hit"));

        assert_eq!(global.top_users[0].user_id, "amy");
        assert_eq!(global.top_users[0].minutes, 3.0);
    }

    #[test]
    fn distribution_covers_active_listeners() {
        let global = build_global(2025, &tallies(), &AggregationSettings::default());
        let plays = &global.distribution.plays_percentiles;
        assert_eq!(plays.len(), 21);
        assert_eq!(plays.first().map(|p| p.1), Some(2));
        assert_eq!(plays.last().map(|p| p.1), Some(3));
    }

    #[test]
    fn input_order_does_not_matter() {
        let settings = AggregationSettings::default();
        let mut reversed = tallies();
        reversed.reverse();
        assert_eq!(
            build_global(2025, &tallies(), &settings),
            build_global(2025, &reversed, &settings)
        );
    }

    #[test]
    fn empty_year() {
        let global = build_global(2030, &[], &AggregationSettings::default());
        assert_eq!(global.total_users, 0);
        assert!(global.distribution.minutes_percentiles.is_empty());
        assert!(global.top_users.is_empty());
    }

    #[test]
    fn standing_against_the_grid() {
        let settings = AggregationSettings::default();
        let all = tallies();
        let global = build_global(2025, &all, &settings);
        let amy = build_personal(&all[1], &settings, None);

        let standing = ListenerStanding::from_distribution(&global.distribution, &amy);
        assert_eq!(standing.plays, 50);
        assert_eq!(standing.artists, 50);

        let bob = build_personal(&all[0], &settings, None);
        assert_eq!(
            ListenerStanding::from_distribution(&global.distribution, &bob).plays,
            0
        );
    }
}
