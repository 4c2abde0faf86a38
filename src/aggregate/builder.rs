//! Pure construction of yearly aggregates from plays.

use super::global::build_global;
use super::key::AggregateKey;
use super::models::{
    DayActivity, PersonalAggregate, SimilarUser, TopArtist, TopTrack, YearlyAggregate,
};
use super::tally::{ListenerTally, TrackStat};
use crate::config::AggregationSettings;
use crate::derived::{
    listening_diversity, longest_session_ms, longest_streak, ms_to_minutes, rank_similar,
    rank_top, top_hour, weekday_weekend_averages, ArtistProfile, ProfileArtist,
};
use crate::play_store::PlayRecord;
use std::collections::BTreeMap;

/// Builds the aggregate of `key` from its plays.
///
/// For a global key the plays are grouped per listener first and the global
/// aggregate is built from those tallies. Personal aggregates built here carry
/// no similar users, since that needs the other listeners of the year.
pub fn build<I>(key: &AggregateKey, events: I, settings: &AggregationSettings) -> YearlyAggregate
where
    I: IntoIterator<Item = PlayRecord>,
{
    match key {
        AggregateKey::User { user_id, year } => {
            let tally = tally_events(user_id, *year, events, settings);
            YearlyAggregate::Personal(build_personal(&tally, settings, None))
        }
        AggregateKey::Global { year } => {
            let mut tallies: BTreeMap<String, ListenerTally> = BTreeMap::new();
            let mut unattributed = 0;
            for record in events {
                let user_id = match &record {
                    PlayRecord::Valid(play) => play.user_id.clone(),
                    PlayRecord::Malformed { .. } => {
                        unattributed += 1;
                        continue;
                    }
                };
                tallies
                    .entry(user_id)
                    .or_insert_with_key(|user_id| {
                        ListenerTally::new(user_id, *year, settings.fallback_track_length_ms)
                    })
                    .push(record);
            }
            let tallies: Vec<ListenerTally> = tallies.into_values().collect();
            let mut aggregate = build_global(*year, &tallies, settings);
            aggregate.skipped_events += unattributed;
            YearlyAggregate::Global(aggregate)
        }
    }
}

/// Runs one listener's plays through a fresh tally.
pub fn tally_events<I>(
    user_id: &str,
    year: i32,
    events: I,
    settings: &AggregationSettings,
) -> ListenerTally
where
    I: IntoIterator<Item = PlayRecord>,
{
    let mut tally = ListenerTally::new(user_id, year, settings.fallback_track_length_ms);
    for record in events {
        tally.push(record);
    }
    tally
}

/// The listener's top artists as used for similarity matching.
pub fn artist_profile(tally: &ListenerTally, pool_size: usize) -> ArtistProfile {
    let artists = tally
        .artists()
        .map(|a| ProfileArtist {
            name: a.name.clone(),
            plays: a.plays,
            duration_ms: a.duration_ms,
            first_seen: a.first_seen,
        })
        .collect();
    ArtistProfile::from_ranked(tally.user_id(), artists, pool_size)
}

/// Finishes a personal aggregate from its tally.
///
/// `peers` holds the top-artist profiles of the year's listeners; when given,
/// the listener's own profile is taken from it if present so both sides of a
/// comparison are ranked the same way.
pub fn build_personal(
    tally: &ListenerTally,
    settings: &AggregationSettings,
    peers: Option<&[ArtistProfile]>,
) -> PersonalAggregate {
    let total_plays = tally.total_plays();

    let tracks: Vec<TrackStat> = tally.tracks().cloned().collect();
    let top_artists = rank_top(tally.artists().cloned().collect(), settings.top_artists)
        .into_iter()
        .map(|artist| {
            let best = rank_top(
                tracks
                    .iter()
                    .filter(|t| t.artist == artist.name)
                    .cloned()
                    .collect(),
                1,
            )
            .pop();
            TopArtist {
                minutes: ms_to_minutes(artist.duration_ms),
                top_track: best.as_ref().map(|t| t.title.clone()),
                top_track_plays: best.as_ref().map(|t| t.plays),
                top_track_duration_ms: best.and_then(|t| t.track_length_ms),
                name: artist.name,
                plays: artist.plays,
                external_id: artist.external_id,
            }
        })
        .collect();

    let top_tracks = rank_top(tracks, settings.top_tracks)
        .into_iter()
        .map(|t| TopTrack {
            minutes: ms_to_minutes(t.duration_ms),
            title: t.title,
            artist: t.artist,
            plays: t.plays,
            recording_id: t.recording_id,
            release_name: t.release_name,
            release_id: t.release_id,
        })
        .collect();

    let activity_graph = tally
        .daily()
        .iter()
        .map(|(date, day)| DayActivity {
            date: date.format("%Y-%m-%d").to_string(),
            plays: day.plays,
            minutes: ms_to_minutes(day.duration_ms),
        })
        .collect();
    let daily_ms: BTreeMap<_, _> = tally
        .daily()
        .iter()
        .map(|(date, day)| (*date, day.duration_ms))
        .collect();
    let (weekday_avg_minutes, weekend_avg_minutes) = weekday_weekend_averages(&daily_ms);

    let avg_track_length_ms = if total_plays == 0 {
        0
    } else {
        tally.total_ms() / total_plays as u64
    };

    let similar_users = peers.map(|peers| {
        let me = peers
            .iter()
            .find(|p| p.user_id == tally.user_id())
            .cloned()
            .unwrap_or_else(|| artist_profile(tally, settings.similarity_pool));
        rank_similar(&me, peers, settings.similar_users)
            .into_iter()
            .map(|m| SimilarUser {
                user_id: m.user_id,
                similarity_score: m.score as f64,
                shared_artist_count: m.score,
                shared_artists: m.shared_artists,
                shared_minutes: ms_to_minutes(m.shared_duration_ms),
            })
            .collect()
    });

    PersonalAggregate {
        year: tally.year(),
        total_minutes: ms_to_minutes(tally.total_ms()),
        total_plays,
        top_artists,
        top_tracks,
        new_artists_count: tally.unique_primary_artists() as u32,
        unique_tracks: tally.unique_tracks() as u32,
        activity_graph,
        hourly_distribution: *tally.hourly(),
        top_hour: top_hour(tally.hourly()),
        weekday_avg_minutes,
        weekend_avg_minutes,
        longest_streak: longest_streak(tally.daily().keys().copied()),
        days_active: tally.daily().len() as u32,
        avg_track_length_ms,
        listening_diversity: listening_diversity(
            tally.unique_tracks(),
            total_plays as usize,
        ),
        longest_session_minutes: ms_to_minutes(longest_session_ms(
            tally.timed_plays(),
            settings.session_idle_threshold_ms,
        )),
        similar_users,
        skipped_events: tally.skipped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play_store::{ArtistCredit, PlayEvent};
    use chrono::{TimeZone, Utc};

    fn play(
        uri: &str,
        track: &str,
        artist: &str,
        day: u32,
        hour: u32,
        minutes: u32,
    ) -> PlayRecord {
        PlayRecord::Valid(PlayEvent {
            user_id: "u".to_string(),
            uri: uri.to_string(),
            track_name: track.to_string(),
            artists: vec![ArtistCredit {
                name: artist.to_string(),
                external_id: None,
            }],
            recording_id: None,
            release_id: None,
            release_name: None,
            duration_ms: Some(minutes * 60_000),
            played_at: Utc.with_ymd_and_hms(2025, 1, day, hour, 0, 0).unwrap(),
        })
    }

    fn personal(events: Vec<PlayRecord>) -> PersonalAggregate {
        match build(&AggregateKey::user("u", 2025), events, &AggregationSettings::default()) {
            YearlyAggregate::Personal(p) => p,
            other => panic!("expected personal aggregate, got {:?}", other),
        }
    }

    #[test]
    fn three_plays_on_three_days() {
        let aggregate = personal(vec![
            play("1", "Song", "Band", 1, 10, 2),
            play("2", "Song", "Band", 2, 10, 2),
            play("3", "Song", "Band", 4, 10, 2),
        ]);

        assert_eq!(aggregate.days_active, 3);
        assert_eq!(aggregate.longest_streak, 2);
        assert_eq!(aggregate.listening_diversity, 1.0 / 3.0);
        assert_eq!(aggregate.top_tracks[0].plays, 3);
        assert_eq!(aggregate.total_plays, 3);
        assert_eq!(aggregate.total_minutes, 6.0);
        assert_eq!(aggregate.avg_track_length_ms, 120_000);
        assert_eq!(aggregate.top_hour, Some(10));
        assert_eq!(aggregate.activity_graph[2].date, "2025-01-04");
        assert_eq!(aggregate.top_artists[0].top_track.as_deref(), Some("Song"));
        assert_eq!(aggregate.top_artists[0].top_track_plays, Some(3));
        assert!(aggregate.similar_users.is_none());
    }

    #[test]
    fn new_artists_count_primary_credits_only() {
        let mut collab = play("1", "Posse Cut", "A", 3, 9, 3);
        if let PlayRecord::Valid(p) = &mut collab {
            for name in ["B", "C", "A"] {
                p.artists.push(ArtistCredit {
                    name: name.to_string(),
                    external_id: None,
                });
            }
        }
        let aggregate = personal(vec![collab]);

        assert_eq!(aggregate.new_artists_count, 1);
        assert_eq!(aggregate.top_artists.len(), 3);
        assert!(aggregate.top_artists.iter().all(|a| a.plays == 1));
        assert_eq!(aggregate.top_artists[0].name, "A");
        assert_eq!(aggregate.top_artists[0].top_track.as_deref(), Some("Posse Cut"));
    }

    #[test]
    fn empty_input_is_zero_valued() {
        let aggregate = personal(Vec::new());
        assert_eq!(aggregate.total_plays, 0);
        assert_eq!(aggregate.total_minutes, 0.0);
        assert_eq!(aggregate.listening_diversity, 0.0);
        assert_eq!(aggregate.longest_streak, 0);
        assert_eq!(aggregate.top_hour, None);
        assert!(aggregate.top_artists.is_empty());
        assert!(aggregate.activity_graph.is_empty());
    }

    #[test]
    fn same_input_same_bytes() {
        let events = vec![
            play("1", "A", "X", 1, 1, 3),
            play("2", "B", "Y", 1, 2, 3),
            play("3", "C", "Z", 2, 3, 3),
            play("4", "D", "W", 3, 4, 3),
        ];
        let settings = AggregationSettings::default();
        let key = AggregateKey::user("u", 2025);
        let first = build(&key, events.clone(), &settings).to_json().unwrap();
        let second = build(&key, events, &settings).to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn equal_counts_keep_first_seen_order() {
        let aggregate = personal(vec![
            play("1", "First", "Early", 1, 1, 3),
            play("2", "Second", "Late", 1, 2, 3),
        ]);
        let names: Vec<_> = aggregate.top_artists.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Early", "Late"]);
        assert_eq!(aggregate.top_tracks[0].title, "First");
    }

    #[test]
    fn sessions_and_malformed_events() {
        // both plays start at 20:00 and overlap into one 3 minute session
        let mut events = vec![
            play("1", "A", "X", 1, 20, 3),
            play("2", "B", "X", 1, 20, 3),
        ];
        events.push(PlayRecord::Malformed {
            uri: "bad".to_string(),
            reason: "blank track name".to_string(),
        });
        let aggregate = personal(events);
        assert_eq!(aggregate.longest_session_minutes, 3.0);
        assert_eq!(aggregate.skipped_events, 1);
        assert_eq!(aggregate.total_plays, 2);
    }

    #[test]
    fn similar_users_come_from_peers() {
        let settings = AggregationSettings::default();
        let tally = tally_events("u", 2025, vec![play("1", "A", "X", 1, 1, 3)], &settings);
        let other = ArtistProfile {
            user_id: "v".to_string(),
            artists: vec![ProfileArtist {
                name: "X".to_string(),
                plays: 4,
                duration_ms: 240_000,
                first_seen: 0,
            }],
        };
        let peers = vec![artist_profile(&tally, 50), other];

        let aggregate = build_personal(&tally, &settings, Some(&peers));
        let similar = aggregate.similar_users.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].user_id, "v");
        assert_eq!(similar[0].shared_artists, vec!["X"]);
        assert_eq!(similar[0].shared_minutes, 7.0);
    }
}
