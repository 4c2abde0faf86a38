//! Listener similarity by shared top artists.
//!
//! The score is the raw size of the intersection of two top-artist sets.

use super::ranking::{rank_top, Rankable};
use crate::play_store::ArtistListening;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileArtist {
    pub name: String,
    pub plays: u32,
    pub duration_ms: u64,
    pub first_seen: u64,
}

impl Rankable for ProfileArtist {
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

/// A listener's top artists for one year, in rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtistProfile {
    pub user_id: String,
    pub artists: Vec<ProfileArtist>,
}

impl ArtistProfile {
    /// Ranks `artists` and keeps the top `pool_size` of them.
    pub fn from_ranked(user_id: &str, artists: Vec<ProfileArtist>, pool_size: usize) -> Self {
        Self {
            user_id: user_id.to_string(),
            artists: rank_top(artists, pool_size),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityMatch {
    pub user_id: String,
    pub score: u32,
    /// Shared artist names in the requesting listener's rank order.
    pub shared_artists: Vec<String>,
    /// Combined listening time of both listeners on the shared artists.
    pub shared_duration_ms: u64,
}

/// Builds one profile per listener from per-(user, artist) totals.
pub fn profiles_from_listening(rows: &[ArtistListening], pool_size: usize) -> Vec<ArtistProfile> {
    let mut per_user: BTreeMap<&str, Vec<ProfileArtist>> = BTreeMap::new();
    for row in rows {
        per_user.entry(row.user_id.as_str()).or_default().push(ProfileArtist {
            name: row.artist.clone(),
            plays: row.plays,
            duration_ms: row.duration_ms,
            first_seen: row.first_played_at_ms.max(0) as u64,
        });
    }
    per_user
        .into_iter()
        .map(|(user_id, artists)| ArtistProfile::from_ranked(user_id, artists, pool_size))
        .collect()
}

/// Ranks `candidates` by similarity to `me`.
///
/// Candidates sharing no artist and `me` itself are left out. Ties on the
/// score go to the larger shared listening time, then to the user id.
pub fn rank_similar(
    me: &ArtistProfile,
    candidates: &[ArtistProfile],
    limit: usize,
) -> Vec<SimilarityMatch> {
    let mine: HashMap<&str, u64> = me
        .artists
        .iter()
        .map(|a| (a.name.as_str(), a.duration_ms))
        .collect();

    let mut matches: Vec<SimilarityMatch> = candidates
        .iter()
        .filter(|c| c.user_id != me.user_id)
        .filter_map(|candidate| {
            let theirs: HashMap<&str, u64> = candidate
                .artists
                .iter()
                .map(|a| (a.name.as_str(), a.duration_ms))
                .collect();
            let shared: Vec<&ProfileArtist> = me
                .artists
                .iter()
                .filter(|a| theirs.contains_key(a.name.as_str()))
                .collect();
            if shared.is_empty() {
                return None;
            }
            let shared_duration_ms = shared
                .iter()
                .map(|a| mine[a.name.as_str()] + theirs[a.name.as_str()])
                .sum();
            Some(SimilarityMatch {
                user_id: candidate.user_id.clone(),
                score: shared.len() as u32,
                shared_artists: shared.iter().map(|a| a.name.clone()).collect(),
                shared_duration_ms,
            })
        })
        .collect();

    matches.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.shared_duration_ms.cmp(&a.shared_duration_ms))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    matches.truncate(limit);
    matches
}
