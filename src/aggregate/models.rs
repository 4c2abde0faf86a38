use super::key::AggregateKey;
use crate::derived::PercentilePoint;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopArtist {
    pub name: String,
    pub plays: u32,
    pub minutes: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_track: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_track_plays: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_track_duration_ms: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopTrack {
    pub title: String,
    pub artist: String,
    pub plays: u32,
    pub minutes: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayActivity {
    /// `YYYY-MM-DD`, UTC.
    pub date: String,
    pub plays: u32,
    pub minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarUser {
    pub user_id: String,
    pub similarity_score: f64,
    pub shared_artists: Vec<String>,
    pub shared_artist_count: u32,
    pub shared_minutes: f64,
}

/// Yearly statistics of one listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalAggregate {
    pub year: i32,
    pub total_minutes: f64,
    pub total_plays: u32,
    pub top_artists: Vec<TopArtist>,
    pub top_tracks: Vec<TopTrack>,
    pub new_artists_count: u32,
    #[serde(default)]
    pub unique_tracks: u32,
    pub activity_graph: Vec<DayActivity>,
    pub hourly_distribution: [u32; 24],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_hour: Option<u8>,
    pub weekday_avg_minutes: f64,
    pub weekend_avg_minutes: f64,
    pub longest_streak: u32,
    pub days_active: u32,
    pub avg_track_length_ms: u64,
    pub listening_diversity: f64,
    pub longest_session_minutes: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similar_users: Option<Vec<SimilarUser>>,
    #[serde(default)]
    pub skipped_events: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopListener {
    pub user_id: String,
    pub plays: u32,
    pub minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalArtist {
    pub name: String,
    pub plays: u32,
    pub minutes: f64,
    pub listeners: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalTrack {
    pub title: String,
    pub artist: String,
    pub plays: u32,
    pub minutes: f64,
    pub listeners: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Distribution {
    pub minutes_percentiles: Vec<PercentilePoint<f64>>,
    pub plays_percentiles: Vec<PercentilePoint<u32>>,
    pub artists_percentiles: Vec<PercentilePoint<u32>>,
    pub tracks_percentiles: Vec<PercentilePoint<u32>>,
}

/// Yearly statistics across every listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAggregate {
    pub year: i32,
    pub total_users: u32,
    pub total_plays: u64,
    pub total_minutes: f64,
    pub verified_minutes: f64,
    pub unique_artists: u32,
    pub unique_tracks: u32,
    pub top_users: Vec<TopListener>,
    pub top_artists: Vec<GlobalArtist>,
    pub top_tracks: Vec<GlobalTrack>,
    pub distribution: Distribution,
    #[serde(default)]
    pub skipped_events: u32,
}

/// The computed statistics for one [`AggregateKey`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum YearlyAggregate {
    Personal(PersonalAggregate),
    Global(GlobalAggregate),
}

impl YearlyAggregate {
    pub fn year(&self) -> i32 {
        match self {
            YearlyAggregate::Personal(a) => a.year,
            YearlyAggregate::Global(a) => a.year,
        }
    }

    pub fn as_personal(&self) -> Option<&PersonalAggregate> {
        match self {
            YearlyAggregate::Personal(a) => Some(a),
            YearlyAggregate::Global(_) => None,
        }
    }

    pub fn as_global(&self) -> Option<&GlobalAggregate> {
        match self {
            YearlyAggregate::Global(a) => Some(a),
            YearlyAggregate::Personal(_) => None,
        }
    }

    pub fn skipped_events(&self) -> u32 {
        match self {
            YearlyAggregate::Personal(a) => a.skipped_events,
            YearlyAggregate::Global(a) => a.skipped_events,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize aggregate")
    }

    /// Decodes a payload written by [`YearlyAggregate::to_json`]; the key decides the shape.
    pub fn from_json(key: &AggregateKey, payload: &str) -> Result<Self> {
        let aggregate = match key {
            AggregateKey::User { .. } => YearlyAggregate::Personal(
                serde_json::from_str(payload).context("Failed to parse personal aggregate")?,
            ),
            AggregateKey::Global { .. } => YearlyAggregate::Global(
                serde_json::from_str(payload).context("Failed to parse global aggregate")?,
            ),
        };
        Ok(aggregate)
    }
}
