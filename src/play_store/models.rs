use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length assumed for a play whose duration is unknown (3.5 minutes).
pub const FALLBACK_TRACK_LENGTH_MS: u32 = 210_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistCredit {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// A play as it arrives from an upstream feed, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncomingPlay {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub track_name: String,
    #[serde(default)]
    pub artists: Vec<ArtistCredit>,
    #[serde(default)]
    pub recording_id: Option<String>,
    #[serde(default)]
    pub release_id: Option<String>,
    #[serde(default)]
    pub release_name: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// ISO-8601 / RFC 3339 timestamp.
    #[serde(default)]
    pub played_at: Option<String>,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid played_at timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("Invalid duration_ms: {0}")]
    InvalidDuration(i64),

    #[error("Batch of {size} plays exceeds the limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// A validated listening event. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayEvent {
    pub user_id: String,
    pub uri: String,
    pub track_name: String,
    pub artists: Vec<ArtistCredit>,
    pub recording_id: Option<String>,
    pub release_id: Option<String>,
    pub release_name: Option<String>,
    pub duration_ms: Option<u32>,
    pub played_at: DateTime<Utc>,
}

impl PlayEvent {
    pub fn year(&self) -> i32 {
        self.played_at.year()
    }

    pub fn date(&self) -> NaiveDate {
        self.played_at.date_naive()
    }

    pub fn hour(&self) -> usize {
        self.played_at.hour() as usize
    }

    pub fn primary_artist(&self) -> Option<&ArtistCredit> {
        self.artists.first()
    }

    /// Duration used for minutes and sessions, substituting `fallback_ms` when unknown.
    pub fn effective_duration_ms(&self, fallback_ms: u32) -> u64 {
        self.duration_ms.unwrap_or(fallback_ms) as u64
    }
}

fn required(value: String, field: &'static str) -> Result<String, IngestError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IngestError::MissingField(field));
    }
    Ok(trimmed.to_string())
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl IncomingPlay {
    pub fn validate(self) -> Result<PlayEvent, IngestError> {
        let user_id = required(self.user_id, "user_id")?;
        let uri = required(self.uri, "uri")?;
        let track_name = required(self.track_name, "track_name")?;

        let raw_played_at = self
            .played_at
            .filter(|s| !s.trim().is_empty())
            .ok_or(IngestError::MissingField("played_at"))?;
        let played_at = DateTime::parse_from_rfc3339(raw_played_at.trim())
            .map_err(|e| IngestError::InvalidTimestamp {
                value: raw_played_at.clone(),
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);

        let duration_ms = match self.duration_ms {
            None | Some(0) => None,
            Some(ms) if ms < 0 || ms > u32::MAX as i64 => {
                return Err(IngestError::InvalidDuration(ms))
            }
            Some(ms) => Some(ms as u32),
        };

        let artists = self
            .artists
            .into_iter()
            .filter_map(|credit| {
                let name = credit.name.trim().to_string();
                if name.is_empty() {
                    None
                } else {
                    Some(ArtistCredit {
                        name,
                        external_id: optional(credit.external_id),
                    })
                }
            })
            .collect();

        Ok(PlayEvent {
            user_id,
            uri,
            track_name,
            artists,
            recording_id: optional(self.recording_id),
            release_id: optional(self.release_id),
            release_name: optional(self.release_name),
            duration_ms,
            played_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Duplicate,
}

/// Position of a play within a key's ordered sequence; resuming after it
/// yields the plays that follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlayCursor {
    pub played_at_ms: i64,
    pub id: i64,
}

/// A stored play as read back for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayRecord {
    Valid(PlayEvent),
    Malformed { uri: String, reason: String },
}

/// Per (user, artist) listening totals for one year.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtistListening {
    pub user_id: String,
    pub artist: String,
    pub plays: u32,
    pub duration_ms: u64,
    pub first_played_at_ms: i64,
}
