//! Append-only, deduplicated record of raw listening events.

mod models;
mod normalize;
mod schema;
mod store;

pub use models::{
    ArtistCredit, ArtistListening, IncomingPlay, IngestError, PlayCursor, PlayEvent, PlayRecord,
    RecordOutcome, FALLBACK_TRACK_LENGTH_MS,
};
pub use normalize::normalize_name;
pub use store::{PlayStore, PlayStream, SqlitePlayStore};
