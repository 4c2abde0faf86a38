//! Algorithms behind the derived statistics: ranking, streaks, sessions,
//! diversity, percentiles and listener similarity.

pub mod activity;
pub mod diversity;
pub mod percentiles;
pub mod ranking;
pub mod sessions;
pub mod similarity;
pub mod streaks;

pub use activity::{ms_to_minutes, top_hour, weekday_weekend_averages};
pub use diversity::listening_diversity;
pub use percentiles::{
    nearest_rank, percentile_grid, standing_in_grid, PercentilePoint, DEFAULT_PERCENTILE_STEP,
};
pub use ranking::{rank_order, rank_top, Rankable};
pub use sessions::{longest_session_ms, TimedPlay};
pub use similarity::{
    profiles_from_listening, rank_similar, ArtistProfile, ProfileArtist, SimilarityMatch,
};
pub use streaks::longest_streak;
