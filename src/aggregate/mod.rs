//! Yearly aggregates: keys, output shapes and the pure builders.

mod builder;
mod global;
mod key;
mod models;
mod tally;

pub use builder::{artist_profile, build, build_personal, tally_events};
pub use global::{build_global, ListenerStanding};
pub use key::AggregateKey;
pub use models::{
    DayActivity, Distribution, GlobalAggregate, GlobalArtist, GlobalTrack, PersonalAggregate,
    SimilarUser, TopArtist, TopListener, TopTrack, YearlyAggregate,
};
pub use tally::{ArtistStat, DayStat, ListenerTally, TrackStat};
