use super::RefreshError;
use crate::aggregate::{
    build_global, build_personal, AggregateKey, ListenerTally, YearlyAggregate,
};
use crate::config::AggregationSettings;
use crate::derived::profiles_from_listening;
use crate::play_store::{PlayStore, PlayStream};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Plays read between two cancellation checks.
///
/// A page read that fails is retried once from the last play tallied.
const CANCEL_CHECK_EVERY: usize = 256;

/// Computes the aggregate of one key from the current play set.
///
/// Runs on a blocking thread. Implementations should check `cancel` during
/// long reads and return [`RefreshError::Cancelled`] once it fires.
pub trait Recomputer: Send + Sync {
    fn recompute(
        &self,
        key: &AggregateKey,
        cancel: &CancellationToken,
    ) -> Result<YearlyAggregate, RefreshError>;
}

/// Recomputes aggregates straight from the play store.
pub struct StoreRecomputer {
    play_store: Arc<dyn PlayStore>,
    settings: AggregationSettings,
}

impl StoreRecomputer {
    pub fn new(play_store: Arc<dyn PlayStore>, settings: AggregationSettings) -> Self {
        Self {
            play_store,
            settings,
        }
    }

    fn tally_user(
        &self,
        user_id: &str,
        year: i32,
        cancel: &CancellationToken,
    ) -> Result<ListenerTally, RefreshError> {
        let mut tally = ListenerTally::new(user_id, year, self.settings.fallback_track_length_ms);
        let mut stream = PlayStream::new(
            Arc::clone(&self.play_store),
            user_id,
            year,
            self.settings.page_size,
        );
        let mut read = 0usize;
        let mut retried = false;
        while let Some(record) = stream.next() {
            if read % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
                return Err(RefreshError::Cancelled);
            }
            match record {
                Ok(record) => {
                    tally.push(record);
                    read += 1;
                    retried = false;
                }
                Err(e) if !retried => {
                    warn!(
                        "Reading plays of {} for {} failed after {} plays, retrying page: {}",
                        user_id, year, read, e
                    );
                    retried = true;
                    stream = PlayStream::resume(
                        Arc::clone(&self.play_store),
                        user_id,
                        year,
                        self.settings.page_size,
                        stream.position(),
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(tally)
    }
}

impl Recomputer for StoreRecomputer {
    fn recompute(
        &self,
        key: &AggregateKey,
        cancel: &CancellationToken,
    ) -> Result<YearlyAggregate, RefreshError> {
        match key {
            AggregateKey::User { user_id, year } => {
                let tally = self.tally_user(user_id, *year, cancel)?;
                let listening = self
                    .play_store
                    .artist_listening(*year, self.settings.fallback_track_length_ms)?;
                let peers = profiles_from_listening(&listening, self.settings.similarity_pool);
                debug!("Built {} with {} candidate peers", key, peers.len());
                Ok(YearlyAggregate::Personal(build_personal(
                    &tally,
                    &self.settings,
                    Some(&peers),
                )))
            }
            AggregateKey::Global { year } => {
                let users = self.play_store.users_for_year(*year)?;
                let mut tallies = Vec::with_capacity(users.len());
                for user_id in &users {
                    if cancel.is_cancelled() {
                        return Err(RefreshError::Cancelled);
                    }
                    tallies.push(self.tally_user(user_id, *year, cancel)?);
                }
                Ok(YearlyAggregate::Global(build_global(
                    *year,
                    &tallies,
                    &self.settings,
                )))
            }
        }
    }
}
