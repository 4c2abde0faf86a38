//! Play builders and a recomputer that can be told to misbehave.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wrapped_stats_server::aggregate::{AggregateKey, YearlyAggregate};
use wrapped_stats_server::play_store::{ArtistCredit, IncomingPlay};
use wrapped_stats_server::refresh::{Recomputer, RefreshError, StoreRecomputer};

/// A two-minute play by "Test Artist".
pub fn play(user_id: &str, uri: &str, track_name: &str, played_at: &str) -> IncomingPlay {
    play_with_duration(user_id, uri, track_name, played_at, 120_000)
}

pub fn play_with_duration(
    user_id: &str,
    uri: &str,
    track_name: &str,
    played_at: &str,
    duration_ms: i64,
) -> IncomingPlay {
    IncomingPlay {
        user_id: user_id.to_string(),
        uri: uri.to_string(),
        track_name: track_name.to_string(),
        artists: vec![ArtistCredit {
            name: "Test Artist".to_string(),
            external_id: None,
        }],
        duration_ms: Some(duration_ms),
        played_at: Some(played_at.to_string()),
        ..IncomingPlay::default()
    }
}

/// Delegates to a real recomputer after failing a configurable number of
/// times, and records how many runs overlapped.
pub struct FlakyRecomputer {
    inner: StoreRecomputer,
    pub failures_left: AtomicU32,
    pub delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FlakyRecomputer {
    pub fn new(inner: StoreRecomputer, failures: u32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures_left: AtomicU32::new(failures),
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

impl Recomputer for FlakyRecomputer {
    fn recompute(
        &self,
        key: &AggregateKey,
        cancel: &CancellationToken,
    ) -> Result<YearlyAggregate, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        std::thread::sleep(self.delay);

        let result = if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(RefreshError::Store(anyhow::anyhow!("play store unavailable")))
        } else {
            self.inner.recompute(key, cancel)
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
