//! Test service lifecycle management
//!
//! Each test gets its own databases in a temp directory, a running refresh
//! scheduler and a manager wired to it. Stopping and restarting reuses the
//! directory, like a server restart.

use super::fixtures::FlakyRecomputer;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wrapped_stats_server::aggregate::AggregateKey;
use wrapped_stats_server::cache::{CacheEntry, ResultCache, SqliteResultCache};
use wrapped_stats_server::collaborators::{NoopMetadataEnricher, PassthroughIdentityResolver};
use wrapped_stats_server::config::{AggregationSettings, IngestionSettings, RefreshSettings};
use wrapped_stats_server::play_store::{PlayStore, SqlitePlayStore};
use wrapped_stats_server::refresh::{
    create_refresh_scheduler, RefreshContext, RefreshHandle, RefreshState, RetryStore,
    SqliteRetryStore, StoreRecomputer,
};
use wrapped_stats_server::WrappedManager;

/// Scheduler settings that retry right away.
pub fn fast_settings() -> RefreshSettings {
    RefreshSettings {
        tick_interval_ms: 10,
        initial_backoff_secs: 0,
        max_backoff_secs: 0,
        ..RefreshSettings::default()
    }
}

pub struct TestService {
    pub manager: Arc<WrappedManager>,
    pub handle: RefreshHandle,
    pub play_store: Arc<dyn PlayStore>,
    pub cache: Arc<dyn ResultCache>,
    pub retry_store: Arc<dyn RetryStore>,
    pub recomputer: Arc<FlakyRecomputer>,

    shutdown: CancellationToken,
    scheduler_task: Option<JoinHandle<()>>,
    temp_dir: Option<TempDir>,
}

impl TestService {
    pub async fn spawn() -> Self {
        Self::spawn_with(fast_settings(), 0, Duration::ZERO).await
    }

    /// Starts a service whose first `failures` runs fail, each run taking
    /// at least `delay`.
    pub async fn spawn_with(settings: RefreshSettings, failures: u32, delay: Duration) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self::start(temp_dir, settings, failures, delay)
    }

    fn start(temp_dir: TempDir, settings: RefreshSettings, failures: u32, delay: Duration) -> Self {
        let play_store: Arc<dyn PlayStore> = Arc::new(
            SqlitePlayStore::new(temp_dir.path().join("plays.db"), true)
                .expect("Failed to open play store"),
        );
        let cache: Arc<dyn ResultCache> = Arc::new(
            SqliteResultCache::new(temp_dir.path().join("wrapped_cache.db"))
                .expect("Failed to open result cache"),
        );
        let retry_store: Arc<dyn RetryStore> = Arc::new(
            SqliteRetryStore::new(temp_dir.path().join("refresh_state.db"))
                .expect("Failed to open refresh state"),
        );
        let recomputer = FlakyRecomputer::new(
            StoreRecomputer::new(play_store.clone(), AggregationSettings::default()),
            failures,
            delay,
        );

        let ctx = RefreshContext {
            play_store: play_store.clone(),
            cache: cache.clone(),
            retry_store: retry_store.clone(),
            recomputer: recomputer.clone(),
        };
        let shutdown = CancellationToken::new();
        let (mut scheduler, handle) = create_refresh_scheduler(ctx, settings, shutdown.clone());
        let scheduler_task = tokio::spawn(async move { scheduler.run().await });

        let manager = Arc::new(WrappedManager::new(
            play_store.clone(),
            cache.clone(),
            handle.clone(),
            Arc::new(PassthroughIdentityResolver),
            Arc::new(NoopMetadataEnricher),
            IngestionSettings::default(),
        ));

        Self {
            manager,
            handle,
            play_store,
            cache,
            retry_store,
            recomputer,
            shutdown,
            scheduler_task: Some(scheduler_task),
            temp_dir: Some(temp_dir),
        }
    }

    /// Stops the scheduler and starts a fresh service on the same databases.
    pub async fn restart(mut self, settings: RefreshSettings, failures: u32) -> Self {
        self.shutdown.cancel();
        if let Some(task) = self.scheduler_task.take() {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("Scheduler did not stop")
                .expect("Scheduler panicked");
        }
        let temp_dir = self.temp_dir.take().expect("Service already stopped");
        Self::start(temp_dir, settings, failures, Duration::ZERO)
    }

    /// Polls the scheduler until `key` is in a state matching `predicate`.
    pub async fn wait_for_state(
        &self,
        key: &AggregateKey,
        predicate: impl Fn(&RefreshState) -> bool,
    ) -> RefreshState {
        for _ in 0..500 {
            let state = self.handle.state(key).await;
            if predicate(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached the expected state", key);
    }

    /// Polls the cache until `key` has an entry.
    pub async fn wait_for_entry(&self, key: &AggregateKey) -> CacheEntry {
        for _ in 0..500 {
            if let Some(entry) = self.cache.get(key).expect("Cache read failed") {
                return entry;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} was never cached", key);
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
