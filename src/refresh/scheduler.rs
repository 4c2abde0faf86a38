use super::handle::{RefreshCommand, RefreshHandle, RefreshOutcome};
use super::recompute::Recomputer;
use super::retry_policy::RetryPolicy;
use super::retry_store::{RetryOutcome, RetryStore};
use super::state::{DirtyReason, KeyStateTable, RefreshState};
use super::RefreshError;
use crate::aggregate::AggregateKey;
use crate::cache::{CacheEntry, ResultCache};
use crate::config::RefreshSettings;
use crate::metrics;
use crate::play_store::PlayStore;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for in-flight runs to notice cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Stores and collaborators the scheduler works with.
#[derive(Clone)]
pub struct RefreshContext {
    pub play_store: Arc<dyn PlayStore>,
    pub cache: Arc<dyn ResultCache>,
    pub retry_store: Arc<dyn RetryStore>,
    pub recomputer: Arc<dyn Recomputer>,
}

struct FinishedRun {
    key: AggregateKey,
    result: Result<CacheEntry, RefreshError>,
    elapsed: Duration,
}

/// Owns every refresh state transition.
pub struct RefreshScheduler {
    /// Shared state accessible by RefreshHandle
    shared_state: Arc<RwLock<KeyStateTable>>,

    ctx: RefreshContext,
    policy: RetryPolicy,
    settings: RefreshSettings,

    /// Receiver for commands from RefreshHandle
    command_receiver: mpsc::Receiver<RefreshCommand>,

    finished_tx: mpsc::UnboundedSender<FinishedRun>,
    finished_rx: mpsc::UnboundedReceiver<FinishedRun>,

    /// Cancellation token of each in-flight run.
    running: HashMap<AggregateKey, CancellationToken>,

    /// Synchronous requests waiting for the next run of a key to finish.
    waiters: HashMap<AggregateKey, Vec<oneshot::Sender<RefreshOutcome>>>,

    /// Years with a successful personal refresh since the last global refresh.
    touched_years: BTreeSet<i32>,

    shutdown_token: CancellationToken,
}

impl RefreshScheduler {
    pub fn new(
        ctx: RefreshContext,
        settings: RefreshSettings,
        command_receiver: mpsc::Receiver<RefreshCommand>,
        shutdown_token: CancellationToken,
        shared_state: Arc<RwLock<KeyStateTable>>,
    ) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            shared_state,
            ctx,
            policy: RetryPolicy::new(&settings),
            settings,
            command_receiver,
            finished_tx,
            finished_rx,
            running: HashMap::new(),
            waiters: HashMap::new(),
            touched_years: BTreeSet::new(),
            shutdown_token,
        }
    }

    /// Main scheduler loop.
    pub async fn run(&mut self) {
        info!(
            "Starting refresh scheduler (max {} concurrent, {:?} budget per run)",
            self.settings.max_concurrent,
            self.settings.run_timeout()
        );
        self.restore().await;

        let mut tick = tokio::time::interval(self.settings.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let global_interval = self.settings.global_refresh_interval();
        let mut global_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + global_interval, global_interval);
        global_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.dispatch().await;

            tokio::select! {
                _ = tick.tick() => {
                    self.on_tick().await;
                }
                _ = global_tick.tick() => {
                    self.refresh_touched_globals().await;
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd).await;
                }
                Some(done) = self.finished_rx.recv() => {
                    self.handle_finished(done).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Refresh scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Refresh scheduler stopped");
    }

    /// Rebuilds the in-memory state from the refresh-state database.
    async fn restore(&mut self) {
        let now = Utc::now();
        match self.ctx.retry_store.list(false) {
            Ok(states) => {
                let mut table = self.shared_state.write().await;
                for retry in &states {
                    let state = match (retry.outcome, retry.next_attempt_at) {
                        (RetryOutcome::Backoff, Some(until)) => RefreshState::Backoff { until },
                        (RetryOutcome::Backoff, None) => RefreshState::Backoff { until: now },
                        (RetryOutcome::Exhausted, _) => RefreshState::Stuck,
                    };
                    table.restore(&retry.key, state);
                }
                if !states.is_empty() {
                    info!("Restored {} keys from the retry queue", states.len());
                }
            }
            Err(e) => error!("Failed to load retry queue: {:#}", e),
        }

        self.drain_requests().await;

        match self.ctx.play_store.years() {
            Ok(years) => {
                for year in years {
                    let key = AggregateKey::global(year);
                    match self.ctx.cache.get(&key) {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            debug!("No cached aggregate for {}, scheduling it", key);
                            self.shared_state
                                .write()
                                .await
                                .mark_dirty(&key, DirtyReason::Startup);
                        }
                        Err(e) => warn!("Failed to read cache entry {}: {:#}", key, e),
                    }
                }
            }
            Err(e) => error!("Failed to list play years: {:#}", e),
        }

        self.update_gauges().await;
    }

    /// Starts runs for dirty keys while there is capacity.
    async fn dispatch(&mut self) {
        let capacity = self.settings.max_concurrent.saturating_sub(self.running.len());
        if capacity == 0 {
            return;
        }
        let keys = {
            let mut table = self.shared_state.write().await;
            let keys = table.next_dirty(capacity);
            for key in &keys {
                table.start(key);
            }
            keys
        };
        if keys.is_empty() {
            return;
        }
        for key in keys {
            self.spawn_run(key);
        }
        self.update_gauges().await;
    }

    fn spawn_run(&mut self, key: AggregateKey) {
        let cancel = self.shutdown_token.child_token();
        self.running.insert(key.clone(), cancel.clone());

        let recomputer = Arc::clone(&self.ctx.recomputer);
        let cache = Arc::clone(&self.ctx.cache);
        let finished_tx = self.finished_tx.clone();
        let budget = self.settings.run_timeout();
        debug!("Starting refresh of {}", key);

        tokio::spawn(async move {
            let start_time = Instant::now();
            // Taken before reading any play, so a slower run that read less
            // data can never replace this one's result.
            let computed_at = Utc::now();
            let run_key = key.clone();
            let run_cancel = cancel.clone();
            // Holds the entry once the cache write went through. The timeout
            // path cancels under this lock, so a run either commits or is
            // cancelled, never both.
            let committed: Arc<Mutex<Option<CacheEntry>>> = Arc::new(Mutex::new(None));
            let run_committed = Arc::clone(&committed);

            let task = tokio::task::spawn_blocking(move || -> Result<CacheEntry, RefreshError> {
                let aggregate = recomputer.recompute(&run_key, &run_cancel)?;
                let mut slot = run_committed.blocking_lock();
                if run_cancel.is_cancelled() {
                    return Err(RefreshError::Cancelled);
                }
                cache.put(&run_key, &aggregate, computed_at)?;
                let entry = CacheEntry {
                    key: run_key,
                    aggregate,
                    computed_at,
                };
                *slot = Some(entry.clone());
                Ok(entry)
            });

            let result = match tokio::time::timeout(budget, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(RefreshError::Panicked(e.to_string())),
                Err(_) => {
                    let slot = committed.lock().await;
                    match slot.as_ref() {
                        Some(entry) => {
                            debug!("Refresh of {} stored its result at the deadline", key);
                            Ok(entry.clone())
                        }
                        None => {
                            cancel.cancel();
                            Err(RefreshError::Timeout(budget))
                        }
                    }
                }
            };

            let _ = finished_tx.send(FinishedRun {
                key,
                result,
                elapsed: start_time.elapsed(),
            });
        });
    }

    async fn handle_finished(&mut self, done: FinishedRun) {
        let FinishedRun {
            key,
            result,
            elapsed,
        } = done;
        self.running.remove(&key);
        let scope = key.scope();

        match result {
            Ok(entry) => {
                metrics::record_refresh(scope, "success", elapsed);
                metrics::record_skipped_events(scope, entry.aggregate.skipped_events());
                if let Err(e) = self.ctx.retry_store.clear(&key) {
                    error!("Failed to clear retry state of {}: {:#}", key, e);
                }
                let next = self.shared_state.write().await.finish_success(&key);
                if let AggregateKey::User { year, .. } = &key {
                    self.touched_years.insert(*year);
                }
                debug!("Refreshed {} in {:?}, now {}", key, elapsed, next);
                self.notify(&key, RefreshOutcome::Completed(entry));
            }
            Err(e) => {
                metrics::record_refresh(scope, e.outcome_label(), elapsed);
                let message = e.to_string();
                let now = Utc::now();
                let retry_at = match self
                    .ctx
                    .retry_store
                    .record_failure(&key, &message, &self.policy, now)
                {
                    Ok(retry) => retry.next_attempt_at,
                    Err(store_err) => {
                        error!("Failed to record failure of {}: {:#}", key, store_err);
                        Some(self.policy.next_retry_at(1, now))
                    }
                };
                let next = self.shared_state.write().await.finish_failure(&key, retry_at);
                match next {
                    RefreshState::Stuck => {
                        error!(
                            "Refresh of {} ran out of attempts, waiting for an operator: {}",
                            key, message
                        );
                        metrics::record_retry_exhausted(scope);
                    }
                    state => warn!("Refresh of {} failed ({}), {}", key, message, state),
                }
                self.notify(&key, RefreshOutcome::Failed(message));
            }
        }

        self.update_gauges().await;
    }

    fn notify(&mut self, key: &AggregateKey, outcome: RefreshOutcome) {
        if let Some(waiters) = self.waiters.remove(key) {
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    async fn handle_command(&mut self, cmd: RefreshCommand) {
        match cmd {
            RefreshCommand::MarkDirty {
                key,
                reason,
                response,
            } => {
                let outcome = self.shared_state.write().await.mark_dirty(&key, reason);
                debug!("Marked {} dirty ({}): {:?}", key, reason.as_str(), outcome);
                let _ = response.send(outcome);
            }
            RefreshCommand::RefreshNow { key, response } => {
                let mut table = self.shared_state.write().await;
                match table.state(&key) {
                    state @ (RefreshState::Backoff { .. } | RefreshState::Stuck) => {
                        let _ = response.send(RefreshOutcome::Unavailable(state));
                    }
                    _ => {
                        table.mark_dirty(&key, DirtyReason::Requested);
                        self.waiters.entry(key).or_default().push(response);
                    }
                }
            }
            RefreshCommand::Reset { key, response } => {
                let result = match self.ctx.retry_store.clear(&key) {
                    Ok(_) => {
                        let outcome = self.shared_state.write().await.reset(&key);
                        info!("Operator reset of {}: {:?}", key, outcome);
                        Ok(outcome)
                    }
                    Err(e) => Err(RefreshError::Store(e)),
                };
                let _ = response.send(result);
            }
        }
        self.update_gauges().await;
    }

    async fn on_tick(&mut self) {
        let released = self.shared_state.write().await.release_due(Utc::now());
        for key in &released {
            debug!("Backoff of {} elapsed, retrying", key);
        }
        self.drain_requests().await;
        self.update_gauges().await;
    }

    /// Applies dirty marks queued by other processes.
    async fn drain_requests(&mut self) {
        match self.ctx.retry_store.take_requests() {
            Ok(requests) if !requests.is_empty() => {
                debug!("Applying {} queued refresh requests", requests.len());
                let mut table = self.shared_state.write().await;
                for (key, reason) in requests {
                    // operator marks come with the retry state already cleared
                    if reason == DirtyReason::Operator {
                        table.reset(&key);
                    } else {
                        table.mark_dirty(&key, reason);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to read queued refresh requests: {:#}", e),
        }
    }

    async fn refresh_touched_globals(&mut self) {
        if self.touched_years.is_empty() {
            return;
        }
        let years = std::mem::take(&mut self.touched_years);
        let mut table = self.shared_state.write().await;
        for year in years {
            let key = AggregateKey::global(year);
            let outcome = table.mark_dirty(&key, DirtyReason::Scheduled);
            debug!("Scheduled refresh of {}: {:?}", key, outcome);
        }
    }

    async fn update_gauges(&self) {
        let counts = self.shared_state.read().await.counts();
        for (state, count) in counts {
            metrics::set_refresh_keys(state, count);
        }
    }

    /// Cancels in-flight runs and hands pending keys to the next process.
    async fn shutdown(&mut self) {
        info!("Shutting down refresh scheduler...");
        for token in self.running.values() {
            token.cancel();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(deadline, self.finished_rx.recv()).await {
                Ok(Some(done)) => {
                    self.running.remove(&done.key);
                }
                _ => break,
            }
        }
        self.waiters.clear();

        let pending: Vec<AggregateKey> = self
            .shared_state
            .read()
            .await
            .snapshot()
            .into_iter()
            .filter(|(_, state)| matches!(state, RefreshState::Dirty | RefreshState::Running))
            .map(|(key, _)| key)
            .collect();
        for key in &pending {
            if let Err(e) = self.ctx.retry_store.enqueue_request(key, DirtyReason::Startup) {
                warn!("Failed to persist pending refresh of {}: {:#}", key, e);
            }
        }
        if !pending.is_empty() {
            info!("Persisted {} pending refreshes for the next start", pending.len());
        }
        info!("Refresh scheduler shutdown complete");
    }
}

/// Create a refresh scheduler and its handle.
pub fn create_refresh_scheduler(
    ctx: RefreshContext,
    settings: RefreshSettings,
    shutdown_token: CancellationToken,
) -> (RefreshScheduler, RefreshHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let shared_state = Arc::new(RwLock::new(KeyStateTable::new()));

    let scheduler = RefreshScheduler::new(
        ctx,
        settings,
        command_rx,
        shutdown_token,
        Arc::clone(&shared_state),
    );
    let handle = RefreshHandle::new(command_tx, shared_state);

    (scheduler, handle)
}
