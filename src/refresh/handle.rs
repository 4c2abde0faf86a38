use super::state::{DirtyReason, KeyStateTable, MarkOutcome, RefreshState};
use super::RefreshError;
use crate::aggregate::AggregateKey;
use crate::cache::CacheEntry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Result of a synchronous refresh request.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// The run finished and its result is in the cache.
    Completed(CacheEntry),
    /// The run failed; the key went to backoff or got stuck.
    Failed(String),
    /// The key is backing off or stuck, no run was started.
    Unavailable(RefreshState),
}

/// Command sent to the scheduler.
pub enum RefreshCommand {
    MarkDirty {
        key: AggregateKey,
        reason: DirtyReason,
        response: oneshot::Sender<MarkOutcome>,
    },
    RefreshNow {
        key: AggregateKey,
        response: oneshot::Sender<RefreshOutcome>,
    },
    Reset {
        key: AggregateKey,
        response: oneshot::Sender<Result<MarkOutcome, RefreshError>>,
    },
}

/// Handle to interact with the refresh scheduler from the read path.
#[derive(Clone)]
pub struct RefreshHandle {
    command_tx: mpsc::Sender<RefreshCommand>,
    shared_state: Arc<RwLock<KeyStateTable>>,
}

impl RefreshHandle {
    pub fn new(
        command_tx: mpsc::Sender<RefreshCommand>,
        shared_state: Arc<RwLock<KeyStateTable>>,
    ) -> Self {
        Self {
            command_tx,
            shared_state,
        }
    }

    async fn send<T>(
        &self,
        command: RefreshCommand,
        response: oneshot::Receiver<T>,
    ) -> Result<T, RefreshError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| RefreshError::SchedulerUnavailable)?;
        response
            .await
            .map_err(|_| RefreshError::SchedulerUnavailable)
    }

    pub async fn mark_dirty(
        &self,
        key: AggregateKey,
        reason: DirtyReason,
    ) -> Result<MarkOutcome, RefreshError> {
        let (response, rx) = oneshot::channel();
        self.send(
            RefreshCommand::MarkDirty {
                key,
                reason,
                response,
            },
            rx,
        )
        .await
    }

    /// Refreshes `key` and waits for the run. A run already in flight is
    /// joined rather than duplicated.
    pub async fn refresh_now(&self, key: AggregateKey) -> Result<RefreshOutcome, RefreshError> {
        let (response, rx) = oneshot::channel();
        self.send(RefreshCommand::RefreshNow { key, response }, rx)
            .await
    }

    /// Operator reset: forgets the key's failures and queues a new run.
    pub async fn reset(&self, key: AggregateKey) -> Result<MarkOutcome, RefreshError> {
        let (response, rx) = oneshot::channel();
        self.send(RefreshCommand::Reset { key, response }, rx)
            .await?
    }

    pub async fn state(&self, key: &AggregateKey) -> RefreshState {
        self.shared_state.read().await.state(key)
    }

    /// Every key that is not clean, with its state.
    pub async fn snapshot(&self) -> Vec<(AggregateKey, RefreshState)> {
        self.shared_state.read().await.snapshot()
    }

    pub async fn counts(&self) -> BTreeMap<&'static str, usize> {
        self.shared_state.read().await.counts()
    }
}
