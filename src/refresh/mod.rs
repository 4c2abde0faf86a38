//! Keeps cached aggregates up to date.
//!
//! Every key moves through a small state machine ([`RefreshState`]). A single
//! scheduler task owns the transitions; failed refreshes are persisted in the
//! retry store and come back after an exponential backoff.

mod handle;
mod recompute;
mod retry_policy;
mod retry_store;
mod schema;
mod scheduler;
mod state;

use std::time::Duration;
use thiserror::Error;

pub use handle::{RefreshCommand, RefreshHandle, RefreshOutcome};
pub use recompute::{Recomputer, StoreRecomputer};
pub use retry_policy::RetryPolicy;
pub use retry_store::{RetryOutcome, RetryState, RetryStore, SqliteRetryStore};
pub use scheduler::{create_refresh_scheduler, RefreshContext, RefreshScheduler};
pub use state::{DirtyReason, KeyStateTable, MarkOutcome, RefreshState};

/// Failure of a whole refresh run. Malformed plays are not errors; they are
/// skipped and counted in the aggregate.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("Refresh timed out after {0:?}")]
    Timeout(Duration),

    #[error("Refresh was cancelled")]
    Cancelled,

    #[error("Refresh task panicked: {0}")]
    Panicked(String),

    #[error("Refresh scheduler is not running")]
    SchedulerUnavailable,
}

impl RefreshError {
    /// Label used for the refresh outcome metric.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            RefreshError::Store(_) => "failure",
            RefreshError::Timeout(_) => "timeout",
            RefreshError::Cancelled => "cancelled",
            RefreshError::Panicked(_) => "panic",
            RefreshError::SchedulerUnavailable => "unavailable",
        }
    }
}
