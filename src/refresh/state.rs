//! Per-key refresh state machine.
//!
//! `Clean -> Dirty -> Running -> Clean`, or on failure
//! `Running -> Backoff -> Dirty` until the attempts run out and the key is
//! `Stuck` waiting for an operator.

use crate::aggregate::AggregateKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RefreshState {
    Clean,
    Dirty,
    Running,
    Backoff { until: DateTime<Utc> },
    /// Attempts exhausted; only an operator reset brings the key back.
    Stuck,
}

impl RefreshState {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshState::Clean => "clean",
            RefreshState::Dirty => "dirty",
            RefreshState::Running => "running",
            RefreshState::Backoff { .. } => "backoff",
            RefreshState::Stuck => "stuck",
        }
    }
}

impl fmt::Display for RefreshState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshState::Backoff { until } => write!(f, "backoff until {}", until.to_rfc3339()),
            other => f.write_str(other.label()),
        }
    }
}

/// Why a key was marked dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyReason {
    /// A play was recorded for the key.
    NewPlays,
    /// A reader asked for the key, e.g. on a cache miss.
    Requested,
    RetryDue,
    /// Periodic refresh of a year whose listeners changed.
    Scheduled,
    Startup,
    Operator,
}

impl DirtyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirtyReason::NewPlays => "new_plays",
            DirtyReason::Requested => "requested",
            DirtyReason::RetryDue => "retry_due",
            DirtyReason::Scheduled => "scheduled",
            DirtyReason::Startup => "startup",
            DirtyReason::Operator => "operator",
        }
    }

    /// The key's input may have changed after an in-flight run read it.
    fn data_changed(&self) -> bool {
        matches!(
            self,
            DirtyReason::NewPlays | DirtyReason::Scheduled | DirtyReason::Operator
        )
    }
}

impl FromStr for DirtyReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "new_plays" => Ok(DirtyReason::NewPlays),
            "requested" => Ok(DirtyReason::Requested),
            "retry_due" => Ok(DirtyReason::RetryDue),
            "scheduled" => Ok(DirtyReason::Scheduled),
            "startup" => Ok(DirtyReason::Startup),
            "operator" => Ok(DirtyReason::Operator),
            _ => anyhow::bail!("unknown dirty reason {:?}", s),
        }
    }
}

/// What a dirty mark did to the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The key became dirty.
    Queued,
    /// The key was already waiting for a run.
    AlreadyQueued,
    /// A run is in flight and will serve this request.
    Coalesced,
    /// A run is in flight; one more run follows it.
    FollowUp,
    /// The key is backing off or stuck and keeps that state.
    Deferred,
}

#[derive(Debug, Clone)]
struct KeyEntry {
    state: RefreshState,
    follow_up: bool,
}

/// State of every key that is not clean. Absent keys are `Clean`.
#[derive(Debug, Default)]
pub struct KeyStateTable {
    entries: BTreeMap<AggregateKey, KeyEntry>,
}

impl KeyStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &AggregateKey) -> RefreshState {
        self.entries
            .get(key)
            .map(|e| e.state)
            .unwrap_or(RefreshState::Clean)
    }

    fn set(&mut self, key: &AggregateKey, state: RefreshState) {
        if state == RefreshState::Clean {
            self.entries.remove(key);
        } else {
            self.entries.insert(
                key.clone(),
                KeyEntry {
                    state,
                    follow_up: false,
                },
            );
        }
    }

    pub fn mark_dirty(&mut self, key: &AggregateKey, reason: DirtyReason) -> MarkOutcome {
        match self.entries.get_mut(key) {
            None => {
                self.set(key, RefreshState::Dirty);
                MarkOutcome::Queued
            }
            Some(entry) => match entry.state {
                RefreshState::Clean => {
                    entry.state = RefreshState::Dirty;
                    MarkOutcome::Queued
                }
                RefreshState::Dirty => MarkOutcome::AlreadyQueued,
                RefreshState::Running if reason.data_changed() => {
                    entry.follow_up = true;
                    MarkOutcome::FollowUp
                }
                RefreshState::Running => MarkOutcome::Coalesced,
                RefreshState::Backoff { .. } | RefreshState::Stuck => MarkOutcome::Deferred,
            },
        }
    }

    /// `Dirty -> Running`. Returns false when the key is not dirty.
    pub fn start(&mut self, key: &AggregateKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.state == RefreshState::Dirty => {
                entry.state = RefreshState::Running;
                entry.follow_up = false;
                true
            }
            _ => false,
        }
    }

    /// `Running -> Clean`, or `Dirty` when a follow-up run was requested.
    /// Returns the new state.
    pub fn finish_success(&mut self, key: &AggregateKey) -> RefreshState {
        let follow_up = self
            .entries
            .get(key)
            .is_some_and(|e| e.state == RefreshState::Running && e.follow_up);
        let next = if follow_up {
            RefreshState::Dirty
        } else {
            RefreshState::Clean
        };
        self.set(key, next);
        next
    }

    /// `Running -> Backoff` until `retry_at`, or `Stuck` when there is no retry.
    /// A pending follow-up is dropped: the retry reads the full input anyway.
    pub fn finish_failure(
        &mut self,
        key: &AggregateKey,
        retry_at: Option<DateTime<Utc>>,
    ) -> RefreshState {
        let next = match retry_at {
            Some(until) => RefreshState::Backoff { until },
            None => RefreshState::Stuck,
        };
        self.set(key, next);
        next
    }

    /// Moves every key whose backoff elapsed back to `Dirty`.
    pub fn release_due(&mut self, now: DateTime<Utc>) -> Vec<AggregateKey> {
        let due: Vec<AggregateKey> = self
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.state, RefreshState::Backoff { until } if until <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &due {
            self.set(key, RefreshState::Dirty);
        }
        due
    }

    /// Restores persisted retry state at startup. Keys already known are left alone.
    pub fn restore(&mut self, key: &AggregateKey, state: RefreshState) {
        if !self.entries.contains_key(key) {
            self.set(key, state);
        }
    }

    /// Operator reset: back to `Dirty` whatever the state, or a follow-up run
    /// when a run is in flight.
    pub fn reset(&mut self, key: &AggregateKey) -> MarkOutcome {
        match self.state(key) {
            RefreshState::Running => self.mark_dirty(key, DirtyReason::Operator),
            RefreshState::Dirty => MarkOutcome::AlreadyQueued,
            _ => {
                self.set(key, RefreshState::Dirty);
                MarkOutcome::Queued
            }
        }
    }

    /// Dirty keys in key order, at most `limit`.
    pub fn next_dirty(&self, limit: usize) -> Vec<AggregateKey> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == RefreshState::Dirty)
            .map(|(k, _)| k.clone())
            .take(limit)
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == RefreshState::Running)
            .count()
    }

    /// Number of keys per state label, clean keys excluded.
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for label in ["dirty", "running", "backoff", "stuck"] {
            counts.insert(label, 0);
        }
        for entry in self.entries.values() {
            *counts.entry(entry.state.label()).or_insert(0) += 1;
        }
        counts
    }

    pub fn snapshot(&self) -> Vec<(AggregateKey, RefreshState)> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.state))
            .collect()
    }
}
