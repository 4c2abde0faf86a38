//! Read and write path in front of the stores and the refresh scheduler.

use crate::aggregate::{AggregateKey, ListenerStanding, PersonalAggregate, YearlyAggregate};
use crate::cache::{CacheEntry, ResultCache};
use crate::collaborators::{ArtistMetadata, CollaboratorError, IdentityResolver, MetadataEnricher};
use crate::config::IngestionSettings;
use crate::metrics;
use crate::play_store::{IncomingPlay, IngestError, PlayStore, RecordOutcome};
use crate::refresh::{DirtyReason, RefreshError, RefreshHandle, RefreshOutcome, RefreshState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(2);

/// What a reader wants when the cache has nothing for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissPolicy {
    /// Refresh the key and wait for it.
    ComputeNow,
    /// Mark the key dirty and return right away.
    Schedule,
}

/// Statistics as seen by a reader.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatsView {
    /// The cached result is current.
    Ready {
        computed_at: DateTime<Utc>,
        stats: YearlyAggregate,
    },
    /// The last good result, served while the key is being refreshed or retried.
    Stale {
        computed_at: DateTime<Utc>,
        refresh: RefreshState,
        stats: YearlyAggregate,
    },
    /// Nothing computed yet.
    Pending { refresh: RefreshState },
}

impl StatsView {
    fn from_entry(entry: CacheEntry, state: RefreshState) -> Self {
        match state {
            RefreshState::Clean => StatsView::Ready {
                computed_at: entry.computed_at,
                stats: entry.aggregate,
            },
            refresh => StatsView::Stale {
                computed_at: entry.computed_at,
                refresh,
                stats: entry.aggregate,
            },
        }
    }

    pub fn stats(&self) -> Option<&YearlyAggregate> {
        match self {
            StatsView::Ready { stats, .. } | StatsView::Stale { stats, .. } => Some(stats),
            StatsView::Pending { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("Unknown handle {0:?}")]
    UnknownHandle(String),

    #[error("Identity lookup failed: {0}")]
    Identity(#[from] CollaboratorError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedPlay {
    /// Position in the submitted batch.
    pub index: usize,
    pub uri: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: Vec<RejectedPlay>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtistImage {
    pub name: String,
    pub external_id: String,
    pub metadata: Option<ArtistMetadata>,
}

/// Outcome of storing a batch of plays.
#[derive(Debug, Default)]
pub struct RecordedBatch {
    pub report: BatchReport,
    /// Keys that gained at least one play.
    pub touched: BTreeSet<AggregateKey>,
    /// The store error that stopped the batch; later plays were not tried.
    pub failure: Option<anyhow::Error>,
}

/// Validates and stores numbered plays in order, without marking anything
/// dirty. Callers decide how the touched keys reach the scheduler.
pub fn record_batch<I>(play_store: &dyn PlayStore, plays: I) -> RecordedBatch
where
    I: IntoIterator<Item = (usize, IncomingPlay)>,
{
    let mut batch = RecordedBatch::default();
    for (index, play) in plays {
        let uri = Some(play.uri.trim().to_string()).filter(|u| !u.is_empty());
        let event = match play.validate() {
            Ok(event) => event,
            Err(e) => {
                metrics::record_play_ingested("rejected");
                batch.report.rejected.push(RejectedPlay {
                    index,
                    uri,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        match play_store.record(&event) {
            Ok(RecordOutcome::Inserted) => {
                metrics::record_play_ingested("inserted");
                batch.report.inserted += 1;
                batch
                    .touched
                    .insert(AggregateKey::user(&event.user_id, event.year()));
            }
            Ok(RecordOutcome::Duplicate) => {
                metrics::record_play_ingested("duplicate");
                batch.report.duplicates += 1;
            }
            Err(e) => {
                batch.failure = Some(e);
                break;
            }
        }
    }
    batch
}

pub struct WrappedManager {
    play_store: Arc<dyn PlayStore>,
    cache: Arc<dyn ResultCache>,
    refresh: RefreshHandle,
    identity: Arc<dyn IdentityResolver>,
    enricher: Arc<dyn MetadataEnricher>,
    ingestion: IngestionSettings,
    enrichment_timeout: Duration,
}

impl WrappedManager {
    pub fn new(
        play_store: Arc<dyn PlayStore>,
        cache: Arc<dyn ResultCache>,
        refresh: RefreshHandle,
        identity: Arc<dyn IdentityResolver>,
        enricher: Arc<dyn MetadataEnricher>,
        ingestion: IngestionSettings,
    ) -> Self {
        Self {
            play_store,
            cache,
            refresh,
            identity,
            enricher,
            ingestion,
            enrichment_timeout: DEFAULT_ENRICHMENT_TIMEOUT,
        }
    }

    pub fn with_enrichment_timeout(mut self, timeout: Duration) -> Self {
        self.enrichment_timeout = timeout;
        self
    }

    pub fn refresh_handle(&self) -> &RefreshHandle {
        &self.refresh
    }

    /// Validates and stores one play. A duplicate `uri` is a successful no-op.
    pub async fn ingest(&self, play: IncomingPlay) -> Result<RecordOutcome, IngestError> {
        let event = play.validate().inspect_err(|_| {
            metrics::record_play_ingested("rejected");
        })?;
        let outcome = self.play_store.record(&event)?;
        match outcome {
            RecordOutcome::Inserted => {
                metrics::record_play_ingested("inserted");
                self.mark_dirty(AggregateKey::user(&event.user_id, event.year()))
                    .await;
            }
            RecordOutcome::Duplicate => metrics::record_play_ingested("duplicate"),
        }
        Ok(outcome)
    }

    /// Stores a batch of plays. Invalid plays are reported in the result;
    /// a store failure aborts the batch after the plays already stored.
    pub async fn ingest_batch(&self, plays: Vec<IncomingPlay>) -> Result<BatchReport, IngestError> {
        let limit = self.ingestion.max_batch_size;
        if plays.len() > limit {
            return Err(IngestError::BatchTooLarge {
                size: plays.len(),
                limit,
            });
        }

        let batch = record_batch(self.play_store.as_ref(), plays.into_iter().enumerate());
        for key in batch.touched {
            self.mark_dirty(key).await;
        }
        match batch.failure {
            Some(e) => Err(IngestError::Store(e)),
            None => Ok(batch.report),
        }
    }

    async fn mark_dirty(&self, key: AggregateKey) {
        match self.refresh.mark_dirty(key.clone(), DirtyReason::NewPlays).await {
            Ok(outcome) => debug!("New plays for {}: {:?}", key, outcome),
            Err(e) => warn!("Could not mark {} dirty: {}", key, e),
        }
    }

    pub async fn personal_stats(
        &self,
        user_id: &str,
        year: i32,
        policy: MissPolicy,
    ) -> Result<StatsView, StatsError> {
        self.stats(AggregateKey::user(user_id, year), policy).await
    }

    pub async fn global_stats(&self, year: i32, policy: MissPolicy) -> Result<StatsView, StatsError> {
        self.stats(AggregateKey::global(year), policy).await
    }

    /// Like [`personal_stats`](Self::personal_stats), addressing the listener
    /// by public handle.
    pub async fn personal_stats_for_handle(
        &self,
        handle: &str,
        year: i32,
        policy: MissPolicy,
    ) -> Result<StatsView, StatsError> {
        let user_id = self
            .identity
            .resolve(handle)
            .await?
            .ok_or_else(|| StatsError::UnknownHandle(handle.to_string()))?;
        self.personal_stats(&user_id, year, policy).await
    }

    async fn stats(&self, key: AggregateKey, policy: MissPolicy) -> Result<StatsView, StatsError> {
        let cached = self.cache.get(&key).map_err(RefreshError::Store)?;
        metrics::record_cache_lookup(key.scope(), cached.is_some());
        if let Some(entry) = cached {
            let state = self.refresh.state(&key).await;
            return Ok(StatsView::from_entry(entry, state));
        }

        match policy {
            MissPolicy::ComputeNow => match self.refresh.refresh_now(key.clone()).await? {
                RefreshOutcome::Completed(entry) => {
                    let state = self.refresh.state(&key).await;
                    Ok(StatsView::from_entry(entry, state))
                }
                RefreshOutcome::Failed(message) => {
                    debug!("On-demand refresh of {} failed: {}", key, message);
                    Ok(StatsView::Pending {
                        refresh: self.refresh.state(&key).await,
                    })
                }
                RefreshOutcome::Unavailable(refresh) => Ok(StatsView::Pending { refresh }),
            },
            MissPolicy::Schedule => {
                self.refresh
                    .mark_dirty(key.clone(), DirtyReason::Requested)
                    .await?;
                Ok(StatsView::Pending {
                    refresh: self.refresh.state(&key).await,
                })
            }
        }
    }

    /// Where the listener stands among the year's listeners, from the cached
    /// aggregates. `None` until both are cached.
    pub fn listener_standing(
        &self,
        user_id: &str,
        year: i32,
    ) -> Result<Option<ListenerStanding>, StatsError> {
        let personal = self
            .cache
            .get(&AggregateKey::user(user_id, year))
            .map_err(RefreshError::Store)?;
        let global = self
            .cache
            .get(&AggregateKey::global(year))
            .map_err(RefreshError::Store)?;
        Ok(match (personal, global) {
            (Some(personal), Some(global)) => {
                match (personal.aggregate.as_personal(), global.aggregate.as_global()) {
                    (Some(p), Some(g)) => Some(ListenerStanding::from_distribution(
                        &g.distribution,
                        p,
                    )),
                    _ => None,
                }
            }
            _ => None,
        })
    }

    /// Display metadata of the top artists that carry an external id.
    /// Lookups that fail or time out leave `metadata` empty.
    pub async fn artist_images(&self, aggregate: &PersonalAggregate) -> Vec<ArtistImage> {
        let mut images = Vec::new();
        for artist in &aggregate.top_artists {
            let Some(external_id) = artist.external_id.as_deref() else {
                continue;
            };
            let metadata = match tokio::time::timeout(
                self.enrichment_timeout,
                self.enricher.artist_metadata(external_id),
            )
            .await
            {
                Ok(Ok(metadata)) => metadata,
                Ok(Err(e)) => {
                    warn!("Metadata lookup for {} failed: {}", external_id, e);
                    None
                }
                Err(_) => {
                    warn!("Metadata lookup for {} timed out", external_id);
                    None
                }
            };
            images.push(ArtistImage {
                name: artist.name.clone(),
                external_id: external_id.to_string(),
                metadata,
            });
        }
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::TopArtist;
    use crate::cache::SqliteResultCache;
    use crate::collaborators::{NoopMetadataEnricher, PassthroughIdentityResolver};
    use crate::config::{AggregationSettings, RefreshSettings};
    use crate::play_store::{ArtistCredit, SqlitePlayStore};
    use crate::refresh::{
        create_refresh_scheduler, RefreshContext, SqliteRetryStore, StoreRecomputer,
    };
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    fn incoming(uri: &str, at: &str) -> IncomingPlay {
        IncomingPlay {
            user_id: "ann".to_string(),
            uri: uri.to_string(),
            track_name: "Halo".to_string(),
            artists: vec![ArtistCredit {
                name: "Low".to_string(),
                external_id: Some("mbid-low".to_string()),
            }],
            duration_ms: Some(180_000),
            played_at: Some(at.to_string()),
            ..IncomingPlay::default()
        }
    }

    fn manager_with(
        enricher: Arc<dyn MetadataEnricher>,
        max_batch_size: usize,
    ) -> (WrappedManager, CancellationToken) {
        let play_store: Arc<dyn PlayStore> = Arc::new(SqlitePlayStore::in_memory(true).unwrap());
        let cache: Arc<dyn ResultCache> = Arc::new(SqliteResultCache::in_memory().unwrap());
        let ctx = RefreshContext {
            play_store: play_store.clone(),
            cache: cache.clone(),
            retry_store: Arc::new(SqliteRetryStore::in_memory().unwrap()),
            recomputer: Arc::new(StoreRecomputer::new(
                play_store.clone(),
                AggregationSettings::default(),
            )),
        };
        let shutdown = CancellationToken::new();
        let (mut scheduler, handle) =
            create_refresh_scheduler(ctx, RefreshSettings::default(), shutdown.clone());
        tokio::spawn(async move { scheduler.run().await });

        let manager = WrappedManager::new(
            play_store,
            cache,
            handle,
            Arc::new(PassthroughIdentityResolver),
            enricher,
            IngestionSettings {
                max_batch_size,
                ..IngestionSettings::default()
            },
        );
        (manager, shutdown)
    }

    #[tokio::test]
    async fn batch_reports_each_play() {
        let (manager, shutdown) = manager_with(Arc::new(NoopMetadataEnricher), 10);
        let mut missing_time = incoming("3", "");
        missing_time.played_at = None;

        let report = manager
            .ingest_batch(vec![
                incoming("1", "2025-02-01T10:00:00Z"),
                incoming("1", "2025-02-01T10:00:00Z"),
                missing_time,
            ])
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 2);
        assert_eq!(report.rejected[0].uri.as_deref(), Some("3"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn oversized_batch_is_refused() {
        let (manager, shutdown) = manager_with(Arc::new(NoopMetadataEnricher), 1);
        let result = manager
            .ingest_batch(vec![
                incoming("1", "2025-02-01T10:00:00Z"),
                incoming("2", "2025-02-01T11:00:00Z"),
            ])
            .await;
        assert!(matches!(
            result,
            Err(IngestError::BatchTooLarge { size: 2, limit: 1 })
        ));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn compute_now_waits_and_schedule_defers() {
        let (manager, shutdown) = manager_with(Arc::new(NoopMetadataEnricher), 10);
        manager
            .ingest(incoming("1", "2025-02-01T10:00:00Z"))
            .await
            .unwrap();

        let view = manager
            .personal_stats("ann", 2025, MissPolicy::ComputeNow)
            .await
            .unwrap();
        let stats = view.stats().unwrap().as_personal().unwrap();
        assert_eq!(stats.total_plays, 1);

        // a year nobody listened in
        let view = manager
            .personal_stats("ann", 2019, MissPolicy::Schedule)
            .await
            .unwrap();
        assert!(matches!(view, StatsView::Pending { .. }));
        shutdown.cancel();
    }

    struct SlowEnricher;

    #[async_trait]
    impl MetadataEnricher for SlowEnricher {
        async fn artist_metadata(
            &self,
            external_id: &str,
        ) -> Result<Option<ArtistMetadata>, CollaboratorError> {
            if external_id == "slow" {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if external_id == "broken" {
                return Err(CollaboratorError::Connection("refused".to_string()));
            }
            Ok(Some(ArtistMetadata {
                image_url: Some(format!("https://img.example/{}", external_id)),
                canonical_name: None,
            }))
        }
    }

    fn artist(name: &str, external_id: Option<&str>) -> TopArtist {
        TopArtist {
            name: name.to_string(),
            plays: 1,
            minutes: 1.0,
            external_id: external_id.map(str::to_string),
            top_track: None,
            top_track_plays: None,
            top_track_duration_ms: None,
        }
    }

    #[tokio::test]
    async fn artist_images_are_best_effort() {
        let (manager, shutdown) = manager_with(Arc::new(SlowEnricher), 10);
        let manager = manager.with_enrichment_timeout(Duration::from_millis(50));

        let mut aggregate = crate::aggregate::build(
            &AggregateKey::user("ann", 2025),
            Vec::new(),
            &AggregationSettings::default(),
        )
        .as_personal()
        .cloned()
        .unwrap();
        aggregate.top_artists = vec![
            artist("Low", Some("mbid-low")),
            artist("Nobody", None),
            artist("Slow", Some("slow")),
            artist("Broken", Some("broken")),
        ];

        let images = manager.artist_images(&aggregate).await;
        assert_eq!(images.len(), 3);
        assert_eq!(
            images[0].metadata.as_ref().unwrap().image_url.as_deref(),
            Some("https://img.example/mbid-low")
        );
        assert!(images[1].metadata.is_none());
        assert!(images[2].metadata.is_none());
        shutdown.cancel();
    }
}
