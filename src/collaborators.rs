//! External services the read path talks to.
//!
//! Neither is needed to compute aggregates: identity resolution only maps a
//! public handle to a user id, and enrichment only decorates results at
//! presentation time.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timeout")]
    Timeout,
}

/// Maps public handles to stable user ids.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Returns `None` when the handle is unknown.
    async fn resolve(&self, handle: &str) -> Result<Option<String>, CollaboratorError>;
}

/// Treats every handle as a user id.
pub struct PassthroughIdentityResolver;

#[async_trait]
impl IdentityResolver for PassthroughIdentityResolver {
    async fn resolve(&self, handle: &str) -> Result<Option<String>, CollaboratorError> {
        let handle = handle.trim().trim_start_matches('@');
        Ok((!handle.is_empty()).then(|| handle.to_string()))
    }
}

/// Display metadata for an artist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtistMetadata {
    pub image_url: Option<String>,
    pub canonical_name: Option<String>,
}

/// Looks up display metadata by external artist id. Best effort.
#[async_trait]
pub trait MetadataEnricher: Send + Sync {
    async fn artist_metadata(
        &self,
        external_id: &str,
    ) -> Result<Option<ArtistMetadata>, CollaboratorError>;
}

/// Knows nothing about any artist.
pub struct NoopMetadataEnricher;

#[async_trait]
impl MetadataEnricher for NoopMetadataEnricher {
    async fn artist_metadata(
        &self,
        _external_id: &str,
    ) -> Result<Option<ArtistMetadata>, CollaboratorError> {
        Ok(None)
    }
}
