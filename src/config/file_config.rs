use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,

    // Feature configs
    pub refresh: Option<RefreshConfig>,
    pub aggregation: Option<AggregationConfig>,
    pub ingestion: Option<IngestionConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RefreshConfig {
    pub max_concurrent: Option<usize>,
    pub run_timeout_ms: Option<u64>,
    pub tick_interval_ms: Option<u64>,
    pub global_refresh_interval_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AggregationConfig {
    pub top_artists: Option<usize>,
    pub top_tracks: Option<usize>,
    pub top_users: Option<usize>,
    pub similar_users: Option<usize>,
    pub similarity_pool: Option<usize>,
    /// Distance between two percentile grid points, in percent.
    pub percentile_step: Option<u8>,
    pub session_idle_threshold_ms: Option<u64>,
    pub fallback_track_length_ms: Option<u32>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct IngestionConfig {
    pub inherit_external_ids: Option<bool>,
    pub max_batch_size: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
