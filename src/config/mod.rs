mod file_config;

pub use file_config::{AggregationConfig, FileConfig, IngestionConfig, RefreshConfig};

use crate::derived::DEFAULT_PERCENTILE_STEP;
use crate::play_store::FALLBACK_TRACK_LENGTH_MS;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub port: u16,
    pub metrics_port: u16,

    pub refresh: RefreshSettings,
    pub aggregation: AggregationSettings,
    pub ingestion: IngestionSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let refresh = RefreshSettings::from_file(file.refresh.unwrap_or_default());
        let aggregation = AggregationSettings::from_file(file.aggregation.unwrap_or_default());
        let ingestion = IngestionSettings::from_file(file.ingestion.unwrap_or_default());

        if refresh.max_concurrent == 0 {
            bail!("refresh.max_concurrent must be at least 1");
        }
        if refresh.max_attempts == 0 {
            bail!("refresh.max_attempts must be at least 1");
        }
        if refresh.tick_interval_ms == 0 || refresh.global_refresh_interval_secs == 0 {
            bail!("refresh intervals must be positive");
        }
        if refresh.run_timeout_ms == 0 {
            bail!("refresh.run_timeout_ms must be positive");
        }
        if !(1..=100).contains(&aggregation.percentile_step) {
            bail!("aggregation.percentile_step must be between 1 and 100");
        }

        Ok(Self {
            db_dir,
            port,
            metrics_port,
            refresh,
            aggregation,
            ingestion,
        })
    }

    pub fn plays_db_path(&self) -> PathBuf {
        self.db_dir.join("plays.db")
    }

    pub fn cache_db_path(&self) -> PathBuf {
        self.db_dir.join("wrapped_cache.db")
    }

    pub fn refresh_state_db_path(&self) -> PathBuf {
        self.db_dir.join("refresh_state.db")
    }
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub max_concurrent: usize,
    /// Time budget of one recomputation; exceeding it counts as a failure.
    pub run_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub global_refresh_interval_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            run_timeout_ms: 30_000,
            tick_interval_ms: 1_000,
            global_refresh_interval_secs: 300,
            max_attempts: 8,
            initial_backoff_secs: 10,
            max_backoff_secs: 1800,
            backoff_multiplier: 2.0,
        }
    }
}

impl RefreshSettings {
    fn from_file(file: RefreshConfig) -> Self {
        let d = Self::default();
        Self {
            max_concurrent: file.max_concurrent.unwrap_or(d.max_concurrent),
            run_timeout_ms: file.run_timeout_ms.unwrap_or(d.run_timeout_ms),
            tick_interval_ms: file.tick_interval_ms.unwrap_or(d.tick_interval_ms),
            global_refresh_interval_secs: file
                .global_refresh_interval_secs
                .unwrap_or(d.global_refresh_interval_secs),
            max_attempts: file.max_attempts.unwrap_or(d.max_attempts),
            initial_backoff_secs: file.initial_backoff_secs.unwrap_or(d.initial_backoff_secs),
            max_backoff_secs: file.max_backoff_secs.unwrap_or(d.max_backoff_secs),
            backoff_multiplier: file.backoff_multiplier.unwrap_or(d.backoff_multiplier),
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn global_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.global_refresh_interval_secs.max(1))
    }
}

#[derive(Debug, Clone)]
pub struct AggregationSettings {
    pub top_artists: usize,
    pub top_tracks: usize,
    pub top_users: usize,
    pub similar_users: usize,
    /// Top artists per listener taking part in similarity matching.
    pub similarity_pool: usize,
    pub percentile_step: u8,
    pub session_idle_threshold_ms: u64,
    pub fallback_track_length_ms: u32,
    /// Plays fetched per page while streaming a key's plays.
    pub page_size: usize,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            top_artists: 10,
            top_tracks: 10,
            top_users: 5,
            similar_users: 3,
            similarity_pool: 50,
            percentile_step: DEFAULT_PERCENTILE_STEP,
            session_idle_threshold_ms: 150_000,
            fallback_track_length_ms: FALLBACK_TRACK_LENGTH_MS,
            page_size: 500,
        }
    }
}

impl AggregationSettings {
    fn from_file(file: AggregationConfig) -> Self {
        let d = Self::default();
        Self {
            top_artists: file.top_artists.unwrap_or(d.top_artists),
            top_tracks: file.top_tracks.unwrap_or(d.top_tracks),
            top_users: file.top_users.unwrap_or(d.top_users),
            similar_users: file.similar_users.unwrap_or(d.similar_users),
            similarity_pool: file.similarity_pool.unwrap_or(d.similarity_pool),
            percentile_step: file.percentile_step.unwrap_or(d.percentile_step),
            session_idle_threshold_ms: file
                .session_idle_threshold_ms
                .unwrap_or(d.session_idle_threshold_ms),
            fallback_track_length_ms: file
                .fallback_track_length_ms
                .unwrap_or(d.fallback_track_length_ms),
            page_size: file.page_size.unwrap_or(d.page_size),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    /// Fill missing external ids from earlier plays with the same normalised name.
    pub inherit_external_ids: bool,
    pub max_batch_size: usize,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            inherit_external_ids: true,
            max_batch_size: 1000,
        }
    }
}

impl IngestionSettings {
    fn from_file(file: IngestionConfig) -> Self {
        let d = Self::default();
        Self {
            inherit_external_ids: file.inherit_external_ids.unwrap_or(d.inherit_external_ids),
            max_batch_size: file.max_batch_size.unwrap_or(d.max_batch_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            port: 3001,
            metrics_port: 9091,
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.port, 3001);
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.refresh.max_attempts, 8);
        assert_eq!(config.refresh.run_timeout(), Duration::from_secs(30));
        assert_eq!(config.aggregation.top_artists, 10);
        assert_eq!(config.aggregation.fallback_track_length_ms, 210_000);
        assert!(config.ingestion.inherit_external_ids);
        assert_eq!(config.plays_db_path(), temp_dir.path().join("plays.db"));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            port: 3001,
            metrics_port: 9091,
        };

        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            port: Some(8080),
            refresh: Some(RefreshConfig {
                max_attempts: Some(3),
                initial_backoff_secs: Some(1),
                ..Default::default()
            }),
            aggregation: Some(AggregationConfig {
                similar_users: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.port, 8080);
        // CLI value used when TOML doesn't specify
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.refresh.max_attempts, 3);
        assert_eq!(config.refresh.initial_backoff_secs, 1);
        assert_eq!(config.refresh.max_backoff_secs, 1800);
        assert_eq!(config.aggregation.similar_users, 5);
        assert_eq!(config.aggregation.top_tracks, 10);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_rejects_zero_concurrency() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let file_config = FileConfig {
            refresh: Some(RefreshConfig {
                max_concurrent: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, Some(file_config));
        assert!(result.unwrap_err().to_string().contains("max_concurrent"));
    }

    #[test]
    fn test_resolve_rejects_zero_run_timeout() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let file_config = FileConfig {
            refresh: Some(RefreshConfig {
                run_timeout_ms: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, Some(file_config));
        assert!(result.unwrap_err().to_string().contains("run_timeout_ms"));
    }
}
