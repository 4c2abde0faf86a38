use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wrapped_stats_server::cache::{ResultCache, SqliteResultCache};
use wrapped_stats_server::collaborators::{NoopMetadataEnricher, PassthroughIdentityResolver};
use wrapped_stats_server::config;
use wrapped_stats_server::metrics;
use wrapped_stats_server::server::run_server;
use wrapped_stats_server::WrappedManager;
use wrapped_stats_server::play_store::{PlayStore, SqlitePlayStore};
use wrapped_stats_server::refresh::{
    create_refresh_scheduler, RefreshContext, RefreshHandle, RetryStore, SqliteRetryStore,
    StoreRecomputer,
};

const SCHEDULER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing database files (plays.db, wrapped_cache.db, refresh_state.db).
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port the statistics API listens on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            port: args.port,
            metrics_port: args.metrics_port,
        }
    }
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    refresh_keys: std::collections::BTreeMap<&'static str, usize>,
}

async fn health(handle: RefreshHandle) -> impl IntoResponse {
    let refresh_keys = handle.counts().await;
    (
        StatusCode::OK,
        Json(Health {
            status: "ok",
            refresh_keys,
        }),
    )
}

async fn run_metrics_server(port: u16, handle: RefreshHandle) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .route("/health", get(move || health(handle.clone())));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    Ok(axum::serve(listener, app).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  port: {}", app_config.port);
    info!("  metrics_port: {}", app_config.metrics_port);
    info!(
        "  refresh: {} concurrent, {} max attempts",
        app_config.refresh.max_concurrent, app_config.refresh.max_attempts
    );

    info!("Initializing metrics...");
    metrics::init_metrics();

    let play_store: Arc<dyn PlayStore> = Arc::new(SqlitePlayStore::new(
        app_config.plays_db_path(),
        app_config.ingestion.inherit_external_ids,
    )?);
    let cache: Arc<dyn ResultCache> = Arc::new(SqliteResultCache::new(app_config.cache_db_path())?);
    let retry_store: Arc<dyn RetryStore> =
        Arc::new(SqliteRetryStore::new(app_config.refresh_state_db_path())?);
    let recomputer = Arc::new(StoreRecomputer::new(
        play_store.clone(),
        app_config.aggregation.clone(),
    ));

    let ctx = RefreshContext {
        play_store: play_store.clone(),
        cache: cache.clone(),
        retry_store,
        recomputer,
    };

    let shutdown_token = CancellationToken::new();
    let (mut scheduler, refresh_handle) =
        create_refresh_scheduler(ctx, app_config.refresh.clone(), shutdown_token.clone());
    let mut scheduler_task = tokio::spawn(async move { scheduler.run().await });

    let manager = Arc::new(WrappedManager::new(
        play_store,
        cache,
        refresh_handle.clone(),
        Arc::new(PassthroughIdentityResolver),
        Arc::new(NoopMetadataEnricher),
        app_config.ingestion.clone(),
    ));

    info!("Metrics available at port {}!", app_config.metrics_port);

    let result = tokio::select! {
        result = run_server(manager, app_config.port) => {
            info!("Server stopped: {:?}", result);
            result
        },
        result = run_metrics_server(app_config.metrics_port, refresh_handle) => {
            info!("Metrics server stopped: {:?}", result);
            result
        },
        _ = &mut scheduler_task => {
            info!("Scheduler stopped");
            return Ok(());
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            Ok(())
        }
    };

    shutdown_token.cancel();
    // The scheduler persists keys it did not get to before it exits
    if tokio::time::timeout(SCHEDULER_SHUTDOWN_TIMEOUT, scheduler_task)
        .await
        .is_err()
    {
        warn!("Scheduler did not stop within {:?}", SCHEDULER_SHUTDOWN_TIMEOUT);
    }
    result
}
