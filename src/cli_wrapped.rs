use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wrapped_stats_server::aggregate::AggregateKey;
use wrapped_stats_server::cache::{CacheEntry, ResultCache, SqliteResultCache};
use wrapped_stats_server::config::{self, AppConfig};
use wrapped_stats_server::manager::{record_batch, BatchReport, RejectedPlay};
use wrapped_stats_server::play_store::{IncomingPlay, PlayStore, SqlitePlayStore};
use wrapped_stats_server::refresh::{
    DirtyReason, Recomputer, RefreshError, RetryOutcome, RetryPolicy, RetryStore,
    SqliteRetryStore, StoreRecomputer,
};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let original_path = PathBuf::from(s);
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.is_dir() {
        return Err(format!("Not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
#[command(name = "cli-wrapped")]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    config: Option<PathBuf>,

    /// Directory containing the database files.
    #[clap(long, value_parser = parse_dir)]
    db_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Imports plays from a JSON-lines file, one play per line.
    Import {
        #[clap(value_parser = parse_path)]
        file: PathBuf,
    },

    /// Shows a listener's statistics for a year.
    Stats {
        user_id: String,
        year: i32,
        /// Recompute and cache the statistics when nothing is cached.
        #[clap(long)]
        compute: bool,
    },

    /// Shows the global statistics of a year.
    Global {
        year: i32,
        /// Recompute and cache the statistics when nothing is cached.
        #[clap(long)]
        compute: bool,
    },

    /// Shows the cache entry and retry state of a key
    /// (`user:<id>:<year>` or `global:<year>`).
    Show { key: String },

    /// Drops the cached aggregate of a key and queues its recomputation.
    Invalidate { key: String },

    /// Inspects and manages keys whose refresh failed.
    RetryQueue {
        #[command(subcommand)]
        action: RetryQueueCommand,
    },

    /// Summary of plays, cached aggregates and failing keys.
    State,
}

#[derive(Subcommand, Debug)]
enum RetryQueueCommand {
    /// Lists failing keys.
    List {
        /// Only keys that ran out of attempts.
        #[clap(long)]
        exhausted: bool,
    },

    /// Forgets the failures of one key, or of every key, and queues a refresh.
    Clear { key: Option<String> },

    /// Recomputes every key in the retry queue now.
    Process {
        #[clap(long, default_value_t = 4)]
        parallelism: usize,
    },
}

struct Stores {
    play_store: Arc<dyn PlayStore>,
    cache: Arc<dyn ResultCache>,
    retry_store: Arc<dyn RetryStore>,
    recomputer: StoreRecomputer,
    policy: RetryPolicy,
}

impl Stores {
    fn open(config: &AppConfig) -> Result<Self> {
        let play_store: Arc<dyn PlayStore> = Arc::new(SqlitePlayStore::new(
            config.plays_db_path(),
            config.ingestion.inherit_external_ids,
        )?);
        Ok(Self {
            recomputer: StoreRecomputer::new(play_store.clone(), config.aggregation.clone()),
            play_store,
            cache: Arc::new(SqliteResultCache::new(config.cache_db_path())?),
            retry_store: Arc::new(SqliteRetryStore::new(config.refresh_state_db_path())?),
            policy: RetryPolicy::new(&config.refresh),
        })
    }

    /// Recomputes `key` and stores the result, like one scheduler run.
    fn compute(&self, key: &AggregateKey) -> Result<CacheEntry, RefreshError> {
        let computed_at = Utc::now();
        let aggregate = self.recomputer.recompute(key, &CancellationToken::new())?;
        self.cache.put(key, &aggregate, computed_at)?;
        Ok(CacheEntry {
            key: key.clone(),
            aggregate,
            computed_at,
        })
    }

    /// Clears the key's failures here and in a running server.
    fn reset(&self, key: &AggregateKey) -> Result<bool> {
        let cleared = self.retry_store.clear(key)?;
        self.retry_store.enqueue_request(key, DirtyReason::Operator)?;
        Ok(cleared)
    }

    /// Resets every failing key. Returns how many were cleared.
    fn reset_all(&self) -> Result<usize> {
        for retry in self.retry_store.list(false)? {
            self.retry_store
                .enqueue_request(&retry.key, DirtyReason::Operator)?;
        }
        self.retry_store.clear_all()
    }
}

fn import(stores: &Stores, path: &Path) -> Result<BatchReport> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut plays = Vec::new();
    let mut unreadable = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IncomingPlay>(&line) {
            Ok(play) => plays.push((index, play)),
            Err(e) => unreadable.push(RejectedPlay {
                index,
                uri: None,
                reason: e.to_string(),
            }),
        }
    }

    let batch = record_batch(stores.play_store.as_ref(), plays);
    for key in &batch.touched {
        stores
            .retry_store
            .enqueue_request(key, DirtyReason::NewPlays)?;
    }
    if let Some(e) = batch.failure {
        return Err(e.context(format!(
            "Import stopped after {} plays",
            batch.report.inserted + batch.report.duplicates
        )));
    }

    let mut report = batch.report;
    report.rejected.extend(unreadable);
    report.rejected.sort_by_key(|rejected| rejected.index);
    for rejected in &report.rejected {
        warn!("Line {} rejected: {}", rejected.index + 1, rejected.reason);
    }
    println!(
        "Imported {} plays ({} duplicates, {} rejected), {} keys queued for refresh",
        report.inserted,
        report.duplicates,
        report.rejected.len(),
        batch.touched.len()
    );
    Ok(report)
}

fn print_entry(entry: &CacheEntry) -> Result<()> {
    println!("{} computed at {}", entry.key, entry.computed_at.to_rfc3339());
    println!("{}", serde_json::to_string_pretty(&entry.aggregate)?);
    Ok(())
}

fn stats(stores: &Stores, key: AggregateKey, compute: bool) -> Result<()> {
    if let Some(entry) = stores.cache.get(&key)? {
        return print_entry(&entry);
    }
    if !compute {
        println!("No cached statistics for {} (use --compute)", key);
        return Ok(());
    }
    let entry = stores.compute(&key)?;
    stores.retry_store.clear(&key)?;
    print_entry(&entry)
}

fn show(stores: &Stores, key: &str) -> Result<()> {
    let key: AggregateKey = key.parse()?;
    match stores.cache.get(&key)? {
        Some(entry) => print_entry(&entry)?,
        None => println!("{}: not cached", key),
    }
    match stores.retry_store.get(&key)? {
        Some(retry) => println!(
            "Retry state: {} attempts, {}, next attempt {}, last error: {}",
            retry.attempts,
            retry.outcome.as_str(),
            retry
                .next_attempt_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "operator".to_string()),
            retry.last_error
        ),
        None => println!("Retry state: none"),
    }
    Ok(())
}

fn invalidate(stores: &Stores, key: &str) -> Result<()> {
    let key: AggregateKey = key.parse()?;
    let dropped = stores.cache.invalidate(&key)?;
    stores
        .retry_store
        .enqueue_request(&key, DirtyReason::Operator)?;
    if dropped {
        println!("Dropped {}, queued a refresh", key);
    } else {
        println!("{} was not cached, queued a refresh anyway", key);
    }
    Ok(())
}

fn retry_queue(stores: &Stores, action: RetryQueueCommand) -> Result<()> {
    match action {
        RetryQueueCommand::List { exhausted } => {
            let states = stores.retry_store.list(exhausted)?;
            if states.is_empty() {
                println!("Retry queue is empty");
            }
            for retry in states {
                println!(
                    "{:<40} {:>3} attempts  {:<9}  last {}  {}",
                    retry.key.to_string(),
                    retry.attempts,
                    retry.outcome.as_str(),
                    retry.last_attempt_at.to_rfc3339(),
                    retry.last_error
                );
            }
        }
        RetryQueueCommand::Clear { key: Some(key) } => {
            let key: AggregateKey = key.parse()?;
            if stores.reset(&key)? {
                println!("Cleared {}", key);
            } else {
                println!("{} had no retry state, queued a refresh anyway", key);
            }
        }
        RetryQueueCommand::Clear { key: None } => {
            println!("Cleared {} keys", stores.reset_all()?);
        }
        RetryQueueCommand::Process { parallelism } => {
            let (succeeded, total) = process(stores, parallelism)?;
            println!("{} of {} keys recomputed", succeeded, total);
        }
    }
    Ok(())
}

/// Recomputes every queued key. A success stores the result and forgets the
/// failures; the running server sees the fresh entry on its next read.
fn process(stores: &Stores, parallelism: usize) -> Result<(usize, usize)> {
    if parallelism == 0 {
        bail!("--parallelism must be at least 1");
    }
    let keys: Vec<AggregateKey> = stores
        .retry_store
        .list(false)?
        .into_iter()
        .map(|retry| retry.key)
        .collect();
    info!("Processing {} keys with {} threads", keys.len(), parallelism);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism)
        .build()?;
    let results: Vec<(AggregateKey, Result<CacheEntry, RefreshError>)> = pool.install(|| {
        keys.par_iter()
            .map(|key| (key.clone(), stores.compute(key)))
            .collect()
    });

    let mut succeeded = 0;
    for (key, result) in results {
        match result {
            Ok(_) => {
                stores.retry_store.clear(&key)?;
                succeeded += 1;
            }
            Err(e) => {
                let retry = stores.retry_store.record_failure(
                    &key,
                    &e.to_string(),
                    &stores.policy,
                    Utc::now(),
                )?;
                println!("{} failed again ({} attempts): {}", key, retry.attempts, e);
            }
        }
    }
    Ok((succeeded, keys.len()))
}

fn state(stores: &Stores) -> Result<()> {
    println!("Plays:");
    for year in stores.play_store.years()? {
        println!(
            "  {}: {} plays, {} listeners",
            year,
            stores.play_store.count_plays(None, year)?,
            stores.play_store.users_for_year(year)?.len()
        );
    }

    let mut cached: BTreeMap<(i32, &'static str), usize> = BTreeMap::new();
    for entry in stores.cache.list()? {
        *cached.entry((entry.key.year(), entry.key.scope())).or_insert(0) += 1;
    }
    println!("Cached aggregates:");
    for ((year, scope), count) in cached {
        println!("  {} {}: {}", year, scope, count);
    }

    let retries = stores.retry_store.list(false)?;
    let exhausted = retries
        .iter()
        .filter(|r| r.outcome == RetryOutcome::Exhausted)
        .count();
    let due = stores.retry_store.due(Utc::now())?.len();
    println!(
        "Retry queue: {} backing off ({} due now), {} exhausted",
        retries.len() - exhausted,
        due,
        exhausted
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => Some(config::FileConfig::load(path)?),
        None => None,
    };
    let cli_config = config::CliConfig {
        db_dir: cli_args.db_dir.clone(),
        ..config::CliConfig::default()
    };
    let app_config = AppConfig::resolve(&cli_config, file_config)?;
    let stores = Stores::open(&app_config)?;

    match cli_args.command {
        Command::Import { file } => import(&stores, &file).map(|_| ()),
        Command::Stats {
            user_id,
            year,
            compute,
        } => stats(&stores, AggregateKey::user(user_id, year), compute),
        Command::Global { year, compute } => stats(&stores, AggregateKey::global(year), compute),
        Command::Show { key } => show(&stores, &key),
        Command::Invalidate { key } => invalidate(&stores, &key),
        Command::RetryQueue { action } => retry_queue(&stores, action),
        Command::State => state(&stores),
    }
}
