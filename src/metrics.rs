use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all wrapped metrics
const PREFIX: &str = "wrapped";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Ingestion
    pub static ref PLAYS_INGESTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_plays_ingested_total"), "Plays received, by outcome"),
        &["outcome"]
    ).expect("Failed to create plays_ingested_total metric");

    // Refresh
    pub static ref REFRESH_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_refresh_runs_total"), "Aggregate refresh runs"),
        &["scope", "outcome"]
    ).expect("Failed to create refresh_runs_total metric");

    pub static ref REFRESH_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_refresh_duration_seconds"),
            "Aggregate refresh duration in seconds"
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        &["scope"]
    ).expect("Failed to create refresh_duration_seconds metric");

    pub static ref REFRESH_KEYS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_refresh_keys"), "Keys per refresh state"),
        &["state"]
    ).expect("Failed to create refresh_keys metric");

    pub static ref RETRIES_EXHAUSTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_retries_exhausted_total"),
            "Keys that ran out of refresh attempts"
        ),
        &["scope"]
    ).expect("Failed to create retries_exhausted_total metric");

    // Cache
    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_cache_lookups_total"), "Result cache lookups"),
        &["scope", "result"]
    ).expect("Failed to create cache_lookups_total metric");

    // Aggregation
    pub static ref SKIPPED_EVENTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            format!("{PREFIX}_skipped_events_total"),
            "Malformed stored plays skipped while aggregating"
        ),
        &["scope"]
    ).expect("Failed to create skipped_events_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // ignore errors if already registered (tests)
    let _ = REGISTRY.register(Box::new(PLAYS_INGESTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(REFRESH_RUNS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(REFRESH_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(REFRESH_KEYS.clone()));
    let _ = REGISTRY.register(Box::new(RETRIES_EXHAUSTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_LOOKUPS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SKIPPED_EVENTS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// `outcome` is `inserted`, `duplicate` or `rejected`.
pub fn record_play_ingested(outcome: &str) {
    PLAYS_INGESTED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_refresh(scope: &str, outcome: &str, duration: Duration) {
    REFRESH_RUNS_TOTAL.with_label_values(&[scope, outcome]).inc();
    REFRESH_DURATION_SECONDS
        .with_label_values(&[scope])
        .observe(duration.as_secs_f64());
}

pub fn set_refresh_keys(state: &str, count: usize) {
    REFRESH_KEYS.with_label_values(&[state]).set(count as f64);
}

pub fn record_retry_exhausted(scope: &str) {
    RETRIES_EXHAUSTED_TOTAL.with_label_values(&[scope]).inc();
}

pub fn record_cache_lookup(scope: &str, hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS_TOTAL.with_label_values(&[scope, result]).inc();
}

pub fn record_skipped_events(scope: &str, count: u32) {
    if count > 0 {
        SKIPPED_EVENTS_TOTAL
            .with_label_values(&[scope])
            .inc_by(count as f64);
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
