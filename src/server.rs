//! HTTP API: play ingestion and the read path of yearly statistics.

use crate::manager::{MissPolicy, StatsError, WrappedManager};
use crate::play_store::{IncomingPlay, IngestError};
use crate::refresh::RefreshError;
use anyhow::{Context, Result};
use axum::{
    extract::{FromRef, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

pub type GuardedWrappedManager = Arc<WrappedManager>;

#[derive(Clone)]
pub struct ServerState {
    pub manager: GuardedWrappedManager,
}

impl FromRef<ServerState> for GuardedWrappedManager {
    fn from_ref(input: &ServerState) -> Self {
        input.manager.clone()
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatsParams {
    /// Compute a missing aggregate before answering instead of scheduling it.
    #[serde(default)]
    compute: bool,
}

impl StatsParams {
    fn policy(&self) -> MissPolicy {
        if self.compute {
            MissPolicy::ComputeNow
        } else {
            MissPolicy::Schedule
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn stats_error_response(e: StatsError) -> Response {
    match e {
        StatsError::UnknownHandle(handle) => {
            error_response(StatusCode::NOT_FOUND, format!("Unknown handle {}", handle))
        }
        StatsError::Identity(e) => {
            warn!("Identity lookup failed: {}", e);
            error_response(StatusCode::BAD_GATEWAY, "Identity service unavailable")
        }
        StatsError::Refresh(RefreshError::SchedulerUnavailable) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Statistics are not being refreshed right now",
        ),
        StatsError::Refresh(e) => {
            error!("Stats read failed: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn post_plays(
    State(manager): State<GuardedWrappedManager>,
    Json(plays): Json<Vec<IncomingPlay>>,
) -> Response {
    match manager.ingest_batch(plays).await {
        Ok(report) => Json(report).into_response(),
        Err(IngestError::Store(e)) => {
            error!("Play batch aborted: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn get_user_stats(
    State(manager): State<GuardedWrappedManager>,
    Path((year, user_id)): Path<(i32, String)>,
    Query(params): Query<StatsParams>,
) -> Response {
    match manager
        .personal_stats(&user_id, year, params.policy())
        .await
    {
        Ok(view) => Json(view).into_response(),
        Err(e) => stats_error_response(e),
    }
}

async fn get_handle_stats(
    State(manager): State<GuardedWrappedManager>,
    Path((year, handle)): Path<(i32, String)>,
    Query(params): Query<StatsParams>,
) -> Response {
    match manager
        .personal_stats_for_handle(&handle, year, params.policy())
        .await
    {
        Ok(view) => Json(view).into_response(),
        Err(e) => stats_error_response(e),
    }
}

async fn get_global_stats(
    State(manager): State<GuardedWrappedManager>,
    Path(year): Path<i32>,
    Query(params): Query<StatsParams>,
) -> Response {
    match manager.global_stats(year, params.policy()).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => stats_error_response(e),
    }
}

async fn get_standing(
    State(manager): State<GuardedWrappedManager>,
    Path((year, user_id)): Path<(i32, String)>,
) -> Response {
    match manager.listener_standing(&user_id, year) {
        Ok(Some(standing)) => Json(standing).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => stats_error_response(e),
    }
}

async fn get_artist_images(
    State(manager): State<GuardedWrappedManager>,
    Path((year, user_id)): Path<(i32, String)>,
) -> Response {
    let view = match manager
        .personal_stats(&user_id, year, MissPolicy::Schedule)
        .await
    {
        Ok(view) => view,
        Err(e) => return stats_error_response(e),
    };
    match view.stats().and_then(|stats| stats.as_personal()) {
        Some(personal) => Json(manager.artist_images(personal).await).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn make_app(manager: GuardedWrappedManager) -> Router {
    let state = ServerState { manager };
    Router::new()
        .route("/v1/plays", post(post_plays))
        .route("/v1/wrapped/{year}/global", get(get_global_stats))
        .route("/v1/wrapped/{year}/users/{user_id}", get(get_user_stats))
        .route(
            "/v1/wrapped/{year}/users/{user_id}/standing",
            get(get_standing),
        )
        .route(
            "/v1/wrapped/{year}/users/{user_id}/artist-images",
            get(get_artist_images),
        )
        .route("/v1/wrapped/{year}/handles/{handle}", get(get_handle_stats))
        .with_state(state)
}

pub async fn run_server(manager: GuardedWrappedManager, port: u16) -> Result<()> {
    let app = make_app(manager);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Serving statistics on port {}", port);
    Ok(axum::serve(listener, app).await?)
}
