use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::controller::state::PairedWorker;
use crate::error::AppError;

const DEFAULT_LOG_TAIL: u32 = 100;
const MAX_LOG_TAIL: u32 = 10_000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workers))
        .route("/scale-up", post(scale_up))
        .route("/scale-down", post(scale_down))
        .route("/{name}", delete(delete_worker))
        .route("/{name}/logs", get(worker_logs))
}

/// Both views joined on worker name: paired, container-only, and
/// registration-only entries all show up.
async fn list_workers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PairedWorker>>, AppError> {
    Ok(Json(state.controller.joined_workers().await?))
}

#[derive(Serialize)]
struct ScaleResponse {
    scaled: &'static str,
    worker: String,
}

async fn scale_up(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<ScaleResponse>), AppError> {
    let worker = state.controller.manual_scale_up().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ScaleResponse {
            scaled: "up",
            worker,
        }),
    ))
}

async fn scale_down(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<ScaleResponse>), AppError> {
    let worker = state.controller.manual_scale_down().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ScaleResponse {
            scaled: "down",
            worker,
        }),
    ))
}

async fn delete_worker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.controller.teardown_by_name(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct LogsQuery {
    tail: Option<u32>,
}

async fn worker_logs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<String, AppError> {
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL).min(MAX_LOG_TAIL);
    state.controller.worker_logs(&name, tail).await
}
