use std::sync::Arc;

use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router, extract::State};

use crate::api::AppState;
use crate::controller::StatusReport;
use crate::controller::state::Metrics;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "running": true }))
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    Json(state.controller.status_report().await)
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.controller.status_report().await;
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_prometheus(&report),
    )
}

/// Text exposition of the controller counters.
fn render_prometheus(report: &StatusReport) -> String {
    let Metrics {
        total_created,
        total_destroyed,
        current_queue_length,
        failed_scale_attempts,
        circuit_breaker_active,
        ignored_existing,
        min_floor_capped,
        ..
    } = &report.state.metrics;

    let mut out = String::new();
    let mut metric = |name: &str, kind: &str, value: u64| {
        out.push_str(&format!("# TYPE {name} {kind}\n{name} {value}\n"));
    };
    metric("runner_controller_workers_created_total", "counter", *total_created);
    metric("runner_controller_workers_destroyed_total", "counter", *total_destroyed);
    metric(
        "runner_controller_failed_scale_attempts_total",
        "counter",
        *failed_scale_attempts,
    );
    metric(
        "runner_controller_min_floor_capped_total",
        "counter",
        *min_floor_capped,
    );
    metric("runner_controller_queue_length", "gauge", *current_queue_length);
    metric(
        "runner_controller_circuit_breaker_active",
        "gauge",
        u64::from(*circuit_breaker_active),
    );
    metric("runner_controller_adopted_workers", "gauge", *ignored_existing);
    metric(
        "runner_controller_managed_workers",
        "gauge",
        report.state.workers.len() as u64,
    );
    metric("runner_controller_active_workers", "gauge", u64::from(report.active));
    metric(
        "runner_controller_degraded",
        "gauge",
        u64::from(report.degraded.degraded),
    );
    out
}
