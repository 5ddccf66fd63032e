//! Read-side and ingestion handlers.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{debug, warn};

use switchyard_core::epoch_millis;
use switchyard_metrics::{render_prometheus, Exposition, OutcomeSample};

use crate::ApiState;
use crate::response::{controller_error, error_response, ApiResponse};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1_000;

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/status
pub async fn status(State(state): State<ApiState>) -> Response {
    match state.controller.status() {
        Ok(snapshot) => ApiResponse::ok(snapshot).into_response(),
        Err(e) => controller_error(e),
    }
}

// ── History ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/history?limit=N
pub async fn history(State(state): State<ApiState>, Query(query): Query<HistoryQuery>) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    match state.controller.history(limit) {
        Ok(entries) => ApiResponse::ok(entries).into_response(),
        Err(e) => controller_error(e),
    }
}

// ── Outcomes ───────────────────────────────────────────────────

/// POST /api/v1/outcomes
///
/// A batch is accepted whole or not at all.
pub async fn ingest_outcomes(
    State(state): State<ApiState>,
    Json(samples): Json<Vec<OutcomeSample>>,
) -> Response {
    if let Some(bad) = samples
        .iter()
        .find(|s| !s.latency_ms.is_finite() || s.latency_ms < 0.0)
    {
        warn!(environment = %bad.environment_id, latency = bad.latency_ms, "rejected outcome batch");
        return error_response(
            &format!("invalid latency {} for {}", bad.latency_ms, bad.environment_id),
            StatusCode::BAD_REQUEST,
        );
    }
    state.outcomes.ingest(&samples);
    debug!(count = samples.len(), "outcomes ingested");
    ApiResponse::ok(serde_json::json!({ "accepted": samples.len() })).into_response()
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let store = state.controller.store();
    let traffic = store.current_traffic().unwrap_or_else(|e| {
        warn!(error = %e, "metrics could not read traffic state");
        None
    });
    let verdicts = store.list_verdicts().unwrap_or_default();
    let window = state.outcomes.snapshot_at(epoch_millis(), state.window);
    let totals = state.outcomes.totals();

    let body = render_prometheus(&Exposition {
        traffic: traffic.as_ref(),
        verdicts: &verdicts,
        window: &window,
        totals: &totals,
    });
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
