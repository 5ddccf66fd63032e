//! Handlers that change deployments or traffic.
//!
//! Migrations start in the background by default (`202 Accepted` with the
//! plan as started); `?wait=true` runs the plan to completion in the
//! request instead.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::info;

use switchyard_controller::{MigrationOutcome, MigrationRequest};
use switchyard_core::EnvironmentId;
use switchyard_state::Outcome;

use crate::ApiState;
use crate::response::{controller_error, ApiResponse};

// ── Deploy ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub environment: EnvironmentId,
    pub version: String,
}

/// POST /api/v1/deploy
pub async fn deploy(State(state): State<ApiState>, Json(req): Json<DeployRequest>) -> Response {
    match state.controller.deploy(req.environment, &req.version).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => controller_error(e),
    }
}

// ── Migrations ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct MigrationQuery {
    #[serde(default)]
    pub wait: bool,
}

/// POST /api/v1/migrations
pub async fn start_migration(
    State(state): State<ApiState>,
    Query(query): Query<MigrationQuery>,
    Json(req): Json<MigrationRequest>,
) -> Response {
    info!(target = %req.target, version = ?req.version, canary = req.canary, wait = query.wait, "migration requested");
    if query.wait {
        return match state.controller.migrate(req).await {
            Ok(outcome) => ApiResponse::ok(outcome).into_response(),
            Err(e) => controller_error(e),
        };
    }
    match state.controller.start_migration(req).await {
        Ok(Some(plan)) => (StatusCode::ACCEPTED, ApiResponse::ok(plan)).into_response(),
        Ok(None) => ApiResponse::ok(MigrationOutcome {
            outcome: Outcome::NoOp,
            plan: None,
        })
        .into_response(),
        Err(e) => controller_error(e),
    }
}

/// GET /api/v1/migrations
pub async fn list_migrations(State(state): State<ApiState>) -> Response {
    match state.controller.plans() {
        Ok(plans) => ApiResponse::ok(plans).into_response(),
        Err(e) => controller_error(e),
    }
}

/// GET /api/v1/migrations/{id}
pub async fn get_migration(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.controller.plan(&id) {
        Ok(plan) => ApiResponse::ok(plan).into_response(),
        Err(e) => controller_error(e),
    }
}

/// POST /api/v1/migrations/{id}/abort
pub async fn abort_migration(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.controller.abort(&id) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({ "plan_id": id, "abort_requested": true })),
        )
            .into_response(),
        Err(e) => controller_error(e),
    }
}

// ── Switch / rollback ──────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    pub target: EnvironmentId,
}

/// POST /api/v1/switch
pub async fn direct_switch(State(state): State<ApiState>, Json(req): Json<SwitchRequest>) -> Response {
    match state.controller.direct_switch(req.target).await {
        Ok(outcome) => ApiResponse::ok(outcome).into_response(),
        Err(e) => controller_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    /// Defaults to the most recent plan.
    #[serde(default)]
    pub plan_id: Option<String>,
}

/// POST /api/v1/rollback
pub async fn rollback(State(state): State<ApiState>, Json(req): Json<RollbackRequest>) -> Response {
    match state.controller.rollback(req.plan_id.as_deref()).await {
        Ok(report) if report.aborted => (StatusCode::ACCEPTED, ApiResponse::ok(report)).into_response(),
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => controller_error(e),
    }
}
