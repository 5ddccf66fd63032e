//! switchyard-api: REST API for Switchyard.
//!
//! Thin axum layer over the deployment controller. Every response uses the
//! same `{success, data, error}` envelope; controller errors map onto HTTP
//! status codes by class.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/status` | Traffic, running plan, health |
//! | POST | `/api/v1/deploy` | Deploy a version to an idle environment |
//! | GET | `/api/v1/migrations` | List migration plans |
//! | POST | `/api/v1/migrations` | Start a stepped or canary migration |
//! | GET | `/api/v1/migrations/{id}` | Get one plan |
//! | POST | `/api/v1/migrations/{id}/abort` | Abort a running plan |
//! | POST | `/api/v1/switch` | Direct switch to one environment |
//! | POST | `/api/v1/rollback` | Roll back a plan |
//! | GET | `/api/v1/history` | Deployment history |
//! | POST | `/api/v1/outcomes` | Ingest request outcomes from the edge |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod migration_handlers;
pub mod response;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use switchyard_controller::DeploymentController;
use switchyard_metrics::OutcomeWindow;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<DeploymentController>,
    pub outcomes: Arc<OutcomeWindow>,
    /// Trailing window reported on `/metrics`.
    pub window: Duration,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/status", get(handlers::status))
        .route("/deploy", post(migration_handlers::deploy))
        .route(
            "/migrations",
            get(migration_handlers::list_migrations).post(migration_handlers::start_migration),
        )
        .route("/migrations/{id}", get(migration_handlers::get_migration))
        .route("/migrations/{id}/abort", post(migration_handlers::abort_migration))
        .route("/switch", post(migration_handlers::direct_switch))
        .route("/rollback", post(migration_handlers::rollback))
        .route("/history", get(handlers::history))
        .route("/outcomes", post(handlers::ingest_outcomes))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
