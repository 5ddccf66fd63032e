//! Switchyard traffic migration: switch executor, stepped plans, rollback.
//!
//! Every change to traffic weights goes through one path:
//!
//! ```text
//!   MigrationPlanner ──step──▶ TrafficSwitchExecutor ──commit──▶ StateStore
//!        │    ▲                        │
//!        │    └── HealthVerdict        └──reload/adopt──▶ EdgeRouter
//!        ▼
//!     Prober (target, then source)
//! ```
//!
//! # Components
//!
//! - **`executor`**: validated, revisioned weight switches with revert
//! - **`planner`**: stepped and canary migration plans under a global lock
//! - **`rollback`**: single-apply restore of a plan's baseline

pub mod error;
pub mod executor;
pub mod planner;
pub mod rollback;

pub use error::{PlanError, RollbackError, SwitchError};
pub use executor::TrafficSwitchExecutor;
pub use planner::{
    step_weights, MigrationPlanner, PlanReport, PlanRequest, PlannerSettings, RunningPlan,
    PLAN_LOCK,
};
