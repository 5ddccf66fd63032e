//! Switchyard deployment controller.
//!
//! The top-level entry point for operators and CI:
//!
//! ```text
//!   deploy ──────────▶ BuildCollaborator ──▶ wait_until_healthy
//!   gradual_migrate ─▶ deploy ──▶ MigrationPlanner (steps, rollback)
//!   direct_switch ───▶ probe ───▶ TrafficSwitchExecutor
//!   rollback/abort ──▶ MigrationPlanner
//!   recover ─────────▶ roll back plans left Running by a dead process
//!   advice loop ◀──── ContinuousMonitor
//! ```
//!
//! Every operation appends to the deployment history.

pub mod advice;
pub mod bootstrap;
pub mod collaborator;
pub mod controller;
pub mod error;

pub use bootstrap::bootstrap;
pub use collaborator::{BuildCollaborator, CommandCollaborator, DeployError, ExternalCollaborator};
pub use controller::{
    Collaborators, ControllerSettings, DeployReport, DeploymentController, MigrationOutcome,
    MigrationRequest, RollbackReport, StatusSnapshot, SwitchOutcome,
};
pub use error::{ControllerError, ControllerResult, RollbackOutcome};
