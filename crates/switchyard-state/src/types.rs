//! Domain types for the Switchyard state store.
//!
//! These types represent the persisted state of environments, traffic
//! weights, migration plans, health verdicts, and deployment history.
//! All types are serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use switchyard_core::{EnvironmentId, Percent};

/// Monotonic TrafficState revision number.
pub type Revision = u64;

/// Unique identifier for a migration plan.
pub type PlanId = String;

/// Traffic share per environment.
pub type Weights = BTreeMap<EnvironmentId, Percent>;

// ── Environment ───────────────────────────────────────────────────

/// A statically registered, independently deployable replica of the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Environment {
    pub id: EnvironmentId,
    /// Version currently deployed. Changed only after a successful deploy.
    pub version: String,
    /// Instance addresses (`host:port`).
    pub endpoints: Vec<String>,
    pub health: HealthStatus,
    pub role: EnvironmentRole,
    /// Unix timestamp (ms) of last change.
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentRole {
    Active,
    Standby,
    Draining,
}

/// Health status as determined by the latest probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

// ── Traffic ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficMode {
    Single,
    Dual,
    Canary,
    HighAvailability,
}

impl TrafficMode {
    /// Mode implied by the number of environments receiving traffic.
    pub fn derive(weights: &Weights) -> Self {
        match weights.values().filter(|w| **w > 0).count() {
            0 | 1 => TrafficMode::Single,
            2 => TrafficMode::Dual,
            _ => TrafficMode::HighAvailability,
        }
    }
}

/// The authoritative record of which environments receive what share of traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficState {
    pub weights: Weights,
    pub mode: TrafficMode,
    pub revision: Revision,
    /// Unix timestamp (ms) when this revision was applied.
    pub last_updated: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WeightsError {
    #[error("weights sum to {0}, expected 100")]
    BadSum(u32),
    #[error("unknown environment: {0}")]
    UnknownEnvironment(EnvironmentId),
    #[error("weight {weight} for {id} exceeds 100")]
    OutOfRange { id: EnvironmentId, weight: Percent },
}

/// Check that weights sum to 100 and each entry is a percentage.
pub fn check_weights(weights: &Weights) -> Result<(), WeightsError> {
    for (id, weight) in weights {
        if *weight > 100 {
            return Err(WeightsError::OutOfRange {
                id: *id,
                weight: *weight,
            });
        }
    }
    let total: u32 = weights.values().map(|w| *w as u32).sum();
    if total != 100 {
        return Err(WeightsError::BadSum(total));
    }
    Ok(())
}

impl TrafficState {
    /// Share routed to `id` (0 if absent).
    pub fn weight_of(&self, id: EnvironmentId) -> Percent {
        self.weights.get(&id).copied().unwrap_or(0)
    }

    /// Sum of all weights. Always 100 for a stored state.
    pub fn total(&self) -> u32 {
        self.weights.values().map(|w| *w as u32).sum()
    }

    /// Environments currently receiving traffic.
    pub fn serving(&self) -> Vec<EnvironmentId> {
        self.weights
            .iter()
            .filter(|(_, w)| **w > 0)
            .map(|(id, _)| *id)
            .collect()
    }

    /// The environment with the largest share, excluding `except`.
    pub fn heaviest_except(&self, except: Option<EnvironmentId>) -> Option<EnvironmentId> {
        self.weights
            .iter()
            .filter(|(id, w)| Some(**id) != except && **w > 0)
            .max_by_key(|(_, w)| **w)
            .map(|(id, _)| *id)
    }

    /// True when both states route identical shares (revision ignored).
    pub fn same_routing(&self, weights: &Weights) -> bool {
        let nonzero = |w: &Weights| -> Weights {
            w.iter().filter(|(_, v)| **v > 0).map(|(k, v)| (*k, *v)).collect()
        };
        nonzero(&self.weights) == nonzero(weights)
    }
}

// ── Health ────────────────────────────────────────────────────────

/// Result of a single named check against one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckOutcome {
    pub ok: bool,
    pub latency_ms: u64,
    pub status_code: Option<u16>,
    /// Diagnostics returned by the endpoint or the transport error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of probing an environment at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthVerdict {
    pub environment_id: EnvironmentId,
    pub healthy: bool,
    pub checks: BTreeMap<String, CheckOutcome>,
    /// Unix timestamp (ms).
    pub evaluated_at: u64,
}

impl HealthVerdict {
    /// Build a verdict; healthy only if at least one check ran and all passed.
    pub fn from_checks(
        environment_id: EnvironmentId,
        checks: BTreeMap<String, CheckOutcome>,
        evaluated_at: u64,
    ) -> Self {
        let healthy = !checks.is_empty() && checks.values().all(|c| c.ok);
        Self {
            environment_id,
            healthy,
            checks,
            evaluated_at,
        }
    }

    /// Names of the checks that failed.
    pub fn failing_checks(&self) -> Vec<&str> {
        self.checks
            .iter()
            .filter(|(_, c)| !c.ok)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn status(&self) -> HealthStatus {
        if self.healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

// ── Migration plans ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MigrationKind {
    /// Shift `target:P, source:100-P` for each step.
    Stepped,
    /// Hold a fixed canary share, then promote.
    Canary { percent: Percent },
}

/// Outcome of one migration step. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub percentage: Percent,
    pub health_verdict: Option<HealthVerdict>,
    /// Unix timestamp (ms) when the step started.
    pub timestamp: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// The computed weights already matched and no switch was issued.
    #[serde(default)]
    pub switch_skipped: bool,
}

impl StepResult {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.health_verdict.as_ref().is_some_and(|v| v.healthy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal plan transition {from:?} -> {to:?}")]
pub struct PlanTransitionError {
    pub from: PlanStatus,
    pub to: PlanStatus,
}

/// An ordered, abortable sequence of weight changes from one environment
/// to another, gated by health checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationPlan {
    pub id: PlanId,
    pub source: EnvironmentId,
    pub target: EnvironmentId,
    /// Version deployed to the target before migrating, if any.
    pub version: Option<String>,
    pub kind: MigrationKind,
    pub steps: Vec<Percent>,
    pub current_step_index: usize,
    pub status: PlanStatus,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    /// Last known-good TrafficState captured when the plan started.
    pub baseline: Option<TrafficState>,
    pub history: Vec<StepResult>,
    pub failure: Option<String>,
}

impl MigrationPlan {
    pub fn new(
        id: PlanId,
        source: EnvironmentId,
        target: EnvironmentId,
        kind: MigrationKind,
        steps: Vec<Percent>,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            source,
            target,
            version: None,
            kind,
            steps,
            current_step_index: 0,
            status: PlanStatus::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            baseline: None,
            history: Vec::new(),
            failure: None,
        }
    }

    /// Succeeded and RolledBack never change again. Failed only moves on
    /// to RolledBack once the rollback lands.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            PlanStatus::Succeeded | PlanStatus::Failed | PlanStatus::RolledBack
        )
    }

    fn transition(&mut self, to: PlanStatus) -> Result<(), PlanTransitionError> {
        let allowed = matches!(
            (self.status, to),
            (PlanStatus::Pending, PlanStatus::Running)
                | (PlanStatus::Running, PlanStatus::Succeeded)
                | (PlanStatus::Running, PlanStatus::Failed)
                | (PlanStatus::Failed, PlanStatus::RolledBack)
        );
        if !allowed {
            return Err(PlanTransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Pending → Running, capturing the known-good state to roll back to.
    pub fn begin(&mut self, baseline: TrafficState, now: u64) -> Result<(), PlanTransitionError> {
        self.transition(PlanStatus::Running)?;
        self.baseline = Some(baseline);
        self.started_at = Some(now);
        Ok(())
    }

    /// Append a step result; `advance` moves to the next step.
    pub fn record_step(&mut self, result: StepResult, advance: bool) -> Result<(), PlanTransitionError> {
        if self.status != PlanStatus::Running {
            return Err(PlanTransitionError {
                from: self.status,
                to: PlanStatus::Running,
            });
        }
        self.history.push(result);
        if advance {
            self.current_step_index = (self.current_step_index + 1).min(self.steps.len());
        }
        Ok(())
    }

    pub fn succeed(&mut self, now: u64) -> Result<(), PlanTransitionError> {
        self.transition(PlanStatus::Succeeded)?;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: u64) -> Result<(), PlanTransitionError> {
        self.transition(PlanStatus::Failed)?;
        self.failure = Some(reason.into());
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn mark_rolled_back(&mut self, now: u64) -> Result<(), PlanTransitionError> {
        self.transition(PlanStatus::RolledBack)?;
        self.finished_at = Some(now);
        Ok(())
    }

    /// Next step percentage, if any remain.
    pub fn next_step(&self) -> Option<Percent> {
        self.steps.get(self.current_step_index).copied()
    }
}

// ── Alerts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    EnvironmentUnhealthy,
    ErrorRate,
    Latency,
    Availability,
    MigrationFailed,
    RollbackFailed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::EnvironmentUnhealthy => "environment_unhealthy",
            AlertKind::ErrorRate => "error_rate",
            AlertKind::Latency => "latency",
            AlertKind::Availability => "availability",
            AlertKind::MigrationFailed => "migration_failed",
            AlertKind::RollbackFailed => "rollback_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub message: String,
    pub severity: Severity,
    /// Unix timestamp (ms).
    pub timestamp: u64,
    /// Events sharing a key are deduplicated within the cooldown window.
    pub cooldown_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<EnvironmentId>,
}

impl AlertEvent {
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        environment_id: Option<EnvironmentId>,
        message: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        let cooldown_key = match environment_id {
            Some(id) => format!("{}:{id}", kind.as_str()),
            None => kind.as_str().to_string(),
        };
        Self {
            kind,
            message: message.into(),
            severity,
            timestamp,
            cooldown_key,
            environment_id,
        }
    }
}

// ── Deployment history ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deploy,
    GradualMigrate,
    DirectSwitch,
    Rollback,
    Abort,
    Recover,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    NoOp,
    Rejected,
    Failed,
    RolledBack,
}

/// Immutable record of one controller operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    /// Assigned by the store on append.
    #[serde(default)]
    pub sequence: u64,
    /// Unix timestamp (ms).
    pub timestamp: u64,
    pub operation: Operation,
    pub from_environment: Option<EnvironmentId>,
    pub to_environment: Option<EnvironmentId>,
    pub outcome: Outcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ── Plan lock ─────────────────────────────────────────────────────

/// Lease on a named lock; expires if the holder stops renewing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl Lease {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}
