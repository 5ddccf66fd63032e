//! Deployment controller: the operator-facing entry point.
//!
//! Every public operation returns a structured result, never panics across
//! the boundary, and appends one entry to the deployment history whatever
//! its outcome. Traffic changes go through the migration planner (stepped)
//! or straight through the switch executor (`direct_switch`); both are
//! excluded while a plan holds the plan lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use switchyard_alert::AlertFanout;
use switchyard_core::{epoch_millis, validate_steps, validate_version, EnvironmentId, Percent, SwitchyardConfig};
use switchyard_health::{wait_until_healthy, Prober};
use switchyard_router::EdgeRouter;
use switchyard_rollout::{
    MigrationPlanner, PlanError, PlanReport, PlanRequest, PlannerSettings, RunningPlan,
    TrafficSwitchExecutor, PLAN_LOCK,
};
use switchyard_state::{
    Environment, EnvironmentRole, HealthVerdict, HistoryEntry, MigrationKind, MigrationPlan,
    Operation, Outcome, PlanId, PlanStatus, Revision, StateStore, TrafficState, Weights,
};

use crate::collaborator::BuildCollaborator;
use crate::error::{ControllerError, ControllerResult, RollbackOutcome};

/// Controller knobs taken from the config file.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub default_steps: Vec<Percent>,
    pub canary_percent: Percent,
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
}

impl From<&SwitchyardConfig> for ControllerSettings {
    fn from(config: &SwitchyardConfig) -> Self {
        Self {
            default_steps: config.migration.steps.clone(),
            canary_percent: config.migration.canary_percent,
            ready_timeout: Duration::from_secs(config.deploy.ready_timeout_secs),
            ready_poll: Duration::from_secs(config.deploy.ready_poll_secs),
        }
    }
}

/// Everything the controller talks to.
pub struct Collaborators {
    pub store: StateStore,
    pub router: Arc<dyn EdgeRouter>,
    pub prober: Arc<dyn Prober>,
    pub builder: Arc<dyn BuildCollaborator>,
    pub alerts: Arc<AlertFanout>,
}

/// A migration request as accepted from operators and CI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub target: EnvironmentId,
    /// Deploy this version to the target before migrating.
    #[serde(default)]
    pub version: Option<String>,
    /// Defaults to the configured steps.
    #[serde(default)]
    pub steps: Option<Vec<Percent>>,
    /// Hold a small canary share before promoting.
    #[serde(default)]
    pub canary: bool,
    /// Defaults to the configured canary share.
    #[serde(default)]
    pub canary_percent: Option<Percent>,
}

impl MigrationRequest {
    pub fn stepped(target: EnvironmentId, version: Option<String>, steps: Option<Vec<Percent>>) -> Self {
        Self {
            target,
            version,
            steps,
            canary: false,
            canary_percent: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub environment: EnvironmentId,
    pub version: String,
    pub verdict: HealthVerdict,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    /// `Succeeded`, or `NoOp` when the target already served everything.
    pub outcome: Outcome,
    pub plan: Option<MigrationPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SwitchOutcome {
    pub outcome: Outcome,
    pub revision: Revision,
    pub from: Option<EnvironmentId>,
    pub to: EnvironmentId,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub plan_id: PlanId,
    /// True when the plan was still running and was aborted instead;
    /// its own rollback then restores traffic.
    pub aborted: bool,
    pub revision: Option<Revision>,
    pub status: PlanStatus,
}

/// Read-only view for operators and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub traffic: Option<TrafficState>,
    /// The running plan, else the most recent one.
    pub plan: Option<MigrationPlan>,
    pub verdicts: Vec<HealthVerdict>,
    pub environments: Vec<Environment>,
}

enum Prepared {
    Started(RunningPlan, watch::Receiver<bool>),
    AlreadyServing,
}

pub struct DeploymentController {
    store: StateStore,
    executor: Arc<TrafficSwitchExecutor>,
    planner: Arc<MigrationPlanner>,
    prober: Arc<dyn Prober>,
    builder: Arc<dyn BuildCollaborator>,
    settings: ControllerSettings,
    /// Held while an operation prepares or changes traffic.
    gate: tokio::sync::Mutex<()>,
    /// Abort signals for plans running in this process.
    running: Mutex<HashMap<PlanId, watch::Sender<bool>>>,
}

impl DeploymentController {
    pub fn new(collaborators: Collaborators, config: &SwitchyardConfig) -> Self {
        let Collaborators {
            store,
            router,
            prober,
            builder,
            alerts,
        } = collaborators;
        let executor = Arc::new(TrafficSwitchExecutor::new(store.clone(), router, &config.switch));
        let planner = Arc::new(MigrationPlanner::new(
            store.clone(),
            executor.clone(),
            prober.clone(),
            alerts,
            PlannerSettings::from(&config.migration),
        ));
        Self {
            store,
            executor,
            planner,
            prober,
            builder,
            settings: ControllerSettings::from(config),
            gate: tokio::sync::Mutex::new(()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── deploy ─────────────────────────────────────────────────────

    /// Put `version` onto an idle environment and wait for it to be healthy.
    /// Never changes traffic.
    pub async fn deploy(&self, id: EnvironmentId, version: &str) -> ControllerResult<DeployReport> {
        let started = Instant::now();
        let result = async {
            let _gate = self.enter()?;
            self.ensure_no_running_plan()?;
            self.deploy_inner(id, version).await
        }
        .await;
        self.record(Operation::Deploy, None, Some(id), started, None, outcome_of(&result, |_| Outcome::Succeeded));
        result
    }

    async fn deploy_inner(&self, id: EnvironmentId, version: &str) -> ControllerResult<DeployReport> {
        if !validate_version(version) {
            return Err(ControllerError::Validation(format!("{version:?} is not a semantic version")));
        }
        if self.store.get_environment(id)?.is_none() {
            return Err(ControllerError::Validation(format!("unknown environment {id}")));
        }
        let weight = self
            .store
            .current_traffic()?
            .map(|t| t.weight_of(id))
            .unwrap_or(0);
        if weight > 0 {
            return Err(ControllerError::Validation(format!(
                "{id} receives {weight}% of traffic; deploy to an idle environment"
            )));
        }

        info!(environment = %id, version, "deploying");
        self.builder
            .build_and_start(id, version)
            .await
            .map_err(|e| ControllerError::operational(format!("deploy of {version} to {id} failed: {e}")))?;

        let verdict = wait_until_healthy(
            self.prober.as_ref(),
            id,
            self.settings.ready_timeout,
            self.settings.ready_poll,
        )
        .await;
        let healthy = verdict.healthy;
        self.store.record_verdict(&verdict)?;
        if healthy {
            self.store
                .update_environment(id, |env| env.version = version.to_string())?;
        }

        if !healthy {
            return Err(ControllerError::operational(format!(
                "{id} did not become healthy after deploying {version} (failing: {})",
                verdict.failing_checks().join(", ")
            )));
        }
        info!(environment = %id, version, "deploy complete");
        Ok(DeployReport {
            environment: id,
            version: version.to_string(),
            verdict,
        })
    }

    // ── migrations ─────────────────────────────────────────────────

    /// Deploy `version` to `target`, then migrate traffic in steps.
    pub async fn gradual_migrate(
        &self,
        target: EnvironmentId,
        version: &str,
        steps: Option<Vec<Percent>>,
    ) -> ControllerResult<MigrationOutcome> {
        self.migrate(MigrationRequest::stepped(target, Some(version.to_string()), steps))
            .await
    }

    /// Run a migration to completion.
    pub async fn migrate(&self, request: MigrationRequest) -> ControllerResult<MigrationOutcome> {
        let started = Instant::now();
        match self.prepare(&request).await {
            Ok(Prepared::Started(running, cancel)) => {
                let report = self.planner.run(running, cancel).await;
                self.finish(report, started)
            }
            Ok(Prepared::AlreadyServing) => {
                self.record_no_op(&request, started);
                Ok(MigrationOutcome {
                    outcome: Outcome::NoOp,
                    plan: None,
                })
            }
            Err(e) => {
                self.record_rejected(&request, started, &e);
                Err(e)
            }
        }
    }

    /// Start a migration and run it in the background.
    ///
    /// Returns the plan as started, or `None` if the target already
    /// receives all traffic.
    pub async fn start_migration(self: &Arc<Self>, request: MigrationRequest) -> ControllerResult<Option<MigrationPlan>> {
        let started = Instant::now();
        match self.prepare(&request).await {
            Ok(Prepared::Started(running, cancel)) => {
                let plan = running.plan.clone();
                let controller = self.clone();
                tokio::spawn(async move {
                    let report = controller.planner.run(running, cancel).await;
                    if let Err(e) = controller.finish(report, started) {
                        warn!(error = %e, "background migration did not succeed");
                    }
                });
                Ok(Some(plan))
            }
            Ok(Prepared::AlreadyServing) => {
                self.record_no_op(&request, started);
                Ok(None)
            }
            Err(e) => {
                self.record_rejected(&request, started, &e);
                Err(e)
            }
        }
    }

    async fn prepare(&self, request: &MigrationRequest) -> ControllerResult<Prepared> {
        let _gate = self.enter()?;
        self.ensure_no_running_plan()?;

        let target = request.target;
        if self.store.get_environment(target)?.is_none() {
            return Err(ControllerError::Validation(format!("unknown environment {target}")));
        }
        if self
            .store
            .current_traffic()?
            .is_some_and(|t| t.weight_of(target) == 100)
        {
            info!(%target, "target already receives all traffic");
            return Ok(Prepared::AlreadyServing);
        }

        let kind = if request.canary {
            MigrationKind::Canary {
                percent: request.canary_percent.unwrap_or(self.settings.canary_percent),
            }
        } else {
            MigrationKind::Stepped
        };
        let steps = request
            .steps
            .clone()
            .unwrap_or_else(|| self.settings.default_steps.clone());
        if kind == MigrationKind::Stepped {
            validate_steps(&steps).map_err(|e| ControllerError::Validation(e.to_string()))?;
        }

        if let Some(version) = &request.version {
            let deployed = Instant::now();
            let result = self.deploy_inner(target, version).await;
            self.record(
                Operation::Deploy,
                None,
                Some(target),
                deployed,
                None,
                outcome_of(&result, |_| Outcome::Succeeded),
            );
            result?;
        }

        match self.planner.start(PlanRequest {
            target,
            version: request.version.clone(),
            kind,
            steps,
        }) {
            Ok(running) => {
                let (tx, rx) = watch::channel(false);
                self.running
                    .lock()
                    .expect("running plans lock")
                    .insert(running.id().to_string(), tx);
                Ok(Prepared::Started(running, rx))
            }
            Err(PlanError::AlreadyServing(_)) => Ok(Prepared::AlreadyServing),
            Err(e) => Err(e.into()),
        }
    }

    fn finish(&self, report: PlanReport, started: Instant) -> ControllerResult<MigrationOutcome> {
        let PlanReport { plan, rollback } = report;
        self.running
            .lock()
            .expect("running plans lock")
            .remove(&plan.id);

        let reason = plan
            .failure
            .clone()
            .unwrap_or_else(|| format!("plan ended {:?}", plan.status));
        let (result, outcome) = match (plan.status, rollback) {
            (PlanStatus::Succeeded, _) => (
                Ok(MigrationOutcome {
                    outcome: Outcome::Succeeded,
                    plan: Some(plan.clone()),
                }),
                (Outcome::Succeeded, None),
            ),
            (PlanStatus::RolledBack, _) => {
                let revision = self
                    .store
                    .current_traffic()
                    .ok()
                    .flatten()
                    .map(|t| t.revision);
                (
                    Err(ControllerError::Operational {
                        reason: reason.clone(),
                        rollback: Some(RollbackOutcome::restored(revision)),
                    }),
                    (Outcome::RolledBack, Some(reason)),
                )
            }
            (_, Some(Err(e))) if e.is_fatal() => {
                let message = format!("plan {}: {reason}; {e}", plan.id);
                error!(plan = %plan.id, error = %e, "migration rollback failed");
                (
                    Err(ControllerError::Fatal(message.clone())),
                    (Outcome::Failed, Some(message)),
                )
            }
            (_, rollback) => {
                let detail = rollback
                    .and_then(|r| r.err())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no rollback attempted".to_string());
                (
                    Err(ControllerError::Operational {
                        reason: reason.clone(),
                        rollback: Some(RollbackOutcome::failed(detail.clone())),
                    }),
                    (Outcome::Failed, Some(format!("{reason}; {detail}"))),
                )
            }
        };

        self.record(
            Operation::GradualMigrate,
            Some(plan.source),
            Some(plan.target),
            started,
            Some(plan.id.clone()),
            outcome,
        );
        result
    }

    fn record_no_op(&self, request: &MigrationRequest, started: Instant) {
        self.record(
            Operation::GradualMigrate,
            None,
            Some(request.target),
            started,
            None,
            (Outcome::NoOp, Some(format!("{} already receives 100% of traffic", request.target))),
        );
    }

    fn record_rejected(&self, request: &MigrationRequest, started: Instant, e: &ControllerError) {
        let from = self.current_source(request.target);
        self.record(
            Operation::GradualMigrate,
            from,
            Some(request.target),
            started,
            None,
            failure_outcome(e),
        );
    }

    // ── direct switch ──────────────────────────────────────────────

    /// Health-check `target`, then send it all traffic in one apply.
    pub async fn direct_switch(&self, target: EnvironmentId) -> ControllerResult<SwitchOutcome> {
        let started = Instant::now();
        let from = self.current_source(target);
        let result = self.switch_to(target, from).await;
        self.record(
            Operation::DirectSwitch,
            from,
            Some(target),
            started,
            None,
            outcome_of(&result, |s| s.outcome),
        );
        result
    }

    async fn switch_to(&self, target: EnvironmentId, from: Option<EnvironmentId>) -> ControllerResult<SwitchOutcome> {
        let _gate = self.enter()?;
        self.ensure_no_running_plan()?;
        if self.store.get_environment(target)?.is_none() {
            return Err(ControllerError::Validation(format!("unknown environment {target}")));
        }

        let current = self.executor.current()?;
        if current.weight_of(target) == 100 {
            debug!(%target, revision = current.revision, "direct switch is a no-op");
            return Ok(SwitchOutcome {
                outcome: Outcome::NoOp,
                revision: current.revision,
                from: Some(target),
                to: target,
            });
        }

        let verdict = self.planner.probe_and_record(target).await;
        if !verdict.healthy {
            return Err(ControllerError::operational(format!(
                "{target} is unhealthy (failing: {}); traffic unchanged",
                verdict.failing_checks().join(", ")
            )));
        }

        let weights: Weights = [(target, 100)].into_iter().collect();
        let revision = self.executor.apply(weights).await?;
        for id in current.serving() {
            if id != target {
                self.planner.set_role(id, EnvironmentRole::Standby);
            }
        }
        self.planner.set_role(target, EnvironmentRole::Active);
        info!(%target, revision, "direct switch applied");
        Ok(SwitchOutcome {
            outcome: Outcome::Succeeded,
            revision,
            from,
            to: target,
        })
    }

    // ── rollback / abort ───────────────────────────────────────────

    /// Roll back a plan (the latest one if `plan_id` is None).
    ///
    /// A running plan is aborted; its own rollback path restores traffic.
    pub async fn rollback(&self, plan_id: Option<&str>) -> ControllerResult<RollbackReport> {
        let started = Instant::now();
        let plan = match self.find_plan(plan_id) {
            Ok(plan) => plan,
            Err(e) => {
                self.record(Operation::Rollback, None, None, started, plan_id.map(str::to_string), failure_outcome(&e));
                return Err(e);
            }
        };
        let (from, to, id) = (Some(plan.target), Some(plan.source), Some(plan.id.clone()));
        let result = self.rollback_plan(plan).await;
        self.record(
            Operation::Rollback,
            from,
            to,
            started,
            id,
            outcome_of(&result, |r| if r.aborted { Outcome::RolledBack } else { Outcome::Succeeded }),
        );
        result
    }

    async fn rollback_plan(&self, mut plan: MigrationPlan) -> ControllerResult<RollbackReport> {
        if plan.status == PlanStatus::Running {
            self.signal_abort(&plan)?;
            return Ok(RollbackReport {
                plan_id: plan.id,
                aborted: true,
                revision: None,
                status: PlanStatus::Running,
            });
        }

        let _gate = self.enter()?;
        self.ensure_no_running_plan()?;
        let revision = self.planner.rollback(&mut plan).await?;
        Ok(RollbackReport {
            plan_id: plan.id,
            aborted: false,
            revision: Some(revision),
            status: plan.status,
        })
    }

    /// Ask a running plan to stop; it rolls back at its next step boundary.
    pub fn abort(&self, plan_id: &str) -> ControllerResult<()> {
        let started = Instant::now();
        let result = self
            .store
            .get_plan(plan_id)
            .map_err(ControllerError::from)
            .and_then(|plan| plan.ok_or_else(|| ControllerError::NotFound(format!("plan {plan_id}"))))
            .and_then(|plan| self.signal_abort(&plan).map(|()| plan));
        let (from, to) = match &result {
            Ok(plan) => (Some(plan.source), Some(plan.target)),
            Err(_) => (None, None),
        };
        self.record(
            Operation::Abort,
            from,
            to,
            started,
            Some(plan_id.to_string()),
            outcome_of(&result, |_| Outcome::Succeeded),
        );
        result.map(|_| ())
    }

    fn signal_abort(&self, plan: &MigrationPlan) -> ControllerResult<()> {
        if plan.status != PlanStatus::Running {
            return Err(ControllerError::Validation(format!(
                "plan {} is {:?}, not running",
                plan.id, plan.status
            )));
        }
        let running = self.running.lock().expect("running plans lock");
        match running.get(&plan.id) {
            Some(tx) => {
                let _ = tx.send(true);
                warn!(plan = %plan.id, "abort requested");
                Ok(())
            }
            None => Err(ControllerError::Validation(format!(
                "plan {} is not running in this process",
                plan.id
            ))),
        }
    }

    /// True once an abort has been signalled to a plan running here.
    pub(crate) fn abort_pending(&self, plan_id: &str) -> bool {
        self.running
            .lock()
            .expect("running plans lock")
            .get(plan_id)
            .is_some_and(|tx| *tx.borrow())
    }

    fn find_plan(&self, plan_id: Option<&str>) -> ControllerResult<MigrationPlan> {
        match plan_id {
            Some(id) => self
                .store
                .get_plan(id)?
                .ok_or_else(|| ControllerError::NotFound(format!("plan {id}"))),
            None => self
                .store
                .latest_plan()?
                .ok_or_else(|| ControllerError::NotFound("no migration has been run".to_string())),
        }
    }

    // ── read side ──────────────────────────────────────────────────

    pub fn status(&self) -> ControllerResult<StatusSnapshot> {
        let plan = match self.store.running_plans()?.into_iter().next() {
            Some(plan) => Some(plan),
            None => self.store.latest_plan()?,
        };
        Ok(StatusSnapshot {
            traffic: self.store.current_traffic()?,
            plan,
            verdicts: self.store.list_verdicts()?,
            environments: self.store.list_environments()?,
        })
    }

    pub fn history(&self, limit: usize) -> ControllerResult<Vec<HistoryEntry>> {
        Ok(self.store.list_history(limit)?)
    }

    pub fn plan(&self, plan_id: &str) -> ControllerResult<MigrationPlan> {
        self.find_plan(Some(plan_id))
    }

    pub fn plans(&self) -> ControllerResult<Vec<MigrationPlan>> {
        Ok(self.store.list_plans()?)
    }

    // ── crash recovery ─────────────────────────────────────────────

    /// Roll back plans a previous process left Running.
    ///
    /// Returns the ids of plans restored to their baseline.
    pub async fn recover(&self) -> ControllerResult<Vec<PlanId>> {
        let mut recovered = Vec::new();
        for mut plan in self.store.running_plans()? {
            let local = self
                .running
                .lock()
                .expect("running plans lock")
                .contains_key(&plan.id);
            if local {
                continue;
            }

            let started = Instant::now();
            warn!(plan = %plan.id, "recovering interrupted migration");
            plan.fail("interrupted before completion", epoch_millis())
                .map_err(|e| ControllerError::Fatal(e.to_string()))?;
            self.store.put_plan(&plan)?;

            let result = self.planner.rollback(&mut plan).await.map_err(ControllerError::from);
            if let Err(e) = self.store.release_lease(PLAN_LOCK, &plan.id) {
                warn!(plan = %plan.id, error = %e, "could not release stale plan lock");
            }
            self.record(
                Operation::Recover,
                Some(plan.target),
                Some(plan.source),
                started,
                Some(plan.id.clone()),
                outcome_of(&result, |_| Outcome::RolledBack),
            );
            result?;
            info!(plan = %plan.id, "interrupted migration rolled back");
            recovered.push(plan.id);
        }
        Ok(recovered)
    }

    // ── helpers ────────────────────────────────────────────────────

    fn enter(&self) -> ControllerResult<tokio::sync::MutexGuard<'_, ()>> {
        self.gate.try_lock().map_err(|_| {
            ControllerError::Concurrency("another deployment operation is in progress".to_string())
        })
    }

    fn ensure_no_running_plan(&self) -> ControllerResult<()> {
        if let Some(lease) = self.store.get_lease(PLAN_LOCK)?
            && !lease.is_expired(epoch_millis())
        {
            return Err(ControllerError::Concurrency(format!(
                "migration {} is running",
                lease.holder
            )));
        }
        Ok(())
    }

    /// The environment traffic would move away from.
    fn current_source(&self, target: EnvironmentId) -> Option<EnvironmentId> {
        self.store
            .current_traffic()
            .ok()
            .flatten()
            .and_then(|t| t.heaviest_except(Some(target)))
    }

    pub(crate) fn planner(&self) -> &MigrationPlanner {
        &self.planner
    }

    pub(crate) fn record(
        &self,
        operation: Operation,
        from: Option<EnvironmentId>,
        to: Option<EnvironmentId>,
        started: Instant,
        plan_id: Option<PlanId>,
        (outcome, detail): (Outcome, Option<String>),
    ) {
        let entry = HistoryEntry {
            sequence: 0,
            timestamp: epoch_millis(),
            operation,
            from_environment: from,
            to_environment: to,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
            plan_id,
            detail,
        };
        match self.store.append_history(entry) {
            Ok(entry) => debug!(sequence = entry.sequence, ?operation, ?outcome, "history recorded"),
            Err(e) => error!(?operation, error = %e, "failed to append deployment history"),
        }
    }
}

fn outcome_of<T>(result: &ControllerResult<T>, ok: impl FnOnce(&T) -> Outcome) -> (Outcome, Option<String>) {
    match result {
        Ok(value) => (ok(value), None),
        Err(e) => failure_outcome(e),
    }
}

fn failure_outcome(e: &ControllerError) -> (Outcome, Option<String>) {
    let outcome = match e {
        ControllerError::Validation(_) | ControllerError::NotFound(_) | ControllerError::Concurrency(_) => {
            Outcome::Rejected
        }
        ControllerError::Operational {
            rollback: Some(RollbackOutcome { restored: true, .. }),
            ..
        } => Outcome::RolledBack,
        _ => Outcome::Failed,
    };
    (outcome, Some(e.to_string()))
}
