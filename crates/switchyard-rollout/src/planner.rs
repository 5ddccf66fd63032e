//! Migration planner: drives a plan through its steps.
//!
//! A plan moves traffic from its source to its target in ascending
//! percentages. Each step applies the new split, lets connections settle,
//! then probes the target (and the source while it still serves). A
//! failed switch, a failed probe, a lost plan lock, or an operator abort
//! fails the plan and triggers a single-step rollback to the baseline
//! captured at start.
//!
//! Only one plan runs at a time system-wide. The lock is a lease row in
//! the state store, renewed at every step boundary and released when the
//! plan reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use switchyard_alert::AlertFanout;
use switchyard_core::config::MigrationSettings;
use switchyard_core::{epoch_millis, validate_steps, EnvironmentId, Percent};
use switchyard_health::Prober;
use switchyard_state::{
    AlertEvent, AlertKind, EnvironmentRole, HealthVerdict, LeaseOutcome, MigrationKind,
    MigrationPlan, PlanStatus, Severity, StateStore, StepResult, TrafficMode, Weights,
};

use crate::error::{PlanError, RollbackError};
use crate::executor::TrafficSwitchExecutor;

/// Name of the global plan lock.
pub const PLAN_LOCK: &str = "migration";

#[derive(Debug, Clone)]
pub struct PlannerSettings {
    pub settle: Duration,
    pub check_source: bool,
    pub lock_ttl: Duration,
}

impl From<&MigrationSettings> for PlannerSettings {
    fn from(s: &MigrationSettings) -> Self {
        Self {
            settle: Duration::from_secs(s.settle_secs),
            check_source: s.check_source,
            lock_ttl: Duration::from_secs(s.lock_ttl_secs),
        }
    }
}

/// What to migrate.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub target: EnvironmentId,
    pub version: Option<String>,
    pub kind: MigrationKind,
    /// Ignored for canary plans.
    pub steps: Vec<Percent>,
}

/// Holds the global plan lock; releases it on drop.
pub struct PlanLock {
    store: StateStore,
    holder: String,
}

impl PlanLock {
    /// Extend the lease. False means another holder took it over.
    fn renew(&self, ttl: Duration) -> bool {
        match self
            .store
            .renew_lease(PLAN_LOCK, &self.holder, epoch_millis(), ttl.as_millis() as u64)
        {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(plan = %self.holder, error = %e, "plan lock renewal failed");
                false
            }
        }
    }
}

impl Drop for PlanLock {
    fn drop(&mut self) {
        match self.store.release_lease(PLAN_LOCK, &self.holder) {
            Ok(true) => debug!(plan = %self.holder, "plan lock released"),
            Ok(false) => {}
            Err(e) => warn!(plan = %self.holder, error = %e, "plan lock release failed"),
        }
    }
}

/// A started plan and the lock it holds.
pub struct RunningPlan {
    pub plan: MigrationPlan,
    lock: PlanLock,
}

impl std::fmt::Debug for RunningPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningPlan")
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

/// Terminal result of running a plan.
#[derive(Debug)]
pub struct PlanReport {
    pub plan: MigrationPlan,
    /// Present when the plan failed and a rollback was attempted.
    pub rollback: Option<Result<(), RollbackError>>,
}

pub struct MigrationPlanner {
    pub(crate) store: StateStore,
    pub(crate) executor: Arc<TrafficSwitchExecutor>,
    pub(crate) prober: Arc<dyn Prober>,
    pub(crate) alerts: Arc<AlertFanout>,
    settings: PlannerSettings,
}

impl MigrationPlanner {
    pub fn new(
        store: StateStore,
        executor: Arc<TrafficSwitchExecutor>,
        prober: Arc<dyn Prober>,
        alerts: Arc<AlertFanout>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            store,
            executor,
            prober,
            alerts,
            settings,
        }
    }

    /// Validate a request, take the plan lock, and move a new plan to Running.
    pub fn start(&self, request: PlanRequest) -> Result<RunningPlan, PlanError> {
        let steps = match request.kind {
            MigrationKind::Stepped => {
                validate_steps(&request.steps).map_err(|e| PlanError::Validation(e.to_string()))?;
                request.steps.clone()
            }
            MigrationKind::Canary { percent } => {
                if percent == 0 || percent >= 100 {
                    return Err(PlanError::Validation(format!(
                        "canary share {percent} is outside 1..=99"
                    )));
                }
                vec![percent, 100]
            }
        };

        if self.store.get_environment(request.target)?.is_none() {
            return Err(PlanError::Validation(format!(
                "unknown target environment {}",
                request.target
            )));
        }

        let baseline = self
            .store
            .current_traffic()?
            .ok_or_else(|| PlanError::Validation("no traffic state has been initialized".to_string()))?;
        if baseline.weight_of(request.target) == 100 {
            return Err(PlanError::AlreadyServing(request.target));
        }
        let Some(source) = baseline.heaviest_except(Some(request.target)) else {
            return Err(PlanError::Validation("no source environment is serving traffic".to_string()));
        };
        if let Some(other) = baseline
            .serving()
            .into_iter()
            .find(|id| *id != source && *id != request.target)
        {
            return Err(PlanError::Validation(format!(
                "{other} also receives traffic; a migration moves traffic between two environments"
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = epoch_millis();
        match self.store.try_acquire_lease(
            PLAN_LOCK,
            &id,
            now,
            self.settings.lock_ttl.as_millis() as u64,
        )? {
            LeaseOutcome::Acquired(_) => {}
            LeaseOutcome::Busy(lease) => {
                debug!(holder = %lease.holder, "plan lock busy");
                return Err(PlanError::Concurrency {
                    holder: lease.holder,
                });
            }
        }
        let lock = PlanLock {
            store: self.store.clone(),
            holder: id.clone(),
        };

        let mut plan = MigrationPlan::new(id, source, request.target, request.kind, steps, now);
        plan.version = request.version;
        plan.begin(baseline, now)?;
        self.store.put_plan(&plan)?;
        self.set_role(source, EnvironmentRole::Draining);

        info!(
            plan = %plan.id,
            source = %source,
            target = %plan.target,
            steps = ?plan.steps,
            "migration started"
        );
        Ok(RunningPlan { plan, lock })
    }

    /// Run a started plan to a terminal state.
    ///
    /// `cancel` flipping to true aborts at the next step boundary (or
    /// during the settle pause).
    pub async fn run(&self, running: RunningPlan, mut cancel: watch::Receiver<bool>) -> PlanReport {
        let RunningPlan { mut plan, lock } = running;

        while let Some(percentage) = plan.next_step() {
            if *cancel.borrow() {
                return self.fail_and_roll_back(plan, "aborted by operator".to_string(), lock).await;
            }

            let step_started = Instant::now();
            let mut result = StepResult {
                percentage,
                health_verdict: None,
                timestamp: epoch_millis(),
                duration_ms: 0,
                error: None,
                switch_skipped: false,
            };

            let (weights, mode) = step_weights(&plan, percentage);
            let unchanged = self
                .store
                .current_traffic()
                .ok()
                .flatten()
                .is_some_and(|current| current.same_routing(&weights) && current.mode == mode);

            if unchanged {
                debug!(plan = %plan.id, percentage, "step weights already applied");
                result.switch_skipped = true;
            } else if let Err(e) = self.executor.apply_with(weights, Some(mode), true).await {
                result.error = Some(format!("traffic switch failed: {e}"));
                result.duration_ms = step_started.elapsed().as_millis() as u64;
                let reason = format!("step {percentage}%: {e}");
                self.record(&mut plan, result, false);
                return self.fail_and_roll_back(plan, reason, lock).await;
            }

            if self.settle(&mut cancel).await {
                result.error = Some("aborted during settle".to_string());
                result.duration_ms = step_started.elapsed().as_millis() as u64;
                self.record(&mut plan, result, false);
                return self.fail_and_roll_back(plan, "aborted by operator".to_string(), lock).await;
            }

            let target_verdict = self.probe_and_record(plan.target).await;
            let mut failure = None;
            if !target_verdict.healthy {
                failure = Some(format!(
                    "target {} unhealthy at {percentage}% (failing: {})",
                    plan.target,
                    target_verdict.failing_checks().join(", ")
                ));
            } else if self.settings.check_source && percentage < 100 {
                let source_verdict = self.probe_and_record(plan.source).await;
                if !source_verdict.healthy {
                    failure = Some(format!(
                        "source {} regressed at {percentage}% (failing: {})",
                        plan.source,
                        source_verdict.failing_checks().join(", ")
                    ));
                }
            }

            result.health_verdict = Some(target_verdict);
            result.error = failure.clone();
            result.duration_ms = step_started.elapsed().as_millis() as u64;
            let passed = failure.is_none();
            self.record(&mut plan, result, passed);

            if let Some(reason) = failure {
                return self.fail_and_roll_back(plan, reason, lock).await;
            }
            if !lock.renew(self.settings.lock_ttl) {
                return self.fail_and_roll_back(plan, "plan lock lost".to_string(), lock).await;
            }
            debug!(plan = %plan.id, percentage, "step passed");
        }

        if let Err(e) = plan.succeed(epoch_millis()) {
            error!(plan = %plan.id, error = %e, "could not mark plan succeeded");
        }
        self.persist(&plan);
        self.set_role(plan.target, EnvironmentRole::Active);
        self.set_role(plan.source, EnvironmentRole::Standby);
        info!(plan = %plan.id, target = %plan.target, "migration succeeded");
        drop(lock);
        PlanReport {
            plan,
            rollback: None,
        }
    }

    /// Sleep for the settle interval. Returns true if aborted meanwhile.
    async fn settle(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        let sleep = tokio::time::sleep(self.settings.settle);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = cancel.changed() => {
                    if changed.is_err() {
                        // Nobody can abort any more; finish the pause.
                        (&mut sleep).await;
                        return false;
                    }
                    if *cancel.borrow() {
                        return true;
                    }
                }
            }
        }
    }

    async fn fail_and_roll_back(&self, mut plan: MigrationPlan, reason: String, lock: PlanLock) -> PlanReport {
        warn!(plan = %plan.id, %reason, "migration failed, rolling back");
        if let Err(e) = plan.fail(reason.clone(), epoch_millis()) {
            error!(plan = %plan.id, error = %e, "could not mark plan failed");
        }
        self.persist(&plan);

        let mut event = AlertEvent::new(
            AlertKind::MigrationFailed,
            Severity::Warning,
            Some(plan.target),
            format!("migration {} to {} failed: {reason}", plan.id, plan.target),
            epoch_millis(),
        );
        event.cooldown_key = format!("{}:{}", AlertKind::MigrationFailed.as_str(), plan.id);
        self.alerts.publish(event);

        let rollback = self.roll_back_failed(&mut plan).await;
        drop(lock);
        PlanReport {
            plan,
            rollback: Some(rollback),
        }
    }

    fn record(&self, plan: &mut MigrationPlan, result: StepResult, advance: bool) {
        if let Err(e) = plan.record_step(result, advance) {
            error!(plan = %plan.id, error = %e, "could not record step");
        }
        self.persist(plan);
    }

    pub(crate) fn persist(&self, plan: &MigrationPlan) {
        if let Err(e) = self.store.put_plan(plan) {
            error!(plan = %plan.id, error = %e, "failed to persist plan");
        }
    }

    /// Probe an environment and record the verdict and its health.
    pub async fn probe_and_record(&self, id: EnvironmentId) -> HealthVerdict {
        let verdict = self.prober.probe(id, &[]).await;
        if let Err(e) = self.store.record_verdict(&verdict) {
            warn!(environment = %id, error = %e, "failed to record verdict");
        }
        verdict
    }

    pub fn set_role(&self, id: EnvironmentId, role: EnvironmentRole) {
        let now = epoch_millis();
        if let Err(e) = self.store.update_environment(id, |env| {
            env.role = role;
            env.updated_at = now;
        }) {
            warn!(environment = %id, ?role, error = %e, "failed to update role");
        }
    }
}

/// Weights and mode for one step: `target:P, source:100-P`, every other
/// baseline environment at zero.
pub fn step_weights(plan: &MigrationPlan, percentage: Percent) -> (Weights, TrafficMode) {
    let mut weights: Weights = plan
        .baseline
        .as_ref()
        .map(|b| b.weights.keys().map(|id| (*id, 0)).collect())
        .unwrap_or_default();
    weights.insert(plan.target, percentage);
    weights.insert(plan.source, 100 - percentage);

    let mode = match plan.kind {
        MigrationKind::Canary { .. } if percentage < 100 => TrafficMode::Canary,
        _ => TrafficMode::derive(&weights),
    };
    (weights, mode)
}

impl RunningPlan {
    pub fn id(&self) -> &str {
        &self.plan.id
    }

    pub fn status(&self) -> PlanStatus {
        self.plan.status
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::executor::tests::{seeded_store, test_settings, weights};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;
    use switchyard_alert::ChannelSink;
    use switchyard_core::EnvironmentId::{Primary, Secondary};
    use switchyard_health::CheckKind;
    use switchyard_router::{EdgeRouter, WeightedRouter};
    use switchyard_state::CheckOutcome;
    use tokio::sync::mpsc;

    /// Prober answering from a per-environment script, then a fixed status.
    #[derive(Default)]
    pub(crate) struct ScriptedProber {
        healthy: StdMutex<HashMap<EnvironmentId, bool>>,
        script: StdMutex<HashMap<EnvironmentId, VecDeque<bool>>>,
    }

    impl ScriptedProber {
        pub(crate) fn set_healthy(&self, id: EnvironmentId, healthy: bool) {
            self.healthy.lock().unwrap().insert(id, healthy);
        }

        /// Queue results returned before falling back to the fixed status.
        pub(crate) fn script(&self, id: EnvironmentId, results: &[bool]) {
            self.script
                .lock()
                .unwrap()
                .entry(id)
                .or_default()
                .extend(results.iter().copied());
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, id: EnvironmentId, _checks: &[CheckKind]) -> HealthVerdict {
            let scripted = self.script.lock().unwrap().get_mut(&id).and_then(|q| q.pop_front());
            let ok = scripted
                .unwrap_or_else(|| self.healthy.lock().unwrap().get(&id).copied().unwrap_or(true));
            let mut checks = BTreeMap::new();
            checks.insert(
                "deep".to_string(),
                CheckOutcome {
                    ok,
                    latency_ms: 3,
                    status_code: Some(if ok { 200 } else { 503 }),
                    detail: None,
                },
            );
            HealthVerdict::from_checks(id, checks, epoch_millis())
        }
    }

    pub(crate) struct Harness {
        pub store: StateStore,
        pub router: Arc<WeightedRouter>,
        pub prober: Arc<ScriptedProber>,
        pub planner: MigrationPlanner,
        pub alert_rx: tokio::sync::Mutex<mpsc::Receiver<AlertEvent>>,
        pub cancel_tx: watch::Sender<bool>,
    }

    impl Harness {
        pub(crate) fn cancel(&self) -> watch::Receiver<bool> {
            self.cancel_tx.subscribe()
        }

        /// Wait briefly for a delivered alert of `kind`.
        pub(crate) async fn next_alert(&self, kind: AlertKind) -> Option<AlertEvent> {
            let mut rx = self.alert_rx.lock().await;
            loop {
                match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                    Ok(Some(event)) if event.kind == kind => return Some(event),
                    Ok(Some(_)) => continue,
                    _ => return None,
                }
            }
        }
    }

    pub(crate) async fn harness() -> Harness {
        let store = seeded_store();
        let router = Arc::new(WeightedRouter::new());
        router
            .reload(&store.current_traffic().unwrap().unwrap())
            .await
            .unwrap();
        let executor = Arc::new(TrafficSwitchExecutor::new(
            store.clone(),
            router.clone(),
            &test_settings(),
        ));
        let prober = Arc::new(ScriptedProber::default());
        let (tx, rx) = mpsc::channel(64);
        let alerts = Arc::new(
            AlertFanout::new(Duration::from_secs(300)).with_sink(Arc::new(ChannelSink::new(tx))),
        );
        let planner = MigrationPlanner::new(
            store.clone(),
            executor,
            prober.clone(),
            alerts,
            PlannerSettings {
                settle: Duration::ZERO,
                check_source: true,
                lock_ttl: Duration::from_secs(600),
            },
        );
        let (cancel_tx, _) = watch::channel(false);
        Harness {
            store,
            router,
            prober,
            planner,
            alert_rx: tokio::sync::Mutex::new(rx),
            cancel_tx,
        }
    }

    pub(crate) fn request(target: EnvironmentId, steps: Vec<Percent>) -> PlanRequest {
        PlanRequest {
            target,
            version: Some("2.0.0".to_string()),
            kind: MigrationKind::Stepped,
            steps,
        }
    }

    #[tokio::test]
    async fn all_healthy_steps_succeed() {
        let h = harness().await;
        let running = h.planner.start(request(Secondary, vec![25, 50, 75, 100])).unwrap();
        assert_eq!(running.status(), PlanStatus::Running);
        let source = h.store.get_environment(Primary).unwrap().unwrap();
        assert_eq!(source.role, EnvironmentRole::Draining);

        let report = h.planner.run(running, h.cancel()).await;

        assert_eq!(report.plan.status, PlanStatus::Succeeded);
        assert!(report.rollback.is_none());
        assert_eq!(report.plan.history.len(), 4);
        assert!(report.plan.history.iter().all(|s| s.passed()));

        let traffic = h.store.current_traffic().unwrap().unwrap();
        assert_eq!(traffic.weights, weights(&[(Primary, 0), (Secondary, 100)]));
        assert_eq!(h.router.adopted().unwrap(), traffic);

        let target = h.store.get_environment(Secondary).unwrap().unwrap();
        assert_eq!(target.role, EnvironmentRole::Active);
        assert_eq!(
            h.store.get_environment(Primary).unwrap().unwrap().role,
            EnvironmentRole::Standby
        );
        assert!(h.store.get_lease(PLAN_LOCK).unwrap().is_none());
        assert_eq!(h.store.get_plan(&report.plan.id).unwrap().unwrap(), report.plan);
    }

    #[tokio::test]
    async fn unhealthy_step_rolls_back_to_baseline() {
        let h = harness().await;
        let before = h.store.current_traffic().unwrap().unwrap();
        // Healthy at 25%, unhealthy at 50%.
        h.prober.script(Secondary, &[true, false]);

        let running = h.planner.start(request(Secondary, vec![25, 50, 75, 100])).unwrap();
        let report = h.planner.run(running, h.cancel()).await;

        assert_eq!(report.plan.status, PlanStatus::RolledBack);
        assert!(matches!(report.rollback, Some(Ok(()))));
        let percentages: Vec<Percent> = report.plan.history.iter().map(|s| s.percentage).collect();
        assert_eq!(percentages, vec![25, 50]);
        assert!(report.plan.history[0].passed());
        assert!(!report.plan.history[1].passed());

        let after = h.store.current_traffic().unwrap().unwrap();
        assert_eq!(after.weights, before.weights);
        assert!(after.revision > before.revision);
        assert_eq!(
            h.store.get_environment(Primary).unwrap().unwrap().role,
            EnvironmentRole::Active
        );
        assert!(h.next_alert(AlertKind::MigrationFailed).await.is_some());
    }

    #[tokio::test]
    async fn source_regression_fails_the_step() {
        let h = harness().await;
        h.prober.script(Primary, &[false]);

        let running = h.planner.start(request(Secondary, vec![50, 100])).unwrap();
        let report = h.planner.run(running, h.cancel()).await;

        assert_eq!(report.plan.status, PlanStatus::RolledBack);
        assert!(report.plan.failure.unwrap().contains("source primary regressed"));
    }

    #[tokio::test]
    async fn second_plan_is_rejected_while_one_runs() {
        let h = harness().await;
        let first = h.planner.start(request(Secondary, vec![100])).unwrap();

        let err = h.planner.start(request(Secondary, vec![50, 100])).unwrap_err();
        assert!(matches!(err, PlanError::Concurrency { ref holder } if holder == first.id()));

        let report = h.planner.run(first, h.cancel()).await;
        assert_eq!(report.plan.status, PlanStatus::Succeeded);
    }

    #[tokio::test]
    async fn target_already_serving_everything() {
        let h = harness().await;
        let err = h.planner.start(request(Primary, vec![100])).unwrap_err();
        assert!(matches!(err, PlanError::AlreadyServing(Primary)));
        assert!(h.store.list_plans().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_requests_are_rejected_without_side_effects() {
        let h = harness().await;
        for steps in [vec![], vec![50, 25, 100], vec![25, 50]] {
            let err = h.planner.start(request(Secondary, steps)).unwrap_err();
            assert!(matches!(err, PlanError::Validation(_)));
        }
        let err = h.planner.start(request(EnvironmentId::Canary, vec![100])).unwrap_err();
        assert!(matches!(err, PlanError::Validation(_)));
        assert!(h.store.get_lease(PLAN_LOCK).unwrap().is_none());
    }

    #[tokio::test]
    async fn canary_holds_split_then_promotes() {
        let h = harness().await;
        let running = h
            .planner
            .start(PlanRequest {
                target: Secondary,
                version: None,
                kind: MigrationKind::Canary { percent: 10 },
                steps: Vec::new(),
            })
            .unwrap();
        assert_eq!(running.plan.steps, vec![10, 100]);

        let report = h.planner.run(running, h.cancel()).await;
        assert_eq!(report.plan.status, PlanStatus::Succeeded);

        let canary = h.store.traffic_revision(2).unwrap().unwrap();
        assert_eq!(canary.mode, TrafficMode::Canary);
        assert_eq!(canary.weight_of(Secondary), 10);
        let final_state = h.store.current_traffic().unwrap().unwrap();
        assert_eq!(final_state.mode, TrafficMode::Single);
    }

    #[tokio::test]
    async fn step_matching_current_weights_skips_the_switch() {
        let h = harness().await;
        h.planner
            .executor
            .apply(weights(&[(Primary, 75), (Secondary, 25)]))
            .await
            .unwrap();
        let revisions_before = h.store.list_traffic_revisions(100).unwrap().len();

        let running = h.planner.start(request(Secondary, vec![25, 100])).unwrap();
        let report = h.planner.run(running, h.cancel()).await;

        assert_eq!(report.plan.status, PlanStatus::Succeeded);
        assert!(report.plan.history[0].switch_skipped);
        assert!(!report.plan.history[1].switch_skipped);
        // Only the 100% step wrote a revision.
        assert_eq!(h.store.list_traffic_revisions(100).unwrap().len(), revisions_before + 1);
    }

    #[tokio::test]
    async fn abort_before_first_step_rolls_back() {
        let h = harness().await;
        let running = h.planner.start(request(Secondary, vec![25, 50, 100])).unwrap();
        let cancel = h.cancel();
        h.cancel_tx.send(true).unwrap();

        let report = h.planner.run(running, cancel).await;
        assert_eq!(report.plan.status, PlanStatus::RolledBack);
        assert!(report.plan.history.is_empty());
        assert_eq!(report.plan.failure.as_deref(), Some("aborted by operator"));
        assert!(h.store.get_lease(PLAN_LOCK).unwrap().is_none());
    }

    #[tokio::test]
    async fn lost_plan_lock_rolls_back_after_the_step() {
        let h = harness().await;
        let before = h.store.current_traffic().unwrap().unwrap();
        let running = h.planner.start(request(Secondary, vec![25, 50, 100])).unwrap();

        // Another controller takes the lease over once it looks expired.
        let lease = h.store.get_lease(PLAN_LOCK).unwrap().unwrap();
        let taken = h
            .store
            .try_acquire_lease(PLAN_LOCK, "other-controller", lease.expires_at + 1, 600_000)
            .unwrap();
        assert!(matches!(taken, LeaseOutcome::Acquired(_)));

        let report = h.planner.run(running, h.cancel()).await;

        assert_eq!(report.plan.status, PlanStatus::RolledBack);
        assert_eq!(report.plan.failure.as_deref(), Some("plan lock lost"));
        assert!(matches!(report.rollback, Some(Ok(()))));
        // The step itself passed; the renewal after it did not.
        assert_eq!(report.plan.history.len(), 1);
        assert!(report.plan.history[0].passed());

        let after = h.store.current_traffic().unwrap().unwrap();
        assert_eq!(after.weights, before.weights);
        assert_eq!(h.router.adopted().unwrap().weights, before.weights);
        // Dropping our lock leaves the new holder's lease alone.
        assert_eq!(h.store.get_lease(PLAN_LOCK).unwrap().unwrap().holder, "other-controller");
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_settle_is_observed() {
        let mut h = harness().await;
        h.planner.settings.settle = Duration::from_secs(30);
        let running = h.planner.start(request(Secondary, vec![50, 100])).unwrap();
        let cancel = h.cancel();
        let abort = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            h.cancel_tx.send(true).unwrap();
        };

        let (report, ()) = tokio::join!(h.planner.run(running, cancel), abort);
        assert_eq!(report.plan.status, PlanStatus::RolledBack);
        assert_eq!(report.plan.history.len(), 1);
        assert_eq!(report.plan.history[0].error.as_deref(), Some("aborted during settle"));
        let traffic = h.store.current_traffic().unwrap().unwrap();
        assert_eq!(traffic.weight_of(Primary), 100);
    }

    #[test]
    fn step_weights_zero_out_bystanders() {
        let mut plan = MigrationPlan::new(
            "p".to_string(),
            Primary,
            Secondary,
            MigrationKind::Stepped,
            vec![40, 100],
            0,
        );
        plan.baseline = Some(switchyard_state::TrafficState {
            weights: weights(&[(Primary, 100), (Secondary, 0), (EnvironmentId::Canary, 0)]),
            mode: TrafficMode::Single,
            revision: 1,
            last_updated: 0,
        });
        let (w, mode) = step_weights(&plan, 40);
        assert_eq!(
            w,
            weights(&[(Primary, 60), (Secondary, 40), (EnvironmentId::Canary, 0)])
        );
        assert_eq!(mode, TrafficMode::Dual);
    }
}
