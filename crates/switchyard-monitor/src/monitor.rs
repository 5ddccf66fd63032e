//! Continuous monitor loop.
//!
//! Each tick probes every registered environment, samples the outcome
//! window, tracks availability over the trailing window, and publishes an
//! alert per breached threshold. A Critical alert that gets past the
//! cooldown and concerns the target of a running plan produces a
//! `RollbackAdvice` for that plan, at most once per cooldown window.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use switchyard_alert::AlertFanout;
use switchyard_core::config::MonitorSettings;
use switchyard_core::{epoch_millis, EnvironmentId};
use switchyard_health::Prober;
use switchyard_metrics::{OutcomeWindow, WindowMetrics};
use switchyard_state::{AlertEvent, HealthVerdict, PlanId, Severity, StateStore, TrafficState};

use crate::thresholds::{evaluate, Thresholds};

/// Suggestion to roll back a running plan. The receiver decides.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackAdvice {
    pub plan_id: PlanId,
    pub reason: String,
}

/// What one tick saw and did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub evaluated_at: u64,
    pub verdicts: Vec<HealthVerdict>,
    pub window: BTreeMap<EnvironmentId, WindowMetrics>,
    /// None until a traffic state exists.
    pub availability: Option<f64>,
    /// Alerts published this tick (cooldown-suppressed ones excluded).
    pub alerts: Vec<AlertEvent>,
    pub advice: Option<RollbackAdvice>,
}

#[derive(Default)]
struct MonitorState {
    /// (tick time ms, every serving environment healthy).
    ticks: VecDeque<(u64, bool)>,
    /// Plan → time (ms) it was last advised.
    advised: HashMap<PlanId, u64>,
}

pub struct ContinuousMonitor {
    store: StateStore,
    prober: Arc<dyn Prober>,
    outcomes: Arc<OutcomeWindow>,
    alerts: Arc<AlertFanout>,
    thresholds: Thresholds,
    interval: Duration,
    window: Duration,
    advice_cooldown_ms: u64,
    advice_tx: Option<mpsc::Sender<RollbackAdvice>>,
    state: Mutex<MonitorState>,
}

impl ContinuousMonitor {
    pub fn new(
        store: StateStore,
        prober: Arc<dyn Prober>,
        outcomes: Arc<OutcomeWindow>,
        alerts: Arc<AlertFanout>,
        settings: &MonitorSettings,
    ) -> Self {
        Self {
            store,
            prober,
            outcomes,
            alerts,
            thresholds: Thresholds::from(settings),
            interval: Duration::from_secs(settings.interval_secs),
            window: Duration::from_secs(settings.window_secs),
            advice_cooldown_ms: settings.cooldown_secs.saturating_mul(1_000),
            advice_tx: None,
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Send rollback advice to `tx`. Without it the monitor only alerts.
    pub fn with_advice(mut self, tx: mpsc::Sender<RollbackAdvice>) -> Self {
        self.advice_tx = Some(tx);
        self
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(epoch_millis()).await
    }

    /// Run one tick as of `now` (Unix ms).
    pub async fn tick_at(&self, now: u64) -> TickReport {
        let traffic = self.store.current_traffic().unwrap_or_else(|e| {
            warn!(error = %e, "monitor could not read traffic state");
            None
        });
        let ids = self.store.environment_ids().unwrap_or_else(|e| {
            warn!(error = %e, "monitor could not list environments");
            Vec::new()
        });

        let mut verdicts = Vec::with_capacity(ids.len());
        for id in ids {
            let verdict = self.prober.probe(id, &[]).await;
            self.record_verdict(&verdict);
            verdicts.push(verdict);
        }

        let availability = traffic
            .as_ref()
            .map(|t| self.record_availability(now, t, &verdicts));
        let window = self.outcomes.snapshot_at(now, self.window);
        let breaches = evaluate(
            &self.thresholds,
            traffic.as_ref(),
            &verdicts,
            &window,
            availability,
        );

        let mut alerts = Vec::new();
        let mut advice = None;
        for breach in breaches {
            let event = AlertEvent::new(
                breach.kind,
                breach.severity,
                breach.environment,
                breach.message,
                now,
            );
            if !self.alerts.publish(event.clone()) {
                continue;
            }
            if event.severity == Severity::Critical && advice.is_none() {
                advice = self.advise(&event, now);
            }
            alerts.push(event);
        }

        debug!(
            environments = verdicts.len(),
            availability = ?availability,
            alerts = alerts.len(),
            "monitor tick"
        );
        TickReport {
            evaluated_at: now,
            verdicts,
            window,
            availability,
            alerts,
            advice,
        }
    }

    /// Tick every interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            window_secs = self.window.as_secs(),
            "continuous monitor started"
        );
        // First tick fires immediately so the serving environment is
        // confirmed Active without waiting a full interval.
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("continuous monitor shutting down");
                    break;
                }
            }
        }
    }

    fn record_verdict(&self, verdict: &HealthVerdict) {
        if let Err(e) = self.store.record_verdict(verdict) {
            warn!(environment = %verdict.environment_id, error = %e, "failed to record verdict");
        }
    }

    /// Share of ticks in the window where every serving environment was healthy.
    fn record_availability(&self, now: u64, traffic: &TrafficState, verdicts: &[HealthVerdict]) -> f64 {
        let up = traffic.serving().iter().all(|id| {
            verdicts
                .iter()
                .any(|v| v.environment_id == *id && v.healthy)
        });

        let mut state = self.state.lock().expect("monitor state lock");
        state.ticks.push_back((now, up));
        let since = now.saturating_sub(self.window.as_millis() as u64);
        while state.ticks.front().is_some_and(|(at, _)| *at <= since) {
            state.ticks.pop_front();
        }
        let healthy = state.ticks.iter().filter(|(_, up)| *up).count();
        healthy as f64 * 100.0 / state.ticks.len() as f64
    }

    /// Advise a rollback for the running plan `event` concerns.
    ///
    /// The controller may decline advice it cannot confirm, so a plan that
    /// is still running is advised again once the cooldown has passed.
    fn advise(&self, event: &AlertEvent, now: u64) -> Option<RollbackAdvice> {
        let tx = self.advice_tx.as_ref()?;
        let running = match self.store.running_plans() {
            Ok(plans) => plans,
            Err(e) => {
                warn!(error = %e, "monitor could not list running plans");
                return None;
            }
        };
        let plan = running
            .iter()
            .find(|p| event.environment_id.is_none_or(|id| id == p.target))?;

        {
            let mut state = self.state.lock().expect("monitor state lock");
            state
                .advised
                .retain(|id, _| running.iter().any(|p| &p.id == id));
            if let Some(last) = state.advised.get(&plan.id)
                && now < last.saturating_add(self.advice_cooldown_ms)
            {
                debug!(plan = %plan.id, "rollback advised recently");
                return None;
            }
            state.advised.insert(plan.id.clone(), now);
        }

        let advice = RollbackAdvice {
            plan_id: plan.id.clone(),
            reason: event.message.clone(),
        };
        match tx.try_send(advice.clone()) {
            Ok(()) => {
                warn!(plan = %advice.plan_id, reason = %advice.reason, "advising rollback");
                Some(advice)
            }
            Err(e) => {
                warn!(plan = %advice.plan_id, error = %e, "rollback advice dropped");
                self.state
                    .lock()
                    .expect("monitor state lock")
                    .advised
                    .remove(&advice.plan_id);
                None
            }
        }
    }
}
