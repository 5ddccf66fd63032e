//! Shared fixtures: scripted prober and builder around the real in-process router.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use switchyard_alert::{AlertFanout, ChannelSink};
use switchyard_controller::{
    bootstrap, BuildCollaborator, Collaborators, DeployError, DeploymentController,
};
use switchyard_core::config::EnvironmentConfig;
use switchyard_core::{epoch_millis, BackoffPolicy, EnvironmentId, SwitchyardConfig};
use switchyard_health::{CheckKind, Prober};
use switchyard_router::{EdgeRouter, WeightedRouter};
use switchyard_state::{AlertEvent, AlertKind, CheckOutcome, HealthVerdict, StateStore};

/// Healthy unless told otherwise; scripted results are consumed first.
#[derive(Default)]
pub struct ScriptedProber {
    healthy: Mutex<HashMap<EnvironmentId, bool>>,
    script: Mutex<HashMap<EnvironmentId, VecDeque<bool>>>,
    probes: AtomicUsize,
}

impl ScriptedProber {
    pub fn set_healthy(&self, id: EnvironmentId, healthy: bool) {
        self.healthy.lock().unwrap().insert(id, healthy);
    }

    pub fn script(&self, id: EnvironmentId, results: &[bool]) {
        self.script
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .extend(results.iter().copied());
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, id: EnvironmentId, _checks: &[CheckKind]) -> HealthVerdict {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().get_mut(&id).and_then(|q| q.pop_front());
        let ok = scripted
            .unwrap_or_else(|| self.healthy.lock().unwrap().get(&id).copied().unwrap_or(true));
        let mut checks = BTreeMap::new();
        checks.insert(
            format!("deep@{id}.internal:80"),
            CheckOutcome {
                ok,
                latency_ms: 4,
                status_code: Some(if ok { 200 } else { 503 }),
                detail: (!ok).then(|| "dependency check failed".to_string()),
            },
        );
        HealthVerdict::from_checks(id, checks, epoch_millis())
    }
}

/// Records deploy calls; can be made slow or failing.
#[derive(Default)]
pub struct ScriptedBuilder {
    pub calls: Mutex<Vec<(EnvironmentId, String)>>,
    fail: Mutex<Option<String>>,
    delay: Mutex<Duration>,
}

impl ScriptedBuilder {
    pub fn fail_with(&self, message: &str) {
        *self.fail.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<(EnvironmentId, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BuildCollaborator for ScriptedBuilder {
    async fn build_and_start(&self, id: EnvironmentId, version: &str) -> Result<(), DeployError> {
        self.calls.lock().unwrap().push((id, version.to_string()));
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.fail.lock().unwrap().clone() {
            Some(stderr) => Err(DeployError::Failed {
                status: "exit status: 1".to_string(),
                stderr,
            }),
            None => Ok(()),
        }
    }
}

pub struct Harness {
    pub store: StateStore,
    pub router: Arc<WeightedRouter>,
    pub prober: Arc<ScriptedProber>,
    pub builder: Arc<ScriptedBuilder>,
    pub alerts: Arc<AlertFanout>,
    pub alert_rx: mpsc::Receiver<AlertEvent>,
    pub controller: Arc<DeploymentController>,
    pub config: SwitchyardConfig,
}

impl Harness {
    /// Wait briefly for a delivered alert of `kind`.
    pub async fn next_alert(&mut self, kind: AlertKind) -> Option<AlertEvent> {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), self.alert_rx.recv()).await {
                Ok(Some(event)) if event.kind == kind => return Some(event),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }
}

pub fn test_config() -> SwitchyardConfig {
    let mut config = SwitchyardConfig::scaffold("primary.internal:80", "secondary.internal:80");
    config.migration.settle_secs = 0;
    config.switch.adoption_timeout_ms = 500;
    config.switch.retry = BackoffPolicy::immediate(3);
    config.deploy.ready_timeout_secs = 0;
    config.deploy.ready_poll_secs = 0;
    config
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(tweak: impl FnOnce(&mut SwitchyardConfig)) -> Harness {
    let mut config = test_config();
    tweak(&mut config);

    let store = StateStore::open_in_memory().unwrap();
    let traffic = bootstrap(&store, &config).unwrap();
    let router = Arc::new(WeightedRouter::new());
    router.reload(&traffic).await.unwrap();

    let prober = Arc::new(ScriptedProber::default());
    let builder = Arc::new(ScriptedBuilder::default());
    let (tx, alert_rx) = mpsc::channel(64);
    let alerts = Arc::new(
        AlertFanout::new(Duration::from_secs(config.monitor.cooldown_secs))
            .with_sink(Arc::new(ChannelSink::new(tx))),
    );
    let controller = Arc::new(DeploymentController::new(
        Collaborators {
            store: store.clone(),
            router: router.clone(),
            prober: prober.clone(),
            builder: builder.clone(),
            alerts: alerts.clone(),
        },
        &config,
    ));

    Harness {
        store,
        router,
        prober,
        builder,
        alerts,
        alert_rx,
        controller,
        config,
    }
}

/// Adds a third, idle environment.
pub fn with_canary(config: &mut SwitchyardConfig) {
    config.environments.push(EnvironmentConfig {
        id: EnvironmentId::Canary,
        version: "1.0.0".to_string(),
        endpoints: vec!["canary.internal:80".to_string()],
    });
}

/// Poll `check` every 10ms until it holds or `within` passes.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
