//! Environment-level probing.
//!
//! The `HealthProber` runs each requested check against every endpoint of
//! an environment, retrying failed checks under the configured backoff
//! policy, and folds the results into one `HealthVerdict`. It never
//! returns an error: an unreachable or unknown environment simply yields
//! an unhealthy verdict.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use switchyard_core::config::HealthSettings;
use switchyard_core::{epoch_millis, BackoffPolicy, EnvironmentId};
use switchyard_state::{CheckOutcome, HealthVerdict, StateStore};

use crate::checker::{http_probe, CheckKind};

/// Something that can produce a health verdict for an environment.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `id` with the given checks. An empty slice means the default set.
    async fn probe(&self, id: EnvironmentId, checks: &[CheckKind]) -> HealthVerdict;
}

/// Failed check carried through the retry loop.
struct FailedCheck(CheckOutcome);

impl fmt::Display for FailedCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.0.status_code, &self.0.detail) {
            (Some(code), _) => write!(f, "status {code}"),
            (None, Some(detail)) => f.write_str(detail),
            (None, None) => f.write_str("check failed"),
        }
    }
}

/// HTTP prober reading endpoints from the environment registry.
#[derive(Clone)]
pub struct HealthProber {
    store: StateStore,
    liveness_path: String,
    deep_path: String,
    timeout: Duration,
    retry: BackoffPolicy,
}

impl HealthProber {
    pub fn new(store: StateStore, settings: &HealthSettings) -> Self {
        Self {
            store,
            liveness_path: settings.liveness_path.clone(),
            deep_path: settings.deep_path.clone(),
            timeout: settings.timeout(),
            retry: settings.retry.clone(),
        }
    }

    fn path_for(&self, kind: CheckKind) -> &str {
        match kind {
            CheckKind::Liveness => &self.liveness_path,
            CheckKind::Deep => &self.deep_path,
        }
    }

    async fn run_check(&self, address: &str, kind: CheckKind) -> CheckOutcome {
        let path = self.path_for(kind);
        let label = format!("{}@{address}", kind.name());
        let timeout = self.timeout;
        let result = self
            .retry
            .retry(&label, |_| true, move |_| async move {
                let outcome = http_probe(address, path, timeout).await;
                if outcome.ok {
                    Ok(outcome)
                } else {
                    Err(FailedCheck(outcome))
                }
            })
            .await;
        match result {
            Ok(outcome) => outcome,
            Err(FailedCheck(outcome)) => outcome,
        }
    }
}

#[async_trait]
impl Prober for HealthProber {
    async fn probe(&self, id: EnvironmentId, checks: &[CheckKind]) -> HealthVerdict {
        let checks = if checks.is_empty() {
            crate::DEFAULT_CHECKS
        } else {
            checks
        };

        let mut results = BTreeMap::new();
        match self.store.get_environment(id) {
            Ok(Some(env)) => {
                for address in &env.endpoints {
                    for kind in checks {
                        let outcome = self.run_check(address, *kind).await;
                        results.insert(format!("{}@{address}", kind.name()), outcome);
                    }
                }
            }
            Ok(None) => {
                results.insert(
                    "registry".to_string(),
                    failed_check(format!("environment {id} is not registered")),
                );
            }
            Err(e) => {
                results.insert(
                    "registry".to_string(),
                    failed_check(format!("registry read failed: {e}")),
                );
            }
        }

        let verdict = HealthVerdict::from_checks(id, results, epoch_millis());
        if verdict.healthy {
            debug!(environment = %id, "probe healthy");
        } else {
            warn!(
                environment = %id,
                failing = ?verdict.failing_checks(),
                "probe unhealthy"
            );
        }
        verdict
    }
}

fn failed_check(detail: String) -> CheckOutcome {
    CheckOutcome {
        ok: false,
        latency_ms: 0,
        status_code: None,
        detail: Some(detail),
    }
}

/// Poll until `id` probes healthy or `max_wait` elapses.
///
/// Returns the last verdict either way; callers gate on `verdict.healthy`.
pub async fn wait_until_healthy(
    prober: &dyn Prober,
    id: EnvironmentId,
    max_wait: Duration,
    poll_interval: Duration,
) -> HealthVerdict {
    let deadline = Instant::now() + max_wait;
    let mut polls = 0u32;
    loop {
        polls += 1;
        let verdict = prober.probe(id, &[]).await;
        if verdict.healthy {
            info!(environment = %id, polls, "environment ready");
            return verdict;
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(
                environment = %id,
                polls,
                max_wait_secs = max_wait.as_secs(),
                "environment did not become healthy in time"
            );
            return verdict;
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::tests::canned_server;
    use std::sync::atomic::{AtomicU32, Ordering};
    use switchyard_state::{Environment, EnvironmentRole, HealthStatus};

    fn settings() -> HealthSettings {
        HealthSettings {
            timeout_ms: 2_000,
            retry: BackoffPolicy::immediate(3),
            ..HealthSettings::default()
        }
    }

    fn register(store: &StateStore, id: EnvironmentId, endpoints: Vec<String>) {
        store
            .put_environment(&Environment {
                id,
                version: "1.0.0".to_string(),
                endpoints,
                health: HealthStatus::Unknown,
                role: EnvironmentRole::Standby,
                updated_at: 0,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn healthy_environment_reports_every_check() {
        let store = StateStore::open_in_memory().unwrap();
        let a = canned_server("200 OK", r#"{"status":"pass"}"#).await;
        let b = canned_server("200 OK", r#"{"status":"pass"}"#).await;
        register(&store, EnvironmentId::Secondary, vec![a.clone(), b]);

        let prober = HealthProber::new(store, &settings());
        let verdict = prober.probe(EnvironmentId::Secondary, &[]).await;

        assert!(verdict.healthy);
        assert_eq!(verdict.checks.len(), 4);
        assert!(verdict.checks.contains_key(&format!("deep@{a}")));
    }

    #[tokio::test]
    async fn one_bad_endpoint_fails_the_verdict() {
        let store = StateStore::open_in_memory().unwrap();
        let good = canned_server("200 OK", "{}").await;
        let bad = canned_server("500 Internal Server Error", "{}").await;
        register(&store, EnvironmentId::Secondary, vec![good, bad.clone()]);

        let prober = HealthProber::new(store, &settings());
        let verdict = prober
            .probe(EnvironmentId::Secondary, &[CheckKind::Liveness])
            .await;

        assert!(!verdict.healthy);
        assert_eq!(verdict.failing_checks(), vec![format!("liveness@{bad}").as_str()]);
    }

    #[tokio::test]
    async fn unknown_environment_is_unhealthy_not_an_error() {
        let store = StateStore::open_in_memory().unwrap();
        let prober = HealthProber::new(store, &settings());
        let verdict = prober.probe(EnvironmentId::Canary, &[]).await;
        assert!(!verdict.healthy);
        assert!(verdict.checks.contains_key("registry"));
    }

    /// Fails a fixed number of times, then reports healthy.
    struct FlakyProber {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Prober for FlakyProber {
        async fn probe(&self, id: EnvironmentId, _checks: &[CheckKind]) -> HealthVerdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let ok = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err();
            let mut checks = BTreeMap::new();
            checks.insert(
                "liveness".to_string(),
                CheckOutcome {
                    ok,
                    latency_ms: 1,
                    status_code: Some(if ok { 200 } else { 503 }),
                    detail: None,
                },
            );
            HealthVerdict::from_checks(id, checks, 0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_healthy() {
        let prober = FlakyProber {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        let verdict = wait_until_healthy(
            &prober,
            EnvironmentId::Secondary,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .await;
        assert!(verdict.healthy);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_gives_up_at_deadline() {
        let prober = FlakyProber {
            failures_left: AtomicU32::new(u32::MAX),
            calls: AtomicU32::new(0),
        };
        let verdict = wait_until_healthy(
            &prober,
            EnvironmentId::Secondary,
            Duration::from_secs(12),
            Duration::from_secs(5),
        )
        .await;
        assert!(!verdict.healthy);
        // t=0, 5, 10, 12
        assert_eq!(prober.calls.load(Ordering::SeqCst), 4);
    }
}
