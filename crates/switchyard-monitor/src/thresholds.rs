//! Threshold evaluation: turns one tick's observations into breaches.
//!
//! Pure: no I/O, no clock. The monitor gathers verdicts and window metrics,
//! this module decides which of them deserve an alert and how loud.

use std::collections::BTreeMap;

use switchyard_core::config::MonitorSettings;
use switchyard_core::EnvironmentId;
use switchyard_metrics::WindowMetrics;
use switchyard_state::{AlertKind, HealthVerdict, Severity, TrafficState};

/// Fewer requests than this in the window are too few to judge a rate.
pub const MIN_REQUESTS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    /// 0.0-1.0.
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    /// Percent.
    pub availability: f64,
    pub min_requests: u64,
}

impl From<&MonitorSettings> for Thresholds {
    fn from(s: &MonitorSettings) -> Self {
        Self {
            error_rate: s.error_rate_threshold,
            p95_latency_ms: s.p95_latency_ms,
            availability: s.availability_threshold,
            min_requests: MIN_REQUESTS,
        }
    }
}

/// A threshold crossed during one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub kind: AlertKind,
    pub severity: Severity,
    pub environment: Option<EnvironmentId>,
    pub message: String,
}

/// Compare one tick's observations against the thresholds.
///
/// Environments receiving traffic are judged more severely than idle ones:
/// an unhealthy standby is a Warning, an unhealthy serving environment is
/// Critical.
pub fn evaluate(
    thresholds: &Thresholds,
    traffic: Option<&TrafficState>,
    verdicts: &[HealthVerdict],
    window: &BTreeMap<EnvironmentId, WindowMetrics>,
    availability: Option<f64>,
) -> Vec<Breach> {
    let serving = |id: EnvironmentId| traffic.is_some_and(|t| t.weight_of(id) > 0);
    let mut breaches = Vec::new();

    for verdict in verdicts.iter().filter(|v| !v.healthy) {
        let id = verdict.environment_id;
        let (severity, role) = if serving(id) {
            (Severity::Critical, "serving")
        } else {
            (Severity::Warning, "idle")
        };
        breaches.push(Breach {
            kind: AlertKind::EnvironmentUnhealthy,
            severity,
            environment: Some(id),
            message: format!(
                "{role} environment {id} is unhealthy (failing: {})",
                verdict.failing_checks().join(", ")
            ),
        });
    }

    for (id, metrics) in window {
        if metrics.requests < thresholds.min_requests {
            continue;
        }
        if metrics.error_rate > thresholds.error_rate {
            breaches.push(Breach {
                kind: AlertKind::ErrorRate,
                severity: Severity::Critical,
                environment: Some(*id),
                message: format!(
                    "error rate on {id} is {:.1}% over {} requests (threshold {:.1}%)",
                    metrics.error_rate * 100.0,
                    metrics.requests,
                    thresholds.error_rate * 100.0
                ),
            });
        }
        if metrics.p95_latency_ms > thresholds.p95_latency_ms {
            breaches.push(Breach {
                kind: AlertKind::Latency,
                severity: Severity::Warning,
                environment: Some(*id),
                message: format!(
                    "p95 latency on {id} is {:.0}ms (threshold {:.0}ms)",
                    metrics.p95_latency_ms, thresholds.p95_latency_ms
                ),
            });
        }
    }

    if let Some(availability) = availability
        && availability < thresholds.availability
    {
        breaches.push(Breach {
            kind: AlertKind::Availability,
            severity: Severity::Warning,
            environment: None,
            message: format!(
                "availability is {availability:.2}% (threshold {:.2}%)",
                thresholds.availability
            ),
        });
    }

    breaches
}
