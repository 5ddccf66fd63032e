//! Outcome window: per-environment request samples over a trailing window.
//!
//! Samples are kept in arrival order per environment and pruned once they
//! fall out of the retention period. Lifetime counters survive pruning
//! so they can be exported as Prometheus counters.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use switchyard_core::{epoch_millis, EnvironmentId};

/// One request outcome as observed by the edge router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeSample {
    pub environment_id: EnvironmentId,
    /// Unix timestamp (ms). Missing on ingest means "now".
    #[serde(default)]
    pub timestamp_ms: Option<u64>,
    pub latency_ms: f64,
    pub is_error: bool,
}

/// Aggregates over a trailing window.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WindowMetrics {
    pub requests: u64,
    pub errors: u64,
    /// errors / requests, 0.0 when there were no requests.
    pub error_rate: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at_ms: u64,
    latency_ms: f64,
    is_error: bool,
}

#[derive(Default)]
struct EnvironmentSamples {
    samples: VecDeque<Sample>,
    total_requests: u64,
    total_errors: u64,
}

/// Thread-safe store of recent request outcomes.
pub struct OutcomeWindow {
    retention_ms: u64,
    inner: Mutex<HashMap<EnvironmentId, EnvironmentSamples>>,
}

impl OutcomeWindow {
    /// Keep samples for `retention`; windows wider than this see less data.
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_ms: retention.as_millis() as u64,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request that finished now.
    pub fn record(&self, id: EnvironmentId, latency_ms: f64, is_error: bool) {
        self.record_at(id, epoch_millis(), latency_ms, is_error);
    }

    pub fn record_at(&self, id: EnvironmentId, at_ms: u64, latency_ms: f64, is_error: bool) {
        let mut inner = self.inner.lock().expect("outcome window lock");
        let entry = inner.entry(id).or_default();
        entry.total_requests += 1;
        if is_error {
            entry.total_errors += 1;
        }
        entry.samples.push_back(Sample {
            at_ms,
            latency_ms: latency_ms.max(0.0),
            is_error,
        });
        prune(&mut entry.samples, at_ms.saturating_sub(self.retention_ms));
    }

    /// Record a batch pushed by an external router.
    pub fn ingest(&self, samples: &[OutcomeSample]) {
        let now = epoch_millis();
        for s in samples {
            self.record_at(
                s.environment_id,
                s.timestamp_ms.unwrap_or(now),
                s.latency_ms,
                s.is_error,
            );
        }
        debug!(count = samples.len(), "outcome samples ingested");
    }

    /// Per-environment aggregates over `(now - window, now]`.
    pub fn snapshot_at(&self, now_ms: u64, window: Duration) -> BTreeMap<EnvironmentId, WindowMetrics> {
        let since = now_ms.saturating_sub(window.as_millis() as u64);
        let inner = self.inner.lock().expect("outcome window lock");
        inner
            .iter()
            .map(|(id, env)| {
                let recent: Vec<Sample> = env
                    .samples
                    .iter()
                    .filter(|s| s.at_ms > since && s.at_ms <= now_ms)
                    .copied()
                    .collect();
                (*id, summarize(&recent))
            })
            .collect()
    }

    /// Lifetime (requests, errors) per environment.
    pub fn totals(&self) -> BTreeMap<EnvironmentId, (u64, u64)> {
        let inner = self.inner.lock().expect("outcome window lock");
        inner
            .iter()
            .map(|(id, env)| (*id, (env.total_requests, env.total_errors)))
            .collect()
    }
}

fn prune(samples: &mut VecDeque<Sample>, cutoff_ms: u64) {
    while samples.front().is_some_and(|s| s.at_ms < cutoff_ms) {
        samples.pop_front();
    }
}

fn summarize(samples: &[Sample]) -> WindowMetrics {
    let requests = samples.len() as u64;
    let errors = samples.iter().filter(|s| s.is_error).count() as u64;
    let error_rate = if requests > 0 {
        errors as f64 / requests as f64
    } else {
        0.0
    };
    let latencies: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
    let (p50, p95) = compute_percentiles(&latencies);
    WindowMetrics {
        requests,
        errors,
        error_rate,
        p50_latency_ms: p50,
        p95_latency_ms: p95,
    }
}

/// Nearest-rank P50 and P95. Returns (0.0, 0.0) for no samples.
fn compute_percentiles(latencies: &[f64]) -> (f64, f64) {
    if latencies.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p95_idx = (sorted.len() as f64 * 0.95) as usize;

    let p50 = sorted[p50_idx.min(sorted.len() - 1)];
    let p95 = sorted[p95_idx.min(sorted.len() - 1)];

    (p50, p95)
}
