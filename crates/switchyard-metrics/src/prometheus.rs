//! Prometheus text exposition format.
//!
//! Renders traffic weights, health verdicts, and request outcomes into the
//! Prometheus text exposition format for the `/metrics` endpoint.

use std::collections::BTreeMap;
use std::fmt::Write;

use switchyard_core::EnvironmentId;
use switchyard_state::{HealthVerdict, TrafficState};

use crate::window::WindowMetrics;

/// Everything the exposition needs, gathered by the caller.
pub struct Exposition<'a> {
    pub traffic: Option<&'a TrafficState>,
    pub verdicts: &'a [HealthVerdict],
    pub window: &'a BTreeMap<EnvironmentId, WindowMetrics>,
    pub totals: &'a BTreeMap<EnvironmentId, (u64, u64)>,
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

/// Render the current state into Prometheus text format.
///
/// Per-environment series carry an `environment` label.
pub fn render_prometheus(input: &Exposition<'_>) -> String {
    let mut out = String::new();

    header(&mut out, "switchyard_traffic_weight_percent", "Share of traffic routed to an environment.", "gauge");
    if let Some(traffic) = input.traffic {
        for (id, weight) in &traffic.weights {
            let _ = writeln!(out, "switchyard_traffic_weight_percent{{environment=\"{id}\"}} {weight}");
        }
    }

    header(&mut out, "switchyard_traffic_revision", "Revision of the applied traffic state.", "gauge");
    if let Some(traffic) = input.traffic {
        let _ = writeln!(out, "switchyard_traffic_revision {}", traffic.revision);
    }

    header(&mut out, "switchyard_environment_healthy", "Latest health verdict (1 healthy, 0 unhealthy).", "gauge");
    for v in input.verdicts {
        let _ = writeln!(
            out,
            "switchyard_environment_healthy{{environment=\"{}\"}} {}",
            v.environment_id,
            u8::from(v.healthy)
        );
    }

    header(&mut out, "switchyard_requests_total", "Requests observed by the edge router.", "counter");
    for (id, (requests, _)) in input.totals {
        let _ = writeln!(out, "switchyard_requests_total{{environment=\"{id}\"}} {requests}");
    }

    header(&mut out, "switchyard_request_errors_total", "Failed requests observed by the edge router.", "counter");
    for (id, (_, errors)) in input.totals {
        let _ = writeln!(out, "switchyard_request_errors_total{{environment=\"{id}\"}} {errors}");
    }

    header(&mut out, "switchyard_error_rate", "Error rate over the trailing window (0.0-1.0).", "gauge");
    for (id, m) in input.window {
        let _ = writeln!(out, "switchyard_error_rate{{environment=\"{id}\"}} {:.4}", m.error_rate);
    }

    header(&mut out, "switchyard_latency_p95_ms", "P95 latency over the trailing window in milliseconds.", "gauge");
    for (id, m) in input.window {
        let _ = writeln!(out, "switchyard_latency_p95_ms{{environment=\"{id}\"}} {:.2}", m.p95_latency_ms);
    }

    out
}
