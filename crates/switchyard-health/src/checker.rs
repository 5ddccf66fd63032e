//! HTTP check execution.
//!
//! One check is one GET against `http://{address}{path}`, bounded by a
//! timeout. The endpoint passes on a 2xx response whose body (if JSON)
//! does not report a failing status. Failures are returned as data.

use std::time::{Duration, Instant};

use http_body_util::{BodyExt, LengthLimitError, Limited};
use tracing::debug;

use switchyard_state::CheckOutcome;

/// Body bytes kept as diagnostics on failure.
const MAX_DETAIL_LEN: usize = 512;

/// Largest health response body read. Anything bigger fails the check.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Which health endpoint a check targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    /// Cheap process-is-up check.
    Liveness,
    /// Exercises dependencies, latency, and memory headroom.
    Deep,
}

impl CheckKind {
    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::Liveness => "liveness",
            CheckKind::Deep => "deep",
        }
    }
}

/// Liveness then deep, the set used when a caller asks for the default.
pub const DEFAULT_CHECKS: &[CheckKind] = &[CheckKind::Liveness, CheckKind::Deep];

/// Perform a single HTTP check against an endpoint.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> CheckOutcome {
    let uri = format!("http://{address}{path}");
    let started = Instant::now();

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| format!("connect failed: {e}"))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| format!("handshake failed: {e}"))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "switchyard-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| format!("bad request: {e}"))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| format!("request failed: {e}"))?;
        let status = resp.status();
        let body = Limited::new(resp.into_body(), MAX_BODY_BYTES)
            .collect()
            .await
            .map(|b| b.to_bytes())
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    format!("response body exceeds {MAX_BODY_BYTES} bytes")
                } else {
                    format!("body read failed: {e}")
                }
            });
        Ok::<_, String>((status, body))
    })
    .await;

    let latency_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(Ok((status, Err(reason)))) => {
            debug!(%status, %uri, %reason, "health check body rejected");
            CheckOutcome {
                ok: false,
                latency_ms,
                status_code: Some(status.as_u16()),
                detail: Some(reason),
            }
        }
        Ok(Ok((status, Ok(body)))) => {
            let body_failed = reports_failure(&body);
            let ok = status.is_success() && !body_failed;
            let detail = if ok {
                None
            } else {
                debug!(%status, %uri, "health check failed");
                Some(truncate(&String::from_utf8_lossy(&body)))
            };
            CheckOutcome {
                ok,
                latency_ms,
                status_code: Some(status.as_u16()),
                detail,
            }
        }
        Ok(Err(reason)) => {
            debug!(%uri, %reason, "health check transport error");
            CheckOutcome {
                ok: false,
                latency_ms,
                status_code: None,
                detail: Some(reason),
            }
        }
        Err(_) => {
            debug!(%uri, "health check timed out");
            CheckOutcome {
                ok: false,
                latency_ms,
                status_code: None,
                detail: Some(format!("timed out after {}ms", timeout.as_millis())),
            }
        }
    }
}

/// A structured body may flag failure even with a 2xx status, e.g.
/// `{"status": "fail", "checks": {...}}`.
fn reports_failure(body: &[u8]) -> bool {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return false;
    };
    match value.get("status").and_then(|s| s.as_str()) {
        Some(s) => matches!(
            s.to_ascii_lowercase().as_str(),
            "fail" | "failed" | "unhealthy" | "down" | "error"
        ),
        None => value.get("healthy").and_then(|h| h.as_bool()) == Some(false),
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_DETAIL_LEN {
        return s.to_string();
    }
    let mut end = MAX_DETAIL_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
