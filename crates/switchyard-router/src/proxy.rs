//! HTTP forwarding in front of the in-process router.
//!
//! Each request goes to the endpoint `WeightedRouter::route_endpoint` picks.
//! Its latency and whether it failed (5xx, transport error, timeout) are
//! recorded as an outcome for the continuous monitor. One upstream
//! connection per request, HTTP/1 only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::weighted::WeightedRouter;

#[derive(Clone)]
struct ProxyState {
    router: Arc<WeightedRouter>,
    timeout: Duration,
}

/// An axum app forwarding every request through `router`, each bounded by `timeout`.
pub fn proxy_app(router: Arc<WeightedRouter>, timeout: Duration) -> Router {
    Router::new()
        .fallback(forward)
        .with_state(ProxyState { router, timeout })
}

async fn forward(State(proxy): State<ProxyState>, req: Request) -> Response {
    let Some((id, endpoint)) = proxy.router.route_endpoint() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no environment is receiving traffic").into_response();
    };

    let started = Instant::now();
    let result = tokio::time::timeout(proxy.timeout, send(&endpoint, req)).await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(Ok(resp)) => {
            let is_error = resp.status().is_server_error();
            debug!(environment = %id, %endpoint, status = %resp.status(), latency_ms, "proxied");
            proxy.router.record_outcome(id, latency_ms, is_error);
            resp
        }
        Ok(Err(reason)) => {
            warn!(environment = %id, %endpoint, %reason, "upstream request failed");
            proxy.router.record_outcome(id, latency_ms, true);
            (StatusCode::BAD_GATEWAY, reason).into_response()
        }
        Err(_) => {
            warn!(environment = %id, %endpoint, "upstream request timed out");
            proxy.router.record_outcome(id, latency_ms, true);
            (StatusCode::GATEWAY_TIMEOUT, "upstream timed out").into_response()
        }
    }
}

async fn send(endpoint: &str, req: Request) -> Result<Response, String> {
    let stream = tokio::net::TcpStream::connect(endpoint)
        .await
        .map_err(|e| format!("connect to {endpoint} failed: {e}"))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, Body>(io)
        .await
        .map_err(|e| format!("handshake with {endpoint} failed: {e}"))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let (mut parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    parts.uri = path
        .parse::<Uri>()
        .map_err(|e| format!("bad request target {path}: {e}"))?;
    let host = HeaderValue::from_str(endpoint).map_err(|e| format!("bad endpoint {endpoint}: {e}"))?;
    parts.headers.insert(header::HOST, host);

    let resp = sender
        .send_request(Request::from_parts(parts, body))
        .await
        .map_err(|e| format!("request to {endpoint} failed: {e}"))?;
    Ok(resp.map(Body::new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use switchyard_core::EnvironmentId;
    use switchyard_metrics::OutcomeWindow;
    use switchyard_state::{TrafficMode, TrafficState};
    use tower::ServiceExt;

    use crate::EdgeRouter;

    fn all_to(id: EnvironmentId) -> TrafficState {
        let weights = [(id, 100)].into_iter().collect();
        TrafficState {
            mode: TrafficMode::derive(&weights),
            weights,
            revision: 2,
            last_updated: 0,
        }
    }

    async fn upstream() -> String {
        let app = axum::Router::new()
            .route("/ok", get(|| async { "served" }))
            .route("/boom", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    fn get_request(uri: &str) -> Request {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn forwards_to_the_routed_environment_and_records_outcomes() {
        let window = Arc::new(OutcomeWindow::new(Duration::from_secs(60)));
        let router = Arc::new(WeightedRouter::new().with_outcomes(window.clone()));
        router.set_endpoints(EnvironmentId::Secondary, vec![upstream().await]);
        router.reload(&all_to(EnvironmentId::Secondary)).await.unwrap();
        let app = proxy_app(router, Duration::from_secs(5));

        let resp = app.clone().oneshot(get_request("/ok")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"served");

        let resp = app.oneshot(get_request("/boom")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(window.totals()[&EnvironmentId::Secondary], (2, 1));
    }

    #[tokio::test]
    async fn nothing_adopted_is_unavailable() {
        let app = proxy_app(Arc::new(WeightedRouter::new()), Duration::from_secs(1));
        let resp = app.oneshot(get_request("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_recorded_error() {
        let closed = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let window = Arc::new(OutcomeWindow::new(Duration::from_secs(60)));
        let router = Arc::new(WeightedRouter::new().with_outcomes(window.clone()));
        router.set_endpoints(EnvironmentId::Primary, vec![closed]);
        router.reload(&all_to(EnvironmentId::Primary)).await.unwrap();

        let resp = proxy_app(router, Duration::from_secs(2))
            .oneshot(get_request("/"))
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(window.totals()[&EnvironmentId::Primary], (1, 1));
    }
}
