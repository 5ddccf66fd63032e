//! `serve`: run every subsystem in one process.
//!
//! Startup order matters: the store is bootstrapped from config, plans left
//! running by a previous process are rolled back, and only then is the edge
//! router brought in line with the committed traffic state. With the
//! in-process router, client traffic enters through the proxy listener
//! (`[router] proxy_listen`).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use switchyard_alert::{AlertFanout, TracingSink};
use switchyard_api::{build_router, ApiState};
use switchyard_controller::{
    bootstrap, BuildCollaborator, Collaborators, CommandCollaborator, DeploymentController,
    ExternalCollaborator,
};
use switchyard_core::config::RouterKind;
use switchyard_core::{EnvironmentId, SwitchyardConfig};
use switchyard_health::HealthProber;
use switchyard_metrics::OutcomeWindow;
use switchyard_monitor::ContinuousMonitor;
use switchyard_router::{proxy_app, EdgeRouter, FileRouter, RouterSync, WeightedRouter};
use switchyard_state::StateStore;

pub async fn run_serve(config_path: &Path, data_dir: PathBuf, port: u16) -> anyhow::Result<()> {
    let config = SwitchyardConfig::from_file(config_path)?;
    info!(config = %config_path.display(), "Switchyard daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("switchyard.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let traffic = bootstrap(&store, &config)?;
    info!(revision = traffic.revision, weights = ?traffic.weights, "traffic state loaded");

    let outcomes = Arc::new(OutcomeWindow::new(Duration::from_secs(
        config.monitor.window_secs.saturating_mul(2),
    )));
    let (router, weighted) = edge_router(&config, outcomes.clone());
    let prober = Arc::new(HealthProber::new(store.clone(), &config.health));
    let alerts = Arc::new(
        AlertFanout::new(Duration::from_secs(config.monitor.cooldown_secs)).with_sink(Arc::new(TracingSink)),
    );

    let controller = Arc::new(DeploymentController::new(
        Collaborators {
            store: store.clone(),
            router: router.clone(),
            prober: prober.clone(),
            builder: build_collaborator(&config),
            alerts: alerts.clone(),
        },
        &config,
    ));
    info!("deployment controller initialized");

    // ── Recovery ───────────────────────────────────────────────

    match controller.recover().await {
        Ok(recovered) if !recovered.is_empty() => {
            warn!(plans = ?recovered, "rolled back interrupted migrations");
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, "recovery failed; manual intervention required"),
    }

    match RouterSync::new(store.clone(), router.clone()).sync().await {
        Ok(Some(revision)) => info!(revision, "edge router synchronised"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "edge router sync failed; will retry on next switch"),
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let (advice_tx, advice_rx) = mpsc::channel(16);
    let monitor = ContinuousMonitor::new(store.clone(), prober, outcomes.clone(), alerts, &config.monitor)
        .with_advice(advice_tx);
    let monitor_shutdown = shutdown_rx.clone();
    let monitor_handle = tokio::spawn(async move {
        monitor.run(monitor_shutdown).await;
    });

    let advice_handle = tokio::spawn(controller.clone().run_advice_loop(advice_rx, shutdown_rx.clone()));

    // ── Start traffic proxy (in-process router only) ───────────

    let proxy_handle = match weighted {
        Some(weighted) => {
            let listener = tokio::net::TcpListener::bind(&config.router.proxy_listen).await?;
            info!(addr = %config.router.proxy_listen, "traffic proxy starting");
            let app = proxy_app(weighted, Duration::from_millis(config.router.upstream_timeout_ms));
            let mut proxy_shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = proxy_shutdown.wait_for(|stop| *stop).await;
                    })
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "traffic proxy failed");
                }
            }))
        }
        None => None,
    };

    // ── Start API server ───────────────────────────────────────

    let app = build_router(ApiState {
        controller,
        outcomes,
        window: Duration::from_secs(config.monitor.window_secs),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = monitor_handle.await;
    let _ = advice_handle.await;
    if let Some(handle) = proxy_handle {
        let _ = handle.await;
    }

    info!("Switchyard daemon stopped");
    Ok(())
}

fn upstreams(config: &SwitchyardConfig) -> BTreeMap<EnvironmentId, Vec<String>> {
    config
        .environments
        .iter()
        .map(|env| (env.id, env.endpoints.clone()))
        .collect()
}

/// The edge router named by `[router]`. The in-process router is also
/// returned concretely so the traffic proxy can route through it.
fn edge_router(
    config: &SwitchyardConfig,
    outcomes: Arc<OutcomeWindow>,
) -> (Arc<dyn EdgeRouter>, Option<Arc<WeightedRouter>>) {
    match config.router.kind {
        RouterKind::File => {
            info!(
                path = %config.router.config_path.display(),
                reload = ?config.router.reload_command,
                "using file edge router"
            );
            let router: Arc<dyn EdgeRouter> = Arc::new(FileRouter::new(
                config.router.config_path.clone(),
                config.router.reload_command.clone(),
                Duration::from_millis(config.router.reload_timeout_ms),
                upstreams(config),
            ));
            (router, None)
        }
        RouterKind::Memory => {
            info!("using in-process edge router");
            let router = WeightedRouter::new().with_outcomes(outcomes);
            for (id, endpoints) in upstreams(config) {
                router.set_endpoints(id, endpoints);
            }
            let router = Arc::new(router);
            (router.clone() as Arc<dyn EdgeRouter>, Some(router))
        }
    }
}

fn build_collaborator(config: &SwitchyardConfig) -> Arc<dyn BuildCollaborator> {
    match &config.deploy.command {
        Some(command) => {
            info!(%command, "deploys run the configured command");
            Arc::new(CommandCollaborator::new(
                command.clone(),
                Duration::from_secs(config.deploy.timeout_secs),
            ))
        }
        None => {
            info!("no deploy command configured; environments are updated externally");
            Arc::new(ExternalCollaborator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_router_writes_committed_state_on_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SwitchyardConfig::scaffold("10.0.0.1:80", "10.0.0.2:80");
        config.router.kind = RouterKind::File;
        config.router.config_path = dir.path().join("upstreams.json");

        let store = StateStore::open_in_memory().unwrap();
        let traffic = bootstrap(&store, &config).unwrap();
        let (router, weighted) = edge_router(&config, Arc::new(OutcomeWindow::new(Duration::from_secs(60))));
        assert!(weighted.is_none());

        let synced = RouterSync::new(store, router.clone()).sync().await.unwrap();

        assert_eq!(synced, Some(traffic.revision));
        assert!(config.router.config_path.exists());
        let adopted = router.current_config().await.unwrap().unwrap();
        assert_eq!(adopted.weights, traffic.weights);
    }

    #[tokio::test]
    async fn memory_router_is_default() {
        let config = SwitchyardConfig::scaffold("a:1", "b:1");
        let store = StateStore::open_in_memory().unwrap();
        bootstrap(&store, &config).unwrap();
        let (router, weighted) = edge_router(&config, Arc::new(OutcomeWindow::new(Duration::from_secs(60))));

        assert!(router.current_config().await.unwrap().is_none());
        RouterSync::new(store, router.clone()).sync().await.unwrap();
        assert!(router.current_config().await.unwrap().is_some());
        // The proxy routes through the same instance the sync updated.
        assert!(weighted.unwrap().route_endpoint().is_some());
    }
}
