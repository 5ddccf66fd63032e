//! First-boot registration of environments and the initial traffic state.

use tracing::info;

use switchyard_core::{epoch_millis, SwitchyardConfig};
use switchyard_state::{
    Environment, EnvironmentRole, HealthStatus, StateResult, StateStore, TrafficMode, TrafficState,
    Weights,
};

/// Register every configured environment and seed the traffic state.
///
/// Idempotent: existing records keep their version, role and health (only
/// endpoints are refreshed) and an existing traffic state is left alone.
pub fn bootstrap(store: &StateStore, config: &SwitchyardConfig) -> StateResult<TrafficState> {
    let now = epoch_millis();
    for env in &config.environments {
        // Nothing is Active before it has probed healthy; the first verdict
        // for the serving environment promotes it.
        store.register_environment(&Environment {
            id: env.id,
            version: env.version.clone(),
            endpoints: env.endpoints.clone(),
            health: HealthStatus::Unknown,
            role: EnvironmentRole::Standby,
            updated_at: now,
        })?;
    }

    let weights: Weights = config
        .environments
        .iter()
        .map(|env| (env.id, if env.id == config.initial_active { 100 } else { 0 }))
        .collect();
    let traffic = store.init_traffic(weights, TrafficMode::Single, now)?;
    info!(
        environments = config.environments.len(),
        revision = traffic.revision,
        "environments registered"
    );
    Ok(traffic)
}
