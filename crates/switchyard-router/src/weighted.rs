//! In-process weighted router.
//!
//! Picks an environment per request with smooth weighted round-robin, so a
//! 75/25 split serves exactly 75 and 25 of every 100 requests with the
//! minority interleaved rather than bunched. Within an environment,
//! endpoints are picked round-robin.

use std::collections::{BTreeMap, HashMap};
#[cfg(any(test, feature = "test-util"))]
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::debug;

use switchyard_core::EnvironmentId;
use switchyard_metrics::OutcomeWindow;
use switchyard_state::TrafficState;

use crate::{EdgeRouter, RouterError};

/// Adopted state plus the running smooth-WRR counters for it.
struct RoutingTable {
    state: TrafficState,
    current: Mutex<BTreeMap<EnvironmentId, i64>>,
}

struct EndpointSet {
    endpoints: Vec<String>,
    counter: AtomicUsize,
}

pub struct WeightedRouter {
    table: RwLock<Option<RoutingTable>>,
    endpoints: RwLock<HashMap<EnvironmentId, EndpointSet>>,
    outcomes: Option<Arc<OutcomeWindow>>,
    #[cfg(any(test, feature = "test-util"))]
    faults: Faults,
}

/// Fault injection for exercising retry and revert paths.
#[cfg(any(test, feature = "test-util"))]
#[derive(Default)]
struct Faults {
    failing_reloads: AtomicU32,
    holding_adoption: AtomicBool,
}

impl WeightedRouter {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(None),
            endpoints: RwLock::new(HashMap::new()),
            outcomes: None,
            #[cfg(any(test, feature = "test-util"))]
            faults: Faults::default(),
        }
    }

    /// Feed request outcomes into `window`.
    pub fn with_outcomes(mut self, window: Arc<OutcomeWindow>) -> Self {
        self.outcomes = Some(window);
        self
    }

    /// Register or replace the endpoints of an environment.
    pub fn set_endpoints(&self, id: EnvironmentId, endpoints: Vec<String>) {
        let mut map = self.endpoints.write().expect("endpoints lock");
        debug!(environment = %id, count = endpoints.len(), "updated environment endpoints");
        map.insert(
            id,
            EndpointSet {
                endpoints,
                counter: AtomicUsize::new(0),
            },
        );
    }

    /// The state this router has adopted, if any.
    pub fn adopted(&self) -> Option<TrafficState> {
        let table = self.table.read().expect("routing table lock");
        table.as_ref().map(|t| t.state.clone())
    }

    /// Select the environment for the next request.
    pub fn route(&self) -> Option<EnvironmentId> {
        let table = self.table.read().expect("routing table lock");
        let table = table.as_ref()?;
        let mut current = table.current.lock().expect("wrr counters lock");

        let mut total = 0i64;
        let mut best: Option<(EnvironmentId, i64)> = None;
        for (id, weight) in &table.state.weights {
            if *weight == 0 {
                continue;
            }
            let w = *weight as i64;
            total += w;
            let c = current.entry(*id).or_insert(0);
            *c += w;
            if best.is_none_or(|(_, b)| *c > b) {
                best = Some((*id, *c));
            }
        }

        let (picked, _) = best?;
        if let Some(c) = current.get_mut(&picked) {
            *c -= total;
        }
        Some(picked)
    }

    /// Select an environment and one of its endpoints (round-robin).
    pub fn route_endpoint(&self) -> Option<(EnvironmentId, String)> {
        let id = self.route()?;
        let map = self.endpoints.read().expect("endpoints lock");
        let set = map.get(&id)?;
        if set.endpoints.is_empty() {
            return None;
        }
        let idx = set.counter.fetch_add(1, Ordering::Relaxed) % set.endpoints.len();
        Some((id, set.endpoints[idx].clone()))
    }

    /// Report how a routed request went.
    pub fn record_outcome(&self, id: EnvironmentId, latency_ms: f64, is_error: bool) {
        if let Some(window) = &self.outcomes {
            window.record(id, latency_ms, is_error);
        }
    }

    /// Make the next `count` reloads fail with a transient error.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_next_reloads(&self, count: u32) {
        self.faults.failing_reloads.store(count, Ordering::SeqCst);
    }

    /// While held, reloads are acknowledged but the old state keeps serving.
    #[cfg(any(test, feature = "test-util"))]
    pub fn hold_adoption(&self, hold: bool) {
        self.faults.holding_adoption.store(hold, Ordering::SeqCst);
    }

    /// `Some` when an injected fault decides the outcome of this reload.
    #[cfg(any(test, feature = "test-util"))]
    fn injected(&self, state: &TrafficState) -> Option<Result<(), RouterError>> {
        let failing = self
            .faults
            .failing_reloads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Some(Err(RouterError::Reload("router busy".to_string())));
        }
        if self.faults.holding_adoption.load(Ordering::SeqCst) {
            tracing::warn!(revision = state.revision, "reload acknowledged but not adopted");
            return Some(Ok(()));
        }
        None
    }

    #[cfg(not(any(test, feature = "test-util")))]
    fn injected(&self, _state: &TrafficState) -> Option<Result<(), RouterError>> {
        None
    }
}

impl Default for WeightedRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EdgeRouter for WeightedRouter {
    async fn reload(&self, state: &TrafficState) -> Result<(), RouterError> {
        if let Some(result) = self.injected(state) {
            return result;
        }

        let mut table = self.table.write().expect("routing table lock");
        *table = Some(RoutingTable {
            state: state.clone(),
            current: Mutex::new(BTreeMap::new()),
        });
        debug!(revision = state.revision, weights = ?state.weights, "weighted router adopted state");
        Ok(())
    }

    async fn current_config(&self) -> Result<Option<TrafficState>, RouterError> {
        Ok(self.adopted())
    }
}
