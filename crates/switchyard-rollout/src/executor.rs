//! Traffic switch executor: the sole writer of the TrafficState.
//!
//! An apply validates the requested weights, commits them as the next
//! revision (compare-and-swap in the store), signals the edge router, and
//! waits until the router reports the new revision. If the router never
//! adopts it, the prior weights are committed again as a fresh revision
//! and pushed back out, so the store always holds a fully applied state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use switchyard_core::config::SwitchSettings;
use switchyard_core::{epoch_millis, BackoffPolicy};
use switchyard_router::{EdgeRouter, RouterError};
use switchyard_state::{
    check_weights, Revision, StateError, StateStore, TrafficMode, TrafficState, Weights,
    WeightsError,
};

use crate::error::SwitchError;

/// How often the router is polled while waiting for adoption.
const ADOPTION_POLL: Duration = Duration::from_millis(50);

pub struct TrafficSwitchExecutor {
    store: StateStore,
    router: Arc<dyn EdgeRouter>,
    retry: BackoffPolicy,
    adoption_timeout: Duration,
    /// Serializes writers within this process.
    writer: Mutex<()>,
}

impl TrafficSwitchExecutor {
    pub fn new(store: StateStore, router: Arc<dyn EdgeRouter>, settings: &SwitchSettings) -> Self {
        Self {
            store,
            router,
            retry: settings.retry.clone(),
            adoption_timeout: Duration::from_millis(settings.adoption_timeout_ms),
            writer: Mutex::new(()),
        }
    }

    /// The committed TrafficState.
    pub fn current(&self) -> Result<TrafficState, SwitchError> {
        self.store.current_traffic()?.ok_or(SwitchError::Uninitialized)
    }

    /// Apply `weights` with a derived mode; an unchanged split is rejected.
    pub async fn apply(&self, weights: Weights) -> Result<Revision, SwitchError> {
        self.apply_with(weights, None, false).await
    }

    /// Apply `weights`.
    ///
    /// `mode` overrides the mode derived from the weights. With
    /// `idempotent`, a request matching the committed state returns its
    /// revision without writing anything.
    pub async fn apply_with(
        &self,
        weights: Weights,
        mode: Option<TrafficMode>,
        idempotent: bool,
    ) -> Result<Revision, SwitchError> {
        let _writer = self.writer.lock().await;

        let previous = self.current()?;
        let weights = self.normalize(weights)?;
        let mode = mode.unwrap_or_else(|| TrafficMode::derive(&weights));

        if previous.same_routing(&weights) && previous.mode == mode {
            if idempotent {
                debug!(revision = previous.revision, "weights unchanged, nothing to apply");
                return Ok(previous.revision);
            }
            return Err(SwitchError::NoChange {
                revision: previous.revision,
            });
        }

        let applied = self.commit(previous.revision, weights, mode).await?;
        match self.publish(&applied).await {
            Ok(()) => {
                info!(
                    revision = applied.revision,
                    weights = ?applied.weights,
                    mode = ?applied.mode,
                    "traffic switch applied"
                );
                Ok(applied.revision)
            }
            Err(cause) => {
                warn!(revision = applied.revision, error = %cause, "traffic switch failed, reverting");
                match self.revert(&previous, &applied).await {
                    Ok(reverted_to) => Err(SwitchError::Reverted {
                        cause: Box::new(cause),
                        reverted_to,
                    }),
                    Err(revert) => Err(SwitchError::RevertFailed {
                        cause: Box::new(cause),
                        revert: revert.to_string(),
                    }),
                }
            }
        }
    }

    /// Reject unknown ids and list every registered environment.
    fn normalize(&self, weights: Weights) -> Result<Weights, SwitchError> {
        let known = self.store.environment_ids()?;
        if let Some(unknown) = weights.keys().find(|id| !known.contains(id)) {
            return Err(WeightsError::UnknownEnvironment(*unknown).into());
        }
        let mut full: Weights = known.into_iter().map(|id| (id, 0)).collect();
        full.extend(weights);
        check_weights(&full)?;
        Ok(full)
    }

    async fn commit(
        &self,
        expected: Revision,
        weights: Weights,
        mode: TrafficMode,
    ) -> Result<TrafficState, SwitchError> {
        let state = self
            .retry
            .retry("traffic commit", StateError::is_transient, |_| {
                let store = self.store.clone();
                let weights = weights.clone();
                async move { store.replace_traffic(expected, weights, mode, epoch_millis()) }
            })
            .await?;
        Ok(state)
    }

    /// Signal the router and verify it adopted `state`.
    async fn publish(&self, state: &TrafficState) -> Result<(), SwitchError> {
        self.retry
            .retry("router reload", RouterError::is_transient, |_| {
                let router = self.router.clone();
                let state = state.clone();
                async move { router.reload(&state).await }
            })
            .await
            .map_err(SwitchError::Reload)?;

        if self.wait_for_adoption(state).await {
            Ok(())
        } else {
            Err(SwitchError::NotAdopted {
                revision: state.revision,
                timeout_ms: self.adoption_timeout.as_millis() as u64,
            })
        }
    }

    async fn wait_for_adoption(&self, state: &TrafficState) -> bool {
        let deadline = Instant::now() + self.adoption_timeout;
        loop {
            match self.router.current_config().await {
                Ok(Some(serving)) if serving.revision == state.revision && serving.weights == state.weights => {
                    return true;
                }
                Ok(serving) => {
                    debug!(
                        want = state.revision,
                        serving = ?serving.map(|s| s.revision),
                        "router has not adopted revision yet"
                    );
                }
                Err(e) => debug!(error = %e, "router config read failed"),
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(ADOPTION_POLL).await;
        }
    }

    /// Commit the prior weights as a new revision and push them out.
    async fn revert(&self, previous: &TrafficState, applied: &TrafficState) -> Result<Revision, SwitchError> {
        let reverted = self
            .commit(applied.revision, previous.weights.clone(), previous.mode)
            .await?;
        self.publish(&reverted).await?;
        info!(
            revision = reverted.revision,
            restored_from = previous.revision,
            "traffic reverted"
        );
        Ok(reverted.revision)
    }
}
