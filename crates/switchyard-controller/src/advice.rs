//! Acting on rollback advice from the continuous monitor.
//!
//! Advice is only a hint. The controller probes the plan's target itself
//! and aborts the plan only if that probe fails too. Declined advice is not
//! remembered; the monitor advises again after its cooldown.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use switchyard_monitor::RollbackAdvice;
use switchyard_state::PlanStatus;

use crate::controller::DeploymentController;

impl DeploymentController {
    /// Handle one piece of advice. Returns true if a plan was aborted.
    pub async fn handle_advice(&self, advice: &RollbackAdvice) -> bool {
        let plan = match self.store().get_plan(&advice.plan_id) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                warn!(plan = %advice.plan_id, "advice for unknown plan");
                return false;
            }
            Err(e) => {
                warn!(plan = %advice.plan_id, error = %e, "could not load advised plan");
                return false;
            }
        };
        if plan.status != PlanStatus::Running {
            debug!(plan = %plan.id, status = ?plan.status, "advised plan already finished");
            return false;
        }
        if self.abort_pending(&plan.id) {
            debug!(plan = %plan.id, "advised plan is already aborting");
            return false;
        }

        let verdict = self.planner().probe_and_record(plan.target).await;
        if verdict.healthy {
            info!(
                plan = %plan.id,
                target = %plan.target,
                reason = %advice.reason,
                "rollback advice not confirmed by health check, continuing"
            );
            return false;
        }

        warn!(plan = %plan.id, reason = %advice.reason, "rollback advice confirmed, aborting plan");
        match self.abort(&plan.id) {
            Ok(()) => true,
            Err(e) => {
                warn!(plan = %plan.id, error = %e, "could not abort advised plan");
                false
            }
        }
    }

    /// Consume advice until the channel closes or `shutdown` flips.
    pub async fn run_advice_loop(
        self: Arc<Self>,
        mut advice: mpsc::Receiver<RollbackAdvice>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("rollback advice loop started");
        loop {
            tokio::select! {
                next = advice.recv() => match next {
                    Some(advice) => {
                        self.handle_advice(&advice).await;
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("rollback advice loop stopped");
    }
}
