//! Rollback: restore a plan's baseline in one atomic apply.
//!
//! Rollback is never stepped: the pre-migration weights are applied as a
//! single revision, then the environment that now carries the traffic is
//! probed again. If that environment is unhealthy too there is nothing
//! left to fall back to; a Critical alert goes out and the error is
//! returned for an operator to act on.

use tracing::{error, info, warn};

use switchyard_core::epoch_millis;
use switchyard_state::{
    AlertEvent, AlertKind, EnvironmentRole, MigrationPlan, PlanStatus, Revision, Severity,
};

use crate::error::RollbackError;
use crate::planner::MigrationPlanner;

impl MigrationPlanner {
    /// Roll back a terminal plan.
    ///
    /// A Failed plan moves to RolledBack. A Succeeded plan keeps its
    /// status; only the traffic is restored.
    pub async fn rollback(&self, plan: &mut MigrationPlan) -> Result<Revision, RollbackError> {
        match plan.status {
            PlanStatus::Failed => {
                let revision = self.restore_baseline(plan).await?;
                self.finish_rolled_back(plan);
                Ok(revision)
            }
            PlanStatus::Succeeded => self.restore_baseline(plan).await,
            status => Err(RollbackError::InvalidState {
                id: plan.id.clone(),
                status,
            }),
        }
    }

    /// Rollback path taken by `run` after marking the plan Failed.
    pub(crate) async fn roll_back_failed(&self, plan: &mut MigrationPlan) -> Result<(), RollbackError> {
        self.restore_baseline(plan).await?;
        self.finish_rolled_back(plan);
        Ok(())
    }

    fn finish_rolled_back(&self, plan: &mut MigrationPlan) {
        if let Err(e) = plan.mark_rolled_back(epoch_millis()) {
            error!(plan = %plan.id, error = %e, "could not mark plan rolled back");
        }
        self.persist(plan);
    }

    async fn restore_baseline(&self, plan: &MigrationPlan) -> Result<Revision, RollbackError> {
        let baseline = plan
            .baseline
            .clone()
            .ok_or_else(|| RollbackError::NoBaseline(plan.id.clone()))?;
        let restored = baseline.heaviest_except(None).unwrap_or(plan.source);

        let revision = match self
            .executor
            .apply_with(baseline.weights.clone(), Some(baseline.mode), true)
            .await
        {
            Ok(revision) => revision,
            Err(e) => {
                error!(plan = %plan.id, error = %e, "rollback could not restore baseline");
                self.escalate(plan, format!("rollback of {} could not restore traffic: {e}", plan.id));
                return Err(RollbackError::Switch(e));
            }
        };

        let verdict = self.probe_and_record(restored).await;
        if !verdict.healthy {
            let failing: Vec<String> = verdict.failing_checks().iter().map(|c| c.to_string()).collect();
            // Nothing healthy to call Active until an operator intervenes.
            self.set_role(restored, EnvironmentRole::Draining);
            if plan.target != restored {
                self.set_role(plan.target, EnvironmentRole::Standby);
            }
            error!(
                plan = %plan.id,
                environment = %restored,
                failing = ?failing,
                "rolled back onto an unhealthy environment"
            );
            self.escalate(
                plan,
                format!(
                    "rollback of {} restored traffic to {restored}, which is unhealthy ({})",
                    plan.id,
                    failing.join(", ")
                ),
            );
            return Err(RollbackError::RestoredUnhealthy {
                environment: restored,
                failing,
            });
        }

        self.set_role(restored, EnvironmentRole::Active);
        if plan.target != restored {
            self.set_role(plan.target, EnvironmentRole::Standby);
        }
        info!(plan = %plan.id, revision, environment = %restored, "rollback complete");
        Ok(revision)
    }

    fn escalate(&self, plan: &MigrationPlan, message: String) {
        let mut event = AlertEvent::new(
            AlertKind::RollbackFailed,
            Severity::Critical,
            Some(plan.source),
            message,
            epoch_millis(),
        );
        event.cooldown_key = format!("{}:{}", AlertKind::RollbackFailed.as_str(), plan.id);
        if !self.alerts.publish(event) {
            warn!(plan = %plan.id, "rollback alert suppressed by cooldown");
        }
    }
}
