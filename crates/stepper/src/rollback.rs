//! Compensation after a failed or cancelled run.
//!
//! Every step instance that reached `Succeeded` is rolled back, newest first.
//! Each rollback is awaited without a time limit, like `execute` before any
//! cancel. Rollback failures are logged and reported to the diagnostics
//! sink; they never stop the remaining rollbacks and never replace the
//! failure that ended the run.

use crate::callback::{StepCallback, StepStatus};
use crate::diagnostics::{Diagnostic, DiagnosticLevel};
use crate::error::StepperError;
use crate::id::FullQualifiedId;
use crate::job::runtime::JobRuntime;
use crate::step::runner::{drive, Completion};
use crate::step::StepState;

/// What happened during one rollback pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub rolled_back: Vec<FullQualifiedId>,
    pub failed: Vec<(FullQualifiedId, String)>,
    pub purged_attributes: usize,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub(crate) struct RollbackCoordinator<'a> {
    rt: &'a mut JobRuntime,
}

impl<'a> RollbackCoordinator<'a> {
    pub fn new(rt: &'a mut JobRuntime) -> Self {
        Self { rt }
    }

    /// Roll back every succeeded step, newest first, then purge the data
    /// produced under the failed instance.
    pub async fn run(self, cause: &StepperError) -> RollbackReport {
        let rt = self.rt;
        let status = if cause.is_cancellation() {
            StepStatus::cancelled(cause.to_string())
        } else {
            StepStatus::error(cause.to_string())
        };

        let mut report = RollbackReport::default();
        let targets = rt.arena.succeeded_newest_first();
        if !targets.is_empty() {
            tracing::info!(
                job_id = %rt.job_id,
                steps = targets.len(),
                cause = %cause,
                "Rolling back completed steps"
            );
        }

        for id in targets {
            let Some(record) = rt.arena.get(&id) else {
                continue;
            };
            let definition = record.definition.clone();
            let env = record.env.clone();
            if let Err(e) = rt.arena.transition(&id, StepState::RollingBack) {
                tracing::warn!(step = %id, error = %e, "Skipping rollback");
                continue;
            }
            rt.set_current(Some(id.clone()));

            let (callback, rx) = StepCallback::channel(id.to_string());
            let rollback = definition.step.rollback(&env, &status, callback);
            let completion = drive(rollback, rx).await;

            let failure = match completion {
                Completion::Reported(StepStatus::Ok) => None,
                Completion::Reported(other) => Some(other.message().unwrap_or("rollback failed").to_string()),
                Completion::Dropped => Some("rollback finished without reporting a status".to_string()),
                Completion::TimedOut(after) => Some(format!("rollback timed out after {} ms", after.as_millis())),
            };

            match failure {
                None => {
                    if let Err(e) = rt.arena.transition(&id, StepState::RolledBack) {
                        tracing::warn!(step = %id, error = %e, "Unexpected rollback state");
                    }
                    tracing::debug!(step = %id, "Step rolled back");
                    report.rolled_back.push(id);
                }
                Some(message) => {
                    if let Err(e) = rt.arena.transition(&id, StepState::RollbackFailed) {
                        tracing::warn!(step = %id, error = %e, "Unexpected rollback state");
                    }
                    let err = StepperError::Rollback {
                        step: id.to_string(),
                        message: format!("{}: {}", definition.label, message),
                    };
                    tracing::warn!(job_id = %rt.job_id, step = %id, error = %err, "Rollback failed");
                    rt.diagnostics.report(
                        Diagnostic::new(DiagnosticLevel::Warning, err.to_string())
                            .with_job(rt.job_id)
                            .with_step(id.to_string()),
                    );
                    report.failed.push((id, message));
                }
            }
        }

        if let Some(failed) = rt.failed_at.clone() {
            report.purged_attributes = rt.data.purge_scope(&failed);
            if report.purged_attributes > 0 {
                tracing::debug!(
                    step = %failed,
                    purged = report.purged_attributes,
                    "Purged data of failed step"
                );
            }
        }
        rt.set_current(None);
        report
    }
}
