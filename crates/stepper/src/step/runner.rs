//! Per-step lifecycle.
//!
//! One call to [`run_step`] drives a step instance through
//! `Created → Initialized → Validated → Running → {Succeeded, Failed, Cancelled}`.
//! The job task awaits the step's callback; cancellation observed while
//! waiting is forwarded once through [`Step::cancel`], after which the
//! step's cancel-timeout bounds the wait.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::callback::{StepCallback, StepStatus};
use crate::error::{Result, StepperError};
use crate::id::FullQualifiedId;
use crate::job::runtime::JobRuntime;
use crate::plan::PlannedStep;
use crate::step::{Step, StepEnv};

/// Lifecycle state of one step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Created,
    Initialized,
    Validated,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Initialized => write!(f, "initialized"),
            Self::Validated => write!(f, "validated"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::RollingBack => write!(f, "rolling_back"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::RollbackFailed => write!(f, "rollback_failed"),
        }
    }
}

impl StepState {
    pub fn can_transition_to(self, next: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, next),
            (Created, Initialized)
                | (Initialized, Validated)
                | (Validated, Running)
                | (Running, Succeeded)
                | (Created | Initialized | Validated | Running, Failed | Cancelled)
                | (Succeeded, RollingBack)
                | (RollingBack, RolledBack | RollbackFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::RolledBack | Self::RollbackFailed
        )
    }
}

/// How a suspended call ended.
#[derive(Debug)]
pub(crate) enum Completion {
    Reported(StepStatus),
    /// Every callback clone was dropped without a status.
    Dropped,
    TimedOut(Duration),
}

/// Poll `operation` to completion while waiting for the callback.
///
/// The callback wins: once it fires the rest of `operation` is dropped.
pub(crate) async fn drive<F>(operation: F, mut rx: oneshot::Receiver<StepStatus>) -> Completion
where
    F: Future<Output = ()>,
{
    tokio::pin!(operation);
    let mut returned = false;
    loop {
        tokio::select! {
            biased;
            status = &mut rx => {
                return match status {
                    Ok(status) => Completion::Reported(status),
                    Err(_) => Completion::Dropped,
                };
            }
            _ = &mut operation, if !returned => returned = true,
        }
    }
}

/// Run `execute`, forwarding cancellation once and bounding the wait after it.
async fn execute_and_wait(step: &dyn Step, env: &StepEnv, cancel_timeout: Option<Duration>) -> Completion {
    let (callback, mut rx) = StepCallback::channel(env.id.to_string());
    let operation = step.execute(env, callback);
    tokio::pin!(operation);

    let mut returned = false;
    let mut deadline: Option<tokio::time::Instant> = None;
    let mut cancel_forwarded = false;

    loop {
        let at = deadline;
        let expired = async move {
            match at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            status = &mut rx => {
                return match status {
                    Ok(status) => Completion::Reported(status),
                    Err(_) => Completion::Dropped,
                };
            }
            _ = &mut operation, if !returned => returned = true,
            _ = env.progress.cancelled(), if !cancel_forwarded => {
                cancel_forwarded = true;
                tracing::debug!(step = %env.id, "Forwarding cancellation to step");
                step.cancel(env);
                deadline = cancel_timeout.map(|t| tokio::time::Instant::now() + t);
            }
            _ = expired => {
                return Completion::TimedOut(cancel_timeout.unwrap_or_default());
            }
        }
    }
}

/// Drive one step instance. Failures leave the instance in a terminal state
/// in the job arena and return the error that ends the run.
pub(crate) async fn run_step(rt: &mut JobRuntime, planned: &PlannedStep, id: FullQualifiedId) -> Result<()> {
    let definition = &planned.definition;
    if rt.progress.is_cancelled() {
        return Err(StepperError::Cancelled(format!(
            "{} cancelled before '{}'",
            rt.label, definition.label
        )));
    }

    let env = rt.env_for(id.clone(), definition.parameters.clone());
    rt.arena.insert(id.clone(), definition.clone(), env.clone())?;
    rt.set_current(Some(id.clone()));

    let total = definition.total_work.unwrap_or(rt.config.default_total_work);
    rt.progress.begin_task(definition.label.clone(), total);
    if rt.config.trace_stepping {
        tracing::info!(job_id = %rt.job_id, step = %id, "*** START ({})", definition.label);
    }

    let started = Instant::now();
    let result = lifecycle(rt, planned, &env).await;

    if let Err(e) = definition.step.cleanup(&env) {
        tracing::warn!(step = %id, error = %e, "Step cleanup failed");
    }
    rt.progress.worked(total);

    if rt.config.profile_stepping {
        tracing::info!(
            step = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Step finished"
        );
    }

    match &result {
        Ok(()) => {
            rt.arena.transition(&id, StepState::Succeeded)?;
            rt.arena.record_completion(&id);
            rt.executed.insert(definition.id.clone());
            if rt.config.trace_stepping {
                tracing::info!(job_id = %rt.job_id, step = %id, "*** DONE ({})", definition.label);
            }
        }
        Err(e) => {
            let state = if e.is_cancellation() {
                StepState::Cancelled
            } else {
                StepState::Failed
            };
            rt.arena.transition(&id, state)?;
            rt.failed_at = Some(id.clone());
            if rt.config.trace_stepping {
                let marker = if e.is_cancellation() { "CANCEL" } else { "ERROR" };
                tracing::info!(job_id = %rt.job_id, step = %id, error = %e, "*** {} ({})", marker, definition.label);
            }
        }
    }
    result
}

async fn lifecycle(rt: &mut JobRuntime, planned: &PlannedStep, env: &StepEnv) -> Result<()> {
    let definition = &planned.definition;
    let step = definition.step.as_ref();
    let id = &env.id;

    step.initialize_from(env)
        .map_err(|e| StepperError::execution(id.to_string(), &definition.label, e.to_string()))?;
    rt.arena.transition(id, StepState::Initialized)?;

    if let Some(missing) = planned
        .dependencies
        .iter()
        .find(|dep| !rt.executed.contains(*dep))
    {
        return Err(StepperError::UnresolvedDependency {
            step: id.to_string(),
            dependency: missing.clone(),
        });
    }
    step.validate_execute(env).map_err(|e| match e {
        e @ StepperError::Validation { .. } => e,
        other => StepperError::Validation {
            step: id.to_string(),
            message: other.to_string(),
        },
    })?;
    rt.arena.transition(id, StepState::Validated)?;

    if rt.progress.is_cancelled() {
        return Err(StepperError::Cancelled(format!(
            "{} cancelled before '{}'",
            rt.label, definition.label
        )));
    }

    rt.arena.transition(id, StepState::Running)?;
    let timeout = definition
        .cancel_timeout
        .resolve(rt.config.default_cancel_timeout());

    match execute_and_wait(step, env, timeout).await {
        Completion::Reported(StepStatus::Ok) => Ok(()),
        Completion::Reported(StepStatus::Cancelled(message)) => Err(StepperError::Cancelled(
            format!("{}: {}", definition.label, message),
        )),
        Completion::Reported(StepStatus::Error(message)) if rt.progress.is_cancelled() => {
            tracing::debug!(step = %id, %message, "Error reported after cancellation");
            Err(StepperError::Cancelled(format!("{}: {}", definition.label, message)))
        }
        Completion::Reported(StepStatus::Error(message)) => Err(StepperError::execution(
            id.to_string(),
            &definition.label,
            message,
        )),
        Completion::Dropped => Err(StepperError::execution(
            id.to_string(),
            &definition.label,
            "step finished without reporting a status",
        )),
        Completion::TimedOut(after) => {
            tracing::warn!(
                step = %id,
                timeout_ms = after.as_millis() as u64,
                "Step ignored cancellation, abandoning it"
            );
            Err(StepperError::Timeout {
                step: id.to_string(),
                timeout_ms: after.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use StepState::*;
        assert!(Created.can_transition_to(Initialized));
        assert!(Running.can_transition_to(Cancelled));
        assert!(Validated.can_transition_to(Failed));
        assert!(Succeeded.can_transition_to(RollingBack));
        assert!(RollingBack.can_transition_to(RollbackFailed));

        assert!(!Created.can_transition_to(Running));
        assert!(!Failed.can_transition_to(RollingBack));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!RolledBack.can_transition_to(RollingBack));
    }

    #[tokio::test]
    async fn test_drive_prefers_callback_over_return() {
        let (callback, rx) = StepCallback::channel("s");
        let operation = async move {
            callback.done(StepStatus::error("late"));
        };
        match drive(operation, rx).await {
            Completion::Reported(status) => assert_eq!(status, StepStatus::error("late")),
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drive_detects_dropped_callback() {
        let (callback, rx) = StepCallback::channel("s");
        let operation = async move {
            drop(callback);
        };
        assert!(matches!(drive(operation, rx).await, Completion::Dropped));
    }
}
