//! Stepper jobs.
//!
//! A job is one execution of a step group against a context. It runs on its
//! own tokio task: it waits for its scheduling rule, plans the group tree,
//! runs the steps, rolls back on failure, records history and finally
//! publishes exactly one [`JobOutcome`].

pub(crate) mod runtime;
pub mod scheduler;
pub mod tracker;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::StepperConfig;
use crate::context::StepContext;
use crate::diagnostics::{Diagnostic, DiagnosticLevel, DiagnosticsSink};
use crate::error::{ErrorKind, StepperError};
use crate::group::runner::run_group;
use crate::history::{history_id, HistoryEntry, HistoryStore};
use crate::id::FullQualifiedId;
use crate::operation::OperationService;
use crate::plan;
use crate::progress::ProgressMonitor;
use crate::properties::{keys, PropertiesContainer};
use crate::registry::StepRegistry;
use crate::rollback::RollbackCoordinator;

use runtime::JobRuntime;
use scheduler::Ticket;
use tracker::JobTracker;

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Cancelled { message: String },
    Failed { kind: ErrorKind, message: String },
}

impl JobOutcome {
    pub fn from_error(error: &StepperError) -> Self {
        if error.is_cancellation() {
            Self::Cancelled {
                message: error.to_string(),
            }
        } else {
            Self::Failed {
                kind: error.kind(),
                message: error.to_string(),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Cancelled { message } | Self::Failed { message, .. } => Some(message),
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Cancelled { message } => write!(f, "cancelled: {}", message),
            Self::Failed { kind, message } => write!(f, "failed ({}): {}", kind, message),
        }
    }
}

/// Coarse job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for the scheduling rule.
    Queued,
    Running,
    Finished,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Options fixed when a job is created.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub name: Option<String>,
    pub cancelable: bool,
    /// Record the run in history when it finishes.
    pub history: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            name: None,
            cancelable: true,
            history: false,
        }
    }
}

/// Invoked exactly once with the job's outcome.
pub type JobCallback = Box<dyn FnOnce(&JobHandle, &JobOutcome) + Send>;

struct JobShared {
    id: Uuid,
    name: String,
    operation: String,
    step_group_id: String,
    context: Arc<dyn StepContext>,
    data: PropertiesContainer,
    progress: ProgressMonitor,
    history: bool,
    current: Arc<Mutex<Option<FullQualifiedId>>>,
    state: Mutex<JobState>,
    outcome: watch::Sender<Option<JobOutcome>>,
}

/// Caller-side view of a job.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.shared.id)
            .field("operation", &self.shared.operation)
            .field("context", &self.shared.context.id())
            .field("state", &self.state())
            .finish()
    }
}

impl JobHandle {
    fn new(
        name: String,
        operation: String,
        step_group_id: String,
        context: Arc<dyn StepContext>,
        data: PropertiesContainer,
        options: &JobOptions,
    ) -> Self {
        let progress = if options.cancelable {
            ProgressMonitor::new()
        } else {
            ProgressMonitor::not_cancelable()
        };
        let (outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(JobShared {
                id: Uuid::new_v4(),
                name,
                operation,
                step_group_id,
                context,
                data,
                progress,
                history: options.history,
                current: Arc::new(Mutex::new(None)),
                state: Mutex::new(JobState::Queued),
                outcome,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn operation(&self) -> &str {
        &self.shared.operation
    }

    pub fn step_group_id(&self) -> &str {
        &self.shared.step_group_id
    }

    pub fn context(&self) -> &Arc<dyn StepContext> {
        &self.shared.context
    }

    pub fn context_id(&self) -> &str {
        self.shared.context.id()
    }

    pub fn data(&self) -> &PropertiesContainer {
        &self.shared.data
    }

    pub fn progress(&self) -> &ProgressMonitor {
        &self.shared.progress
    }

    /// Instance currently executing or rolling back.
    pub fn current_step(&self) -> Option<FullQualifiedId> {
        self.shared
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_cancelable(&self) -> bool {
        self.shared.progress.is_cancelable()
    }

    /// Whether this run is left out of history.
    pub fn skip_history(&self) -> bool {
        !self.shared.history || self.shared.data.get_bool(keys::SKIP_HISTORY)
    }

    pub fn state(&self) -> JobState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: JobState) {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Request cancellation. Returns false for non-cancelable jobs.
    pub fn cancel(&self) -> bool {
        let accepted = self.shared.progress.cancel();
        if accepted {
            tracing::info!(job_id = %self.shared.id, operation = %self.shared.operation, "Job cancel requested");
        }
        accepted
    }

    pub fn is_finished(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        self.shared.outcome.borrow().clone()
    }

    /// Wait for the job to finish.
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.shared.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone())
            .unwrap_or(None);
        outcome.unwrap_or_else(|| JobOutcome::Failed {
            kind: ErrorKind::Execution,
            message: "job finished without an outcome".to_string(),
        })
    }
}

/// Everything the job task needs, assembled by the engine.
pub(crate) struct StepperJob {
    pub handle: JobHandle,
    pub ticket: Ticket,
    pub registry: Arc<StepRegistry>,
    pub config: Arc<StepperConfig>,
    pub diagnostics: Arc<dyn DiagnosticsSink>,
    pub history: Arc<dyn HistoryStore>,
    pub tracker: Arc<JobTracker>,
    pub service: Option<Arc<dyn OperationService>>,
    pub callback: Option<JobCallback>,
}

impl StepperJob {
    /// Create the handle and seed the job data.
    pub fn handle(
        operation: &str,
        step_group_id: &str,
        context: Arc<dyn StepContext>,
        data: PropertiesContainer,
        options: &JobOptions,
    ) -> JobHandle {
        let name = options.name.clone().unwrap_or_else(|| step_group_id.to_string());
        let handle = JobHandle::new(
            name,
            operation.to_string(),
            step_group_id.to_string(),
            context,
            data,
            options,
        );
        handle.data().set_transient(keys::JOB_ID, handle.id().to_string());
        handle.data().set_transient(keys::JOB_OPERATION, operation);
        handle
    }

    pub async fn run(self) -> JobOutcome {
        let StepperJob {
            handle,
            ticket,
            registry,
            config,
            diagnostics,
            history,
            tracker,
            service,
            callback,
        } = self;
        let progress = handle.progress().clone();

        let guard = tokio::select! {
            biased;
            _ = progress.cancelled() => None,
            guard = ticket => Some(guard),
        };

        let (outcome, guard) = match guard {
            None => {
                tracing::info!(job_id = %handle.id(), "Job cancelled while queued");
                (
                    JobOutcome::Cancelled {
                        message: format!("{} cancelled before it started", handle.name()),
                    },
                    None,
                )
            }
            Some(guard) => {
                handle.set_state(JobState::Running);
                tracing::info!(
                    job_id = %handle.id(),
                    operation = %handle.operation(),
                    context = %handle.context_id(),
                    group = %handle.step_group_id(),
                    "Job started"
                );
                let outcome = execute(&handle, &registry, &config, &diagnostics).await;
                (outcome, Some(guard))
            }
        };

        if !handle.skip_history() {
            let data = service
                .as_ref()
                .and_then(|s| s.special_history_data(handle.context().as_ref(), handle.operation(), handle.data()))
                .unwrap_or_else(|| handle.data().clone());
            history.record(
                &history_id(handle.context_id(), handle.operation()),
                HistoryEntry {
                    job_id: handle.id(),
                    context_id: handle.context_id().to_string(),
                    operation: handle.operation().to_string(),
                    step_group_id: handle.step_group_id().to_string(),
                    outcome: outcome.clone(),
                    data: data.snapshot(),
                    recorded_at: Utc::now(),
                },
            );
        }

        tracker.remove(handle.context_id(), handle.id());
        handle.set_state(JobState::Finished);

        match &outcome {
            JobOutcome::Succeeded => {
                tracing::info!(job_id = %handle.id(), operation = %handle.operation(), "Job succeeded")
            }
            JobOutcome::Cancelled { message } => {
                tracing::info!(job_id = %handle.id(), operation = %handle.operation(), %message, "Job cancelled")
            }
            JobOutcome::Failed { kind, message } => {
                tracing::warn!(job_id = %handle.id(), operation = %handle.operation(), %kind, %message, "Job failed")
            }
        }

        match callback {
            Some(callback) => callback(&handle, &outcome),
            None => {
                if let JobOutcome::Failed { message, .. } = &outcome {
                    diagnostics.report(
                        Diagnostic::new(
                            DiagnosticLevel::Error,
                            format!("{}: {}", handle.name(), message),
                        )
                        .with_job(handle.id())
                        .with_operation(handle.operation()),
                    );
                }
            }
        }

        handle.shared.outcome.send_replace(Some(outcome.clone()));
        // The next job on this rule starts only after the outcome is out.
        drop(guard);
        outcome
    }
}

/// Plan and run the step group, rolling back on failure.
async fn execute(
    handle: &JobHandle,
    registry: &StepRegistry,
    config: &Arc<StepperConfig>,
    diagnostics: &Arc<dyn DiagnosticsSink>,
) -> JobOutcome {
    let plan = match plan::build(registry, handle.context().as_ref(), handle.step_group_id()) {
        Ok(plan) => plan,
        Err(e) => {
            tracing::warn!(job_id = %handle.id(), error = %e, "Job configuration rejected");
            return JobOutcome::from_error(&e);
        }
    };

    let mut rt = JobRuntime::new(
        handle.id(),
        handle.name().to_string(),
        Arc::clone(handle.context()),
        handle.data().clone(),
        handle.progress().clone(),
        Arc::clone(config),
        Arc::clone(diagnostics),
        Arc::clone(&handle.shared.current),
    );

    let root = FullQualifiedId::root();
    let result = run_group(&mut rt, &plan, &root).await;
    rt.set_current(None);

    match result {
        Ok(()) => JobOutcome::Succeeded,
        Err(e) => {
            let report = RollbackCoordinator::new(&mut rt).run(&e).await;
            if !report.is_clean() {
                tracing::warn!(
                    job_id = %handle.id(),
                    failed = report.failed.len(),
                    "Rollback incomplete"
                );
            }
            JobOutcome::from_error(&e)
        }
    }
}
