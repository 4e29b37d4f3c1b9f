//! Cancel the other jobs of a context.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use crate::callback::StepCallback;
use crate::job::tracker::JobTracker;
use crate::properties::keys;
use crate::step::{Step, StepEnv};

/// Cancels every other cancelable job on the step's context and waits for
/// them to finish before calling back.
///
/// Typically the first step of a disconnect: queued jobs finish at once,
/// running ones get their own cancel-timeout to wind down.
#[derive(Debug, Clone)]
pub struct CancelJobsStep {
    tracker: Arc<JobTracker>,
}

impl CancelJobsStep {
    pub fn new(tracker: Arc<JobTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Step for CancelJobsStep {
    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        let own = env.data.get_str(keys::JOB_ID);
        let others: Vec<_> = self
            .tracker
            .jobs(env.context.id())
            .into_iter()
            .filter(|job| Some(job.id().to_string()) != own)
            .filter(|job| job.is_cancelable() && !job.is_finished())
            .collect();

        if !others.is_empty() {
            tracing::info!(
                context = %env.context.id(),
                jobs = others.len(),
                "Cancelling running jobs"
            );
        }
        for job in &others {
            job.cancel();
        }
        join_all(others.iter().map(|job| job.wait())).await;
        callback.ok();
    }
}
