//! Live jobs per context.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use crate::job::JobHandle;

/// Every queued or running job, grouped by context id.
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: Mutex<HashMap<String, Vec<JobHandle>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, handle: JobHandle) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.entry(handle.context_id().to_string())
            .or_default()
            .push(handle);
    }

    pub(crate) fn remove(&self, context_id: &str, job_id: Uuid) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = jobs.get_mut(context_id) {
            list.retain(|j| j.id() != job_id);
            if list.is_empty() {
                jobs.remove(context_id);
            }
        }
    }

    /// Live jobs on a context, in scheduling order.
    pub fn jobs(&self, context_id: &str) -> Vec<JobHandle> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Live jobs on a context running `operation`.
    pub fn jobs_for_operation(&self, context_id: &str, operation: &str) -> Vec<JobHandle> {
        self.jobs(context_id)
            .into_iter()
            .filter(|j| j.operation() == operation)
            .collect()
    }

    pub fn get(&self, job_id: Uuid) -> Option<JobHandle> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .find(|j| j.id() == job_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
