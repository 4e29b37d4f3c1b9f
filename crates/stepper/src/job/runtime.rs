//! Job-local execution state.
//!
//! Step instances are tracked in a flat arena keyed by [`FullQualifiedId`];
//! the arena also keeps the order in which instances succeeded, which is
//! the order rollback walks backwards.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::config::StepperConfig;
use crate::context::StepContext;
use crate::diagnostics::DiagnosticsSink;
use crate::error::{Result, StepperError};
use crate::id::FullQualifiedId;
use crate::progress::ProgressMonitor;
use crate::properties::PropertiesContainer;
use crate::step::{StepDefinition, StepEnv, StepState};

/// Runtime record of one step instance.
#[derive(Debug)]
pub(crate) struct StepRecord {
    pub definition: Arc<StepDefinition>,
    pub state: StepState,
    pub env: StepEnv,
}

#[derive(Debug, Default)]
pub(crate) struct StepArena {
    records: HashMap<FullQualifiedId, StepRecord>,
    completed: Vec<FullQualifiedId>,
}

impl StepArena {
    pub fn insert(&mut self, id: FullQualifiedId, definition: Arc<StepDefinition>, env: StepEnv) -> Result<()> {
        if self.records.contains_key(&id) {
            return Err(StepperError::Configuration(format!(
                "step instance '{}' already exists in this job",
                id
            )));
        }
        self.records.insert(
            id,
            StepRecord {
                definition,
                state: StepState::Created,
                env,
            },
        );
        Ok(())
    }

    pub fn get(&self, id: &FullQualifiedId) -> Option<&StepRecord> {
        self.records.get(id)
    }

    pub fn state(&self, id: &FullQualifiedId) -> Option<StepState> {
        self.records.get(id).map(|r| r.state)
    }

    pub fn transition(&mut self, id: &FullQualifiedId, next: StepState) -> Result<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StepperError::not_found("Step instance", id.to_string()))?;
        if !record.state.can_transition_to(next) {
            return Err(StepperError::IllegalTransition {
                step: id.to_string(),
                from: record.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::trace!(step = %id, from = %record.state, to = %next, "Step state");
        record.state = next;
        Ok(())
    }

    pub fn record_completion(&mut self, id: &FullQualifiedId) {
        self.completed.push(id.clone());
    }

    /// Succeeded instances, most recently completed first.
    pub fn succeeded_newest_first(&self) -> Vec<FullQualifiedId> {
        self.completed
            .iter()
            .rev()
            .filter(|id| self.state(id) == Some(StepState::Succeeded))
            .cloned()
            .collect()
    }

    /// Every instance with its state, in completion order first, then the rest by id.
    pub fn states(&self) -> Vec<(FullQualifiedId, StepState)> {
        let mut out: Vec<(FullQualifiedId, StepState)> = self
            .completed
            .iter()
            .filter_map(|id| self.state(id).map(|s| (id.clone(), s)))
            .collect();
        let mut rest: Vec<(FullQualifiedId, StepState)> = self
            .records
            .iter()
            .filter(|(id, _)| !self.completed.contains(*id))
            .map(|(id, r)| (id.clone(), r.state))
            .collect();
        rest.sort_by(|a, b| a.0.cmp(&b.0));
        out.extend(rest);
        out
    }
}

/// State shared by every step of one running job. Owned by the job task.
pub(crate) struct JobRuntime {
    pub job_id: Uuid,
    pub label: String,
    pub context: Arc<dyn StepContext>,
    pub data: PropertiesContainer,
    pub progress: ProgressMonitor,
    pub config: Arc<StepperConfig>,
    pub diagnostics: Arc<dyn DiagnosticsSink>,
    pub arena: StepArena,
    /// Declared ids of steps and groups that completed successfully.
    pub executed: HashSet<String>,
    pub failed_at: Option<FullQualifiedId>,
    current: Arc<Mutex<Option<FullQualifiedId>>>,
}

impl JobRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: Uuid,
        label: String,
        context: Arc<dyn StepContext>,
        data: PropertiesContainer,
        progress: ProgressMonitor,
        config: Arc<StepperConfig>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        current: Arc<Mutex<Option<FullQualifiedId>>>,
    ) -> Self {
        Self {
            job_id,
            label,
            context,
            data,
            progress,
            config,
            diagnostics,
            arena: StepArena::default(),
            executed: HashSet::new(),
            failed_at: None,
            current,
        }
    }

    pub fn env_for(&self, id: FullQualifiedId, parameters: Arc<HashMap<String, String>>) -> StepEnv {
        StepEnv {
            context: Arc::clone(&self.context),
            data: self.data.clone(),
            id,
            progress: self.progress.clone(),
            parameters,
        }
    }

    pub fn set_current(&self, id: Option<FullQualifiedId>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{env_at, Recorder};

    #[test]
    fn test_arena_rejects_duplicates_and_illegal_transitions() {
        let recorder = Recorder::new();
        let def = Arc::new(recorder.step("a"));
        let id = FullQualifiedId::new("g").child("a");
        let mut arena = StepArena::default();

        arena.insert(id.clone(), def.clone(), env_at(id.clone())).unwrap();
        assert!(arena.insert(id.clone(), def, env_at(id.clone())).is_err());

        let err = arena.transition(&id, StepState::Running).unwrap_err();
        assert!(matches!(err, StepperError::IllegalTransition { .. }));
        arena.transition(&id, StepState::Initialized).unwrap();
        assert_eq!(arena.state(&id), Some(StepState::Initialized));
    }

    #[test]
    fn test_succeeded_newest_first() {
        let recorder = Recorder::new();
        let mut arena = StepArena::default();
        for name in ["a", "b", "c"] {
            let id = FullQualifiedId::new(name);
            arena
                .insert(id.clone(), Arc::new(recorder.step(name)), env_at(id.clone()))
                .unwrap();
            for state in [
                StepState::Initialized,
                StepState::Validated,
                StepState::Running,
                StepState::Succeeded,
            ] {
                arena.transition(&id, state).unwrap();
            }
            arena.record_completion(&id);
        }
        arena.transition(&FullQualifiedId::new("b"), StepState::RollingBack).unwrap();

        let order: Vec<String> = arena
            .succeeded_newest_first()
            .iter()
            .map(|i| i.to_string())
            .collect();
        assert_eq!(order, vec!["c", "a"]);
    }
}
