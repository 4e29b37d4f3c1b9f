//! Definition registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StepperError};
use crate::group::iterator::IteratorFactory;
use crate::group::StepGroup;
use crate::step::StepDefinition;

/// Step, step group and iterator definitions, keyed by id.
///
/// Built once at startup and shared with the engine through an `Arc`.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<StepDefinition>>,
    groups: HashMap<String, Arc<StepGroup>>,
    iterators: HashMap<String, IteratorFactory>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step template.
    pub fn register_step(&mut self, definition: StepDefinition) -> Result<()> {
        definition.validate()?;
        if self.steps.contains_key(&definition.id) {
            return Err(StepperError::Configuration(format!(
                "step '{}' is already registered",
                definition.id
            )));
        }
        tracing::debug!(step = %definition.id, "Registered step");
        self.steps.insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    /// Register a step group template.
    pub fn register_group(&mut self, group: StepGroup) -> Result<()> {
        if group.id.trim().is_empty() {
            return Err(StepperError::Configuration(
                "step group id must not be blank".to_string(),
            ));
        }
        if self.groups.contains_key(&group.id) {
            return Err(StepperError::Configuration(format!(
                "step group '{}' is already registered",
                group.id
            )));
        }
        tracing::debug!(group = %group.id, "Registered step group");
        self.groups.insert(group.id.clone(), Arc::new(group));
        Ok(())
    }

    /// Register an iterator factory.
    pub fn register_iterator(&mut self, id: impl Into<String>, factory: IteratorFactory) -> Result<()> {
        let id = id.into();
        if self.iterators.contains_key(&id) {
            return Err(StepperError::Configuration(format!(
                "iterator '{}' is already registered",
                id
            )));
        }
        self.iterators.insert(id, factory);
        Ok(())
    }

    pub fn step(&self, id: &str) -> Result<Arc<StepDefinition>> {
        self.steps
            .get(id)
            .cloned()
            .ok_or_else(|| StepperError::not_found("Step", id))
    }

    pub fn group(&self, id: &str) -> Result<Arc<StepGroup>> {
        self.groups
            .get(id)
            .cloned()
            .ok_or_else(|| StepperError::not_found("Step group", id))
    }

    pub fn iterator(&self, id: &str) -> Result<IteratorFactory> {
        self.iterators
            .get(id)
            .cloned()
            .ok_or_else(|| StepperError::not_found("Iterator", id))
    }

    pub fn has_group(&self, id: &str) -> bool {
        self.groups.contains_key(id)
    }

    /// Sorted ids of all registered step groups.
    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sorted ids of all registered steps.
    pub fn step_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.steps.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.step_ids())
            .field("groups", &self.group_ids())
            .field("iterators", &self.iterators.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::iterator::ListIterator;
    use crate::test_support::Recorder;

    #[test]
    fn test_register_and_lookup() {
        let recorder = Recorder::new();
        let mut registry = StepRegistry::new();
        registry.register_step(recorder.step("a")).unwrap();
        registry.register_group(StepGroup::new("g")).unwrap();
        registry.register_iterator("list", ListIterator::factory()).unwrap();

        assert_eq!(registry.step("a").unwrap().id, "a");
        assert!(registry.has_group("g"));
        assert!(registry.iterator("list").is_ok());
        assert_eq!(registry.step_ids(), vec!["a"]);
    }

    #[test]
    fn test_duplicates_rejected() {
        let recorder = Recorder::new();
        let mut registry = StepRegistry::new();
        registry.register_step(recorder.step("a")).unwrap();
        assert!(registry.register_step(recorder.step("a")).is_err());
        registry.register_group(StepGroup::new("g")).unwrap();
        assert!(registry.register_group(StepGroup::new("g")).is_err());
    }

    #[test]
    fn test_missing_lookup() {
        let registry = StepRegistry::new();
        let err = registry.step("nope").unwrap_err();
        assert_eq!(err.to_string(), "Step not found: nope");
    }
}
