//! Operation services: what a named operation means for a context.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::StepContext;
use crate::properties::PropertiesContainer;

/// Resolves (context, operation) pairs to step groups and job options.
///
/// Consulted once, when a job is started. Default methods describe a
/// cancelable, history-less operation.
pub trait OperationService: Send + Sync {
    fn is_handled_operation(&self, context: &dyn StepContext, operation: &str) -> bool;

    fn step_group_id(&self, context: &dyn StepContext, operation: &str) -> Option<String>;

    /// Job name; defaults to the step group id.
    fn step_group_name(&self, _context: &dyn StepContext, _operation: &str) -> Option<String> {
        None
    }

    fn is_enabled(&self, _context: &dyn StepContext, _operation: &str) -> bool {
        true
    }

    fn is_cancelable(&self, _context: &dyn StepContext, _operation: &str) -> bool {
        true
    }

    fn add_to_history(&self, _context: &dyn StepContext, _operation: &str) -> bool {
        false
    }

    /// Data to record instead of the job data.
    fn special_history_data(
        &self,
        _context: &dyn StepContext,
        _operation: &str,
        _data: &PropertiesContainer,
    ) -> Option<PropertiesContainer> {
        None
    }

    /// Whether `data` is complete enough to start the operation.
    fn validate_step_data(&self, _context: &dyn StepContext, _operation: &str, _data: &PropertiesContainer) -> bool {
        true
    }

    /// Initial job data, derived from what the caller supplied.
    fn step_group_data(
        &self,
        _context: &dyn StepContext,
        _operation: &str,
        data: &PropertiesContainer,
    ) -> PropertiesContainer {
        data.clone()
    }
}

/// Everything a job needs to know about its operation.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    pub operation: String,
    pub step_group_id: String,
    pub name: String,
    pub cancelable: bool,
    pub history: bool,
}

/// Ask `service` about `operation` on `context`. `None` when the operation is
/// not handled, not enabled, has no step group or rejects the data.
pub fn describe(
    service: &dyn OperationService,
    context: &dyn StepContext,
    operation: &str,
    data: &PropertiesContainer,
) -> Option<OperationDescriptor> {
    if !service.is_handled_operation(context, operation) || !service.is_enabled(context, operation) {
        return None;
    }
    let step_group_id = service.step_group_id(context, operation)?;
    if !service.validate_step_data(context, operation, data) {
        tracing::debug!(operation, context = %context.id(), "Step data rejected");
        return None;
    }
    Some(OperationDescriptor {
        operation: operation.to_string(),
        name: service
            .step_group_name(context, operation)
            .unwrap_or_else(|| step_group_id.clone()),
        step_group_id,
        cancelable: service.is_cancelable(context, operation),
        history: service.add_to_history(context, operation),
    })
}

/// One operation entry of a [`StaticOperationService`].
#[derive(Debug, Clone)]
pub struct OperationEntry {
    pub step_group_id: String,
    pub name: Option<String>,
    pub cancelable: bool,
    pub history: bool,
    /// Keys that must be present in the caller's data.
    pub required_keys: Vec<String>,
}

impl OperationEntry {
    pub fn new(step_group_id: impl Into<String>) -> Self {
        Self {
            step_group_id: step_group_id.into(),
            name: None,
            cancelable: true,
            history: false,
            required_keys: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn not_cancelable(mut self) -> Self {
        self.cancelable = false;
        self
    }

    pub fn with_history(mut self) -> Self {
        self.history = true;
        self
    }

    pub fn requires(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }
}

type ContextFilter = Arc<dyn Fn(&dyn StepContext) -> bool + Send + Sync>;

/// Table-driven operation service.
#[derive(Default, Clone)]
pub struct StaticOperationService {
    operations: HashMap<String, OperationEntry>,
    filter: Option<ContextFilter>,
}

impl std::fmt::Debug for StaticOperationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticOperationService")
            .field("operations", &self.operations)
            .finish()
    }
}

impl StaticOperationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: impl Into<String>, entry: OperationEntry) -> Self {
        self.operations.insert(operation.into(), entry);
        self
    }

    /// Only handle contexts accepted by `filter`.
    pub fn for_contexts(mut self, filter: impl Fn(&dyn StepContext) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Sorted operation names.
    pub fn operations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn entry(&self, operation: &str) -> Option<&OperationEntry> {
        self.operations.get(operation)
    }
}

impl OperationService for StaticOperationService {
    fn is_handled_operation(&self, context: &dyn StepContext, operation: &str) -> bool {
        self.operations.contains_key(operation) && self.filter.as_ref().map_or(true, |f| f(context))
    }

    fn step_group_id(&self, _context: &dyn StepContext, operation: &str) -> Option<String> {
        self.operations.get(operation).map(|e| e.step_group_id.clone())
    }

    fn step_group_name(&self, _context: &dyn StepContext, operation: &str) -> Option<String> {
        self.operations.get(operation).and_then(|e| e.name.clone())
    }

    fn is_cancelable(&self, _context: &dyn StepContext, operation: &str) -> bool {
        self.operations.get(operation).map_or(true, |e| e.cancelable)
    }

    fn add_to_history(&self, _context: &dyn StepContext, operation: &str) -> bool {
        self.operations.get(operation).is_some_and(|e| e.history)
    }

    fn validate_step_data(&self, _context: &dyn StepContext, operation: &str, data: &PropertiesContainer) -> bool {
        self.operations
            .get(operation)
            .map_or(false, |e| e.required_keys.iter().all(|k| data.contains(k)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NamedContext;

    fn service() -> StaticOperationService {
        StaticOperationService::new()
            .with_operation(
                "connect",
                OperationEntry::new("connect-group").with_name("Connect").with_history(),
            )
            .with_operation("attach", OperationEntry::new("attach-group").requires("processes"))
            .with_operation("flash", OperationEntry::new("flash-group").not_cancelable())
            .for_contexts(|c| c.id() != "offline")
    }

    #[test]
    fn test_describe_handled_operation() {
        let svc = service();
        let ctx = NamedContext::new("board");
        let desc = describe(&svc, &ctx, "connect", &PropertiesContainer::new()).unwrap();
        assert_eq!(desc.step_group_id, "connect-group");
        assert_eq!(desc.name, "Connect");
        assert!(desc.cancelable);
        assert!(desc.history);

        let flash = describe(&svc, &ctx, "flash", &PropertiesContainer::new()).unwrap();
        assert!(!flash.cancelable);
        assert_eq!(flash.name, "flash-group");
    }

    #[test]
    fn test_describe_rejections() {
        let svc = service();
        let data = PropertiesContainer::new();
        assert!(describe(&svc, &NamedContext::new("board"), "unknown", &data).is_none());
        assert!(describe(&svc, &NamedContext::new("offline"), "connect", &data).is_none());
        assert!(describe(&svc, &NamedContext::new("board"), "attach", &data).is_none());

        data.set("processes", serde_json::json!(["p1"]));
        assert!(describe(&svc, &NamedContext::new("board"), "attach", &data).is_some());
    }
}
