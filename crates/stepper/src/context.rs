//! Target contexts.

use std::any::Any;
use std::fmt;

/// The remote entity a job operates on (device, target, process).
///
/// The engine only uses [`id`](StepContext::id) for scheduling and tracking
/// and [`name`](StepContext::name) in messages. Steps downcast through
/// [`as_any`](StepContext::as_any) to reach their concrete context.
pub trait StepContext: Send + Sync + fmt::Debug {
    /// Stable identity; jobs with the same id are serialized.
    fn id(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str {
        self.id()
    }

    fn as_any(&self) -> &dyn Any;
}

/// Minimal context carrying only an id and a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedContext {
    id: String,
    name: String,
}

impl NamedContext {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl StepContext for NamedContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
