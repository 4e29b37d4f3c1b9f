//! Steps: the unit of work the engine sequences.
//!
//! A [`StepDefinition`] is the immutable template registered once per id. It
//! carries the declared dependencies and limits plus the [`Step`] behaviour.
//! Behaviours are shared by every instance of the template, so any
//! per-instance scratch data belongs in the job's [`PropertiesContainer`]
//! under [`StepEnv::id`].

pub(crate) mod runner;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::callback::{StepCallback, StepStatus};
use crate::context::StepContext;
use crate::error::{Result, StepperError};
use crate::id::FullQualifiedId;
use crate::progress::ProgressMonitor;
use crate::properties::{keys, PropertiesContainer};

pub use runner::StepState;

/// Everything a step sees while it runs.
///
/// Cheap to clone; hand a clone to spawned work together with the callback.
#[derive(Debug, Clone)]
pub struct StepEnv {
    /// Target context of the job.
    pub context: Arc<dyn StepContext>,
    /// Shared job data.
    pub data: PropertiesContainer,
    /// Address of this instance.
    pub id: FullQualifiedId,
    /// Job progress and cancellation.
    pub progress: ProgressMonitor,
    /// Parameters of the step or group template.
    pub parameters: Arc<HashMap<String, String>>,
}

impl StepEnv {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Scoped read of job data at this instance.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.data.get_scoped(&self.id, key)
    }

    /// Write job data visible to this instance and its descendants.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.set_scoped(&self.id, key, value);
    }

    /// The context a step should act on: staged by an iterator, else the job's context id.
    pub fn active_context(&self) -> Value {
        self.attribute(keys::ACTIVE_CONTEXT)
            .unwrap_or_else(|| Value::String(self.context.id().to_string()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.progress.is_cancelled()
    }

    pub(crate) fn with_id(&self, id: FullQualifiedId) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }
}

/// Behaviour of a step.
///
/// `execute` and `rollback` complete through the callback, not through their
/// return: the engine waits until the callback fires. Steps may call it before
/// returning or hand a clone to spawned work and return immediately.
#[async_trait]
pub trait Step: Send + Sync {
    /// Read configuration from the environment. Must not touch the target.
    fn initialize_from(&self, _env: &StepEnv) -> Result<()> {
        Ok(())
    }

    /// Precondition check before `execute`.
    fn validate_execute(&self, _env: &StepEnv) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, env: &StepEnv, callback: StepCallback);

    /// Cancellation was requested while `execute` is outstanding.
    fn cancel(&self, _env: &StepEnv) {}

    /// Release per-run resources. Called after every run, successful or not.
    fn cleanup(&self, _env: &StepEnv) -> Result<()> {
        Ok(())
    }

    /// Compensate a successful `execute` after a later step failed.
    ///
    /// The engine waits for the callback without a time limit; the
    /// cancel-timeout does not apply here.
    async fn rollback(&self, _env: &StepEnv, _cause: &StepStatus, callback: StepCallback) {
        callback.ok();
    }
}

/// How long the engine waits for a callback after forwarding cancellation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CancelTimeout {
    /// Use the configured default.
    #[default]
    Default,
    After(Duration),
    /// Wait until the step calls back.
    Never,
}

impl CancelTimeout {
    pub fn resolve(self, default: Duration) -> Option<Duration> {
        match self {
            Self::Default => Some(default),
            Self::After(d) => Some(d),
            Self::Never => None,
        }
    }
}

/// Immutable step template.
#[derive(Clone)]
pub struct StepDefinition {
    pub id: String,
    pub label: String,
    pub dependencies: Vec<String>,
    pub singleton: bool,
    pub cancel_timeout: CancelTimeout,
    pub total_work: Option<u64>,
    pub parameters: Arc<HashMap<String, String>>,
    pub step: Arc<dyn Step>,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("dependencies", &self.dependencies)
            .field("singleton", &self.singleton)
            .field("cancel_timeout", &self.cancel_timeout)
            .finish()
    }
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, step: impl Step + 'static) -> Self {
        Self::from_arc(id, Arc::new(step))
    }

    pub fn from_arc(id: impl Into<String>, step: Arc<dyn Step>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            dependencies: Vec::new(),
            singleton: false,
            cancel_timeout: CancelTimeout::Default,
            total_work: None,
            parameters: Arc::new(HashMap::new()),
            step,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Declare a dependency. Duplicates are ignored.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn with_cancel_timeout(mut self, timeout: CancelTimeout) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    pub fn with_total_work(mut self, units: u64) -> Self {
        self.total_work = Some(units);
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.parameters).insert(name.into(), value.into());
        self
    }

    /// Structural checks run at registration.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StepperError::Configuration(
                "step id must not be blank".to_string(),
            ));
        }
        if let Some(dep) = self.dependencies.iter().find(|d| d.trim().is_empty()) {
            return Err(StepperError::Configuration(format!(
                "step '{}' declares a blank dependency id '{}'",
                self.id, dep
            )));
        }
        if self.dependencies.iter().any(|d| d == &self.id) {
            return Err(StepperError::Configuration(format!(
                "step '{}' depends on itself",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Step for Noop {
        async fn execute(&self, _env: &StepEnv, callback: StepCallback) {
            callback.ok();
        }
    }

    #[test]
    fn test_definition_builder() {
        let def = StepDefinition::new("attach", Noop)
            .with_label("Attach")
            .depends_on("connect")
            .depends_on("connect")
            .with_parameter("mode", "full")
            .with_cancel_timeout(CancelTimeout::After(Duration::from_millis(50)));

        assert_eq!(def.dependencies, vec!["connect".to_string()]);
        assert_eq!(def.parameters.get("mode").map(String::as_str), Some("full"));
        assert_eq!(
            def.cancel_timeout.resolve(Duration::from_secs(10)),
            Some(Duration::from_millis(50))
        );
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_blank_ids_rejected() {
        assert!(StepDefinition::new(" ", Noop).validate().is_err());
        assert!(StepDefinition::new("a", Noop).depends_on("").validate().is_err());
        assert!(StepDefinition::new("a", Noop).depends_on("a").validate().is_err());
    }

    #[test]
    fn test_cancel_timeout_never() {
        assert_eq!(CancelTimeout::Never.resolve(Duration::from_secs(1)), None);
        assert_eq!(
            CancelTimeout::Default.resolve(Duration::from_secs(1)),
            Some(Duration::from_secs(1))
        );
    }
}
