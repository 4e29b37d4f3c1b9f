//! Engine entry point.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::StepperConfig;
use crate::context::StepContext;
use crate::diagnostics::{DiagnosticsSink, TracingDiagnostics};
use crate::error::{Result, StepperError};
use crate::history::{HistoryStore, InMemoryHistory};
use crate::id::FullQualifiedId;
use crate::job::scheduler::{ContextRule, Scheduler, SchedulingRuleProvider};
use crate::job::tracker::JobTracker;
use crate::job::{JobCallback, JobHandle, JobOptions, StepperJob};
use crate::operation::{describe, OperationService};
use crate::plan;
use crate::properties::PropertiesContainer;
use crate::registry::StepRegistry;

/// Runs operations on contexts.
///
/// Cheap to share behind an `Arc`; every job started through it runs on its
/// own tokio task.
pub struct Stepper {
    registry: Arc<StepRegistry>,
    config: Arc<StepperConfig>,
    services: Vec<Arc<dyn OperationService>>,
    rules: Arc<dyn SchedulingRuleProvider>,
    scheduler: Arc<Scheduler>,
    tracker: Arc<JobTracker>,
    history: Arc<dyn HistoryStore>,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl std::fmt::Debug for Stepper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stepper")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("services", &self.services.len())
            .field("jobs", &self.tracker.len())
            .finish()
    }
}

/// Builder for [`Stepper`].
pub struct StepperBuilder {
    registry: Arc<StepRegistry>,
    config: StepperConfig,
    services: Vec<Arc<dyn OperationService>>,
    rules: Option<Arc<dyn SchedulingRuleProvider>>,
    history: Option<Arc<dyn HistoryStore>>,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
    tracker: Option<Arc<JobTracker>>,
}

impl StepperBuilder {
    pub fn config(mut self, config: StepperConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an operation service. Services are asked in the order added.
    pub fn service(mut self, service: Arc<dyn OperationService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn scheduling_rules(mut self, rules: Arc<dyn SchedulingRuleProvider>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Share a job tracker, e.g. with steps registered before the engine exists.
    pub fn tracker(mut self, tracker: Arc<JobTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Stepper {
        let history = self
            .history
            .unwrap_or_else(|| Arc::new(InMemoryHistory::new(self.config.history_capacity)));
        Stepper {
            registry: self.registry,
            config: Arc::new(self.config),
            services: self.services,
            rules: self.rules.unwrap_or_else(|| Arc::new(ContextRule)),
            scheduler: Arc::new(Scheduler::new()),
            tracker: self.tracker.unwrap_or_default(),
            history,
            diagnostics: self
                .diagnostics
                .unwrap_or_else(|| Arc::new(TracingDiagnostics)),
        }
    }
}

impl Stepper {
    pub fn builder(registry: impl Into<Arc<StepRegistry>>) -> StepperBuilder {
        StepperBuilder {
            registry: registry.into(),
            config: StepperConfig::default(),
            services: Vec::new(),
            rules: None,
            history: None,
            diagnostics: None,
            tracker: None,
        }
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &StepperConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// First service that handles `operation` on `context`.
    pub fn service_for(&self, context: &dyn StepContext, operation: &str) -> Option<Arc<dyn OperationService>> {
        self.services
            .iter()
            .find(|s| s.is_handled_operation(context, operation))
            .cloned()
    }

    /// Whether `operation` can currently be started on `context`.
    pub fn is_enabled(&self, context: &dyn StepContext, operation: &str) -> bool {
        self.service_for(context, operation).is_some_and(|s| {
            s.is_enabled(context, operation)
                && s.step_group_id(context, operation)
                    .is_some_and(|id| self.registry.has_group(&id))
        })
    }

    /// Start `operation` on `context`.
    pub fn run(
        &self,
        context: Arc<dyn StepContext>,
        operation: &str,
        data: PropertiesContainer,
    ) -> Result<JobHandle> {
        self.start_operation(context, operation, data, None)
    }

    /// Start `operation` on `context` and invoke `callback` with its outcome.
    pub fn run_with_callback(
        &self,
        context: Arc<dyn StepContext>,
        operation: &str,
        data: PropertiesContainer,
        callback: JobCallback,
    ) -> Result<JobHandle> {
        self.start_operation(context, operation, data, Some(callback))
    }

    fn start_operation(
        &self,
        context: Arc<dyn StepContext>,
        operation: &str,
        data: PropertiesContainer,
        callback: Option<JobCallback>,
    ) -> Result<JobHandle> {
        let unavailable = || StepperError::OperationUnavailable {
            operation: operation.to_string(),
            context: context.name().to_string(),
        };
        let service = self
            .service_for(context.as_ref(), operation)
            .ok_or_else(unavailable)?;
        let descriptor =
            describe(service.as_ref(), context.as_ref(), operation, &data).ok_or_else(unavailable)?;
        let data = service.step_group_data(context.as_ref(), operation, &data);
        let options = JobOptions {
            name: Some(descriptor.name),
            cancelable: descriptor.cancelable,
            history: descriptor.history,
        };
        self.launch(
            context,
            operation,
            &descriptor.step_group_id,
            data,
            options,
            Some(service),
            callback,
        )
    }

    /// Start a step group directly, without an operation service.
    ///
    /// The group id doubles as the operation name.
    pub fn run_group(
        &self,
        context: Arc<dyn StepContext>,
        step_group_id: &str,
        data: PropertiesContainer,
        options: JobOptions,
    ) -> Result<JobHandle> {
        self.launch(context, step_group_id, step_group_id, data, options, None, None)
    }

    /// Like [`run_group`](Self::run_group) with an outcome callback.
    pub fn run_group_with_callback(
        &self,
        context: Arc<dyn StepContext>,
        step_group_id: &str,
        data: PropertiesContainer,
        options: JobOptions,
        callback: JobCallback,
    ) -> Result<JobHandle> {
        self.launch(
            context,
            step_group_id,
            step_group_id,
            data,
            options,
            None,
            Some(callback),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        context: Arc<dyn StepContext>,
        operation: &str,
        step_group_id: &str,
        data: PropertiesContainer,
        options: JobOptions,
        service: Option<Arc<dyn OperationService>>,
        callback: Option<JobCallback>,
    ) -> Result<JobHandle> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            StepperError::Configuration(format!("jobs must be started inside a tokio runtime: {}", e))
        })?;

        let rule = self.rules.rule_key(context.as_ref(), operation);
        let handle = StepperJob::handle(operation, step_group_id, context, data, &options);
        let ticket = self.scheduler.request(rule.clone());
        self.tracker.add(handle.clone());

        tracing::debug!(
            job_id = %handle.id(),
            operation,
            rule = %rule,
            queued = self.scheduler.queued(&rule),
            "Job scheduled"
        );

        let job = StepperJob {
            handle: handle.clone(),
            ticket,
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
            diagnostics: Arc::clone(&self.diagnostics),
            history: Arc::clone(&self.history),
            tracker: Arc::clone(&self.tracker),
            service,
            callback,
        };
        runtime.spawn(job.run());
        Ok(handle)
    }

    /// Resolved step instance order for a group, without running anything.
    ///
    /// Iterated groups are expanded `iterations[group id]` times (once by default).
    pub fn plan(
        &self,
        context: &dyn StepContext,
        step_group_id: &str,
        iterations: &HashMap<String, usize>,
    ) -> Result<Vec<FullQualifiedId>> {
        let plan = plan::build(&self.registry, context, step_group_id)?;
        Ok(plan.flatten(iterations))
    }

    /// Live jobs on a context.
    pub fn jobs(&self, context_id: &str) -> Vec<JobHandle> {
        self.tracker.jobs(context_id)
    }

    /// Cancel every cancelable job on a context. Returns how many accepted.
    pub fn cancel_jobs(&self, context_id: &str) -> usize {
        self.tracker
            .jobs(context_id)
            .iter()
            .filter(|j| j.cancel())
            .count()
    }
}
