//! Stepper - dependency-ordered, cancellable step execution.
//!
//! Runs multi-step operations (connect, launch, attach, detach) against a
//! target context. Operations are step groups: ordered, optionally iterated
//! compositions of opaque asynchronous steps.
//!
//! This crate provides:
//! - Hierarchical step instance ids and scoped job data
//! - Stable dependency ordering with cycle detection
//! - The per-step state machine with bounded cancellation
//! - Step group composition and iterators
//! - Per-context FIFO scheduling of jobs
//! - Reverse-order rollback of completed steps
//! - Operation services, run history and diagnostics

pub mod callback;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod group;
pub mod history;
pub mod id;
pub mod job;
pub mod operation;
pub mod plan;
pub mod progress;
pub mod properties;
pub mod registry;
pub mod resolver;
pub mod rollback;
pub mod step;
pub mod stepper;
pub mod steps;

#[cfg(test)]
pub(crate) mod test_support;

pub use callback::{StepCallback, StepStatus};
pub use config::StepperConfig;
pub use context::{NamedContext, StepContext};
pub use diagnostics::{Diagnostic, DiagnosticLevel, DiagnosticsSink, MemoryDiagnostics, TracingDiagnostics};
pub use error::{ErrorKind, Result, StepperError};
pub use group::iterator::{IteratorFactory, ListIterator, RepeatIterator, StepGroupIterator};
pub use group::{StepGroup, StepGroupable};
pub use history::{HistoryEntry, HistoryStore, InMemoryHistory};
pub use id::FullQualifiedId;
pub use job::scheduler::{ContextRule, SchedulingRuleProvider};
pub use job::tracker::JobTracker;
pub use job::{JobCallback, JobHandle, JobOptions, JobOutcome, JobState};
pub use operation::{OperationEntry, OperationService, StaticOperationService};
pub use progress::ProgressMonitor;
pub use properties::{keys, PropertiesContainer};
pub use registry::StepRegistry;
pub use rollback::RollbackReport;
pub use step::{CancelTimeout, Step, StepDefinition, StepEnv, StepState};
pub use stepper::{Stepper, StepperBuilder};
pub use steps::CancelJobsStep;
