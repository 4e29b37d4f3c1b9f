//! Diagnostics for failures no caller is waiting on.
//!
//! Rollback failures and failed jobs that were started without a completion
//! callback end up here instead of in a caller-visible result.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

/// One reported diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub job_id: Option<Uuid>,
    pub operation: Option<String>,
    pub step: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(level: DiagnosticLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            job_id: None,
            operation: None,
            step: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

/// Receiver of engine diagnostics.
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Logs diagnostics through `tracing`.
#[derive(Debug, Default)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn report(&self, d: Diagnostic) {
        let job_id = d.job_id.map(|id| id.to_string()).unwrap_or_default();
        let step = d.step.unwrap_or_default();
        match d.level {
            DiagnosticLevel::Error => {
                tracing::error!(job_id = %job_id, step = %step, "{}", d.message)
            }
            DiagnosticLevel::Warning => {
                tracing::warn!(job_id = %job_id, step = %step, "{}", d.message)
            }
            DiagnosticLevel::Info => {
                tracing::info!(job_id = %job_id, step = %step, "{}", d.message)
            }
        }
    }
}

/// Keeps diagnostics in memory.
#[derive(Debug, Default)]
pub struct MemoryDiagnostics {
    entries: Mutex<Vec<Diagnostic>>,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl DiagnosticsSink for MemoryDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemoryDiagnostics::new();
        let job = Uuid::new_v4();
        sink.report(
            Diagnostic::new(DiagnosticLevel::Warning, "rollback failed")
                .with_job(job)
                .with_step("connect/open"),
        );
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, Some(job));
        assert_eq!(entries[0].step.as_deref(), Some("connect/open"));

        sink.clear();
        assert!(sink.entries().is_empty());
    }
}
