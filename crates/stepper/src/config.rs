//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

/// Stepper configuration loaded from environment variables.
///
/// Environment variables are prefixed with `STEPPER_`:
/// - `STEPPER_DEFAULT_CANCEL_TIMEOUT_MS`: cancel-timeout for steps that do not declare one (default: 10000)
/// - `STEPPER_DEFAULT_TOTAL_WORK`: progress work units per step (default: 100)
/// - `STEPPER_HISTORY_CAPACITY`: entries kept per history id (default: 10)
/// - `STEPPER_TRACE_STEPPING`: emit START/DONE/ERROR stepping events (default: false)
/// - `STEPPER_PROFILE_STEPPING`: log per-step durations (default: false)
#[derive(Debug, Clone, Deserialize)]
pub struct StepperConfig {
    /// Cancel-timeout in milliseconds
    #[serde(default = "default_cancel_timeout_ms")]
    pub default_cancel_timeout_ms: u64,

    /// Work units per step
    #[serde(default = "default_total_work")]
    pub default_total_work: u64,

    /// Recent-run history size
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Stepping trace events
    #[serde(default)]
    pub trace_stepping: bool,

    /// Step duration logging
    #[serde(default)]
    pub profile_stepping: bool,
}

fn default_cancel_timeout_ms() -> u64 {
    10_000
}

fn default_total_work() -> u64 {
    100
}

fn default_history_capacity() -> usize {
    10
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            default_cancel_timeout_ms: default_cancel_timeout_ms(),
            default_total_work: default_total_work(),
            history_capacity: default_history_capacity(),
            trace_stepping: false,
            profile_stepping: false,
        }
    }
}

impl StepperConfig {
    /// Load configuration from `STEPPER_*` environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("STEPPER_").from_env::<StepperConfig>()
    }

    /// Default cancel-timeout as a duration.
    pub fn default_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.default_cancel_timeout_ms)
    }
}
