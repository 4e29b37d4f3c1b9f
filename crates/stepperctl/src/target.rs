//! In-process stand-in for a debug target.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stepper::{StepContext, StepEnv};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

impl FromStr for ConnectState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "disconnecting" => Ok(Self::Disconnecting),
            other => Err(format!("unknown connect state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Launched,
    Attached,
    Running,
}

#[derive(Debug, Default)]
struct Inner {
    connect_state: Option<ConnectState>,
    channel_open: bool,
    processes: BTreeMap<String, ProcessState>,
}

/// Snapshot of a [`SimulatedTarget`], printed after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetStatus {
    pub connect_state: ConnectState,
    pub channel_open: bool,
    pub processes: BTreeMap<String, ProcessState>,
}

/// A target whose "hardware" is a few fields behind a mutex.
///
/// Every simulated call takes `latency`. The step named by `fail_at` reports
/// an error instead of doing its work.
#[derive(Debug)]
pub struct SimulatedTarget {
    id: String,
    latency: Duration,
    fail_at: Option<String>,
    inner: Mutex<Inner>,
}

impl SimulatedTarget {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            latency: Duration::from_millis(50),
            fail_at: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing_at(mut self, step: Option<String>) -> Self {
        self.fail_at = step;
        self
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Injected failure for the step instance at `env`, if any.
    pub fn injected_failure(&self, env: &StepEnv) -> Option<String> {
        let declared = env.id.declared_id()?;
        (self.fail_at.as_deref() == Some(declared))
            .then(|| format!("simulated failure in {}", env.id))
    }

    pub fn connect_state(&self) -> ConnectState {
        self.lock().connect_state.unwrap_or(ConnectState::Disconnected)
    }

    /// Set the connect state, returning the previous one.
    pub fn set_connect_state(&self, state: ConnectState) -> ConnectState {
        let previous = self.lock().connect_state.replace(state);
        previous.unwrap_or(ConnectState::Disconnected)
    }

    pub fn is_channel_open(&self) -> bool {
        self.lock().channel_open
    }

    pub fn set_channel_open(&self, open: bool) {
        self.lock().channel_open = open;
    }

    pub fn process(&self, name: &str) -> Option<ProcessState> {
        self.lock().processes.get(name).copied()
    }

    pub fn process_names(&self) -> Vec<String> {
        self.lock().processes.keys().cloned().collect()
    }

    pub fn set_process(&self, name: &str, state: ProcessState) {
        self.lock().processes.insert(name.to_string(), state);
    }

    pub fn remove_process(&self, name: &str) -> Option<ProcessState> {
        self.lock().processes.remove(name)
    }

    pub fn status(&self) -> TargetStatus {
        let inner = self.lock();
        TargetStatus {
            connect_state: inner.connect_state.unwrap_or(ConnectState::Disconnected),
            channel_open: inner.channel_open,
            processes: inner.processes.clone(),
        }
    }
}

impl StepContext for SimulatedTarget {
    fn id(&self) -> &str {
        &self.id
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_state_round_trip() {
        for state in [
            ConnectState::Disconnected,
            ConnectState::Connecting,
            ConnectState::Connected,
            ConnectState::Disconnecting,
        ] {
            assert_eq!(state.to_string().parse::<ConnectState>().unwrap(), state);
        }
        assert!("half-open".parse::<ConnectState>().is_err());
    }

    #[test]
    fn test_status_defaults_to_disconnected() {
        let target = SimulatedTarget::new("board");
        assert_eq!(target.connect_state(), ConnectState::Disconnected);
        assert_eq!(target.set_connect_state(ConnectState::Connecting), ConnectState::Disconnected);
        assert_eq!(target.status().connect_state, ConnectState::Connecting);
    }
}
