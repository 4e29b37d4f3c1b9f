//! Steps that drive a [`SimulatedTarget`].

use async_trait::async_trait;
use serde_json::Value;
use stepper::{Result, Step, StepCallback, StepContext, StepEnv, StepStatus, StepperError};

use crate::target::{ConnectState, ProcessState, SimulatedTarget};

const PREVIOUS_CONNECT_STATE: &str = "previousConnectState";
const PREVIOUS_PROCESS_STATE: &str = "previousProcessState";
const LAUNCHED: &str = "launchedProcesses";

fn target(env: &StepEnv) -> std::result::Result<&SimulatedTarget, StepStatus> {
    env.context
        .as_any()
        .downcast_ref::<SimulatedTarget>()
        .ok_or_else(|| StepStatus::error(format!("'{}' is not a simulated target", env.context.id())))
}

/// Common prologue: resolve the target, honour injected failures and take
/// the simulated round trip.
async fn call(env: &StepEnv) -> std::result::Result<&SimulatedTarget, StepStatus> {
    let target = target(env)?;
    tokio::select! {
        _ = tokio::time::sleep(target.latency()) => {}
        _ = env.progress.cancelled() => {
            return Err(StepStatus::cancelled(format!("{} interrupted", env.id)));
        }
    }
    if let Some(message) = target.injected_failure(env) {
        return Err(StepStatus::error(message));
    }
    Ok(target)
}

/// Process names listed under the `processes` job key.
fn processes(env: &StepEnv) -> Vec<String> {
    match env.attribute("processes") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(name)) => vec![name],
        _ => Vec::new(),
    }
}

fn active_process(env: &StepEnv) -> std::result::Result<String, StepStatus> {
    match env.active_context() {
        Value::String(name) if name != env.context.id() => Ok(name),
        _ => Err(StepStatus::error(format!("{} has no active process", env.id))),
    }
}

/// Moves the target's connect state.
///
/// Parameters: `state` (required), `stateOnCancel` and `stateOnError`
/// (applied on rollback, falling back to the state found before execute).
#[derive(Debug, Default)]
pub struct SetConnectStateStep;

impl SetConnectStateStep {
    fn state_param(env: &StepEnv, name: &str) -> Result<Option<ConnectState>> {
        env.parameter(name)
            .map(|raw| {
                raw.parse::<ConnectState>().map_err(|message| StepperError::Validation {
                    step: env.id.to_string(),
                    message,
                })
            })
            .transpose()
    }
}

#[async_trait]
impl Step for SetConnectStateStep {
    fn validate_execute(&self, env: &StepEnv) -> Result<()> {
        if Self::state_param(env, "state")?.is_none() {
            return Err(StepperError::Validation {
                step: env.id.to_string(),
                message: "missing 'state' parameter".into(),
            });
        }
        Self::state_param(env, "stateOnCancel")?;
        Self::state_param(env, "stateOnError")?;
        Ok(())
    }

    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        let target = match call(env).await {
            Ok(target) => target,
            Err(status) => {
                callback.done(status);
                return;
            }
        };
        match Self::state_param(env, "state") {
            Ok(Some(state)) => {
                let previous = target.set_connect_state(state);
                env.set_attribute(PREVIOUS_CONNECT_STATE, previous.to_string());
                tracing::debug!(target_id = %target.id(), from = %previous, to = %state, "Connect state changed");
                callback.ok();
            }
            Ok(None) => {
                callback.done(StepStatus::error("missing 'state' parameter"));
            }
            Err(e) => {
                callback.done(StepStatus::error(e.to_string()));
            }
        }
    }

    async fn rollback(&self, env: &StepEnv, cause: &StepStatus, callback: StepCallback) {
        let target = match target(env) {
            Ok(target) => target,
            Err(status) => {
                callback.done(status);
                return;
            }
        };
        let param = if cause.is_cancelled() { "stateOnCancel" } else { "stateOnError" };
        let restored = Self::state_param(env, param).ok().flatten().or_else(|| {
            env.attribute(PREVIOUS_CONNECT_STATE)
                .and_then(|v| v.as_str().and_then(|s| s.parse().ok()))
        });
        if let Some(state) = restored {
            target.set_connect_state(state);
        }
        callback.ok();
    }
}

#[derive(Debug, Default)]
pub struct OpenChannelStep;

#[async_trait]
impl Step for OpenChannelStep {
    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        match call(env).await {
            Ok(target) => {
                target.set_channel_open(true);
                callback.ok();
            }
            Err(status) => {
                callback.done(status);
            }
        }
    }

    async fn rollback(&self, env: &StepEnv, _cause: &StepStatus, callback: StepCallback) {
        if let Ok(target) = target(env) {
            target.set_channel_open(false);
        }
        callback.ok();
    }
}

/// Waits for the target to answer on the open channel.
#[derive(Debug, Default)]
pub struct WaitForReadyStep;

#[async_trait]
impl Step for WaitForReadyStep {
    fn validate_execute(&self, env: &StepEnv) -> Result<()> {
        let open = env
            .context
            .as_any()
            .downcast_ref::<SimulatedTarget>()
            .is_some_and(SimulatedTarget::is_channel_open);
        if open {
            Ok(())
        } else {
            Err(StepperError::Validation {
                step: env.id.to_string(),
                message: "channel is not open".into(),
            })
        }
    }

    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        callback.done(call(env).await.map(|_| StepStatus::Ok).unwrap_or_else(|s| s));
    }
}

/// Launches every process listed under `processes`.
#[derive(Debug, Default)]
pub struct LaunchProcessStep;

#[async_trait]
impl Step for LaunchProcessStep {
    fn validate_execute(&self, env: &StepEnv) -> Result<()> {
        if processes(env).is_empty() {
            return Err(StepperError::Validation {
                step: env.id.to_string(),
                message: "no processes to launch".into(),
            });
        }
        Ok(())
    }

    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        let target = match call(env).await {
            Ok(target) => target,
            Err(status) => {
                callback.done(status);
                return;
            }
        };
        let names = processes(env);
        for name in &names {
            target.set_process(name, ProcessState::Launched);
        }
        env.set_attribute(LAUNCHED, names);
        callback.ok();
    }

    async fn rollback(&self, env: &StepEnv, _cause: &StepStatus, callback: StepCallback) {
        if let (Ok(target), Some(Value::Array(names))) = (target(env), env.attribute(LAUNCHED)) {
            for name in names.iter().filter_map(Value::as_str) {
                target.remove_process(name);
                tracing::debug!(process = name, "Terminated launched process");
            }
        }
        callback.ok();
    }
}

async fn attach(env: &StepEnv) -> std::result::Result<(), StepStatus> {
    let name = active_process(env)?;
    let target = call(env).await?;
    match target.process(&name) {
        Some(ProcessState::Launched) => {
            target.set_process(&name, ProcessState::Attached);
            Ok(())
        }
        Some(_) => Ok(()),
        None => Err(StepStatus::error(format!("no such process: {}", name))),
    }
}

/// Attaches the debugger to the active process.
#[derive(Debug, Default)]
pub struct AttachContextStep;

#[async_trait]
impl Step for AttachContextStep {
    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        callback.done(attach(env).await.err().unwrap_or(StepStatus::Ok));
    }

    async fn rollback(&self, env: &StepEnv, _cause: &StepStatus, callback: StepCallback) {
        if let (Ok(target), Ok(name)) = (target(env), active_process(env)) {
            if target.process(&name) == Some(ProcessState::Attached) {
                target.set_process(&name, ProcessState::Launched);
            }
        }
        callback.ok();
    }
}

/// Resumes every attached process.
#[derive(Debug, Default)]
pub struct ResumeProcessStep;

#[async_trait]
impl Step for ResumeProcessStep {
    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        let target = match call(env).await {
            Ok(target) => target,
            Err(status) => {
                callback.done(status);
                return;
            }
        };
        let mut resumed = Vec::new();
        for name in target.process_names() {
            if target.process(&name) == Some(ProcessState::Attached) {
                target.set_process(&name, ProcessState::Running);
                resumed.push(name);
            }
        }
        env.set_attribute("resumedProcesses", resumed);
        callback.ok();
    }

    async fn rollback(&self, env: &StepEnv, _cause: &StepStatus, callback: StepCallback) {
        if let (Ok(target), Some(Value::Array(names))) = (target(env), env.attribute("resumedProcesses")) {
            for name in names.iter().filter_map(Value::as_str) {
                target.set_process(name, ProcessState::Attached);
            }
        }
        callback.ok();
    }
}

async fn detach(env: &StepEnv) -> std::result::Result<(), StepStatus> {
    let name = active_process(env)?;
    let target = call(env).await?;
    if let Some(previous) = target.remove_process(&name) {
        env.set_attribute(PREVIOUS_PROCESS_STATE, serde_json::to_value(previous).unwrap_or(Value::Null));
    }
    Ok(())
}

/// Detaches from the active process.
#[derive(Debug, Default)]
pub struct DetachContextStep;

#[async_trait]
impl Step for DetachContextStep {
    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        callback.done(detach(env).await.err().unwrap_or(StepStatus::Ok));
    }

    async fn rollback(&self, env: &StepEnv, _cause: &StepStatus, callback: StepCallback) {
        let previous = env
            .attribute(PREVIOUS_PROCESS_STATE)
            .and_then(|v| serde_json::from_value::<ProcessState>(v).ok());
        if let (Ok(target), Ok(name), Some(state)) = (target(env), active_process(env), previous) {
            target.set_process(&name, state);
        }
        callback.ok();
    }
}

#[derive(Debug, Default)]
pub struct CloseChannelStep;

#[async_trait]
impl Step for CloseChannelStep {
    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        match call(env).await {
            Ok(target) => {
                target.set_channel_open(false);
                callback.ok();
            }
            Err(status) => {
                callback.done(status);
            }
        }
    }

    async fn rollback(&self, env: &StepEnv, _cause: &StepStatus, callback: StepCallback) {
        if let Ok(target) = target(env) {
            target.set_channel_open(true);
        }
        callback.ok();
    }
}
