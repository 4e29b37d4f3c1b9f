//! Recording test doubles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::callback::{StepCallback, StepStatus};
use crate::context::NamedContext;
use crate::id::FullQualifiedId;
use crate::progress::ProgressMonitor;
use crate::properties::PropertiesContainer;
use crate::step::{Step, StepDefinition, StepEnv};

pub(crate) fn env_at(id: FullQualifiedId) -> StepEnv {
    StepEnv {
        context: Arc::new(NamedContext::new("test")),
        data: PropertiesContainer::new(),
        id,
        progress: ProgressMonitor::new(),
        parameters: Arc::new(HashMap::new()),
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Succeed,
    Fail(&'static str),
    /// Calls back twice: Ok, then an error.
    DoubleCallback,
    /// Runs for the given time, then succeeds.
    Sleep(Duration),
    /// Hands the callback to a spawned task that succeeds after the delay.
    Spawned(Duration),
    /// Never calls back on its own; answers `cancel` with Cancelled.
    HangUntilCancelled,
    /// Never calls back at all.
    Hang,
    /// Returns without ever calling back.
    DropCallback,
    /// Succeeds; its rollback fails.
    FailRollback,
    /// Writes `value` under `key` at its own id, then succeeds.
    Write(&'static str, i64),
    /// Fails `validate_execute` with the message.
    RejectValidation(&'static str),
    /// Succeeds; its rollback takes the given time.
    SlowRollback(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Event {
    pub kind: &'static str,
    pub id: String,
    pub at: Instant,
}

#[derive(Clone, Default)]
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(&self, name: &str) -> StepDefinition {
        self.step_with(name, Behavior::Succeed)
    }

    pub fn step_with(&self, name: &str, behavior: Behavior) -> StepDefinition {
        StepDefinition::new(
            name,
            RecordingStep {
                behavior,
                events: Arc::clone(&self.events),
                pending: Mutex::new(Vec::new()),
            },
        )
    }

    /// A step whose status is computed from its environment.
    pub fn fn_step(
        &self,
        name: &str,
        f: impl Fn(&StepEnv) -> StepStatus + Send + Sync + 'static,
    ) -> StepDefinition {
        StepDefinition::new(
            name,
            FnStep {
                f: Box::new(f),
                events: Arc::clone(&self.events),
            },
        )
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Instance ids of the given event kind, in order.
    pub fn ids(&self, kind: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.id)
            .collect()
    }

    pub fn executed(&self) -> Vec<String> {
        self.ids("execute")
    }

    pub fn rolled_back(&self) -> Vec<String> {
        self.ids("rollback")
    }

    /// (start, end) of every `Sleep` step run.
    pub fn intervals(&self) -> Vec<(String, Instant, Instant)> {
        let events = self.events();
        events
            .iter()
            .filter(|e| e.kind == "start")
            .filter_map(|start| {
                events
                    .iter()
                    .find(|e| e.kind == "end" && e.id == start.id && e.at >= start.at)
                    .map(|end| (start.id.clone(), start.at, end.at))
            })
            .collect()
    }
}

fn record(events: &Mutex<Vec<Event>>, kind: &'static str, id: &FullQualifiedId) {
    events.lock().unwrap().push(Event {
        kind,
        id: id.to_string(),
        at: Instant::now(),
    });
}

struct RecordingStep {
    behavior: Behavior,
    events: Arc<Mutex<Vec<Event>>>,
    pending: Mutex<Vec<StepCallback>>,
}

#[async_trait]
impl Step for RecordingStep {
    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        record(&self.events, "execute", &env.id);
        match &self.behavior {
            Behavior::Succeed
            | Behavior::FailRollback
            | Behavior::SlowRollback(_)
            | Behavior::RejectValidation(_) => {
                callback.ok();
            }
            Behavior::Fail(message) => {
                callback.done(StepStatus::error(*message));
            }
            Behavior::DoubleCallback => {
                callback.ok();
                callback.done(StepStatus::error("second callback"));
            }
            Behavior::Sleep(duration) => {
                record(&self.events, "start", &env.id);
                tokio::time::sleep(*duration).await;
                record(&self.events, "end", &env.id);
                callback.ok();
            }
            Behavior::Spawned(duration) => {
                let duration = *duration;
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    callback.ok();
                });
            }
            Behavior::HangUntilCancelled | Behavior::Hang => {
                self.pending.lock().unwrap().push(callback);
            }
            Behavior::DropCallback => {}
            Behavior::Write(key, value) => {
                env.set_attribute(*key, *value);
                callback.ok();
            }
        }
    }

    fn validate_execute(&self, env: &StepEnv) -> crate::Result<()> {
        match self.behavior {
            Behavior::RejectValidation(message) => Err(crate::StepperError::Validation {
                step: env.id.to_string(),
                message: message.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn cancel(&self, env: &StepEnv) {
        record(&self.events, "cancel", &env.id);
        if let Behavior::HangUntilCancelled = self.behavior {
            for callback in self.pending.lock().unwrap().drain(..) {
                callback.done(StepStatus::cancelled("stopped"));
            }
        }
    }

    fn cleanup(&self, env: &StepEnv) -> crate::Result<()> {
        record(&self.events, "cleanup", &env.id);
        Ok(())
    }

    async fn rollback(&self, env: &StepEnv, _cause: &StepStatus, callback: StepCallback) {
        record(&self.events, "rollback", &env.id);
        match self.behavior {
            Behavior::FailRollback => {
                callback.done(StepStatus::error("compensation refused"));
            }
            Behavior::SlowRollback(duration) => {
                tokio::time::sleep(duration).await;
                record(&self.events, "rolled-back", &env.id);
                callback.ok();
            }
            _ => {
                callback.ok();
            }
        }
    }
}

type StatusFn = Box<dyn Fn(&StepEnv) -> StepStatus + Send + Sync>;

struct FnStep {
    f: StatusFn,
    events: Arc<Mutex<Vec<Event>>>,
}

#[async_trait]
impl Step for FnStep {
    async fn execute(&self, env: &StepEnv, callback: StepCallback) {
        record(&self.events, "execute", &env.id);
        callback.done((self.f)(env));
    }

    async fn rollback(&self, env: &StepEnv, _cause: &StepStatus, callback: StepCallback) {
        record(&self.events, "rollback", &env.id);
        callback.ok();
    }
}
