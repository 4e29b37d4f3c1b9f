//! Step completion status and the exactly-once callback.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Status a step reports through its callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Cancelled(String),
    Error(String),
}

impl StepStatus {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled(message.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::Cancelled(m) | Self::Error(m) => Some(m),
        }
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for StepStatus {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(e) => Self::Error(e.to_string()),
        }
    }
}

struct Inner {
    step: String,
    sender: Mutex<Option<oneshot::Sender<StepStatus>>>,
    invocations: AtomicUsize,
}

/// Completion callback handed to `execute`, `rollback` and similar suspending calls.
///
/// Clones share the same channel; only the first [`done`](Self::done) across
/// all clones is delivered, later ones are logged and ignored. Dropping every
/// clone without calling `done` is reported to the engine as a missing status.
#[derive(Clone)]
pub struct StepCallback {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StepCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepCallback")
            .field("step", &self.inner.step)
            .field("invocations", &self.invocations())
            .finish()
    }
}

impl StepCallback {
    /// Create a callback and the receiver the engine waits on.
    pub fn channel(step: impl Into<String>) -> (Self, oneshot::Receiver<StepStatus>) {
        let (tx, rx) = oneshot::channel();
        let callback = Self {
            inner: Arc::new(Inner {
                step: step.into(),
                sender: Mutex::new(Some(tx)),
                invocations: AtomicUsize::new(0),
            }),
        };
        (callback, rx)
    }

    /// Report completion. Returns true if this call delivered the status.
    pub fn done(&self, status: StepStatus) -> bool {
        self.inner.invocations.fetch_add(1, Ordering::SeqCst);
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(tx) => {
                if tx.send(status).is_err() {
                    tracing::debug!(step = %self.inner.step, "Callback receiver already gone");
                }
                true
            }
            None => {
                tracing::warn!(
                    step = %self.inner.step,
                    ?status,
                    "Callback invoked more than once, ignoring"
                );
                false
            }
        }
    }

    pub fn ok(&self) -> bool {
        self.done(StepStatus::Ok)
    }

    pub fn is_done(&self) -> bool {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Number of `done` calls observed, including ignored ones.
    pub fn invocations(&self) -> usize {
        self.inner.invocations.load(Ordering::SeqCst)
    }
}
