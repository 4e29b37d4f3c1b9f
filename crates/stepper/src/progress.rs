//! Cancellation and work reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    cancelable: bool,
    cancel: watch::Sender<bool>,
    total: AtomicU64,
    worked: AtomicU64,
    task: Mutex<String>,
    sub_task: Mutex<String>,
}

/// Cooperative cancellation flag and progress counter shared by a job and its steps.
///
/// Cancellation only sets a flag: the engine checks it between steps and
/// forwards it once to the step in flight. A monitor created with
/// [`ProgressMonitor::not_cancelable`] ignores [`cancel`](Self::cancel).
#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    inner: Arc<Inner>,
}

impl Default for ProgressMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self::with_cancelable(true)
    }

    pub fn not_cancelable() -> Self {
        Self::with_cancelable(false)
    }

    fn with_cancelable(cancelable: bool) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cancelable,
                cancel,
                total: AtomicU64::new(0),
                worked: AtomicU64::new(0),
                task: Mutex::new(String::new()),
                sub_task: Mutex::new(String::new()),
            }),
        }
    }

    pub fn is_cancelable(&self) -> bool {
        self.inner.cancelable
    }

    /// Request cancellation. Returns false if the monitor ignores it.
    pub fn cancel(&self) -> bool {
        if !self.inner.cancelable {
            tracing::debug!("Cancel ignored by non-cancelable monitor");
            return false;
        }
        self.inner.cancel.send_replace(true);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.cancel.subscribe();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Start a task with the given work estimate.
    pub fn begin_task(&self, name: impl Into<String>, total: u64) {
        let name = name.into();
        tracing::trace!(task = %name, total, "Begin task");
        *self.inner.task.lock().unwrap_or_else(PoisonError::into_inner) = name;
        self.inner.total.fetch_add(total, Ordering::Relaxed);
    }

    pub fn sub_task(&self, name: impl Into<String>) {
        *self.inner.sub_task.lock().unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    pub fn worked(&self, units: u64) {
        self.inner.worked.fetch_add(units, Ordering::Relaxed);
    }

    /// Mark the remaining work of the current task as done.
    pub fn done(&self) {
        let total = self.inner.total.load(Ordering::Relaxed);
        self.inner.worked.fetch_max(total, Ordering::Relaxed);
    }

    pub fn task(&self) -> String {
        self.inner.task.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn current_sub_task(&self) -> String {
        self.inner
            .sub_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// (worked, total) work units.
    pub fn work(&self) -> (u64, u64) {
        (
            self.inner.worked.load(Ordering::Relaxed),
            self.inner.total.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let monitor = ProgressMonitor::new();
        let waiter = monitor.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        assert!(!monitor.is_cancelled());
        assert!(monitor.cancel());
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(monitor.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_cancelable_ignores_cancel() {
        let monitor = ProgressMonitor::not_cancelable();
        assert!(!monitor.cancel());
        assert!(!monitor.is_cancelled());
        let waited = tokio::time::timeout(Duration::from_secs(5), monitor.cancelled()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_work_accounting() {
        let monitor = ProgressMonitor::new();
        monitor.begin_task("connect", 100);
        monitor.worked(40);
        assert_eq!(monitor.work(), (40, 100));
        monitor.done();
        assert_eq!(monitor.work(), (100, 100));
        assert_eq!(monitor.task(), "connect");
    }
}
