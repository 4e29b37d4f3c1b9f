//! Per-context mutual exclusion.
//!
//! Jobs whose scheduling rules share a key run one at a time, in the order
//! they asked for the key. Requests are queued when they are made, not when
//! the job task is first polled, so two jobs scheduled back to back always
//! run in that order.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::context::StepContext;

/// Maps a (context, operation) pair to a mutual-exclusion key.
pub trait SchedulingRuleProvider: Send + Sync {
    fn rule_key(&self, context: &dyn StepContext, operation: &str) -> String;
}

/// Default rule: one job at a time per context id.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextRule;

impl SchedulingRuleProvider for ContextRule {
    fn rule_key(&self, context: &dyn StepContext, _operation: &str) -> String {
        context.id().to_string()
    }
}

#[derive(Debug, Default)]
struct Slot {
    busy: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// FIFO token dispenser keyed by rule key.
#[derive(Debug, Default)]
pub struct Scheduler {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for the token of `key`. The returned ticket resolves to a
    /// [`RuleGuard`] once every earlier request has released it.
    pub fn request(self: &Arc<Self>, key: impl Into<String>) -> Ticket {
        let key = key.into();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key.clone()).or_default();
        let state = if slot.busy {
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(tx);
            tracing::trace!(rule = %key, queued = slot.waiters.len(), "Waiting for scheduling rule");
            TicketState::Waiting(rx)
        } else {
            slot.busy = true;
            TicketState::Granted
        };
        Ticket {
            scheduler: Arc::clone(self),
            key,
            state,
        }
    }

    /// Number of jobs waiting for `key`.
    pub fn queued(&self, key: &str) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |s| s.waiters.len())
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|s| s.busy)
    }

    /// Hand the token to the next live waiter, or free the slot.
    fn release(&self, key: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        while let Some(next) = slot.waiters.pop_front() {
            if next.send(()).is_ok() {
                return;
            }
        }
        slots.remove(key);
    }
}

enum TicketState {
    Granted,
    Waiting(oneshot::Receiver<()>),
    Done,
}

/// A queued request for a scheduling rule.
///
/// Dropping a ticket before it resolves leaves the queue; dropping it after
/// it was granted but before it was awaited releases the token.
pub struct Ticket {
    scheduler: Arc<Scheduler>,
    key: String,
    state: TicketState,
}

impl Future for Ticket {
    type Output = RuleGuard;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<RuleGuard> {
        let this = &mut *self;
        match &mut this.state {
            TicketState::Granted => {}
            // The scheduler outlives every ticket, so the sender is only
            // dropped after sending.
            TicketState::Waiting(rx) => {
                if Pin::new(rx).poll(cx).is_pending() {
                    return Poll::Pending;
                }
            }
            TicketState::Done => return Poll::Pending,
        }
        this.state = TicketState::Done;
        Poll::Ready(RuleGuard {
            scheduler: Arc::clone(&this.scheduler),
            key: this.key.clone(),
        })
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.state, TicketState::Done) {
            TicketState::Granted => self.scheduler.release(&self.key),
            TicketState::Waiting(mut rx) => {
                // A grant may have raced with the drop; pass it on.
                rx.close();
                if rx.try_recv().is_ok() {
                    self.scheduler.release(&self.key);
                }
            }
            TicketState::Done => {}
        }
    }
}

/// Holds a scheduling rule until dropped.
#[derive(Debug)]
pub struct RuleGuard {
    scheduler: Arc<Scheduler>,
    key: String,
}

impl RuleGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for RuleGuard {
    fn drop(&mut self) {
        tracing::trace!(rule = %self.key, "Releasing scheduling rule");
        self.scheduler.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_fifo_grant_order() {
        let scheduler = Arc::new(Scheduler::new());
        let mut first = task::spawn(scheduler.request("ctx"));
        let mut second = task::spawn(scheduler.request("ctx"));
        let mut third = task::spawn(scheduler.request("ctx"));
        assert_eq!(scheduler.queued("ctx"), 2);

        let guard = assert_ready!(first.poll());
        assert_pending!(second.poll());
        assert_pending!(third.poll());

        drop(guard);
        assert!(second.is_woken());
        let guard = assert_ready!(second.poll());
        assert_pending!(third.poll());

        drop(guard);
        let guard = assert_ready!(third.poll());
        drop(guard);
        assert!(!scheduler.is_busy("ctx"));
    }

    #[test]
    fn test_independent_keys() {
        let scheduler = Arc::new(Scheduler::new());
        let mut a = task::spawn(scheduler.request("a"));
        let mut b = task::spawn(scheduler.request("b"));
        let _ga = assert_ready!(a.poll());
        let _gb = assert_ready!(b.poll());
    }

    #[test]
    fn test_abandoned_waiter_is_skipped() {
        let scheduler = Arc::new(Scheduler::new());
        let mut first = task::spawn(scheduler.request("ctx"));
        let abandoned = scheduler.request("ctx");
        let mut third = task::spawn(scheduler.request("ctx"));

        let guard = assert_ready!(first.poll());
        drop(abandoned);
        assert_pending!(third.poll());
        drop(guard);
        let _guard = assert_ready!(third.poll());
    }

    #[test]
    fn test_unpolled_granted_ticket_releases() {
        let scheduler = Arc::new(Scheduler::new());
        drop(scheduler.request("ctx"));
        assert!(!scheduler.is_busy("ctx"));
    }
}
