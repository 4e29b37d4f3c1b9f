//! Step groups: ordered, optionally iterated compositions of steps and groups.

pub mod iterator;
pub(crate) mod runner;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::context::StepContext;
use crate::error::{Result, StepperError};

/// Per-context predicate deciding whether a child takes part in a run.
#[derive(Clone)]
pub struct Enablement(Arc<dyn Fn(&dyn StepContext) -> bool + Send + Sync>);

impl Enablement {
    pub fn new(predicate: impl Fn(&dyn StepContext) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    pub fn is_enabled(&self, context: &dyn StepContext) -> bool {
        (self.0)(context)
    }
}

impl fmt::Debug for Enablement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Enablement(..)")
    }
}

/// Reference from a group to one of its children.
#[derive(Debug, Clone)]
pub struct ChildRef {
    /// Registered step or group id.
    pub id: String,
    /// Dependencies added on top of the child's own.
    pub dependencies: Vec<String>,
    pub enablement: Option<Enablement>,
}

impl ChildRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            enablement: None,
        }
    }

    pub fn is_enabled(&self, context: &dyn StepContext) -> bool {
        self.enablement
            .as_ref()
            .map_or(true, |e| e.is_enabled(context))
    }
}

/// A group child: either a step or a nested group.
#[derive(Debug, Clone)]
pub enum StepGroupable {
    Step(ChildRef),
    Group(ChildRef),
}

impl StepGroupable {
    pub fn step(id: impl Into<String>) -> Self {
        Self::Step(ChildRef::new(id))
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::Group(ChildRef::new(id))
    }

    pub fn reference(&self) -> &ChildRef {
        match self {
            Self::Step(r) | Self::Group(r) => r,
        }
    }

    fn reference_mut(&mut self) -> &mut ChildRef {
        match self {
            Self::Step(r) | Self::Group(r) => r,
        }
    }

    pub fn id(&self) -> &str {
        &self.reference().id
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        let deps = &mut self.reference_mut().dependencies;
        if !deps.contains(&id) {
            deps.push(id);
        }
        self
    }

    pub fn enabled_when(
        mut self,
        predicate: impl Fn(&dyn StepContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.reference_mut().enablement = Some(Enablement::new(predicate));
        self
    }
}

/// Step group template.
///
/// The child list may change between runs. A locked group refuses changes
/// while any run that planned it is still in flight.
pub struct StepGroup {
    pub id: String,
    pub label: String,
    pub locked: bool,
    pub iterator: Option<String>,
    pub parameters: Arc<HashMap<String, String>>,
    children: RwLock<Vec<StepGroupable>>,
    in_flight: AtomicUsize,
}

impl fmt::Debug for StepGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepGroup")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("locked", &self.locked)
            .field("iterator", &self.iterator)
            .field("children", &self.children())
            .finish()
    }
}

impl StepGroup {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            locked: false,
            iterator: None,
            parameters: Arc::new(HashMap::new()),
            children: RwLock::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn iterated_by(mut self, iterator: impl Into<String>) -> Self {
        self.iterator = Some(iterator.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.parameters).insert(name.into(), value.into());
        self
    }

    pub fn with_child(self, child: StepGroupable) -> Self {
        self.children
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(child);
        self
    }

    /// Snapshot of the declared children.
    pub fn children(&self) -> Vec<StepGroupable> {
        self.children
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs currently holding this group.
    pub fn runs_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn check_mutable(&self) -> Result<()> {
        if self.locked && self.runs_in_flight() > 0 {
            return Err(StepperError::Locked(self.id.clone()));
        }
        Ok(())
    }

    /// Insert a child at `index`, or append when `None`.
    pub fn insert_child(&self, index: Option<usize>, child: StepGroupable) -> Result<()> {
        self.check_mutable()?;
        let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
        match index {
            Some(i) if i <= children.len() => children.insert(i, child),
            Some(i) => {
                return Err(StepperError::Configuration(format!(
                    "index {} out of range for step group '{}'",
                    i, self.id
                )))
            }
            None => children.push(child),
        }
        Ok(())
    }

    pub fn remove_child(&self, id: &str) -> Result<Option<StepGroupable>> {
        self.check_mutable()?;
        let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
        Ok(children
            .iter()
            .position(|c| c.id() == id)
            .map(|i| children.remove(i)))
    }

    pub(crate) fn begin_run(self: &Arc<Self>) -> RunGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        RunGuard {
            group: Arc::clone(self),
        }
    }
}

/// Marks a group as in flight until dropped.
pub(crate) struct RunGuard {
    group: Arc<StepGroup>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.group.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
