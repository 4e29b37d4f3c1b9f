//! Pre-run resolution of a step group tree.
//!
//! Before the first step runs, the job expands its root group for the target
//! context: children are filtered by enablement, looked up in the registry
//! and ordered by the dependency resolver, recursively. Every structural
//! problem (unknown ids, cycles, duplicate child ids, repeated singletons,
//! recursive groups) surfaces here, so a misconfigured job fails without
//! executing anything.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::context::StepContext;
use crate::error::{Result, StepperError};
use crate::group::iterator::IteratorFactory;
use crate::group::{RunGuard, StepGroup, StepGroupable};
use crate::id::FullQualifiedId;
use crate::registry::StepRegistry;
use crate::resolver::{self, Dependent};
use crate::step::StepDefinition;

/// A step resolved for one run.
#[derive(Debug)]
pub struct PlannedStep {
    pub definition: Arc<StepDefinition>,
    /// Template dependencies plus those added by the group reference.
    pub dependencies: Vec<String>,
}

/// A group resolved for one run, children in execution order.
pub struct PlannedGroup {
    pub group: Arc<StepGroup>,
    pub dependencies: Vec<String>,
    pub iterator: Option<IteratorFactory>,
    pub children: Vec<PlannedNode>,
    _guard: RunGuard,
}

impl std::fmt::Debug for PlannedGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedGroup")
            .field("group", &self.group.id)
            .field("iterated", &self.iterator.is_some())
            .field("children", &self.children)
            .finish()
    }
}

#[derive(Debug)]
pub enum PlannedNode {
    Step(PlannedStep),
    Group(PlannedGroup),
}

impl PlannedNode {
    pub fn id(&self) -> &str {
        match self {
            Self::Step(s) => &s.definition.id,
            Self::Group(g) => &g.group.id,
        }
    }
}

impl Dependent for PlannedNode {
    fn dependency_id(&self) -> &str {
        self.id()
    }

    fn dependencies(&self) -> &[String] {
        match self {
            Self::Step(s) => &s.dependencies,
            Self::Group(g) => &g.dependencies,
        }
    }
}

/// Build the plan for `group_id` against `context`.
pub fn build(registry: &StepRegistry, context: &dyn StepContext, group_id: &str) -> Result<PlannedGroup> {
    let mut builder = Builder {
        registry,
        context,
        stack: Vec::new(),
        singletons: HashSet::new(),
        iterated: 0,
    };
    let group = registry.group(group_id)?;
    builder.group(group, Vec::new())
}

struct Builder<'a> {
    registry: &'a StepRegistry,
    context: &'a dyn StepContext,
    stack: Vec<String>,
    singletons: HashSet<String>,
    /// Iterated groups on the stack.
    iterated: usize,
}

impl Builder<'_> {
    fn group(&mut self, group: Arc<StepGroup>, dependencies: Vec<String>) -> Result<PlannedGroup> {
        if self.stack.contains(&group.id) {
            return Err(StepperError::Configuration(format!(
                "step group '{}' contains itself: {} -> {}",
                group.id,
                self.stack.join(" -> "),
                group.id
            )));
        }
        self.stack.push(group.id.clone());

        let iterator = match &group.iterator {
            Some(id) => Some(self.registry.iterator(id)?),
            None => None,
        };
        if iterator.is_some() {
            self.iterated += 1;
        }

        let mut seen = HashSet::new();
        let mut children = Vec::new();
        for child in group.children() {
            let reference = child.reference();
            if !reference.is_enabled(self.context) {
                tracing::trace!(group = %group.id, child = %reference.id, "Child disabled for context");
                continue;
            }
            if !seen.insert(reference.id.clone()) {
                return Err(StepperError::Configuration(format!(
                    "step group '{}' references '{}' more than once",
                    group.id, reference.id
                )));
            }
            let node = match &child {
                StepGroupable::Step(r) => {
                    let definition = self.registry.step(&r.id)?;
                    if definition.singleton && self.iterated > 0 {
                        return Err(StepperError::Configuration(format!(
                            "singleton step '{}' cannot run inside iterated group '{}'",
                            definition.id, group.id
                        )));
                    }
                    if definition.singleton && !self.singletons.insert(definition.id.clone()) {
                        return Err(StepperError::Configuration(format!(
                            "singleton step '{}' is referenced more than once",
                            definition.id
                        )));
                    }
                    let dependencies = merge(&definition.dependencies, &r.dependencies);
                    PlannedNode::Step(PlannedStep {
                        definition,
                        dependencies,
                    })
                }
                StepGroupable::Group(r) => {
                    let nested = self.registry.group(&r.id)?;
                    PlannedNode::Group(self.group(nested, r.dependencies.clone())?)
                }
            };
            children.push(node);
        }

        let children = resolver::resolve(&group.id, children)?;
        self.stack.pop();
        if iterator.is_some() {
            self.iterated -= 1;
        }

        let guard = group.begin_run();
        Ok(PlannedGroup {
            group,
            dependencies,
            iterator,
            children,
            _guard: guard,
        })
    }
}

fn merge(own: &[String], extra: &[String]) -> Vec<String> {
    let mut all = own.to_vec();
    for dep in extra {
        if !all.contains(dep) {
            all.push(dep.clone());
        }
    }
    all
}

impl PlannedGroup {
    /// Step instance ids in execution order, expanding each iterated group
    /// `iterations[group id]` times (once when unknown).
    pub fn flatten(&self, iterations: &HashMap<String, usize>) -> Vec<FullQualifiedId> {
        let mut out = Vec::new();
        self.flatten_into(&FullQualifiedId::root(), iterations, &mut out);
        out
    }

    fn flatten_into(
        &self,
        parent: &FullQualifiedId,
        iterations: &HashMap<String, usize>,
        out: &mut Vec<FullQualifiedId>,
    ) {
        let scopes: Vec<FullQualifiedId> = if self.iterator.is_some() {
            let n = iterations.get(&self.group.id).copied().unwrap_or(1);
            (0..n)
                .map(|i| parent.child_iteration(self.group.id.clone(), i))
                .collect()
        } else {
            vec![parent.child(self.group.id.clone())]
        };
        for scope in scopes {
            for child in &self.children {
                match child {
                    PlannedNode::Step(s) => out.push(scope.child(s.definition.id.clone())),
                    PlannedNode::Group(g) => g.flatten_into(&scope, iterations, out),
                }
            }
        }
    }
}
