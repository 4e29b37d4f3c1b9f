//! Sequential execution of a planned step group.

use futures::future::{BoxFuture, FutureExt};

use crate::error::{Result, StepperError};
use crate::group::iterator::IterationCursor;
use crate::id::FullQualifiedId;
use crate::job::runtime::JobRuntime;
use crate::plan::{PlannedGroup, PlannedNode};
use crate::step::runner::run_step;

/// Run `group` below `parent`, one child at a time, in planned order.
///
/// Iterated groups run their children once per iteration under
/// `parent/group[i]`; a failure in any iteration fails the group.
pub(crate) fn run_group<'a>(
    rt: &'a mut JobRuntime,
    group: &'a PlannedGroup,
    parent: &'a FullQualifiedId,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let id = &group.group.id;
        if let Some(missing) = group.dependencies.iter().find(|d| !rt.executed.contains(*d)) {
            return Err(StepperError::UnresolvedDependency {
                step: parent.child(id.clone()).to_string(),
                dependency: missing.clone(),
            });
        }

        match &group.iterator {
            None => {
                let scope = parent.child(id.clone());
                tracing::debug!(job_id = %rt.job_id, group = %scope, "Running step group");
                run_children(rt, group, &scope).await?;
            }
            Some(factory) => {
                let scope = parent.child(id.clone());
                let env = rt.env_for(scope.clone(), group.group.parameters.clone());
                let mut iterator = factory(&group.group.parameters)?;
                let mut cursor = IterationCursor::new(scope.to_string());

                let iterations = iterator.initialize(&env).await?;
                cursor.set_iterations(iterations)?;
                tracing::debug!(
                    job_id = %rt.job_id,
                    group = %scope,
                    iterations,
                    "Running iterated step group"
                );

                while cursor.has_next() {
                    if rt.progress.is_cancelled() {
                        return Err(StepperError::Cancelled(format!(
                            "{} cancelled in '{}'",
                            rt.label, group.group.label
                        )));
                    }
                    let i = cursor.advance()?;
                    let iteration_scope = parent.child_iteration(id.clone(), i);
                    let iteration_env = env.with_id(iteration_scope.clone());
                    rt.set_current(Some(iteration_scope.clone()));
                    iterator.next(&iteration_env, i).await?;
                    run_children(rt, group, &iteration_scope).await?;
                }
            }
        }

        rt.executed.insert(id.clone());
        Ok(())
    }
    .boxed()
}

async fn run_children(rt: &mut JobRuntime, group: &PlannedGroup, scope: &FullQualifiedId) -> Result<()> {
    for child in &group.children {
        if rt.progress.is_cancelled() {
            return Err(StepperError::Cancelled(format!(
                "{} cancelled in '{}'",
                rt.label, group.group.label
            )));
        }
        match child {
            PlannedNode::Step(step) => {
                run_step(rt, step, scope.child(step.definition.id.clone())).await?;
            }
            PlannedNode::Group(nested) => {
                run_group(rt, nested, scope).await?;
            }
        }
    }
    Ok(())
}
