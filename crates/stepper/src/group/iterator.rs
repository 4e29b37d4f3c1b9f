//! Repetition of a group's children.
//!
//! An iterator is created fresh for every group run from a registered
//! [`IteratorFactory`]. The group runner calls [`initialize`] once to learn the
//! iteration count N, then [`next`] once per iteration before the children
//! run. `next` receives an environment addressed at the iteration id
//! (`…/group[i]`), so attributes it writes are seen by that iteration's
//! children and by no other iteration.
//!
//! [`initialize`]: StepGroupIterator::initialize
//! [`next`]: StepGroupIterator::next

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, StepperError};
use crate::properties::keys;
use crate::step::StepEnv;

#[async_trait]
pub trait StepGroupIterator: Send {
    /// Compute the iteration count. Called once per group run.
    async fn initialize(&mut self, env: &StepEnv) -> Result<usize>;

    /// Stage the data for `iteration` under `env.id`.
    async fn next(&mut self, env: &StepEnv, iteration: usize) -> Result<()>;
}

/// Builds an iterator from the owning group's parameters.
pub type IteratorFactory =
    Arc<dyn Fn(&HashMap<String, String>) -> Result<Box<dyn StepGroupIterator>> + Send + Sync>;

/// Drives an iterator and enforces its calling protocol.
pub(crate) struct IterationCursor {
    group: String,
    iterations: Option<usize>,
    iteration: usize,
}

impl IterationCursor {
    pub(crate) fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            iterations: None,
            iteration: 0,
        }
    }

    pub(crate) fn set_iterations(&mut self, iterations: usize) -> Result<()> {
        if self.iteration > 0 {
            return Err(self.error("cannot change iterations during run"));
        }
        self.iterations = Some(iterations);
        Ok(())
    }

    pub(crate) fn has_next(&self) -> bool {
        self.iterations.is_some_and(|n| self.iteration < n)
    }

    /// Claim the next iteration index.
    pub(crate) fn advance(&mut self) -> Result<usize> {
        let n = self
            .iterations
            .ok_or_else(|| self.error("iterator not initialized"))?;
        if self.iteration >= n {
            return Err(self.error("no more iterations"));
        }
        let current = self.iteration;
        self.iteration += 1;
        Ok(current)
    }

    fn error(&self, message: &str) -> StepperError {
        StepperError::Iterator {
            group: self.group.clone(),
            message: message.to_string(),
        }
    }
}

/// Iterates over a JSON array found under the `source` parameter key.
///
/// Each element is staged under the `target` parameter key in the iteration
/// scope (default [`keys::ACTIVE_CONTEXT`]).
#[derive(Debug)]
pub struct ListIterator {
    source: String,
    target: String,
    items: Vec<Value>,
}

impl ListIterator {
    pub const SOURCE: &'static str = "source";
    pub const TARGET: &'static str = "target";

    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            items: Vec::new(),
        }
    }

    pub fn factory() -> IteratorFactory {
        Arc::new(|params: &HashMap<String, String>| {
            let source = params.get(Self::SOURCE).ok_or_else(|| {
                StepperError::Configuration("list iterator requires a 'source' parameter".into())
            })?;
            let target = params
                .get(Self::TARGET)
                .map(String::as_str)
                .unwrap_or(keys::ACTIVE_CONTEXT);
            Ok(Box::new(ListIterator::new(source.clone(), target)) as Box<dyn StepGroupIterator>)
        })
    }
}

#[async_trait]
impl StepGroupIterator for ListIterator {
    async fn initialize(&mut self, env: &StepEnv) -> Result<usize> {
        self.items = match env.attribute(&self.source) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        };
        Ok(self.items.len())
    }

    async fn next(&mut self, env: &StepEnv, iteration: usize) -> Result<()> {
        let item = self
            .items
            .get(iteration)
            .cloned()
            .ok_or_else(|| StepperError::Iterator {
                group: env.id.to_string(),
                message: format!("no item for iteration {}", iteration),
            })?;
        env.set_attribute(self.target.clone(), item);
        Ok(())
    }
}

/// Repeats the group `count` times, staging the index under `index_key`.
#[derive(Debug)]
pub struct RepeatIterator {
    count: usize,
    index_key: String,
}

impl RepeatIterator {
    pub const COUNT: &'static str = "count";
    pub const INDEX_KEY: &'static str = "stepper.iteration";

    pub fn new(count: usize) -> Self {
        Self {
            count,
            index_key: Self::INDEX_KEY.to_string(),
        }
    }

    pub fn factory() -> IteratorFactory {
        Arc::new(|params: &HashMap<String, String>| {
            let count = params
                .get(Self::COUNT)
                .ok_or_else(|| {
                    StepperError::Configuration("repeat iterator requires a 'count' parameter".into())
                })?
                .parse::<usize>()
                .map_err(|e| StepperError::Configuration(format!("invalid repeat count: {}", e)))?;
            Ok(Box::new(RepeatIterator::new(count)) as Box<dyn StepGroupIterator>)
        })
    }
}

#[async_trait]
impl StepGroupIterator for RepeatIterator {
    async fn initialize(&mut self, _env: &StepEnv) -> Result<usize> {
        Ok(self.count)
    }

    async fn next(&mut self, env: &StepEnv, iteration: usize) -> Result<()> {
        env.set_attribute(self.index_key.clone(), iteration);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env_at;
    use crate::FullQualifiedId;
    use serde_json::json;

    #[test]
    fn test_cursor_protocol() {
        let mut cursor = IterationCursor::new("g");
        assert!(!cursor.has_next());
        assert!(matches!(cursor.advance(), Err(StepperError::Iterator { .. })));

        cursor.set_iterations(2).unwrap();
        assert_eq!(cursor.advance().unwrap(), 0);
        assert!(cursor.set_iterations(5).is_err());
        assert_eq!(cursor.advance().unwrap(), 1);
        assert!(!cursor.has_next());
        let err = cursor.advance().unwrap_err();
        assert!(err.to_string().contains("no more iterations"));
    }

    #[tokio::test]
    async fn test_list_iterator_stages_items_per_iteration() {
        let env = env_at(FullQualifiedId::new("attach"));
        env.data.set("processes", json!(["p1", "p2"]));

        let params: HashMap<String, String> =
            [("source".to_string(), "processes".to_string())].into_iter().collect();
        let mut iterator = (ListIterator::factory())(&params).unwrap();
        assert_eq!(iterator.initialize(&env).await.unwrap(), 2);

        let parent = FullQualifiedId::root();
        for i in 0..2 {
            let iter_env = env.with_id(parent.child_iteration("attach", i));
            iterator.next(&iter_env, i).await.unwrap();
        }
        let first = parent.child_iteration("attach", 0).child("resume");
        let second = parent.child_iteration("attach", 1).child("resume");
        assert_eq!(env.data.get_scoped(&first, keys::ACTIVE_CONTEXT), Some(json!("p1")));
        assert_eq!(env.data.get_scoped(&second, keys::ACTIVE_CONTEXT), Some(json!("p2")));
    }

    #[tokio::test]
    async fn test_list_iterator_missing_source_is_empty() {
        let env = env_at(FullQualifiedId::new("attach"));
        let mut iterator = ListIterator::new("nothing", "x");
        assert_eq!(iterator.initialize(&env).await.unwrap(), 0);
    }

    #[test]
    fn test_repeat_factory_validates_count() {
        let params: HashMap<String, String> =
            [("count".to_string(), "x".to_string())].into_iter().collect();
        assert!((RepeatIterator::factory())(&params).is_err());
        assert!((RepeatIterator::factory())(&HashMap::new()).is_err());
    }
}
