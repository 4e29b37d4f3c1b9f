//! Job-scoped shared data.
//!
//! Every job owns one [`PropertiesContainer`]. It holds plain keys, visible to
//! every step, and attributes scoped by a [`FullQualifiedId`]. A scoped read
//! walks from the given id up through its ancestors, so an attribute is visible
//! to the instance it was written for and to everything below it, but not to
//! siblings (including other iterations of the same group).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};

use crate::id::FullQualifiedId;

/// Well-known property keys set by the engine.
pub mod keys {
    /// Id of the running job.
    pub const JOB_ID: &str = "stepper.job.id";
    /// Operation the job runs.
    pub const JOB_OPERATION: &str = "stepper.job.operation";
    /// When true, the run is not recorded in history.
    pub const SKIP_HISTORY: &str = "stepper.skip_history";
    /// Context currently targeted by a step, staged by iterators.
    pub const ACTIVE_CONTEXT: &str = "stepper.active_context";
}

#[derive(Debug, Default)]
struct Inner {
    values: BTreeMap<String, Value>,
    scoped: HashMap<FullQualifiedId, BTreeMap<String, Value>>,
    transient: HashSet<String>,
}

/// Shared, mutable key/value bag for one job.
///
/// Cloning yields another handle to the same data; use [`deep_copy`] for an
/// independent container. Values are copied out on read.
///
/// [`deep_copy`]: PropertiesContainer::deep_copy
#[derive(Debug, Clone, Default)]
pub struct PropertiesContainer {
    inner: Arc<RwLock<Inner>>,
}

impl PropertiesContainer {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set a plain key, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.write().values.insert(key.into(), value.into())
    }

    /// Set a plain key that is left out of history snapshots.
    pub fn set_transient(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let mut inner = self.write();
        inner.transient.insert(key.clone());
        inner.values.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().values.get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().values.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut inner = self.write();
        inner.transient.remove(key);
        inner.values.remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set an attribute under a step instance id.
    ///
    /// The root id writes a plain key.
    pub fn set_scoped(&self, id: &FullQualifiedId, key: impl Into<String>, value: impl Into<Value>) {
        let mut inner = self.write();
        if id.is_root() {
            inner.values.insert(key.into(), value.into());
        } else {
            inner
                .scoped
                .entry(id.clone())
                .or_default()
                .insert(key.into(), value.into());
        }
    }

    /// Read an attribute visible at `id`: its own, then its ancestors', then the plain key.
    pub fn get_scoped(&self, id: &FullQualifiedId, key: &str) -> Option<Value> {
        let inner = self.read();
        for scope in id.lineage() {
            let found = if scope.is_root() {
                inner.values.get(key)
            } else {
                inner.scoped.get(&scope).and_then(|m| m.get(key))
            };
            if let Some(value) = found {
                return Some(value.clone());
            }
        }
        None
    }

    /// Remove an attribute written exactly at `id`.
    pub fn remove_scoped(&self, id: &FullQualifiedId, key: &str) -> Option<Value> {
        let mut inner = self.write();
        let removed = inner.scoped.get_mut(id).and_then(|m| m.remove(key));
        if inner.scoped.get(id).is_some_and(|m| m.is_empty()) {
            inner.scoped.remove(id);
        }
        removed
    }

    /// Drop every attribute scoped at `id` or below. Returns the number removed.
    pub fn purge_scope(&self, id: &FullQualifiedId) -> usize {
        let mut inner = self.write();
        let mut removed = 0;
        inner.scoped.retain(|scope, values| {
            if id.is_self_or_ancestor_of(scope) {
                removed += values.len();
                false
            } else {
                true
            }
        });
        removed
    }

    /// Condensed view for history: plain, non-transient keys.
    pub fn snapshot(&self) -> Map<String, Value> {
        let inner = self.read();
        inner
            .values
            .iter()
            .filter(|(k, _)| !inner.transient.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Independent copy of all data.
    pub fn deep_copy(&self) -> Self {
        let inner = self.read();
        Self {
            inner: Arc::new(RwLock::new(Inner {
                values: inner.values.clone(),
                scoped: inner.scoped.clone(),
                transient: inner.transient.clone(),
            })),
        }
    }

    /// Copy plain keys from `other`, overwriting existing ones.
    pub fn merge_from(&self, other: &PropertiesContainer) {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return;
        }
        let source = other.read();
        let mut target = self.write();
        for (k, v) in &source.values {
            target.values.insert(k.clone(), v.clone());
        }
        for k in &source.transient {
            target.transient.insert(k.clone());
        }
    }
}

impl From<Map<String, Value>> for PropertiesContainer {
    fn from(map: Map<String, Value>) -> Self {
        let container = Self::new();
        {
            let mut inner = container.write();
            inner.values.extend(map);
        }
        container
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for PropertiesContainer {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let container = Self::new();
        for (k, v) in iter {
            container.set(k, v);
        }
        container
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_keys_are_shared_between_handles() {
        let data = PropertiesContainer::new();
        let other = data.clone();
        other.set("target", "board-1");
        assert_eq!(data.get_str("target").as_deref(), Some("board-1"));
        assert_eq!(data.len(), 1);
    }

    #[test]
    fn test_scoped_visible_to_descendants_only() {
        let data = PropertiesContainer::new();
        let group = FullQualifiedId::new("attach");
        let first = FullQualifiedId::root().child_iteration("attach", 0);
        let second = FullQualifiedId::root().child_iteration("attach", 1);

        data.set_scoped(&first, "pid", 10);
        data.set_scoped(&second, "pid", 20);

        assert_eq!(data.get_scoped(&first.child("resume"), "pid"), Some(json!(10)));
        assert_eq!(data.get_scoped(&second.child("resume"), "pid"), Some(json!(20)));
        assert_eq!(data.get_scoped(&group, "pid"), None);
        assert_eq!(data.get("pid"), None);
    }

    #[test]
    fn test_scoped_falls_back_to_plain_key() {
        let data = PropertiesContainer::new();
        data.set("timeout", 5);
        let id = FullQualifiedId::new("a").child("b");
        assert_eq!(data.get_scoped(&id, "timeout"), Some(json!(5)));

        data.set_scoped(&FullQualifiedId::new("a"), "timeout", 7);
        assert_eq!(data.get_scoped(&id, "timeout"), Some(json!(7)));
    }

    #[test]
    fn test_purge_scope_removes_subtree() {
        let data = PropertiesContainer::new();
        let group = FullQualifiedId::new("launch");
        data.set_scoped(&group, "a", 1);
        data.set_scoped(&group.child("x"), "b", 2);
        data.set_scoped(&FullQualifiedId::new("other"), "c", 3);

        assert_eq!(data.purge_scope(&group), 2);
        assert_eq!(data.get_scoped(&group.child("x"), "b"), None);
        assert_eq!(data.get_scoped(&FullQualifiedId::new("other"), "c"), Some(json!(3)));
    }

    #[test]
    fn test_snapshot_skips_transient_and_scoped() {
        let data = PropertiesContainer::new();
        data.set("host", "10.0.0.1");
        data.set_transient(keys::JOB_ID, "abc");
        data.set_scoped(&FullQualifiedId::new("s"), "tmp", true);

        let snapshot = data.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("host"), Some(&json!("10.0.0.1")));
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let data: PropertiesContainer = [("a", 1)].into_iter().collect();
        let copy = data.deep_copy();
        copy.set("a", 2);
        assert_eq!(data.get("a"), Some(json!(1)));
    }
}
