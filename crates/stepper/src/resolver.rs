//! Dependency ordering of a group's children.
//!
//! Children are ordered so that every child follows its in-group
//! dependencies. Among children that are ready at the same time the one
//! declared first wins, so an unconstrained group keeps its declared order.
//! Dependencies naming ids outside the group do not constrain the order; they
//! are checked when the dependent step validates.

use std::collections::{BTreeSet, HashMap};

use crate::error::{Result, StepperError};

/// Anything that can be ordered by the resolver.
pub trait Dependent {
    fn dependency_id(&self) -> &str;
    fn dependencies(&self) -> &[String];
}

/// Stable topological sort of `items` by their in-group dependencies.
pub fn resolve<T: Dependent>(group: &str, items: Vec<T>) -> Result<Vec<T>> {
    let index: HashMap<&str, usize> = items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.dependency_id(), i))
        .collect();

    let mut in_degree = vec![0usize; items.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); items.len()];
    for (i, item) in items.iter().enumerate() {
        let mut seen = BTreeSet::new();
        for dep in item.dependencies() {
            if let Some(&d) = index.get(dep.as_str()) {
                if seen.insert(d) {
                    in_degree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..items.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(items.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != items.len() {
        let cycle = find_cycle(&items, &index, &in_degree);
        return Err(StepperError::CircularDependency {
            group: group.to_string(),
            cycle,
        });
    }

    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect())
}

/// Walk unresolved items until an id repeats; render the loop as `a -> b -> a`.
fn find_cycle<T: Dependent>(items: &[T], index: &HashMap<&str, usize>, in_degree: &[usize]) -> String {
    let Some(start) = (0..items.len()).find(|&i| in_degree[i] > 0) else {
        return String::new();
    };

    let mut path: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|&p| p == current) {
            let mut names: Vec<&str> = path[pos..]
                .iter()
                .map(|&i| items[i].dependency_id())
                .collect();
            names.push(items[current].dependency_id());
            return names.join(" -> ");
        }
        path.push(current);
        let next = items[current]
            .dependencies()
            .iter()
            .filter_map(|d| index.get(d.as_str()).copied())
            .find(|&d| in_degree[d] > 0);
        match next {
            Some(n) => current = n,
            None => return items[current].dependency_id().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Item(String, Vec<String>);

    impl Dependent for Item {
        fn dependency_id(&self) -> &str {
            &self.0
        }
        fn dependencies(&self) -> &[String] {
            &self.1
        }
    }

    fn item(id: &str, deps: &[&str]) -> Item {
        Item(id.to_string(), deps.iter().map(|d| d.to_string()).collect())
    }

    fn ids(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.0.as_str()).collect()
    }

    #[test]
    fn test_declaration_order_kept_without_dependencies() {
        let ordered = resolve("g", vec![item("c", &[]), item("a", &[]), item("b", &[])]).unwrap();
        assert_eq!(ids(&ordered), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let ordered = resolve(
            "g",
            vec![item("b", &["a"]), item("a", &[]), item("c", &["b", "a"])],
        )
        .unwrap();
        assert_eq!(ids(&ordered), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_ties_broken_by_declaration() {
        // Once a has run, d is ready and was declared before c.
        let ordered = resolve(
            "g",
            vec![item("b", &[]), item("d", &["a"]), item("a", &[]), item("c", &[])],
        )
        .unwrap();
        assert_eq!(ids(&ordered), vec!["b", "a", "d", "c"]);
    }

    #[test]
    fn test_external_dependencies_ignored() {
        let ordered = resolve("g", vec![item("x", &["elsewhere"]), item("y", &[])]).unwrap();
        assert_eq!(ids(&ordered), vec!["x", "y"]);
    }

    #[test]
    fn test_every_item_follows_its_dependencies() {
        let items = vec![
            item("e", &["d"]),
            item("d", &["b", "c"]),
            item("c", &["a"]),
            item("b", &["a"]),
            item("a", &[]),
        ];
        let ordered = resolve("g", items.clone()).unwrap();
        let pos = |id: &str| ordered.iter().position(|i| i.0 == id).unwrap();
        for it in &items {
            for dep in &it.1 {
                assert!(pos(dep) < pos(&it.0), "{} must precede {}", dep, it.0);
            }
        }
    }

    #[test]
    fn test_cycle_reported() {
        let err = resolve(
            "connect",
            vec![item("a", &["c"]), item("b", &["a"]), item("c", &["b"]), item("z", &[])],
        )
        .unwrap_err();
        match err {
            StepperError::CircularDependency { group, cycle } => {
                assert_eq!(group, "connect");
                assert!(cycle.contains("a") && cycle.contains("b") && cycle.contains("c"));
                assert!(!cycle.contains("z"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
