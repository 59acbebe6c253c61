//! Module dependency resolution using topological sort.
//!
//! Ensures modules are loaded in the correct order based on their
//! dependencies. Uses Kahn's algorithm with cycle detection; among modules
//! that are ready at the same time the alphabetically smallest goes first, so
//! the result is identical across runs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::{ModuleError, ModuleResult};

/// Adjacency map: module name to the names it depends on.
pub type DependencyGraph = BTreeMap<String, Vec<String>>;

/// Resolve module load order.
///
/// Returns module names sorted so that dependencies come before dependents.
///
/// # Errors
/// - [`ModuleError::MissingDependency`] if a module depends on a name that is
///   not in the graph
/// - [`ModuleError::DependencyCycle`] naming every module that could not be
///   ordered
pub fn resolve_load_order(graph: &DependencyGraph) -> ModuleResult<Vec<String>> {
    // in_degree[m] = number of distinct modules m waits for
    let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(graph.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::with_capacity(graph.len());

    for name in graph.keys() {
        in_degree.insert(name, 0);
        dependents.entry(name.as_str()).or_default();
    }

    for (name, deps) in graph {
        let unique: BTreeSet<&str> = deps.iter().map(String::as_str).collect();
        for dep in unique {
            if !graph.contains_key(dep) {
                return Err(ModuleError::missing_dependency(name, dep));
            }
            if let Some(degree) = in_degree.get_mut(name.as_str()) {
                *degree += 1;
            }
            dependents.entry(dep).or_default().push(name);
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut result = Vec::with_capacity(graph.len());

    while let Some(module) = ready.pop_first() {
        result.push(module.to_string());

        if let Some(waiting) = dependents.get(module) {
            for dependent in waiting {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }
    }

    if result.len() != graph.len() {
        let loaded: HashSet<&str> = result.iter().map(String::as_str).collect();
        // BTreeMap keys are already sorted.
        let in_cycle: Vec<String> = graph
            .keys()
            .filter(|k| !loaded.contains(k.as_str()))
            .cloned()
            .collect();
        return Err(ModuleError::cycle(&in_cycle));
    }

    Ok(result)
}

/// Names from `depends` that are not in `available`, in declaration order.
pub fn missing_dependencies(depends: &[String], available: &HashSet<String>) -> Vec<String> {
    depends
        .iter()
        .filter(|dep| !available.contains(*dep))
        .cloned()
        .collect()
}

/// Check that every dependency of `module` is in `available`.
pub fn check_dependencies(
    module: &str,
    depends: &[String],
    available: &HashSet<String>,
) -> ModuleResult<()> {
    match missing_dependencies(depends, available).into_iter().next() {
        Some(dep) => Err(ModuleError::missing_dependency(module, dep)),
        None => Ok(()),
    }
}

/// All modules `name` depends on, directly or transitively.
///
/// Names absent from the graph are still reported (they are dependencies,
/// just unknown ones). Tolerates cycles.
pub fn transitive_dependencies(graph: &DependencyGraph, name: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = graph
        .get(name)
        .map(|deps| deps.iter().map(String::as_str).collect())
        .unwrap_or_default();

    while let Some(dep) = stack.pop() {
        if dep == name || !seen.insert(dep.to_string()) {
            continue;
        }
        if let Some(next) = graph.get(dep) {
            stack.extend(next.iter().map(String::as_str));
        }
    }

    seen
}

/// Modules that list `name` directly in their dependencies, sorted.
pub fn direct_dependents(graph: &DependencyGraph, name: &str) -> Vec<String> {
    graph
        .iter()
        .filter(|(_, deps)| deps.iter().any(|d| d == name))
        .map(|(module, _)| module.clone())
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn graph(entries: &[(&str, &[&str])]) -> DependencyGraph {
        entries
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    fn pos(order: &[String], name: &str) -> usize {
        order.iter().position(|x| x == name).unwrap()
    }

    #[test]
    fn no_dependencies_is_alphabetical() {
        let g = graph(&[("c", &[]), ("a", &[]), ("b", &[])]);
        assert_eq!(resolve_load_order(&g).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn simple_chain() {
        // a depends on b, b depends on c
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        assert_eq!(resolve_load_order(&g).unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn diamond_dependency() {
        let g = graph(&[
            ("d", &[]),
            ("b", &["d"]),
            ("c", &["d"]),
            ("a", &["b", "c"]),
        ]);
        let order = resolve_load_order(&g).unwrap();

        assert!(pos(&order, "d") < pos(&order, "b"));
        assert!(pos(&order, "d") < pos(&order, "c"));
        assert!(pos(&order, "b") < pos(&order, "a"));
        assert!(pos(&order, "c") < pos(&order, "a"));
    }

    #[test]
    fn order_is_stable_across_runs() {
        let g = graph(&[
            ("zeta", &["base"]),
            ("alpha", &["base"]),
            ("base", &[]),
            ("mid", &["alpha", "zeta"]),
        ]);
        let first = resolve_load_order(&g).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve_load_order(&g).unwrap(), first);
        }
        assert_eq!(first, vec!["base", "alpha", "zeta", "mid"]);
    }

    #[test]
    fn duplicate_edges_count_once() {
        let g = graph(&[("a", &["b", "b"]), ("b", &[])]);
        assert_eq!(resolve_load_order(&g).unwrap(), vec!["b", "a"]);
    }

    #[test]
    fn missing_dependency() {
        let g = graph(&[("a", &["missing"])]);
        let err = resolve_load_order(&g).unwrap_err();
        assert!(matches!(err, ModuleError::MissingDependency { .. }));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn circular_dependency_direct() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let err = resolve_load_order(&g).unwrap_err();
        assert!(err.to_string().contains("circular"));
    }

    #[test]
    fn circular_dependency_names_every_unresolved_module() {
        // x is not in the cycle but waits on it
        let g = graph(&[
            ("a", &["b"]),
            ("b", &["c"]),
            ("c", &["a"]),
            ("x", &["a"]),
            ("ok", &[]),
        ]);
        match resolve_load_order(&g).unwrap_err() {
            ModuleError::DependencyCycle { modules } => assert_eq!(modules, "a, b, c, x"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn check_dependencies_satisfied() {
        let available: HashSet<String> = ["dep1", "dep2", "dep3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let deps = vec!["dep1".to_string(), "dep2".to_string()];
        assert!(check_dependencies("test", &deps, &available).is_ok());
    }

    #[test]
    fn check_dependencies_missing() {
        let available: HashSet<String> = ["dep1"].iter().map(|s| s.to_string()).collect();
        let deps = vec!["dep1".to_string(), "missing".to_string()];
        let err = check_dependencies("test", &deps, &available).unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert_eq!(missing_dependencies(&deps, &available), vec!["missing"]);
    }

    #[test]
    fn transitive_dependencies_follow_chain() {
        let g = graph(&[("sales", &["crm"]), ("crm", &["base"]), ("base", &[])]);
        let deps = transitive_dependencies(&g, "sales");
        assert_eq!(
            deps.into_iter().collect::<Vec<_>>(),
            vec!["base".to_string(), "crm".to_string()]
        );
        assert!(transitive_dependencies(&g, "base").is_empty());
    }

    #[test]
    fn transitive_dependencies_tolerate_cycles() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let deps = transitive_dependencies(&g, "a");
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec!["b".to_string()]);
    }

    #[test]
    fn direct_dependents_are_sorted() {
        let g = graph(&[("sales", &["base"]), ("crm", &["base"]), ("base", &[])]);
        assert_eq!(direct_dependents(&g, "base"), vec!["crm", "sales"]);
    }
}
