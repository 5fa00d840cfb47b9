//! Dependency ordering for resources.
//!
//! Resources are reconciled one at a time in topological order. Ties keep
//! declaration order so runs are deterministic.

use std::collections::{BTreeSet, HashMap};

use crate::error::DependencyError;

use super::resource::Resource;

/// Computes a topological order over `resources`, returning indices.
///
/// # Errors
///
/// Returns [`DependencyError::UnknownDependency`] for a dangling reference and
/// [`DependencyError::Cycle`] if the graph is cyclic.
pub fn topological_order(resources: &[Resource]) -> Result<Vec<usize>, DependencyError> {
    let index: HashMap<&str, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, r)| (r.name.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; resources.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); resources.len()];

    for (i, resource) in resources.iter().enumerate() {
        for dep in &resource.depends_on {
            let Some(&j) = index.get(dep.as_str()) else {
                return Err(DependencyError::UnknownDependency {
                    resource: resource.name.clone(),
                    dependency: dep.clone(),
                });
            };
            in_degree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(resources.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < resources.len() {
        let remaining: Vec<usize> = (0..resources.len())
            .filter(|i| in_degree[*i] > 0)
            .collect();
        return Err(DependencyError::Cycle {
            cycle: describe_cycle(resources, &index, &remaining),
        });
    }

    Ok(order)
}

/// Walks dependency edges among the unresolved resources until a name repeats.
fn describe_cycle(
    resources: &[Resource],
    index: &HashMap<&str, usize>,
    remaining: &[usize],
) -> String {
    let Some(&start) = remaining.first() else {
        return String::from("unknown");
    };

    let mut path = vec![start];
    let mut current = start;

    loop {
        // every unresolved node has at least one unresolved dependency
        let next = resources[current]
            .depends_on
            .iter()
            .filter_map(|d| index.get(d.as_str()).copied())
            .find(|j| remaining.contains(j));

        let Some(next) = next else {
            break;
        };

        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut names: Vec<&str> = path[pos..]
                .iter()
                .map(|&i| resources[i].name.as_str())
                .collect();
            names.push(resources[next].name.as_str());
            return names.join(" -> ");
        }

        path.push(next);
        current = next;
    }

    path.iter()
        .map(|&i| resources[i].name.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceKind;
    use std::collections::BTreeMap;

    fn resource(name: &str, deps: &[&str]) -> Resource {
        Resource {
            kind: ResourceKind::Index,
            name: name.to_string(),
            desired: BTreeMap::new(),
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
            notify: vec![],
            config_file: None,
            payload: None,
        }
    }

    fn names(resources: &[Resource], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| resources[i].name.clone()).collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let resources = vec![
            resource("main", &["core"]),
            resource("inputs", &["core", "main"]),
            resource("core", &[]),
        ];

        let order = topological_order(&resources).expect("acyclic");
        assert_eq!(names(&resources, &order), vec!["core", "main", "inputs"]);
    }

    #[test]
    fn test_ties_keep_declaration_order() {
        let resources = vec![
            resource("core", &[]),
            resource("b", &["core"]),
            resource("a", &["core"]),
        ];

        let order = topological_order(&resources).expect("acyclic");
        assert_eq!(names(&resources, &order), vec!["core", "b", "a"]);
    }

    #[test]
    fn test_two_node_cycle() {
        let resources = vec![resource("a", &["b"]), resource("b", &["a"])];

        let err = topological_order(&resources).expect_err("cyclic");
        let DependencyError::Cycle { cycle } = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(cycle, "a -> b -> a");
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let resources = vec![
            resource("core", &[]),
            resource("x", &["core", "z"]),
            resource("y", &["x"]),
            resource("z", &["y"]),
        ];

        let err = topological_order(&resources).expect_err("cyclic");
        assert!(matches!(err, DependencyError::Cycle { ref cycle } if cycle.contains("x -> z")));
    }

    #[test]
    fn test_unknown_dependency() {
        let resources = vec![resource("main", &["core"])];

        let err = topological_order(&resources).expect_err("dangling");
        assert_eq!(
            err,
            DependencyError::UnknownDependency {
                resource: String::from("main"),
                dependency: String::from("core"),
            }
        );
    }
}
