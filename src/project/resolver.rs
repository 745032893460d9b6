//! Service dependency resolution
//!
//! Produces the order in which services start and stop, plus the groups that
//! may provision in parallel. Edges are the union of all four dependency
//! kinds. Cycle detection runs as an independent DFS so errors can report the
//! full path; the Kahn walk carries a defensive count check of its own.

use super::Service;
use crate::error::{ConvoyError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// The resolved startup plan for a set of services.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePlan {
    /// Services in dependency order (dependencies first)
    pub start_order: Vec<String>,
    /// Reverse of `start_order`
    pub stop_order: Vec<String>,
    /// Levels of services with no edges between members of the same level
    pub parallel_groups: Vec<Vec<String>>,
}

/// Resolve the start/stop order and parallel groups for `services`.
pub fn resolve(services: &BTreeMap<String, Service>) -> Result<ServicePlan> {
    // successor lists and in-degrees; edge dep -> dependent
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();

    for name in services.keys() {
        in_degree.insert(name, 0);
    }
    for (name, service) in services {
        for dep in service.all_dependencies() {
            if !services.contains_key(dep) {
                return Err(ConvoyError::NotFound(format!(
                    "service '{}' depends on unknown service '{}'",
                    name, dep
                )));
            }
            successors.entry(dep).or_default().push(name);
            *in_degree.get_mut(name.as_str()).expect("node present") += 1;
        }
    }

    detect_cycle(services)?;

    let mut frontier: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| *name)
        .collect();
    frontier.sort_unstable();

    let mut start_order = Vec::with_capacity(services.len());
    let mut parallel_groups = Vec::new();

    while !frontier.is_empty() {
        let group: Vec<String> = frontier.iter().map(|s| s.to_string()).collect();
        let mut next: Vec<&str> = Vec::new();
        for name in frontier {
            start_order.push(name.to_string());
            for succ in successors.get(name).into_iter().flatten() {
                let deg = in_degree.get_mut(succ).expect("node present");
                *deg -= 1;
                if *deg == 0 {
                    next.push(succ);
                }
            }
        }
        next.sort_unstable();
        parallel_groups.push(group);
        frontier = next;
    }

    if start_order.len() != services.len() {
        return Err(ConvoyError::InvalidArgument(
            "circular dependency between services".to_string(),
        ));
    }

    let stop_order: Vec<String> = start_order.iter().rev().cloned().collect();
    Ok(ServicePlan {
        start_order,
        stop_order,
        parallel_groups,
    })
}

/// Reduce `services` to `requested` plus everything they transitively depend
/// on. Names that do not resolve are returned separately so the caller can
/// warn about them.
pub fn filter_with_dependencies(
    services: &BTreeMap<String, Service>,
    requested: &[String],
) -> (BTreeMap<String, Service>, Vec<String>) {
    let mut unknown = Vec::new();
    let mut pending: VecDeque<String> = VecDeque::new();
    for name in requested {
        if services.contains_key(name) {
            pending.push_back(name.clone());
        } else {
            unknown.push(name.clone());
        }
    }

    let mut selected: BTreeSet<String> = BTreeSet::new();
    while let Some(name) = pending.pop_front() {
        if !selected.insert(name.clone()) {
            continue;
        }
        if let Some(service) = services.get(&name) {
            for dep in service.all_dependencies() {
                if services.contains_key(dep) {
                    pending.push_back(dep.to_string());
                } else if !unknown.iter().any(|u| u == dep) {
                    unknown.push(dep.to_string());
                }
            }
        }
    }

    let reduced = services
        .iter()
        .filter(|(name, _)| selected.contains(*name))
        .map(|(name, service)| (name.clone(), service.clone()))
        .collect();
    (reduced, unknown)
}

fn detect_cycle(services: &BTreeMap<String, Service>) -> Result<()> {
    fn visit<'a>(
        services: &'a BTreeMap<String, Service>,
        name: &'a str,
        visited: &mut BTreeSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Result<()> {
        if let Some(pos) = stack.iter().position(|s| *s == name) {
            let mut path: Vec<&str> = stack[pos..].to_vec();
            path.push(name);
            return Err(ConvoyError::InvalidArgument(format!(
                "circular dependency: {}",
                path.join(" → ")
            )));
        }
        if visited.contains(name) {
            return Ok(());
        }
        stack.push(name);
        if let Some(service) = services.get(name) {
            for dep in service.all_dependencies() {
                if services.contains_key(dep) {
                    visit(services, dep, visited, stack)?;
                }
            }
        }
        stack.pop();
        visited.insert(name);
        Ok(())
    }

    let mut visited = BTreeSet::new();
    for name in services.keys() {
        let mut stack = Vec::new();
        visit(services, name, &mut visited, &mut stack)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, deps: &[&str]) -> Service {
        Service {
            name: name.to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn services(specs: &[(&str, &[&str])]) -> BTreeMap<String, Service> {
        specs
            .iter()
            .map(|(name, deps)| (name.to_string(), service(name, deps)))
            .collect()
    }

    #[test]
    fn test_empty_services_resolve_to_empty_plan() {
        let plan = resolve(&BTreeMap::new()).unwrap();
        assert!(plan.start_order.is_empty());
        assert!(plan.parallel_groups.is_empty());
    }

    #[test]
    fn test_linear_chain() {
        let svcs = services(&[("db", &[]), ("cache", &["db"]), ("web", &["cache"])]);
        let plan = resolve(&svcs).unwrap();
        assert_eq!(plan.start_order, vec!["db", "cache", "web"]);
        assert_eq!(plan.stop_order, vec!["web", "cache", "db"]);
        assert_eq!(
            plan.parallel_groups,
            vec![vec!["db"], vec!["cache"], vec!["web"]]
        );
    }

    #[test]
    fn test_diamond_groups() {
        let svcs = services(&[
            ("db", &[]),
            ("cache", &[]),
            ("api", &["db", "cache"]),
            ("web", &["api"]),
        ]);
        let plan = resolve(&svcs).unwrap();
        assert_eq!(
            plan.parallel_groups,
            vec![vec!["cache", "db"], vec!["api"], vec!["web"]]
        );
    }

    #[test]
    fn test_start_order_is_permutation() {
        let svcs = services(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
            ("e", &[]),
        ]);
        let plan = resolve(&svcs).unwrap();
        assert_eq!(plan.start_order.len(), svcs.len());
        for name in svcs.keys() {
            assert!(plan.start_order.contains(name));
        }
        let flattened: Vec<String> = plan.parallel_groups.concat();
        assert_eq!(flattened, plan.start_order);
    }

    #[test]
    fn test_edges_respect_order() {
        let svcs = services(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &["a", "c"]),
        ]);
        let plan = resolve(&svcs).unwrap();
        let pos = |n: &str| plan.start_order.iter().position(|s| s == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert!(pos("a") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn test_all_condition_kinds_create_edges() {
        let mut svcs = services(&[("a", &[]), ("b", &[]), ("c", &[]), ("d", &[])]);
        let web = Service {
            name: "web".to_string(),
            depends_on: vec!["a".to_string()],
            depends_on_healthy: vec!["b".to_string()],
            depends_on_started: vec!["c".to_string()],
            depends_on_completed: vec!["d".to_string()],
            ..Default::default()
        };
        svcs.insert("web".to_string(), web);

        let plan = resolve(&svcs).unwrap();
        assert_eq!(plan.start_order.last().unwrap(), "web");
        assert_eq!(plan.parallel_groups.len(), 2);
    }

    #[test]
    fn test_unknown_dependency_is_not_found() {
        let svcs = services(&[("a", &["ghost"])]);
        let err = resolve(&svcs).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_self_edge_is_cycle() {
        let svcs = services(&[("a", &["a"])]);
        let err = resolve(&svcs).unwrap_err().to_string();
        assert!(err.contains("circular"), "got: {err}");
    }

    #[test]
    fn test_cycle_reports_path() {
        let svcs = services(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let err = resolve(&svcs).unwrap_err().to_string();
        assert!(err.contains(" → "), "got: {err}");
        // the path walks the full cycle back to its start
        let arrows = err.matches(" → ").count();
        assert_eq!(arrows, 3, "got: {err}");
    }

    #[test]
    fn test_filter_with_dependencies_is_closed() {
        let svcs = services(&[
            ("db", &[]),
            ("cache", &["db"]),
            ("web", &["cache"]),
            ("other", &[]),
        ]);
        let (reduced, unknown) = filter_with_dependencies(&svcs, &["web".to_string()]);
        assert!(unknown.is_empty());
        assert_eq!(reduced.len(), 3);
        assert!(reduced.contains_key("db"));
        assert!(reduced.contains_key("cache"));
        assert!(reduced.contains_key("web"));
        assert!(!reduced.contains_key("other"));
    }

    #[test]
    fn test_filter_reports_unknown_names() {
        let svcs = services(&[("a", &[])]);
        let (reduced, unknown) =
            filter_with_dependencies(&svcs, &["a".to_string(), "ghost".to_string()]);
        assert_eq!(reduced.len(), 1);
        assert_eq!(unknown, vec!["ghost"]);
    }
}
