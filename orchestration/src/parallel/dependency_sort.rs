//! Topological sorting and execution-layer computation.
//!
//! Kahn's algorithm over `(domains, dependencies)`. Layers put every
//! domain one past its deepest dependency; members of a layer are
//! alphabetically sorted for determinism.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graphmap::DiGraphMap;

use super::{ParallelError, ParallelResult};

/// Topologically sort domains by their dependencies (Kahn's algorithm).
///
/// Returns an explicit error on any cycle.
pub fn topological_sort(
    domains: &[String],
    dependencies: &HashMap<String, Vec<String>>,
) -> ParallelResult<Vec<String>> {
    if domains.is_empty() {
        return Ok(Vec::new());
    }
    let domain_set: HashSet<&str> = domains.iter().map(String::as_str).collect();

    let mut in_degree: HashMap<&str, usize> = domains.iter().map(|d| (d.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> =
        domains.iter().map(|d| (d.as_str(), Vec::new())).collect();

    for (domain, deps) in dependencies {
        if !domain_set.contains(domain.as_str()) {
            continue;
        }
        for dep in deps {
            if domain_set.contains(dep.as_str()) {
                dependents.get_mut(dep.as_str()).unwrap().push(domain);
                *in_degree.get_mut(domain.as_str()).unwrap() += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = domains
        .iter()
        .map(String::as_str)
        .filter(|d| in_degree[d] == 0)
        .collect();
    let mut sorted = Vec::new();

    while let Some(current) = queue.pop_front() {
        sorted.push(current.to_string());
        for dependent in &dependents[current] {
            let degree = in_degree.get_mut(dependent).unwrap();
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if sorted.len() != domains.len() {
        let cycles = find_cycles(dependencies);
        let detail = if cycles.is_empty() {
            "unknown cycle".to_string()
        } else {
            cycles
                .iter()
                .map(|cycle| cycle.join(" -> "))
                .collect::<Vec<_>>()
                .join("; ")
        };
        return Err(ParallelError::CircularDependency(detail));
    }
    Ok(sorted)
}

/// Compute execution layers.
///
/// Domains with no dependencies land in layer 0; every other domain
/// lands one layer past its deepest dependency. Members of a layer have
/// no dependencies on each other and can run in parallel.
pub fn compute_execution_layers(
    domains: &[String],
    dependencies: &HashMap<String, Vec<String>>,
) -> ParallelResult<Vec<Vec<String>>> {
    if domains.is_empty() {
        return Ok(Vec::new());
    }
    // A valid layering needs an acyclic graph.
    topological_sort(domains, dependencies)?;

    let domain_set: HashSet<&str> = domains.iter().map(String::as_str).collect();
    let mut layer_of: HashMap<&str, usize> = HashMap::new();
    let mut remaining: Vec<&str> = Vec::new();

    for domain in domains {
        let deps_in_scope = dependencies
            .get(domain)
            .map(|deps| deps.iter().any(|d| domain_set.contains(d.as_str())))
            .unwrap_or(false);
        if deps_in_scope {
            remaining.push(domain);
        } else {
            layer_of.insert(domain, 0);
        }
    }

    while !remaining.is_empty() {
        let mut assigned = Vec::new();
        for domain in &remaining {
            let deps: Vec<&str> = dependencies
                .get(*domain)
                .map(|deps| {
                    deps.iter()
                        .map(String::as_str)
                        .filter(|d| domain_set.contains(d))
                        .collect()
                })
                .unwrap_or_default();
            if deps.iter().all(|dep| layer_of.contains_key(dep)) {
                let depth = deps.iter().map(|dep| layer_of[dep]).max().unwrap_or(0);
                layer_of.insert(domain, depth + 1);
                assigned.push(*domain);
            }
        }
        if assigned.is_empty() {
            // Unreachable after the acyclicity check above.
            return Err(ParallelError::InvalidGraph(
                "layer assignment made no progress".to_string(),
            ));
        }
        remaining.retain(|domain| !assigned.contains(domain));
    }

    let max_layer = layer_of.values().copied().max().unwrap_or(0);
    let mut layers = vec![Vec::new(); max_layer + 1];
    for (domain, layer) in layer_of {
        layers[layer].push(domain.to_string());
    }
    for layer in &mut layers {
        layer.sort();
    }
    Ok(layers)
}

/// Problems found in a dependency map.
#[derive(Debug, Clone)]
pub struct DependencyValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Validate that dependencies are well-formed: every reference exists,
/// no self-dependencies, no cycles.
pub fn validate_dependencies(
    domains: &[String],
    dependencies: &HashMap<String, Vec<String>>,
) -> DependencyValidation {
    let mut errors = Vec::new();
    let domain_set: HashSet<&str> = domains.iter().map(String::as_str).collect();

    for (domain, deps) in dependencies {
        for dep in deps {
            if !domain_set.contains(dep.as_str()) {
                errors.push(format!(
                    "Domain '{domain}' depends on non-existent domain '{dep}'"
                ));
            }
        }
        if deps.contains(domain) {
            errors.push(format!("Domain '{domain}' has self-dependency"));
        }
    }

    for cycle in find_cycles(dependencies) {
        errors.push(format!("Circular dependency detected: {}", cycle.join(" -> ")));
    }

    DependencyValidation {
        valid: errors.is_empty(),
        errors,
    }
}

/// Cycles in the dependency graph, one representative per strongly
/// connected component of size > 1 (plus self-loops).
fn find_cycles(dependencies: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for (domain, deps) in dependencies {
        graph.add_node(domain.as_str());
        for dep in deps {
            graph.add_node(dep.as_str());
            // Edge dep -> domain: dep must run first.
            graph.add_edge(dep.as_str(), domain.as_str(), ());
        }
    }

    let mut cycles = Vec::new();
    for component in petgraph::algo::tarjan_scc(&graph) {
        if component.len() > 1 {
            let mut cycle: Vec<String> = component.iter().map(|n| n.to_string()).collect();
            cycle.sort();
            cycles.push(cycle);
        } else if let Some(node) = component.first() {
            if graph.contains_edge(node, node) {
                cycles.push(vec![node.to_string()]);
            }
        }
    }
    cycles
}
