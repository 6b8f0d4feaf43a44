//! Dependency resolver
//!
//! Graph construction, validation and load order.
//!
//! Resolution starts from one or more target plugins and walks their
//! dependencies through the installed and available catalogs. The checks run
//! in a fixed order and the first failing check ends resolution:
//!
//! 1. **Missing**: required dependencies found in neither catalog
//! 2. **Conflicts**: version constraints rejecting the resolved version
//! 3. **Cycles**: every distinct cycle, found with an explicit-stack DFS
//! 4. **Order**: Kahn's algorithm over the dependency edges
//!
//! Installed manifests take precedence over available ones. Optional
//! dependencies join the graph only when installed.

use indexmap::{IndexMap, IndexSet};
use sdk::errors::EngineError;
use sdk::manifest::{leading_version, Manifest};
use sdk::types::{ConstraintRequest, MissingDependency, VersionConflict};
use semver::VersionReq;
use std::collections::{HashMap, HashSet, VecDeque};

/// Manifests keyed by plugin id
pub type Catalog = HashMap<String, Manifest>;

/// A manifest wrapped for graph operations
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub manifest: Manifest,
    /// Whether the manifest came from the installed catalog
    pub installed: bool,
    /// Declared dependencies that are part of the graph
    edges: Vec<String>,
}

impl DependencyNode {
    pub fn new(manifest: Manifest, installed: bool) -> Self {
        Self {
            manifest,
            installed,
            edges: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Every declared dependency id
    pub fn dependencies(&self) -> Vec<&str> {
        self.manifest.dependency_ids().collect()
    }

    pub fn required_dependencies(&self) -> Vec<&str> {
        self.manifest
            .dependencies
            .iter()
            .filter(|d| d.required)
            .map(|d| d.id.as_str())
            .collect()
    }

    pub fn optional_dependencies(&self) -> Vec<&str> {
        self.manifest
            .dependencies
            .iter()
            .filter(|d| !d.required)
            .map(|d| d.id.as_str())
            .collect()
    }

    /// Dependencies of this node that are in the graph
    pub fn edges(&self) -> &[String] {
        &self.edges
    }

    /// Number of in-graph dependencies this node declares
    pub fn in_degree(&self) -> usize {
        self.edges.len()
    }
}

/// Dependency graph in discovery order
pub type DependencyGraph = IndexMap<String, DependencyNode>;

/// Successful resolution
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Dependencies before dependents
    pub order: Vec<String>,
    pub graph: DependencyGraph,
}

impl Resolution {
    /// Ids in the order that are not installed yet
    pub fn to_install(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.graph.get(*id).is_some_and(|n| !n.installed))
            .map(String::as_str)
            .collect()
    }
}

/// Whether `version` satisfies `constraint`
///
/// `*`, `latest` and the empty string accept any version; everything else is
/// a semver requirement (`^1.2`, `>=1.0, <2.0`, `~0.3.1`, `1.2.3`).
pub fn constraint_allows(constraint: &str, version: &str) -> bool {
    let constraint = constraint.trim();
    if constraint.is_empty() || constraint == "*" || constraint == "latest" {
        return true;
    }

    match (VersionReq::parse(constraint), leading_version(version)) {
        (Ok(req), Some(version)) => req.matches(&version),
        _ => false,
    }
}

/// Stateless resolver service
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `targets` into a load order
    ///
    /// # Errors
    ///
    /// - `NotFound` if a target is in neither catalog
    /// - `DependencyMissing` listing every missing required dependency
    /// - `DependencyConflict` listing every conflicting constraint
    /// - `DependencyCycle` listing every cycle
    /// - `DependencyOrderIncomplete` if ordering fails its safety check
    pub fn resolve(
        &self,
        targets: &[&str],
        installed: &Catalog,
        available: &Catalog,
    ) -> Result<Resolution, EngineError> {
        let (graph, missing) = self.build_graph(targets, installed, available)?;

        if !missing.is_empty() {
            tracing::warn!(count = missing.len(), "Missing dependencies");
            return Err(EngineError::DependencyMissing {
                plugin_id: targets.join(","),
                missing,
            });
        }

        let conflicts = self.find_conflicts(&graph);
        if !conflicts.is_empty() {
            tracing::warn!(count = conflicts.len(), "Dependency version conflicts");
            return Err(EngineError::DependencyConflict { conflicts });
        }

        let cycles = self.find_cycles(&graph);
        if !cycles.is_empty() {
            tracing::warn!(?cycles, "Dependency cycles detected");
            return Err(EngineError::DependencyCycle { cycles });
        }

        let order = self.topological_order(&graph)?;
        tracing::debug!(?order, "Dependencies resolved");

        Ok(Resolution { order, graph })
    }

    /// Walk the catalogs from `targets`, visiting each id once
    ///
    /// Returns the graph and every missing required dependency.
    pub fn build_graph(
        &self,
        targets: &[&str],
        installed: &Catalog,
        available: &Catalog,
    ) -> Result<(DependencyGraph, Vec<MissingDependency>), EngineError> {
        let mut graph = DependencyGraph::new();
        let mut missing = Vec::new();
        let mut stack: Vec<String> = Vec::new();

        for target in targets.iter().rev() {
            if lookup(target, installed, available).is_none() {
                return Err(EngineError::NotFound(format!("plugin {}", target)));
            }
            stack.push(target.to_string());
        }

        while let Some(id) = stack.pop() {
            if graph.contains_key(&id) {
                continue;
            }
            let Some((manifest, is_installed)) = lookup(&id, installed, available) else {
                continue;
            };

            let mut node = DependencyNode::new(manifest.clone(), is_installed);
            let mut edges = IndexSet::new();

            for dep in &manifest.dependencies {
                let present = if dep.required {
                    lookup(&dep.id, installed, available).is_some()
                } else {
                    installed.contains_key(&dep.id)
                };

                if present {
                    edges.insert(dep.id.clone());
                } else if dep.required {
                    missing.push(MissingDependency {
                        requester: id.clone(),
                        dependency_id: dep.id.clone(),
                        constraint: dep.version.clone(),
                    });
                }
            }

            for dep_id in edges.iter().rev() {
                if !graph.contains_key(dep_id) {
                    stack.push(dep_id.clone());
                }
            }
            node.edges = edges.into_iter().collect();
            graph.insert(id, node);
        }

        Ok((graph, missing))
    }

    /// Every constraint that rejects the resolved version of its dependency
    pub fn find_conflicts(&self, graph: &DependencyGraph) -> Vec<VersionConflict> {
        let mut requests: IndexMap<&str, Vec<ConstraintRequest>> = IndexMap::new();

        for node in graph.values() {
            for dep in &node.manifest.dependencies {
                if node.edges.contains(&dep.id) {
                    requests.entry(dep.id.as_str()).or_default().push(ConstraintRequest {
                        requester: node.id().to_string(),
                        constraint: dep.version.clone(),
                    });
                }
            }
        }

        requests
            .into_iter()
            .filter_map(|(dep_id, requests)| {
                let resolved = graph.get(dep_id)?.version().to_string();
                let conflicting: Vec<ConstraintRequest> = requests
                    .into_iter()
                    .filter(|r| !constraint_allows(&r.constraint, &resolved))
                    .collect();

                (!conflicting.is_empty()).then(|| VersionConflict {
                    dependency_id: dep_id.to_string(),
                    resolved_version: resolved,
                    conflicting,
                })
            })
            .collect()
    }

    /// Every distinct cycle, each listed from its first-visited node
    pub fn find_cycles(&self, graph: &DependencyGraph) -> Vec<Vec<String>> {
        const UNVISITED: u8 = 0;
        const ON_STACK: u8 = 1;
        const DONE: u8 = 2;

        let mut state: HashMap<&str, u8> = HashMap::new();
        let mut seen: HashSet<Vec<String>> = HashSet::new();
        let mut cycles = Vec::new();

        for root in graph.keys() {
            if state.get(root.as_str()).copied().unwrap_or(UNVISITED) != UNVISITED {
                continue;
            }

            // (node, index of next edge to explore)
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            let mut path: Vec<&str> = vec![root.as_str()];
            state.insert(root.as_str(), ON_STACK);

            while let Some((node, next)) = stack.last_mut() {
                let edges = graph.get(*node).map(|n| n.edges()).unwrap_or(&[]);

                if *next >= edges.len() {
                    state.insert(*node, DONE);
                    stack.pop();
                    path.pop();
                    continue;
                }

                let child = edges[*next].as_str();
                *next += 1;

                match state.get(child).copied().unwrap_or(UNVISITED) {
                    UNVISITED => {
                        state.insert(child, ON_STACK);
                        stack.push((child, 0));
                        path.push(child);
                    }
                    ON_STACK => {
                        if let Some(pos) = path.iter().position(|n| *n == child) {
                            let cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
                            if seen.insert(canonical_rotation(&cycle)) {
                                cycles.push(cycle);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        cycles
    }

    /// Kahn's algorithm: a node is ready once all its dependencies are placed
    ///
    /// Ties keep graph discovery order.
    pub fn topological_order(&self, graph: &DependencyGraph) -> Result<Vec<String>, EngineError> {
        let mut in_degree: IndexMap<&str, usize> =
            graph.iter().map(|(id, n)| (id.as_str(), n.in_degree())).collect();

        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, node) in graph {
            for dep in node.edges() {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(graph.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() != graph.len() {
            return Err(EngineError::DependencyOrderIncomplete {
                ordered: order.len(),
                total: graph.len(),
            });
        }

        Ok(order)
    }

    /// Whether `manifest` would (transitively) depend on itself
    ///
    /// Returns the offending path starting and ending at the manifest's id.
    pub fn self_dependency_path(
        &self,
        manifest: &Manifest,
        installed: &Catalog,
        available: &Catalog,
    ) -> Option<Vec<String>> {
        let mut parents: HashMap<String, String> = HashMap::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();

        for dep in manifest.dependency_ids() {
            if visited.insert(dep.to_string()) {
                parents.insert(dep.to_string(), manifest.id.clone());
                queue.push_back(dep.to_string());
            }
        }

        while let Some(id) = queue.pop_front() {
            if id == manifest.id {
                let mut path = vec![id.clone()];
                let mut cursor = parents.get(&id);
                while let Some(parent) = cursor {
                    path.push(parent.clone());
                    if *parent == manifest.id {
                        break;
                    }
                    cursor = parents.get(parent);
                }
                path.reverse();
                return Some(path);
            }

            let deps = installed.get(&id).or_else(|| available.get(&id));
            for dep in deps.into_iter().flat_map(|m| m.dependency_ids()) {
                if visited.insert(dep.to_string()) {
                    parents.insert(dep.to_string(), id.clone());
                    queue.push_back(dep.to_string());
                }
            }
        }

        None
    }
}

/// Installed manifests shadow available ones
fn lookup<'a>(id: &str, installed: &'a Catalog, available: &'a Catalog) -> Option<(&'a Manifest, bool)> {
    installed
        .get(id)
        .map(|m| (m, true))
        .or_else(|| available.get(id).map(|m| (m, false)))
}

/// Rotate a cycle so it starts at its smallest id, for deduplication
fn canonical_rotation(cycle: &[String]) -> Vec<String> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    cycle[start..].iter().chain(&cycle[..start]).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::manifest::Dependency;

    fn manifest(id: &str, version: &str, deps: &[(&str, &str)]) -> Manifest {
        deps.iter().fold(Manifest::new(id, version), |m, (dep, constraint)| {
            m.with_dependency(Dependency::required(*dep, *constraint))
        })
    }

    fn catalog(manifests: Vec<Manifest>) -> Catalog {
        manifests.into_iter().map(|m| (m.id.clone(), m)).collect()
    }

    #[test]
    fn test_constraint_allows() {
        assert!(constraint_allows("*", "0.0.1"));
        assert!(constraint_allows("", "9.0.0"));
        assert!(constraint_allows("^1.2", "1.4.0"));
        assert!(!constraint_allows("^1.2", "2.0.0"));
        assert!(constraint_allows(">=1.0.0, <2.0.0", "1.9.9-beta"));
        assert!(!constraint_allows("not a range", "1.0.0"));
    }

    #[test]
    fn test_node_in_degree_counts_declared_dependencies() {
        let installed = catalog(vec![
            manifest("a", "1.0.0", &[]),
            manifest("b", "1.0.0", &[("a", "*")]),
        ]);
        let (graph, _) = DependencyResolver::new()
            .build_graph(&["b"], &installed, &Catalog::new())
            .unwrap();
        assert_eq!(graph["b"].in_degree(), 1);
        assert_eq!(graph["a"].in_degree(), 0);
    }

    #[test]
    fn test_optional_missing_is_skipped() {
        let m = Manifest::new("solo", "1.0.0").with_dependency(Dependency::optional("ghost", "*"));
        let installed = catalog(vec![m]);
        let resolution = DependencyResolver::new()
            .resolve(&["solo"], &installed, &Catalog::new())
            .unwrap();
        assert_eq!(resolution.order, vec!["solo"]);
    }

    #[test]
    fn test_optional_joins_only_when_installed() {
        let app = Manifest::new("app", "1.0.0").with_dependency(Dependency::optional("theme", "*"));
        let theme = Manifest::new("theme", "1.0.0");
        let resolver = DependencyResolver::new();

        let available = catalog(vec![app.clone(), theme.clone()]);
        let resolution = resolver.resolve(&["app"], &Catalog::new(), &available).unwrap();
        assert_eq!(resolution.order, vec!["app"]);

        let installed = catalog(vec![theme]);
        let available = catalog(vec![app]);
        let resolution = resolver.resolve(&["app"], &installed, &available).unwrap();
        assert_eq!(resolution.order, vec!["theme", "app"]);
    }

    #[test]
    fn test_unknown_target() {
        let result = DependencyResolver::new().resolve(&["nope"], &Catalog::new(), &Catalog::new());
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_canonical_rotation() {
        let cycle = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(canonical_rotation(&cycle), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_self_dependency_path() {
        let available = catalog(vec![
            manifest("b", "1.0.0", &[("c", "*")]),
            manifest("c", "1.0.0", &[("a", "*")]),
        ]);
        let a = manifest("a", "1.0.0", &[("b", "*")]);
        let path = DependencyResolver::new()
            .self_dependency_path(&a, &Catalog::new(), &available)
            .unwrap();
        assert_eq!(path, vec!["a", "b", "c", "a"]);

        let clean = manifest("z", "1.0.0", &[("b", "*")]);
        assert!(DependencyResolver::new()
            .self_dependency_path(&clean, &Catalog::new(), &available)
            .is_none());
    }

    #[test]
    fn test_to_install_lists_uninstalled() {
        let installed = catalog(vec![manifest("a", "1.0.0", &[])]);
        let available = catalog(vec![manifest("b", "1.0.0", &[("a", "^1")])]);
        let resolution = DependencyResolver::new()
            .resolve(&["b"], &installed, &available)
            .unwrap();
        assert_eq!(resolution.order, vec!["a", "b"]);
        assert_eq!(resolution.to_install(), vec!["b"]);
    }
}
