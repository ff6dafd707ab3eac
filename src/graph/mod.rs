//! Dependency graph storage, acyclicity validation, and readiness math.
//!
//! [`DependencyGraph`] stores the node/edge structure of a workflow (or of a
//! raw job set inside the queue) and answers the three questions the engine
//! asks of it:
//!
//! - is the graph acyclic? ([`DependencyGraph::validate`], three-color DFS)
//! - which nodes are ready given a completed set? ([`DependencyGraph::ready_frontier`])
//! - who transitively depends on a node? ([`DependencyGraph::transitive_dependents`],
//!   used for SKIP_DEPENDENTS cascades)
//!
//! The graph is generic over any hashable, printable node-id type so the
//! same implementation serves string node ids and integer job ids uniformly.
//! Disconnected subgraphs are valid; validation is O(V+E) and runs once at
//! registration, never at runtime.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

/// A cycle was found in a dependency edge set.
///
/// Carries the offending path (closed: first and last entries are the same
/// node) rendered for diagnostics. Self-loops report a two-entry path.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("circular dependency detected: {path}")]
#[diagnostic(
    code(flowsmith::graph::circular_dependency),
    help("Remove one of the edges along the reported path; workflows must be acyclic.")
)]
pub struct CircularDependencyError {
    /// Human-readable cycle path, e.g. `a -> b -> a`.
    pub path: String,
}

/// DFS colors for cycle detection: unvisited / in-progress / done.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Directed dependency structure: an edge `node -> dep` means `node`
/// depends on (must run after) `dep`.
#[derive(Clone, Debug)]
pub struct DependencyGraph<N>
where
    N: Eq + Hash + Clone + fmt::Debug + fmt::Display,
{
    dependencies: FxHashMap<N, FxHashSet<N>>,
    dependents: FxHashMap<N, FxHashSet<N>>,
}

impl<N> Default for DependencyGraph<N>
where
    N: Eq + Hash + Clone + fmt::Debug + fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<N> DependencyGraph<N>
where
    N: Eq + Hash + Clone + fmt::Debug + fmt::Display,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            dependencies: FxHashMap::default(),
            dependents: FxHashMap::default(),
        }
    }

    /// Build a graph from `(node, dependency)` edge pairs.
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (N, N)>,
    {
        let mut graph = Self::new();
        for (node, dep) in edges {
            graph.add_dependency(node, dep);
        }
        graph
    }

    /// Register a node with no edges (idempotent).
    pub fn add_node(&mut self, node: N) {
        self.dependencies.entry(node.clone()).or_default();
        self.dependents.entry(node).or_default();
    }

    /// Add the edge `node -> dep`. Both endpoints are registered as nodes.
    pub fn add_dependency(&mut self, node: N, dep: N) {
        self.add_node(node.clone());
        self.add_node(dep.clone());
        self.dependencies
            .entry(node.clone())
            .or_default()
            .insert(dep.clone());
        self.dependents.entry(dep).or_default().insert(node);
    }

    #[must_use]
    pub fn contains(&self, node: &N) -> bool {
        self.dependencies.contains_key(node)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.dependencies.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.dependencies.keys()
    }

    /// Direct dependencies of `node` (empty set for unknown nodes).
    pub fn dependencies_of(&self, node: &N) -> impl Iterator<Item = &N> {
        self.dependencies.get(node).into_iter().flatten()
    }

    /// Direct dependents of `node` (empty set for unknown nodes).
    pub fn dependents_of(&self, node: &N) -> impl Iterator<Item = &N> {
        self.dependents.get(node).into_iter().flatten()
    }

    /// Validate acyclicity with a three-color depth-first search.
    ///
    /// Detects self-loops and transitive cycles in O(V+E). Disconnected
    /// subgraphs validate fine. On failure the error carries the offending
    /// cycle path.
    pub fn validate(&self) -> Result<(), CircularDependencyError> {
        let mut marks: FxHashMap<&N, Mark> = self
            .dependencies
            .keys()
            .map(|n| (n, Mark::White))
            .collect();

        // Iterative DFS with an explicit path stack so deep chains cannot
        // overflow the call stack.
        for root in self.dependencies.keys() {
            if marks[root] != Mark::White {
                continue;
            }
            // Each frame is (node, iterator over its dependencies).
            let mut stack: Vec<(&N, std::collections::hash_set::Iter<'_, N>)> = Vec::new();
            let mut path: Vec<&N> = Vec::new();

            marks.insert(root, Mark::Gray);
            path.push(root);
            stack.push((root, self.dependencies[root].iter()));

            while let Some((_, iter)) = stack.last_mut() {
                match iter.next() {
                    Some(dep) => match marks[dep] {
                        Mark::White => {
                            marks.insert(dep, Mark::Gray);
                            path.push(dep);
                            stack.push((dep, self.dependencies[dep].iter()));
                        }
                        Mark::Gray => {
                            // Back edge: the cycle is the path suffix from
                            // the first occurrence of `dep`, closed on itself.
                            let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|n| n.to_string()).collect();
                            cycle.push(dep.to_string());
                            return Err(CircularDependencyError {
                                path: cycle.join(" -> "),
                            });
                        }
                        Mark::Black => {}
                    },
                    None => {
                        let (done, _) = stack.pop().expect("frame present in loop");
                        marks.insert(done, Mark::Black);
                        path.pop();
                    }
                }
            }
        }
        Ok(())
    }

    /// True when every dependency of `node` is in `completed`.
    #[must_use]
    pub fn is_ready(&self, node: &N, completed: &FxHashSet<N>) -> bool {
        self.dependencies_of(node).all(|d| completed.contains(d))
    }

    /// Nodes outside `exclude` whose dependencies are all in `completed`.
    ///
    /// `exclude` is the set of nodes already started or terminal; the
    /// returned frontier is unordered.
    #[must_use]
    pub fn ready_frontier(&self, completed: &FxHashSet<N>, exclude: &FxHashSet<N>) -> Vec<N> {
        self.dependencies
            .keys()
            .filter(|node| !exclude.contains(*node) && !completed.contains(*node))
            .filter(|node| self.is_ready(node, completed))
            .cloned()
            .collect()
    }

    /// All nodes reachable from `node` by following dependent edges
    /// (excluding `node` itself). Breadth-first.
    #[must_use]
    pub fn transitive_dependents(&self, node: &N) -> FxHashSet<N> {
        let mut seen: FxHashSet<N> = FxHashSet::default();
        let mut queue: VecDeque<&N> = self.dependents_of(node).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents_of(next));
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> DependencyGraph<String> {
        DependencyGraph::from_edges(
            edges
                .iter()
                .map(|(a, b)| ((*a).to_string(), (*b).to_string())),
        )
    }

    #[test]
    fn empty_graph_is_valid() {
        let g: DependencyGraph<String> = DependencyGraph::new();
        assert!(g.validate().is_ok());
    }

    #[test]
    fn linear_chain_is_valid() {
        let g = graph(&[("b", "a"), ("c", "b")]);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(&[("a", "a")]);
        let err = g.validate().unwrap_err();
        assert!(err.path.contains("a -> a"), "path was: {}", err.path);
    }

    #[test]
    fn transitive_cycle_is_detected() {
        let g = graph(&[("b", "a"), ("c", "b"), ("a", "c")]);
        assert!(g.validate().is_err());
    }

    #[test]
    fn disconnected_subgraphs_are_valid() {
        let g = graph(&[("b", "a"), ("d", "c")]);
        assert!(g.validate().is_ok());
    }

    #[test]
    fn integer_ids_work_uniformly() {
        let g = DependencyGraph::from_edges([(2u64, 1u64), (3, 2), (1, 3)]);
        assert!(g.validate().is_err());
        let ok = DependencyGraph::from_edges([(2u64, 1u64), (3, 2)]);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn ready_frontier_tracks_completed_set() {
        let g = graph(&[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")]);
        let none = FxHashSet::default();
        let mut frontier = g.ready_frontier(&none, &none);
        frontier.sort();
        assert_eq!(frontier, vec!["a".to_string()]);

        let completed: FxHashSet<String> = ["a".to_string()].into_iter().collect();
        let mut frontier = g.ready_frontier(&completed, &none);
        frontier.sort();
        assert_eq!(frontier, vec!["b".to_string(), "c".to_string()]);

        // d needs both b and c.
        let partial: FxHashSet<String> =
            ["a".to_string(), "b".to_string()].into_iter().collect();
        let frontier = g.ready_frontier(&partial, &none);
        assert_eq!(frontier, vec!["c".to_string()]);
    }

    #[test]
    fn transitive_dependents_cover_the_cascade() {
        let g = graph(&[("b", "a"), ("c", "b"), ("d", "c"), ("x", "a")]);
        let mut deps: Vec<String> = g
            .transitive_dependents(&"b".to_string())
            .into_iter()
            .collect();
        deps.sort();
        assert_eq!(deps, vec!["c".to_string(), "d".to_string()]);
    }
}
