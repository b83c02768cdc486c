//! Waits-for graph between identities that are being resolved.
//!
//! Design:
//! - Forward edges: identity -> identities its factory is currently awaiting
//! - Reverse edges: identity -> identities whose factories are awaiting it
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! An edge is counted, because one factory may await the same identity from
//! two concurrent branches; it disappears once every wait has finished.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    /// Forward edges: waiting identity -> (awaited identity -> wait count)
    edges: HashMap<String, HashMap<String, usize>>,

    /// Reverse edges: awaited identity -> identities waiting for it
    reverse_edges: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record that the factory of `waiting` now awaits `awaited`.
    pub(crate) fn add_dependency(&mut self, waiting: &str, awaited: &str) {
        *self
            .edges
            .entry(waiting.to_string())
            .or_default()
            .entry(awaited.to_string())
            .or_default() += 1;
        self.reverse_edges
            .entry(awaited.to_string())
            .or_default()
            .insert(waiting.to_string());
    }

    /// One wait of `waiting` on `awaited` has finished.
    pub(crate) fn remove_dependency(&mut self, waiting: &str, awaited: &str) {
        let Some(targets) = self.edges.get_mut(waiting) else {
            return;
        };
        let Some(count) = targets.get_mut(awaited) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        targets.remove(awaited);
        if targets.is_empty() {
            self.edges.remove(waiting);
        }
        if let Some(waiters) = self.reverse_edges.get_mut(awaited) {
            waiters.remove(waiting);
            if waiters.is_empty() {
                self.reverse_edges.remove(awaited);
            }
        }
    }

    pub(crate) fn get_dependencies(&self, waiting: &str) -> Vec<String> {
        self.edges
            .get(waiting)
            .map(|deps| deps.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn get_waiting(&self, awaited: &str) -> Vec<String> {
        self.reverse_edges
            .get(awaited)
            .map(|waiting| waiting.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Would `waiting -> awaited` close a cycle?
    ///
    /// Returns the cycle starting and ending at `awaited`, e.g.
    /// `["A", "B", "A"]` when `B` wants to wait on `A` while `A` already
    /// waits on `B`.
    pub(crate) fn cycle_through(&self, waiting: &str, awaited: &str) -> Option<Vec<String>> {
        if waiting == awaited {
            return Some(vec![awaited.to_string(), awaited.to_string()]);
        }
        let mut path = self.find_path(awaited, waiting)?;
        path.push(awaited.to_string());
        Some(path)
    }

    /// Depth-first search for a path `from ->* to` along forward edges.
    pub(crate) fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut stack = vec![from.to_string()];
        let mut visited: HashSet<String> = HashSet::new();
        let mut prev: HashMap<String, String> = HashMap::new();
        visited.insert(from.to_string());

        while let Some(node) = stack.pop() {
            if node == to {
                return Some(Self::follow_path(from, to, &prev));
            }
            for dep in self.get_dependencies(&node) {
                if visited.insert(dep.clone()) {
                    prev.insert(dep.clone(), node.clone());
                    stack.push(dep);
                }
            }
        }
        None
    }

    fn follow_path(from: &str, to: &str, prev: &HashMap<String, String>) -> Vec<String> {
        let mut path = vec![to.to_string()];
        let mut current = to;
        while current != from {
            match prev.get(current) {
                Some(p) => {
                    path.push(p.clone());
                    current = p.as_str();
                }
                None => break,
            }
        }
        path.reverse();
        path
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.edges.is_empty() && self.reverse_edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_graph_is_empty() {
        let graph = DependencyGraph::new();
        assert!(graph.is_empty());
        assert!(graph.get_dependencies("A").is_empty());
    }

    #[test]
    fn add_dependency_creates_both_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("B", "A");

        assert_eq!(graph.get_dependencies("B"), vec!["A".to_string()]);
        assert_eq!(graph.get_waiting("A"), vec!["B".to_string()]);
        assert!(graph.get_dependencies("A").is_empty());
    }

    #[test]
    fn remove_dependency_removes_both_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("B", "A");
        graph.remove_dependency("B", "A");

        assert!(graph.is_empty());
        assert!(graph.get_waiting("A").is_empty());
    }

    #[test]
    fn counted_edges_survive_until_last_wait_ends() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("B", "A");
        graph.add_dependency("B", "A");

        graph.remove_dependency("B", "A");
        assert_eq!(graph.get_dependencies("B"), vec!["A".to_string()]);

        graph.remove_dependency("B", "A");
        assert!(graph.is_empty());
    }

    #[test]
    fn detect_self_dependency() {
        let graph = DependencyGraph::new();
        assert_eq!(
            graph.cycle_through("A", "A"),
            Some(vec!["A".to_string(), "A".to_string()])
        );
    }

    #[test]
    fn detect_simple_cycle() {
        let mut graph = DependencyGraph::new();
        // A is waiting on B; B now wants A.
        graph.add_dependency("A", "B");

        let cycle = graph.cycle_through("B", "A").unwrap();
        assert_eq!(cycle, vec!["A", "B", "A"]);
    }

    #[test]
    fn detect_longer_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("A", "B");
        graph.add_dependency("B", "C");

        let cycle = graph.cycle_through("C", "A").unwrap();
        assert_eq!(cycle, vec!["A", "B", "C", "A"]);
    }

    #[test]
    fn chain_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("A", "B");
        graph.add_dependency("B", "C");

        assert!(graph.cycle_through("A", "C").is_none());
        assert!(graph.cycle_through("D", "A").is_none());
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        // A waits on B and C, both wait on D.
        graph.add_dependency("A", "B");
        graph.add_dependency("A", "C");
        graph.add_dependency("B", "D");

        assert!(
            graph.cycle_through("C", "D").is_none(),
            "Diamond should not have cycles!"
        );
    }

    #[test]
    fn convergent_paths_find_a_single_route() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency("A", "B");
        graph.add_dependency("A", "C");
        graph.add_dependency("B", "D");
        graph.add_dependency("C", "D");

        let path = graph.find_path("A", "D").unwrap();
        assert_eq!(path.first().map(String::as_str), Some("A"));
        assert_eq!(path.last().map(String::as_str), Some("D"));
        assert_eq!(path.len(), 3);
    }
}
