use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};

/// Bidirectional file dependency graph.
///
/// An edge `f -> d` means "`f` depends on `d`". The same edge is the forward entry of `f`
/// and the reverse (dependent) entry of `d`, so the two directions can never disagree.
/// Nodes left without any edge are pruned after every mutation: no path ever maps to an
/// empty dependency or dependent set.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    graph: StableGraph<PathBuf, ()>,
    index: HashMap<PathBuf, NodeIndex>,
    last_modified: HashMap<PathBuf, DateTime<Utc>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the forward edges of `file` with `deps`.
    ///
    /// Stale edges (and their reverse entries) are removed, new ones added, and edges
    /// that survive are left untouched. Self references are ignored.
    pub fn set_dependencies(&mut self, file: &Path, deps: &[PathBuf]) {
        let wanted: HashSet<&Path> = deps
            .iter()
            .map(PathBuf::as_path)
            .filter(|d| *d != file)
            .collect();
        self.last_modified.insert(file.to_path_buf(), Utc::now());

        let existing = self.index.get(file).copied();
        if existing.is_none() && wanted.is_empty() {
            return;
        }
        let file_idx = match existing {
            Some(idx) => idx,
            None => self.intern(file),
        };

        // Drop edges to dependencies that are no longer referenced.
        let stale: Vec<_> = self
            .graph
            .edges_directed(file_idx, Direction::Outgoing)
            .filter(|e| !wanted.contains(self.graph[e.target()].as_path()))
            .map(|e| (e.id(), e.target()))
            .collect();
        for (edge, target) in &stale {
            self.graph.remove_edge(*edge);
            self.prune(*target);
        }

        for dep in wanted {
            let dep_idx = self.intern(dep);
            if self.graph.find_edge(file_idx, dep_idx).is_none() {
                self.graph.add_edge(file_idx, dep_idx, ());
            }
        }

        self.prune(file_idx);
    }

    /// Remove `file` and every edge touching it. Returns `true` if it was in the graph.
    pub fn remove_file(&mut self, file: &Path) -> bool {
        self.last_modified.remove(file);
        let Some(idx) = self.index.remove(file) else {
            return false;
        };
        let neighbours: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .chain(self.graph.neighbors_directed(idx, Direction::Incoming))
            .collect();
        self.graph.remove_node(idx);
        for n in neighbours {
            self.prune(n);
        }
        true
    }

    /// Direct dependencies of `file`, sorted.
    pub fn dependencies(&self, file: &Path) -> Vec<PathBuf> {
        self.neighbours(file, Direction::Outgoing)
    }

    /// Files that directly depend on `file`, sorted.
    pub fn dependents(&self, file: &Path) -> Vec<PathBuf> {
        self.neighbours(file, Direction::Incoming)
    }

    /// All files reachable by following "depended-on-by" edges from `file`, excluding `file`.
    ///
    /// Breadth-first with a visited set, so it terminates on cyclic graphs. Results are
    /// ordered by BFS depth, then by path.
    pub fn transitive_dependents(&self, file: &Path) -> Vec<PathBuf> {
        let Some(&start) = self.index.get(file) else {
            return Vec::new();
        };

        let mut queue: VecDeque<(NodeIndex, usize)> = VecDeque::from([(start, 0)]);
        let mut visited: HashSet<NodeIndex> = HashSet::from([start]);
        let mut found: Vec<(usize, NodeIndex)> = Vec::new();

        while let Some((current, depth)) = queue.pop_front() {
            for source in self.graph.neighbors_directed(current, Direction::Incoming) {
                if visited.insert(source) {
                    found.push((depth + 1, source));
                    queue.push_back((source, depth + 1));
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| self.graph[a.1].cmp(&self.graph[b.1])));
        found
            .into_iter()
            .map(|(_, idx)| self.graph[idx].clone())
            .collect()
    }

    /// Every transitive dependency of `file`, deduplicated, in depth-first discovery order.
    ///
    /// The start node is not pre-marked as visited: in a cycle it is reported once when
    /// the walk reaches it again.
    pub fn dependency_chain(&self, file: &Path) -> Vec<PathBuf> {
        let Some(&start) = self.index.get(file) else {
            return Vec::new();
        };

        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut chain = Vec::new();
        // Pushed in reverse so the smallest path is explored first.
        let mut stack: Vec<NodeIndex> = self.sorted_neighbours(start, Direction::Outgoing);
        stack.reverse();

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            chain.push(self.graph[current].clone());
            for dep in self
                .sorted_neighbours(current, Direction::Outgoing)
                .into_iter()
                .rev()
            {
                if !visited.contains(&dep) {
                    stack.push(dep);
                }
            }
        }
        chain
    }

    pub fn contains(&self, file: &Path) -> bool {
        self.index.contains_key(file)
    }

    /// When the dependency set of `file` was last recorded.
    pub fn last_modified(&self, file: &Path) -> Option<DateTime<Utc>> {
        self.last_modified.get(file).copied()
    }

    pub fn node_count(&self) -> usize {
        self.index.len()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Paths of every node under `dir` (including `dir` itself).
    pub fn files_under(&self, dir: &Path) -> Vec<PathBuf> {
        self.index
            .keys()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect()
    }

    /// Every `(file, dependency)` edge, sorted.
    pub fn edges(&self) -> Vec<(PathBuf, PathBuf)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_references()
            .map(|e| (self.graph[e.source()].clone(), self.graph[e.target()].clone()))
            .collect();
        edges.sort();
        edges
    }

    /// Node indices sorted by path, for deterministic traversals.
    pub(super) fn sorted_nodes(&self) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self.index.values().copied().collect();
        nodes.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        nodes
    }

    pub(super) fn sorted_neighbours(&self, idx: NodeIndex, dir: Direction) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.neighbors_directed(idx, dir).collect();
        out.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
        out.dedup();
        out
    }

    pub(super) fn path_of(&self, idx: NodeIndex) -> &Path {
        &self.graph[idx]
    }

    fn neighbours(&self, file: &Path, dir: Direction) -> Vec<PathBuf> {
        match self.index.get(file) {
            Some(&idx) => self
                .sorted_neighbours(idx, dir)
                .into_iter()
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    fn intern(&mut self, path: &Path) -> NodeIndex {
        if let Some(&idx) = self.index.get(path) {
            return idx;
        }
        let idx = self.graph.add_node(path.to_path_buf());
        self.index.insert(path.to_path_buf(), idx);
        idx
    }

    /// Remove `idx` if it no longer has any edge.
    fn prune(&mut self, idx: NodeIndex) {
        let isolated = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .next()
            .is_none()
            && self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .next()
                .is_none();
        if isolated {
            if let Some(path) = self.graph.remove_node(idx) {
                self.index.remove(&path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(name: &str) -> PathBuf {
        PathBuf::from("/proj").join(name)
    }

    /// Every forward edge has its reverse twin and no node is isolated.
    fn assert_symmetric(graph: &DependencyGraph) {
        for (file, dep) in graph.edges() {
            assert!(graph.dependencies(&file).contains(&dep));
            assert!(graph.dependents(&dep).contains(&file));
        }
        for file in graph.index.keys() {
            assert!(
                !graph.dependencies(file).is_empty() || !graph.dependents(file).is_empty(),
                "{} is isolated but still indexed",
                file.display()
            );
        }
    }

    #[test]
    fn test_set_dependencies_replaces_stale_edges() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("a.cue"), &[p("b.cue"), p("c.cue")]);
        assert_eq!(graph.dependencies(&p("a.cue")), vec![p("b.cue"), p("c.cue")]);

        graph.set_dependencies(&p("a.cue"), &[p("c.cue"), p("d.cue")]);
        assert_eq!(graph.dependencies(&p("a.cue")), vec![p("c.cue"), p("d.cue")]);
        assert!(graph.dependents(&p("b.cue")).is_empty());
        assert!(!graph.contains(&p("b.cue")), "orphaned node must be pruned");
        assert_symmetric(&graph);
    }

    #[test]
    fn test_empty_dependencies_leave_no_node() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("a.cue"), &[]);
        assert_eq!(graph.node_count(), 0);
        assert!(graph.last_modified(&p("a.cue")).is_some());

        graph.set_dependencies(&p("a.cue"), &[p("b.cue")]);
        graph.set_dependencies(&p("a.cue"), &[]);
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_self_reference_ignored() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("a.cue"), &[p("a.cue")]);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_remove_file_cleans_both_directions() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("c.cue"), &[p("b.cue")]);
        graph.set_dependencies(&p("b.cue"), &[p("a.cue")]);

        assert!(graph.remove_file(&p("b.cue")));
        assert!(graph.dependencies(&p("c.cue")).is_empty());
        assert!(graph.dependents(&p("a.cue")).is_empty());
        assert_eq!(graph.node_count(), 0);
        assert!(!graph.remove_file(&p("b.cue")));
        assert_symmetric(&graph);
    }

    #[test]
    fn test_transitive_dependents_ordered_by_depth() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("c.cue"), &[p("b.cue")]);
        graph.set_dependencies(&p("d.cue"), &[p("c.cue")]);
        graph.set_dependencies(&p("e.cue"), &[p("b.cue")]);

        assert_eq!(
            graph.transitive_dependents(&p("b.cue")),
            vec![p("c.cue"), p("e.cue"), p("d.cue")]
        );
        assert!(graph.transitive_dependents(&p("unknown.cue")).is_empty());
    }

    #[test]
    fn test_traversals_terminate_on_cycles() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("a.cue"), &[p("b.cue")]);
        graph.set_dependencies(&p("b.cue"), &[p("c.cue")]);
        graph.set_dependencies(&p("c.cue"), &[p("a.cue")]);

        assert_eq!(
            graph.dependency_chain(&p("a.cue")),
            vec![p("b.cue"), p("c.cue"), p("a.cue")]
        );

        let dependents: HashSet<PathBuf> =
            graph.transitive_dependents(&p("a.cue")).into_iter().collect();
        assert_eq!(dependents, HashSet::from([p("b.cue"), p("c.cue")]));
    }

    #[test]
    fn test_dependency_chain_deduplicates_diamond() {
        let mut graph = DependencyGraph::new();
        graph.set_dependencies(&p("a.cue"), &[p("b.cue"), p("c.cue")]);
        graph.set_dependencies(&p("b.cue"), &[p("d.cue")]);
        graph.set_dependencies(&p("c.cue"), &[p("d.cue")]);

        assert_eq!(
            graph.dependency_chain(&p("a.cue")),
            vec![p("b.cue"), p("d.cue"), p("c.cue")]
        );
    }
}
