use std::collections::HashSet;
use std::path::PathBuf;

use petgraph::Direction;
use petgraph::stable_graph::NodeIndex;
use serde::Serialize;

use super::graph::DependencyGraph;

/// A dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircularDep {
    /// Files in walk order. The first file is repeated at the end to close the cycle.
    pub files: Vec<PathBuf>,
}

impl CircularDep {
    /// Distinct files taking part in the cycle.
    pub fn members(&self) -> &[PathBuf] {
        &self.files[..self.files.len().saturating_sub(1)]
    }

    /// `a -> b -> c -> a`
    pub fn display_chain(&self) -> String {
        self.files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

struct Frame {
    node: NodeIndex,
    next: Vec<NodeIndex>,
    cursor: usize,
}

/// Detect dependency cycles with a depth-first walk over forward edges.
///
/// A global visited set ensures every node is walked once; the frames of the current
/// walk act as the recursion stack. Reaching a node that is still on the stack closes a
/// cycle, reported from that node back to itself. Roots and neighbours are visited in
/// path order, so the output is deterministic.
pub fn find_cycles(graph: &DependencyGraph) -> Vec<CircularDep> {
    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut on_stack: HashSet<NodeIndex> = HashSet::new();
    let mut cycles = Vec::new();

    for root in graph.sorted_nodes() {
        if !visited.insert(root) {
            continue;
        }
        on_stack.insert(root);
        let mut frames = vec![Frame {
            node: root,
            next: graph.sorted_neighbours(root, Direction::Outgoing),
            cursor: 0,
        }];

        while let Some(frame) = frames.last_mut() {
            let Some(&next) = frame.next.get(frame.cursor) else {
                on_stack.remove(&frame.node);
                frames.pop();
                continue;
            };
            frame.cursor += 1;

            if on_stack.contains(&next) {
                // Back edge: the cycle runs from `next`'s frame to the top of the stack.
                let start = frames.iter().position(|f| f.node == next).unwrap_or(0);
                let mut files: Vec<PathBuf> = frames[start..]
                    .iter()
                    .map(|f| graph.path_of(f.node).to_path_buf())
                    .collect();
                files.push(graph.path_of(next).to_path_buf());
                cycles.push(CircularDep { files });
            } else if visited.insert(next) {
                on_stack.insert(next);
                frames.push(Frame {
                    node: next,
                    next: graph.sorted_neighbours(next, Direction::Outgoing),
                    cursor: 0,
                });
            }
        }
    }

    cycles
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
