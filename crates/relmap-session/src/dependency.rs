//! Dependency graph used to order flush operations.
//!
//! Nodes are plain indices; the flush decides what they stand for (entity
//! level save/delete groups, or single rows once a cycle has to be broken).
//! An edge `a -> b` means `a` must execute before `b`.
//!
//! Ordering is deterministic: among nodes that are ready at the same time,
//! the one with the smallest priority goes first.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

const UNVISITED: usize = usize::MAX;

/// A strongly connected component in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// Members sorted by priority.
    pub nodes: Vec<usize>,
    /// More than one member, or a node that depends on itself.
    pub cyclic: bool,
}

/// Directed graph over `0..len` node indices.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: Vec<BTreeSet<usize>>,
}

impl DependencyGraph {
    pub fn new(nodes: usize) -> Self {
        Self {
            edges: vec![BTreeSet::new(); nodes],
        }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Require `before` to execute ahead of `after`.
    pub fn add_edge(&mut self, before: usize, after: usize) {
        self.edges[before].insert(after);
    }

    pub fn remove_edge(&mut self, before: usize, after: usize) -> bool {
        self.edges[before].remove(&after)
    }

    pub fn has_edge(&self, before: usize, after: usize) -> bool {
        self.edges[before].contains(&after)
    }

    pub fn successors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges[node].iter().copied()
    }

    /// Strongly connected components (Tarjan), without recursion so that
    /// long row-level chains cannot exhaust the stack.
    pub fn components(&self) -> Vec<Vec<usize>> {
        let n = self.edges.len();
        let mut index = vec![UNVISITED; n];
        let mut lowlink = vec![0; n];
        let mut on_stack = vec![false; n];
        let mut stack = Vec::new();
        let mut next = 0;
        let mut components = Vec::new();

        for root in 0..n {
            if index[root] != UNVISITED {
                continue;
            }
            let mut call: Vec<(usize, Vec<usize>, usize)> = Vec::new();
            index[root] = next;
            lowlink[root] = next;
            next += 1;
            stack.push(root);
            on_stack[root] = true;
            call.push((root, self.successors(root).collect(), 0));

            while let Some(frame) = call.last_mut() {
                let v = frame.0;
                if frame.2 < frame.1.len() {
                    let w = frame.1[frame.2];
                    frame.2 += 1;
                    if index[w] == UNVISITED {
                        index[w] = next;
                        lowlink[w] = next;
                        next += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        call.push((w, self.successors(w).collect(), 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                    continue;
                }

                call.pop();
                if let Some(parent) = call.last() {
                    lowlink[parent.0] = lowlink[parent.0].min(lowlink[v]);
                }
                if lowlink[v] == index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }
        components
    }

    /// Components in a valid execution order.
    ///
    /// Kahn's algorithm over the condensation; ties go to the component whose
    /// smallest member priority is lowest, so independent work keeps its
    /// natural order.
    pub fn order<K: Ord + Clone>(&self, priority: &[K]) -> Vec<Component> {
        let components = self.components();
        let mut component_of = vec![0; self.len()];
        for (c, members) in components.iter().enumerate() {
            for &node in members {
                component_of[node] = c;
            }
        }

        let mut indegree = vec![0usize; components.len()];
        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
        let mut cyclic = vec![false; components.len()];
        for (node, targets) in self.edges.iter().enumerate() {
            let from = component_of[node];
            for &target in targets {
                let to = component_of[target];
                if from == to {
                    cyclic[from] = true;
                } else if successors[from].insert(to) {
                    indegree[to] += 1;
                }
            }
        }

        let rank: Vec<K> = components
            .iter()
            .map(|members| {
                members
                    .iter()
                    .map(|&n| priority[n].clone())
                    .min()
                    .unwrap_or_else(|| priority[0].clone())
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(K, usize)>> = (0..components.len())
            .filter(|&c| indegree[c] == 0)
            .map(|c| Reverse((rank[c].clone(), c)))
            .collect();

        let mut ordered = Vec::with_capacity(components.len());
        while let Some(Reverse((_, c))) = ready.pop() {
            for &next in &successors[c] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse((rank[next].clone(), next)));
                }
            }
            let mut nodes = components[c].clone();
            nodes.sort_by(|a, b| priority[*a].cmp(&priority[*b]).then(a.cmp(b)));
            ordered.push(Component {
                cyclic: cyclic[c] || nodes.len() > 1,
                nodes,
            });
        }
        ordered
    }
}
