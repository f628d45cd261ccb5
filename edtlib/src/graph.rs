//! Dependency graph between nodes.
//!
//! An edge `a -> b` means `a` depends on `b`: a child on its parent, a node
//! on the targets of its phandles and on its interrupt controllers. The
//! strongly connected components of the graph, in topological order, give
//! every node its dependency ordinal.

use std::{cmp::Reverse, collections::BinaryHeap};

use indexmap::IndexSet;

use crate::node::NodeIndex;

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: IndexSet<NodeIndex>,
    succs: Vec<IndexSet<usize>>,
    preds: Vec<IndexSet<usize>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `node` if it is not in the graph yet.
    pub fn add_node(&mut self, node: NodeIndex) -> usize {
        let (i, added) = self.nodes.insert_full(node);
        if added {
            self.succs.push(IndexSet::new());
            self.preds.push(IndexSet::new());
        }
        i
    }

    /// Records that `from` depends on `to`.
    pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex) {
        let from = self.add_node(from);
        let to = self.add_node(to);

        self.succs[from].insert(to);
        self.preds[to].insert(from);
    }

    pub fn contains(&self, node: NodeIndex) -> bool {
        self.nodes.contains(&node)
    }

    /// Nodes `node` depends on directly.
    pub fn depends_on(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(node, &self.succs)
    }

    /// Nodes that depend directly on `node`.
    pub fn required_by(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.neighbors(node, &self.preds)
    }

    fn neighbors(&self, node: NodeIndex, edges: &[IndexSet<usize>]) -> Vec<NodeIndex> {
        let Some(i) = self.nodes.get_index_of(&node) else {
            return Vec::new();
        };

        edges[i].iter().map(|j| self.nodes[*j]).collect()
    }

    /// The strongly connected components, dependencies first. Ties between
    /// independent components go to the one holding the earliest inserted
    /// node; nodes within a component keep insertion order.
    pub fn scc_order(&self) -> Vec<Vec<NodeIndex>> {
        let components = self.components();

        let mut component_of = vec![0; self.nodes.len()];
        for (c, members) in components.iter().enumerate() {
            for v in members {
                component_of[*v] = c;
            }
        }

        let mut pending = vec![0usize; components.len()];
        let mut dependents: Vec<IndexSet<usize>> = vec![IndexSet::new(); components.len()];
        for (c, members) in components.iter().enumerate() {
            let deps: IndexSet<usize> = members
                .iter()
                .flat_map(|v| self.succs[*v].iter().map(|w| component_of[*w]))
                .filter(|d| *d != c)
                .collect();
            pending[c] = deps.len();
            for d in deps {
                dependents[d].insert(c);
            }
        }

        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = components
            .iter()
            .enumerate()
            .filter(|(c, _)| pending[*c] == 0)
            .map(|(c, members)| Reverse((members[0], c)))
            .collect();

        let mut order = Vec::with_capacity(components.len());
        while let Some(Reverse((_, c))) = ready.pop() {
            order.push(components[c].iter().map(|v| self.nodes[*v]).collect());
            for d in &dependents[c] {
                pending[*d] -= 1;
                if pending[*d] == 0 {
                    ready.push(Reverse((components[*d][0], *d)));
                }
            }
        }

        order
    }

    /// Tarjan's algorithm, iterative. Members of each component are sorted
    /// by insertion index.
    fn components(&self) -> Vec<Vec<usize>> {
        let n = self.nodes.len();
        let mut index: Vec<Option<usize>> = vec![None; n];
        let mut lowlink = vec![0; n];
        let mut on_stack = vec![false; n];
        let mut stack = Vec::new();
        let mut components = Vec::new();
        let mut next = 0;

        for start in 0..n {
            if index[start].is_some() {
                continue;
            }

            index[start] = Some(next);
            lowlink[start] = next;
            next += 1;
            stack.push(start);
            on_stack[start] = true;

            let mut work = vec![(start, 0usize)];
            while let Some((v, edge)) = work.last_mut() {
                let v = *v;

                if let Some(&w) = self.succs[v].get_index(*edge) {
                    *edge += 1;
                    match index[w] {
                        None => {
                            index[w] = Some(next);
                            lowlink[w] = next;
                            next += 1;
                            stack.push(w);
                            on_stack[w] = true;
                            work.push((w, 0));
                        }
                        Some(wi) if on_stack[w] => lowlink[v] = lowlink[v].min(wi),
                        Some(_) => {}
                    }
                    continue;
                }

                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }

                if index[v] == Some(lowlink[v]) {
                    let mut component = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.sort_unstable();
                    components.push(component);
                }
            }
        }

        components
    }
}
