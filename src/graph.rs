//! Dependency graph over `(name, type)` nodes.
//!
//! An edge `A -> B` means A requires B to exist first. Nodes keep the order in
//! which they were first seen; that order breaks ties during sorting, so the
//! same chains always produce the same plan.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::objects::ObjectNode;
use crate::parser::{build_dependency_map, DependencyChain};

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    nodes: Vec<ObjectNode>,
    index: HashMap<ObjectNode, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    edges: HashSet<(usize, usize)>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: ObjectNode) -> usize {
        if let Some(&id) = self.index.get(&node) {
            return id;
        }
        let id = self.nodes.len();
        self.index.insert(node.clone(), id);
        self.nodes.push(node);
        self.deps.push(vec![]);
        self.dependents.push(vec![]);
        id
    }

    /// Records that `from` requires `to`. Duplicate edges are ignored;
    /// self-loops are kept and later reported as cycles.
    pub fn add_edge(&mut self, from: ObjectNode, to: ObjectNode) {
        let from = self.add_node(from);
        let to = self.add_node(to);
        if self.edges.insert((from, to)) {
            self.deps[from].push(to);
            self.dependents[to].push(from);
        }
    }

    pub fn nodes(&self) -> &[ObjectNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, node: &ObjectNode) -> bool {
        self.index.contains_key(node)
    }

    pub fn dependencies(&self, node: &ObjectNode) -> Vec<&ObjectNode> {
        self.index
            .get(node)
            .map(|&id| self.deps[id].iter().map(|&d| &self.nodes[d]).collect())
            .unwrap_or_default()
    }

    pub fn dependents(&self, node: &ObjectNode) -> Vec<&ObjectNode> {
        self.index
            .get(node)
            .map(|&id| self.dependents[id].iter().map(|&d| &self.nodes[d]).collect())
            .unwrap_or_default()
    }

    /// `node` plus everything it transitively depends on.
    pub fn closure(&self, node: &ObjectNode) -> HashSet<ObjectNode> {
        let mut seen = HashSet::new();
        let Some(&start) = self.index.get(node) else {
            return HashSet::new();
        };
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.deps[id].iter().copied());
            }
        }
        seen.into_iter().map(|id| self.nodes[id].clone()).collect()
    }
}

/// Flattens every chain into one graph. Nodes are numbered in chain order and
/// the edges come from [`build_dependency_map`].
pub fn build_view_dependency_graph(chains: &[DependencyChain]) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for chain in chains {
        for node in &chain.nodes {
            graph.add_node(node.clone());
        }
    }
    for (node, deps) in build_dependency_map(chains) {
        for dep in deps {
            graph.add_edge(node.clone(), dep);
        }
    }
    graph
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopoOrder {
    /// Dependencies before dependents.
    pub order: Vec<ObjectNode>,
    /// One entry per cycle, closing with a repeat of its first node.
    pub cycles: Vec<Vec<ObjectNode>>,
}

impl TopoOrder {
    pub fn in_cycle(&self, node: &ObjectNode) -> Option<&Vec<ObjectNode>> {
        self.cycles.iter().find(|cycle| cycle.contains(node))
    }
}

/// Kahn's algorithm. Nodes that can never reach zero unresolved dependencies
/// are left out of `order`; the cycles that hold them back are returned.
pub fn topo_sort_nodes(graph: &DependencyGraph) -> TopoOrder {
    let mut pending: Vec<usize> = graph.deps.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = (0..graph.len()).filter(|&id| pending[id] == 0).collect();
    let mut placed = vec![false; graph.len()];
    let mut order = Vec::with_capacity(graph.len());

    while let Some(id) = ready.pop_first() {
        placed[id] = true;
        order.push(graph.nodes[id].clone());
        for &dependent in &graph.dependents[id] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    let unplaced: HashSet<usize> = (0..graph.len()).filter(|&id| !placed[id]).collect();
    let cycles = find_cycles(graph, &unplaced)
        .into_iter()
        .map(|cycle| cycle.into_iter().map(|id| graph.nodes[id].clone()).collect())
        .collect();

    TopoOrder { order, cycles }
}

// Tarjan's strongly connected components restricted to `within`; one cycle is
// extracted per component that actually loops.
fn find_cycles(graph: &DependencyGraph, within: &HashSet<usize>) -> Vec<Vec<usize>> {
    struct Tarjan<'a> {
        graph: &'a DependencyGraph,
        within: &'a HashSet<usize>,
        counter: usize,
        index: HashMap<usize, usize>,
        lowlink: HashMap<usize, usize>,
        stack: Vec<usize>,
        on_stack: HashSet<usize>,
        components: Vec<Vec<usize>>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index.insert(v, self.counter);
            self.lowlink.insert(v, self.counter);
            self.counter += 1;
            self.stack.push(v);
            self.on_stack.insert(v);

            let graph = self.graph;
            for &w in &graph.deps[v] {
                if !self.within.contains(&w) {
                    continue;
                }
                if !self.index.contains_key(&w) {
                    self.visit(w);
                    let low = self.lowlink[&v].min(self.lowlink[&w]);
                    self.lowlink.insert(v, low);
                } else if self.on_stack.contains(&w) {
                    let low = self.lowlink[&v].min(self.index[&w]);
                    self.lowlink.insert(v, low);
                }
            }

            if self.lowlink[&v] == self.index[&v] {
                let mut component = vec![];
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(&w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let mut tarjan = Tarjan {
        graph,
        within,
        counter: 0,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        stack: vec![],
        on_stack: HashSet::new(),
        components: vec![],
    };
    let mut roots: Vec<usize> = within.iter().copied().collect();
    roots.sort_unstable();
    for v in roots {
        if !tarjan.index.contains_key(&v) {
            tarjan.visit(v);
        }
    }

    let mut cycles: Vec<Vec<usize>> = tarjan
        .components
        .into_iter()
        .filter_map(|component| {
            let members: HashSet<usize> = component.iter().copied().collect();
            let start = *component.iter().min()?;
            cycle_through(graph, start, &members)
        })
        .collect();
    cycles.sort_by_key(|cycle| cycle[0]);
    cycles
}

// Shortest path start -> ... -> start inside `members`, or None if `start`
// does not loop (a single node without a self-edge).
fn cycle_through(graph: &DependencyGraph, start: usize, members: &HashSet<usize>) -> Option<Vec<usize>> {
    let mut parent: HashMap<usize, usize> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(v) = queue.pop_front() {
        for &w in &graph.deps[v] {
            if !members.contains(&w) {
                continue;
            }
            if w == start {
                let mut back = vec![];
                let mut cur = v;
                while cur != start {
                    back.push(cur);
                    cur = parent[&cur];
                }
                let mut cycle = vec![start];
                cycle.extend(back.into_iter().rev());
                cycle.push(start);
                return Some(cycle);
            }
            if !parent.contains_key(&w) {
                parent.insert(w, v);
                queue.push_back(w);
            }
        }
    }
    None
}
