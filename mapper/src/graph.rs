// graph.rs — Directed graph substrate with stable identities
//
// `Graph<N, E>` owns node and edge payloads in arenas; ids stay valid across
// unrelated insertions and deletions. Each node keeps its incoming and
// outgoing edge lists in insertion order. Removing a node removes its
// incident edges first. `reorder_nodes` renumbers the nodes along a supplied
// permutation (ids are positional afterwards) and returns the old→new remap
// so that external references can follow; edge endpoints are rewritten
// internally.
//
// The free functions at the bottom provide the derived tooling: adjacency and
// edge matrices, Floyd–Warshall reachability, connectivity-preserving edge
// pruning, and Gabow's path-based strongly-connected-components search.

use std::collections::HashMap;

use crate::arena::{define_id, Arena, ItemMap, ItemSet};

define_id!(
    /// Stable identifier of a graph node.
    NodeId
);
define_id!(
    /// Stable identifier of a graph edge.
    EdgeId
);

/// An invalid node id, usable as an item-map default.
pub const NO_NODE: NodeId = NodeId(u32::MAX);

struct NodeSlot<N> {
    payload: N,
    in_edges: Vec<EdgeId>,
    out_edges: Vec<EdgeId>,
}

struct EdgeSlot<E> {
    payload: E,
    source: NodeId,
    target: NodeId,
}

pub struct Graph<N, E> {
    nodes: Arena<NodeSlot<N>, NodeId>,
    edges: Arena<EdgeSlot<E>, EdgeId>,
}

impl<N, E> Graph<N, E> {
    pub fn new() -> Self {
        Graph {
            nodes: Arena::new(),
            edges: Arena::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
    }

    pub fn clear_edges(&mut self) {
        self.edges.clear();
        for (_, slot) in self.nodes.iter_mut() {
            slot.in_edges.clear();
            slot.out_edges.clear();
        }
    }

    pub fn add_node(&mut self, payload: N) -> NodeId {
        self.nodes.insert(NodeSlot {
            payload,
            in_edges: Vec::new(),
            out_edges: Vec::new(),
        })
    }

    pub fn add_edge(&mut self, source: NodeId, target: NodeId, payload: E) -> EdgeId {
        debug_assert!(self.nodes.contains(source) && self.nodes.contains(target));
        let id = self.edges.insert(EdgeSlot {
            payload,
            source,
            target,
        });
        self.nodes[source].out_edges.push(id);
        self.nodes[target].in_edges.push(id);
        id
    }

    pub fn remove_edge(&mut self, edge: EdgeId) {
        let slot = self.edges.remove(edge).expect("stale edge id");
        self.nodes[slot.source].out_edges.retain(|&e| e != edge);
        self.nodes[slot.target].in_edges.retain(|&e| e != edge);
    }

    pub fn remove_node(&mut self, node: NodeId) -> N {
        let incident: Vec<EdgeId> = self
            .nodes[node]
            .in_edges
            .iter()
            .chain(&self.nodes[node].out_edges)
            .copied()
            .collect();
        for e in incident {
            if self.edges.contains(e) {
                self.remove_edge(e);
            }
        }
        self.nodes.remove(node).expect("stale node id").payload
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn node(&self, node: NodeId) -> &N {
        &self.nodes[node].payload
    }

    pub fn node_mut(&mut self, node: NodeId) -> &mut N {
        &mut self.nodes[node].payload
    }

    pub fn edge(&self, edge: EdgeId) -> &E {
        &self.edges[edge].payload
    }

    pub fn edge_mut(&mut self, edge: EdgeId) -> &mut E {
        &mut self.edges[edge].payload
    }

    pub fn source(&self, edge: EdgeId) -> NodeId {
        self.edges[edge].source
    }

    pub fn target(&self, edge: EdgeId) -> NodeId {
        self.edges[edge].target
    }

    /// Live nodes in id (insertion) order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &N)> {
        self.nodes.iter().map(|(id, slot)| (id, &slot.payload))
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.ids()
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &E)> {
        self.edges.iter().map(|(id, slot)| (id, &slot.payload))
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.edges.ids()
    }

    /// Outgoing edges of `node` in insertion order.
    pub fn out_edges(&self, node: NodeId) -> &[EdgeId] {
        &self.nodes[node].out_edges
    }

    /// Incoming edges of `node` in insertion order.
    pub fn in_edges(&self, node: NodeId) -> &[EdgeId] {
        &self.nodes[node].in_edges
    }

    pub fn out_degree(&self, node: NodeId) -> usize {
        self.nodes[node].out_edges.len()
    }

    pub fn in_degree(&self, node: NodeId) -> usize {
        self.nodes[node].in_edges.len()
    }

    pub fn degree(&self, node: NodeId) -> usize {
        self.in_degree(node) + self.out_degree(node)
    }

    /// All edges incident to `node` (incoming then outgoing).
    pub fn incident_edges(&self, node: NodeId) -> impl Iterator<Item = EdgeId> + '_ {
        self.nodes[node]
            .in_edges
            .iter()
            .chain(&self.nodes[node].out_edges)
            .copied()
    }

    /// For an edge incident to `node`, the node on the other end.
    pub fn opposite(&self, node: NodeId, edge: EdgeId) -> NodeId {
        let slot = &self.edges[edge];
        if slot.source == node {
            slot.target
        } else {
            slot.source
        }
    }

    pub fn node_set(&self, allin: bool) -> ItemSet<NodeId> {
        self.nodes.item_set(allin)
    }

    pub fn edge_set(&self, allin: bool) -> ItemSet<EdgeId> {
        self.edges.item_set(allin)
    }

    pub fn node_map<V: Clone>(&self, default: V) -> ItemMap<NodeId, V> {
        self.nodes.item_map(default)
    }

    pub fn edge_map<V: Clone>(&self, default: V) -> ItemMap<EdgeId, V> {
        self.edges.item_map(default)
    }

    /// Renumbers the nodes along `order`, which must contain every live node
    /// exactly once. Afterwards ids are positional (0..n in the new order) and
    /// edge endpoints are rewritten. Returns the old→new id map; any item
    /// maps or sets built before the call are invalid.
    pub fn reorder_nodes(&mut self, order: &[NodeId]) -> ItemMap<NodeId, NodeId> {
        assert_eq!(order.len(), self.nodes.len());

        let mut remap = self.nodes.item_map(NO_NODE);
        let mut new_nodes: Arena<NodeSlot<N>, NodeId> = Arena::new();

        let mut taken: Vec<Option<NodeSlot<N>>> = Vec::new();
        for &old in order {
            assert!(self.nodes.contains(old), "reorder with stale node id");
            assert!(remap[old] == NO_NODE, "node listed twice in reorder");
            remap[old] = NodeId(taken.len() as u32);
            taken.push(self.nodes.remove(old));
        }
        for slot in taken {
            let mut slot = slot.expect("node vanished during reorder");
            slot.in_edges.clear();
            slot.out_edges.clear();
            new_nodes.insert(slot);
        }
        self.nodes = new_nodes;

        let edge_ids: Vec<EdgeId> = self.edges.ids().collect();
        for e in edge_ids {
            let (src, tgt) = {
                let slot = &mut self.edges[e];
                slot.source = remap[slot.source];
                slot.target = remap[slot.target];
                (slot.source, slot.target)
            };
            self.nodes[src].out_edges.push(e);
            self.nodes[tgt].in_edges.push(e);
        }
        remap
    }
}

impl<N, E> Default for Graph<N, E> {
    fn default() -> Self {
        Graph::new()
    }
}

impl<N, E> std::fmt::Debug for Graph<N, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .finish()
    }
}

// ── EdgeRegister ────────────────────────────────────────────────────────────

/// Cache keyed by (source, target) that looks up an existing edge or emplaces
/// a new one. The undirected flavor normalizes the key so that both
/// directions map to the same edge.
pub struct EdgeRegister {
    map: HashMap<(NodeId, NodeId), EdgeId>,
    undirected: bool,
}

impl EdgeRegister {
    pub fn directed<N, E>(graph: &Graph<N, E>) -> Self {
        Self::build(graph, false)
    }

    pub fn undirected<N, E>(graph: &Graph<N, E>) -> Self {
        Self::build(graph, true)
    }

    fn build<N, E>(graph: &Graph<N, E>, undirected: bool) -> Self {
        let mut reg = EdgeRegister {
            map: HashMap::new(),
            undirected,
        };
        for e in graph.edge_ids() {
            let key = reg.key(graph.source(e), graph.target(e));
            reg.map.insert(key, e);
        }
        reg
    }

    fn key(&self, source: NodeId, target: NodeId) -> (NodeId, NodeId) {
        if self.undirected && target < source {
            (target, source)
        } else {
            (source, target)
        }
    }

    pub fn find(&self, source: NodeId, target: NodeId) -> Option<EdgeId> {
        self.map.get(&self.key(source, target)).copied()
    }

    /// The edge between `source` and `target`, creating it with a default
    /// payload if it does not exist yet.
    pub fn get_or_insert<N, E: Default>(
        &mut self,
        graph: &mut Graph<N, E>,
        source: NodeId,
        target: NodeId,
    ) -> EdgeId {
        let key = self.key(source, target);
        if let Some(&e) = self.map.get(&key) {
            return e;
        }
        let e = graph.add_edge(source, target, E::default());
        self.map.insert(key, e);
        e
    }
}

// ── Derived matrices ────────────────────────────────────────────────────────

/// Per-node set of direct successors.
pub fn adjacency_matrix<N, E>(g: &Graph<N, E>) -> ItemMap<NodeId, ItemSet<NodeId>> {
    let mut ret = g.node_map(g.node_set(false));
    for e in g.edge_ids() {
        ret[g.source(e)].insert(g.target(e));
    }
    ret
}

/// Map (source, target) → edge. There must be at most one edge per ordered
/// node pair.
pub fn edge_matrix<N, E>(g: &Graph<N, E>) -> ItemMap<NodeId, ItemMap<NodeId, Option<EdgeId>>> {
    let mut ret = g.node_map(g.node_map(None));
    for e in g.edge_ids() {
        let cell = &mut ret[g.source(e)][g.target(e)];
        debug_assert!(cell.is_none(), "parallel edge between node pair");
        *cell = Some(e);
    }
    ret
}

/// Per-node set of transitive successors (nodes reachable along ≥ 1 edges;
/// a node lists itself only if it lies on a cycle). Floyd–Warshall on the
/// adjacency bitsets.
pub fn reachability_matrix<N, E>(g: &Graph<N, E>) -> ItemMap<NodeId, ItemSet<NodeId>> {
    let mut ret = adjacency_matrix(g);
    for n1 in g.node_ids() {
        for n2 in g.node_ids() {
            if ret[n1].contains(n2) {
                let other = ret[n2].clone();
                ret[n1].union_with(&other);
            }
        }
    }
    ret
}

/// Removes every edge that is not necessary to keep the connectivity: if a
/// path from n1 to n2 existed before, one still exists afterwards. Returns
/// the reachability matrix (computed alongside).
pub fn prune_edges<N, E>(g: &mut Graph<N, E>) -> ItemMap<NodeId, ItemSet<NodeId>> {
    let mut ret = adjacency_matrix(g);
    let mut edges = ret.clone();

    for n1 in g.node_ids() {
        for n2 in g.node_ids() {
            if ret[n1].contains(n2) {
                let reach2 = ret[n2].clone();
                ret[n1].union_with(&reach2);
                edges[n1].remove_set(&reach2);
            }
        }
    }

    let all_edges: Vec<EdgeId> = g.edge_ids().collect();
    for e in all_edges {
        let src = g.source(e);
        let tgt = g.target(e);
        if !edges[src].contains(tgt) {
            g.remove_edge(e);
        } else {
            // keep one representative, drop subsequent duplicates
            edges[src].remove(tgt);
        }
    }
    ret
}

// ── Strongly connected components ───────────────────────────────────────────

/// Strongly connected components per Gabow's path-based depth-first search
/// (doi:10.1016/S0020-0190(00)00051-X). Single nodes without self-loops are
/// not part of the component list; they are returned separately.
pub fn strongly_connected<N, E>(g: &Graph<N, E>) -> (Vec<Vec<NodeId>>, Vec<NodeId>) {
    const UNVISITED: usize = 0;
    let scc_tag = usize::MAX;
    let single_tag = usize::MAX - 1;

    struct Dfs<'g, N, E> {
        g: &'g Graph<N, E>,
        path: Vec<NodeId>,
        roots: Vec<usize>,
        sccs: Vec<Vec<NodeId>>,
        tags: ItemMap<NodeId, usize>,
    }

    impl<'g, N, E> Dfs<'g, N, E> {
        fn dfs(&mut self, n: NodeId, scc_tag: usize, single_tag: usize) {
            self.path.push(n);
            self.tags[n] = self.path.len();
            self.roots.push(self.path.len());
            let mut cycles = false;

            for &e in self.g.out_edges(n) {
                let n1 = self.g.target(e);
                let n1tag = self.tags[n1];
                if n1tag == UNVISITED {
                    self.dfs(n1, scc_tag, single_tag);
                } else {
                    while *self.roots.last().unwrap() > n1tag {
                        self.roots.pop();
                    }
                    if n1 == n {
                        cycles = true;
                    }
                }
            }

            if self.tags[n] == *self.roots.last().unwrap() {
                self.roots.pop();
                if self.tags[n] == self.path.len() && !cycles {
                    self.tags[n] = single_tag;
                    self.path.pop();
                } else {
                    let start = self.tags[n] - 1;
                    let scc: Vec<NodeId> = self.path.drain(start..).collect();
                    for &m in &scc {
                        self.tags[m] = scc_tag;
                    }
                    self.sccs.push(scc);
                }
            }
        }
    }

    let mut dfs = Dfs {
        g,
        path: Vec::new(),
        roots: Vec::new(),
        sccs: Vec::new(),
        tags: g.node_map(UNVISITED),
    };

    for n in g.node_ids() {
        if dfs.tags[n] == UNVISITED {
            dfs.dfs(n, scc_tag, single_tag);
        }
    }

    let singles: Vec<NodeId> = g
        .node_ids()
        .filter(|&n| dfs.tags[n] == single_tag)
        .collect();
    (dfs.sccs, singles)
}

// ── Tests ───────────────────────────────────────────────────────────────────
