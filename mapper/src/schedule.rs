// schedule.rs — Resource-aware list scheduling
//
// Builds an expanded schedule graph (one node per user task plus inserted
// DMA transfer tasks wherever a dependency crosses memories, two of them
// when a spill memory intermediates), computes as-late-as-possible times by
// reverse list scheduling, then forward-schedules with memory-capacity
// feasibility: processors and DMA controllers are single-occupation
// resources, memories are occupation charts capped at 95% of their size.
//
// The forward pass runs twice: a prerun that also charges the memory a
// transfer task would need to its consumer (computing the initial
// memory-use envelopes), then — after inserting ordering edges that keep
// transfer tasks behind the point where their memory becomes free — a
// refining pass.
//
// Preconditions: groups populated and bound to cores; buffers assigned when
//                an interface mapping is given.
// Postconditions: per-task (start, end, slack) triples.

use std::collections::{BTreeMap, HashMap};

use crate::arena::ItemMap;
use crate::chart::{OccupationChart, SingleOccupationChart, Time, TIME_INFINITE};
use crate::diag::{codes, DiagSink};
use crate::division::SpaceMultiDiv;
use crate::graph::{Graph, NodeId};
use crate::model::{Access, IfaceKey, Program};
use crate::platform::Platform;
use crate::space::Space;

/// Interface-to-memory placement (memory indices into the platform).
pub type IfaceMapping = HashMap<IfaceKey, usize>;
/// Optional spill memory per dependency (keyed by dependency index).
pub type SpillMapping = HashMap<usize, Option<usize>>;

/// Scheduling result for one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskTimings {
    pub start: Time,
    pub end: Time,
    pub slack: Time,
}

#[derive(Debug, Clone)]
pub struct ScheduleArgs {
    /// Shift applied to the memory-pressure term of the ready-queue priority.
    pub weight: u32,
}

/// Access cost per read/write when no interface mapping is supplied.
const DEFAULT_ACCESS_COST: i64 = 1000;
/// Fraction of each memory the scheduler may plan with (95%).
const MEM_USE_NUM: i64 = 95;
const MEM_USE_DEN: i64 = 100;

// ── Expanded graph ──────────────────────────────────────────────────────────

struct DataUse {
    uses: Vec<usize>, // transition indices
    size: i64,
    ref_count: isize,
}

struct SchedNode {
    /// The user task this node stands for; None for transfer tasks.
    spec: Option<NodeId>,
    /// Distribution domain of a transfer task.
    transfer_dims: Option<Space>,
    duration: Time,
    alap: Time,
    start: Time,
    mem_diff: i64,
    total_mem_use: i64,
    open_deps: usize,
    data_dist: Vec<Vec<DataUse>>,
    processors: Vec<usize>,
}

impl SchedNode {
    fn new(spec: Option<NodeId>) -> Self {
        SchedNode {
            spec,
            transfer_dims: None,
            duration: 0,
            alap: 0,
            start: 0,
            mem_diff: 0,
            total_mem_use: 0,
            open_deps: 0,
            data_dist: Vec::new(),
            processors: Vec::new(),
        }
    }
}

#[derive(Default)]
struct SchedEdge {
    size: i64,
    /// (iface slot, use slot) within the source node's data distribution.
    from_dist: Option<(usize, usize)>,
    mem: i32,
    offset: Time,
}

struct Transition {
    from_iface: Option<IfaceKey>,
    from_index: Space,
    to_iface: Option<IfaceKey>,
    to_index: Space,
    subst: Option<NodeId>,
    mem: i32,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct SchedItem {
    ready: Time,
    priority: i64,
    node: NodeId,
}

impl Ord for SchedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap: earliest ready time first, then highest priority
        other
            .ready
            .cmp(&self.ready)
            .then(self.priority.cmp(&other.priority))
            .then(other.node.cmp(&self.node))
    }
}

impl PartialOrd for SchedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Deterministic xorshift for the pseudo-random retry priority.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> i64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x >> 1) as i64
    }
}

#[derive(Hash, PartialEq, Eq)]
enum UseKey {
    Iface(IfaceKey),
    Node(NodeId),
}

pub struct Scheduler<'p> {
    prog: &'p Program,
    platform: &'p Platform,
    dma_base: usize,
    core_occs: Vec<SingleOccupationChart<NodeId>>,
    mem_occs: Vec<OccupationChart>,
    group_occs: Vec<OccupationChart>,
    runtime_occ_ends: Vec<BTreeMap<Time, NodeId>>,
    graph: Graph<SchedNode, SchedEdge>,
    transitions: Vec<Transition>,
}

impl<'p> Scheduler<'p> {
    pub fn new(prog: &'p Program, platform: &'p Platform) -> Self {
        let dma_base = platform.cores.len();
        Scheduler {
            prog,
            platform,
            dma_base,
            core_occs: vec![
                SingleOccupationChart::new();
                dma_base + platform.dma_controllers.len()
            ],
            mem_occs: platform
                .memories
                .iter()
                .map(|m| OccupationChart::new(m.size * MEM_USE_NUM / MEM_USE_DEN))
                .collect(),
            group_occs: platform
                .groups
                .iter()
                .map(|g| OccupationChart::new(g.total_mem * MEM_USE_NUM / MEM_USE_DEN))
                .collect(),
            runtime_occ_ends: vec![BTreeMap::new(); platform.memories.len()],
            graph: Graph::new(),
            transitions: Vec::new(),
        }
    }

    // ── Graph construction ──────────────────────────────────────────────

    fn insert_task_nodes(&mut self) -> ItemMap<NodeId, NodeId> {
        let mut map = self.prog.task_graph.node_map(crate::graph::NO_NODE);
        for (t, task) in self.prog.task_graph.nodes() {
            let group = task.group.expect("unmapped task in scheduler");
            let core = self.prog.groups[group]
                .binding
                .expect("unbound group in scheduler");
            let mut node = SchedNode::new(Some(t));
            node.processors = vec![core];
            map[t] = self.graph.add_node(node);
        }
        map
    }

    fn calc_task_durations(
        &mut self,
        mapping: Option<&IfaceMapping>,
        diags: &mut DiagSink,
    ) -> bool {
        let conn_map = self.platform.conn_map();
        let nodes: Vec<NodeId> = self.graph.node_ids().collect();
        for n in nodes {
            let Some(spec) = self.graph.node(n).spec else { continue };
            let task = self.prog.task_graph.node(spec);
            let mut duration = task.cost as Time;

            for (i, iface) in task.ifaces.iter().enumerate() {
                let (rcost, wcost) = match mapping {
                    Some(pdm) => {
                        let key = IfaceKey {
                            task: crate::model::AnchorTask::Node(spec),
                            iface: i,
                        };
                        let mem = &self.platform.memories[*pdm
                            .get(&key)
                            .expect("interface missing from memory mapping")];
                        let core = &self.platform.cores[self.graph.node(n).processors[0]];
                        match conn_map.get(&(core.node, mem.node)) {
                            Some(conn) => (conn.read_cost, conn.write_cost),
                            None => {
                                diags.error(
                                    codes::E0404,
                                    format!(
                                        "Cannot access memory '{}' from core '{}' although the mapping says so",
                                        mem.name, core.name
                                    ),
                                );
                                return false;
                            }
                        }
                    }
                    None => (DEFAULT_ACCESS_COST, DEFAULT_ACCESS_COST),
                };
                duration += rcost * iface.reads + wcost * iface.writes;
            }
            self.graph.node_mut(n).duration = duration;
        }
        true
    }

    /// Inserts transfer tasks for dependencies whose endpoints live in
    /// different memories and records every dependency as one or two
    /// transitions.
    fn calc_transitions(
        &mut self,
        _node_map: &ItemMap<NodeId, NodeId>,
        mapping: Option<(&IfaceMapping, &SpillMapping)>,
        diags: &mut DiagSink,
    ) -> bool {
        let Some((pdm, psm)) = mapping else {
            // Assumption: buffers can always be shared, no copies needed.
            for dep in &self.prog.dependencies {
                self.transitions.push(Transition {
                    from_iface: Some(dep.from.key()),
                    from_index: dep.from.index.clone(),
                    to_iface: Some(dep.to.key()),
                    to_index: dep.to.index.clone(),
                    subst: None,
                    mem: -1,
                });
            }
            return true;
        };

        let conn_map = self.platform.conn_map();
        let connect = |graph: &mut Graph<SchedNode, SchedEdge>,
                           from_mem: usize,
                           to_mem: usize,
                           size: i64,
                           diags: &mut DiagSink|
         -> Option<NodeId> {
            let from = &self.platform.memories[from_mem];
            let to = &self.platform.memories[to_mem];
            let conn = match conn_map.get(&(from.node, to.node)) {
                Some(conn) => conn,
                None => {
                    diags.error(
                        codes::E0404,
                        format!(
                            "Cannot transfer data from memory '{}' to memory '{}' although the mapping says so",
                            from.name, to.name
                        ),
                    );
                    return None;
                }
            };
            let mut node = SchedNode::new(None);
            node.duration = conn.dma_cost(size);
            node.processors = conn
                .controllers
                .iter()
                .map(|&c| c + self.dma_base)
                .collect();
            Some(graph.add_node(node))
        };

        for (di, dep) in self.prog.dependencies.iter().enumerate() {
            let from_mem = *pdm.get(&dep.from.key()).expect("unmapped interface");
            let to_mem = *pdm.get(&dep.to.key()).expect("unmapped interface");
            let spill = psm.get(&di).copied().flatten();
            let size = self.prog.dep_mem_size(dep);

            match spill {
                None if from_mem == to_mem => {
                    self.transitions.push(Transition {
                        from_iface: Some(dep.from.key()),
                        from_index: dep.from.index.clone(),
                        to_iface: Some(dep.to.key()),
                        to_index: dep.to.index.clone(),
                        subst: None,
                        mem: from_mem as i32,
                    });
                }
                None => {
                    let Some(transfer) = connect(&mut self.graph, from_mem, to_mem, size, diags)
                    else {
                        return false;
                    };
                    self.transitions.push(Transition {
                        from_iface: Some(dep.from.key()),
                        from_index: dep.from.index.clone(),
                        to_iface: None,
                        to_index: Space::from_dimensions(&dep.from.index.dimensions()),
                        subst: Some(transfer),
                        mem: from_mem as i32,
                    });
                    let dist_dims = Space::from_dimensions(&dep.to.index.dimensions());
                    self.transitions.push(Transition {
                        from_iface: None,
                        from_index: dist_dims.clone(),
                        to_iface: Some(dep.to.key()),
                        to_index: dep.to.index.clone(),
                        subst: Some(transfer),
                        mem: to_mem as i32,
                    });
                    self.graph.node_mut(transfer).transfer_dims = Some(dist_dims);
                }
                Some(spill_mem) => {
                    let Some(t1) = connect(&mut self.graph, from_mem, spill_mem, size, diags)
                    else {
                        return false;
                    };
                    let Some(t2) = connect(&mut self.graph, spill_mem, to_mem, size, diags)
                    else {
                        return false;
                    };
                    self.transitions.push(Transition {
                        from_iface: Some(dep.from.key()),
                        from_index: dep.from.index.clone(),
                        to_iface: None,
                        to_index: Space::from_dimensions(&dep.from.index.dimensions()),
                        subst: Some(t1),
                        mem: from_mem as i32,
                    });
                    let dist_dims = Space::from_dimensions(&dep.to.index.dimensions());
                    self.transitions.push(Transition {
                        from_iface: None,
                        from_index: dist_dims.clone(),
                        to_iface: Some(dep.to.key()),
                        to_index: dep.to.index.clone(),
                        subst: Some(t2),
                        mem: to_mem as i32,
                    });
                    self.graph.node_mut(t1).transfer_dims = Some(dist_dims.clone());
                    self.graph.node_mut(t2).transfer_dims = Some(dist_dims);

                    // staging edge through the spill memory
                    self.graph.node_mut(t1).data_dist = vec![vec![DataUse {
                        uses: Vec::new(),
                        size,
                        ref_count: 0,
                    }]];
                    let e = self.graph.add_edge(
                        t1,
                        t2,
                        SchedEdge {
                            size,
                            from_dist: Some((0, 0)),
                            mem: spill_mem as i32,
                            offset: 0,
                        },
                    );
                    let _ = e;
                }
            }
        }
        true
    }

    /// Splits every interface into data-distribution uses: one use is a
    /// sub-region consumed, in its entirety, by the same set of transitions.
    fn calc_data_dist(&mut self) {
        let elem_size_of = |t: &Transition| -> i64 {
            let key = t.to_iface.or(t.from_iface).expect("transition without iface");
            self.prog.iface(key).elem_size()
        };

        let mut use_maps: HashMap<UseKey, SpaceMultiDiv<usize>> = HashMap::new();
        for (n, node) in self.graph.nodes() {
            if let Some(spec) = node.spec {
                for (i, iface) in self.prog.task_graph.node(spec).ifaces.iter().enumerate() {
                    use_maps.insert(
                        UseKey::Iface(IfaceKey {
                            task: crate::model::AnchorTask::Node(spec),
                            iface: i,
                        }),
                        SpaceMultiDiv::new(Space::from_dimensions(&iface.dims)),
                    );
                }
            } else if let Some(dims) = &node.transfer_dims {
                use_maps.insert(UseKey::Node(n), SpaceMultiDiv::new(dims.clone()));
            }
        }

        for (ti, t) in self.transitions.iter().enumerate() {
            let key = match t.from_iface {
                Some(iface) => UseKey::Iface(iface),
                None => UseKey::Node(t.subst.expect("transition without source")),
            };
            if let Some(um) = use_maps.get_mut(&key) {
                um.assign_section(t.from_index.clone(), ti);
            }
        }

        let nodes: Vec<NodeId> = self.graph.node_ids().collect();
        for n in nodes {
            if let Some(spec) = self.graph.node(n).spec {
                let iface_count = self.prog.task_graph.node(spec).ifaces.len();
                let mut dist = Vec::with_capacity(iface_count);
                for i in 0..iface_count {
                    let key = UseKey::Iface(IfaceKey {
                        task: crate::model::AnchorTask::Node(spec),
                        iface: i,
                    });
                    let elem = self.prog.task_graph.node(spec).ifaces[i].elem_size();
                    let mut uses = Vec::new();
                    for (labels, sec) in use_maps[&key].sections() {
                        uses.push(DataUse {
                            uses: labels.iter().copied().collect(),
                            size: sec.volume() * elem,
                            ref_count: labels.len() as isize,
                        });
                    }
                    dist.push(uses);
                }
                self.graph.node_mut(n).data_dist = dist;
            } else if self.graph.node(n).transfer_dims.is_some() {
                let um = &use_maps[&UseKey::Node(n)];
                if um.is_empty() {
                    continue; // staging transfer, keeps its manual use
                }
                let mut uses = Vec::new();
                for (labels, sec) in um.sections() {
                    let first = *labels.iter().next().expect("empty label set");
                    let elem = elem_size_of(&self.transitions[first]);
                    uses.push(DataUse {
                        uses: labels.iter().copied().collect(),
                        size: sec.volume() * elem,
                        ref_count: labels.len() as isize,
                    });
                }
                self.graph.node_mut(n).data_dist = vec![uses];
            }
        }
    }

    fn insert_transition_edges(&mut self, node_map: &ItemMap<NodeId, NodeId>) {
        let nodes: Vec<NodeId> = self.graph.node_ids().collect();
        for n in nodes {
            let dist_shape: Vec<usize> = self.graph.node(n).data_dist.iter().map(|d| d.len()).collect();
            for (slot, use_count) in dist_shape.iter().enumerate() {
                for u in 0..*use_count {
                    let (uses, size) = {
                        let du = &self.graph.node(n).data_dist[slot][u];
                        (du.uses.clone(), du.size)
                    };
                    let _ = size;
                    for ti in uses {
                        let t = &self.transitions[ti];
                        let target = match t.to_iface {
                            Some(key) => match key.task {
                                crate::model::AnchorTask::Node(spec) => node_map[spec],
                                _ => continue, // program boundary: no node
                            },
                            None => t.subst.expect("transition without target"),
                        };
                        let elem = {
                            let key =
                                t.from_iface.or(t.to_iface).expect("transition without iface");
                            self.prog.iface(key).elem_size()
                        };
                        let edge_size = t.from_index.volume() * elem;
                        let mem = t.mem;
                        self.graph.add_edge(
                            n,
                            target,
                            SchedEdge {
                                size: edge_size,
                                from_dist: Some((slot, u)),
                                mem,
                                offset: 0,
                            },
                        );
                    }
                }
            }
        }
    }

    fn calc_mem_stats(&mut self) {
        let nodes: Vec<NodeId> = self.graph.node_ids().collect();
        for n in nodes {
            let (mut mem_diff, mut total);
            if let Some(spec) = self.graph.node(n).spec {
                total = self
                    .prog
                    .task_graph
                    .node(spec)
                    .ifaces
                    .iter()
                    .map(|d| d.mem_size())
                    .sum();
                mem_diff = 0;
                for &e in self.graph.in_edges(n) {
                    mem_diff -= self.graph.edge(e).size;
                }
                for &e in self.graph.out_edges(n) {
                    mem_diff += self.graph.edge(e).size;
                }
            } else {
                // one buffer on the input side, one on the output side
                let first_out = self.graph.out_edges(n).first().copied();
                total = first_out.map(|e| self.graph.edge(e).size * 2).unwrap_or(0);
                mem_diff = 0;
            }
            let node = self.graph.node_mut(n);
            node.mem_diff = mem_diff;
            node.total_mem_use = total;
        }
    }

    fn build_graph(
        &mut self,
        mapping: Option<(&IfaceMapping, &SpillMapping)>,
        diags: &mut DiagSink,
    ) -> bool {
        self.graph.clear();
        self.transitions.clear();

        let node_map = self.insert_task_nodes();
        if !self.calc_task_durations(mapping.map(|(pdm, _)| pdm), diags) {
            return false;
        }
        if !self.calc_transitions(&node_map, mapping, diags) {
            return false;
        }
        self.calc_data_dist();
        self.insert_transition_edges(&node_map);
        self.calc_mem_stats();
        true
    }

    // ── Forward list scheduling ─────────────────────────────────────────

    fn list_scheduling(
        &mut self,
        weight: u32,
        mapping: Option<(&IfaceMapping, &SpillMapping)>,
        prerun: bool,
        diags: &mut DiagSink,
    ) -> bool {
        struct MemRequirement {
            node: NodeId,
            amount: i64,
        }

        let priority = |node: &SchedNode, weight: u32, prerun: bool| -> i64 {
            if node.spec.is_some() {
                (node.mem_diff << weight) - node.alap
            } else if prerun {
                ((node.total_mem_use / 2) << weight) - node.alap
            } else {
                i64::MAX / 2 - node.alap
            }
        };

        let mut ready: std::collections::BinaryHeap<SchedItem> = std::collections::BinaryHeap::new();
        let nodes: Vec<NodeId> = self.graph.node_ids().collect();
        for &n in &nodes {
            let in_deg = self.graph.in_degree(n);
            {
                let node = self.graph.node_mut(n);
                node.start = 0;
                node.open_deps = in_deg;
                for dd in &mut node.data_dist {
                    for u in dd {
                        u.ref_count = u.uses.len() as isize;
                    }
                }
            }
            if in_deg == 0 {
                ready.push(SchedItem {
                    ready: 0,
                    priority: priority(self.graph.node(n), weight, prerun),
                    node: n,
                });
            }
        }
        for occ in &mut self.core_occs {
            occ.clear();
        }
        for occ in &mut self.group_occs {
            occ.clear();
        }
        for occ in &mut self.mem_occs {
            occ.clear();
        }

        let mut mem_requirements: Vec<Vec<MemRequirement>> =
            (0..self.mem_occs.len()).map(|_| Vec::new()).collect();
        let mut scheduled = self.graph.node_map(false);

        let mut left = self.graph.node_count();
        while let Some(next) = ready.pop() {
            let n = next.node;
            if scheduled[n] {
                continue; // re-queued while waiting for memory
            }
            let (duration, processors, is_spec) = {
                let node = self.graph.node(n);
                (node.duration, node.processors.clone(), node.spec.is_some())
            };

            let mut sched = next.ready;
            for &cid in &processors {
                sched = sched.max(self.core_occs[cid].available(sched, duration.max(1), n));
            }

            let mut mem_alloc = vec![0i64; self.mem_occs.len()];
            let mut mem_free = vec![0i64; self.mem_occs.len()];

            if mapping.is_none() {
                // no transfer tasks here, only user tasks: plan with the
                // per-core-group memory envelope
                let total = self.graph.node(n).total_mem_use;
                let core = processors[0];
                for &g in &self.platform.cores[core].groups {
                    sched =
                        sched.max(self.group_occs[g].available(sched, duration.max(1), total));
                }
            } else {
                if is_spec {
                    let spec = self.graph.node(n).spec.unwrap();
                    let (pdm, _) = mapping.unwrap();
                    let task = self.prog.task_graph.node(spec);
                    for (i, iface) in task.ifaces.iter().enumerate() {
                        if iface.access == Access::In {
                            continue;
                        }
                        let key = IfaceKey {
                            task: crate::model::AnchorTask::Node(spec),
                            iface: i,
                        };
                        let mem = *pdm.get(&key).expect("unmapped interface");
                        let iface_size = iface.mem_size();
                        let mut free_size = iface_size;
                        for u in &self.graph.node(n).data_dist[i] {
                            free_size -= u.size; // data still used later on
                        }
                        mem_free[mem] += free_size;
                        if iface.access == Access::Out {
                            mem_alloc[mem] += iface_size;
                        }
                    }

                    if prerun {
                        // charge memory a transfer task would have allocated
                        let in_edges: Vec<crate::graph::EdgeId> =
                            self.graph.in_edges(n).to_vec();
                        for e in in_edges {
                            let src = self.graph.source(e);
                            let src_node = self.graph.node(src);
                            if src_node.spec.is_some() {
                                continue;
                            }
                            let Some((slot, u)) = self.graph.edge(e).from_dist else {
                                continue;
                            };
                            let du = &src_node.data_dist[slot][u];
                            if du.ref_count == du.uses.len() as isize {
                                // memory not yet reserved by an earlier task
                                mem_alloc[self.graph.edge(e).mem as usize] +=
                                    self.graph.edge(e).size;
                            }
                        }
                    }
                } else if !prerun {
                    // transfer task: allocate the output memory now
                    for dd in &self.graph.node(n).data_dist {
                        for u in dd {
                            if let Some(&first) = u.uses.first() {
                                mem_alloc[self.transitions[first].mem as usize] += u.size;
                            }
                        }
                    }
                }

                for i in (0..mem_alloc.len()).rev() {
                    if mem_alloc[i] > 0 {
                        sched = sched
                            .max(self.mem_occs[i].available(sched, TIME_INFINITE, mem_alloc[i]));
                        if sched == TIME_INFINITE {
                            mem_requirements[i].push(MemRequirement {
                                node: n,
                                amount: mem_alloc[i],
                            });
                            break;
                        }
                    }
                }
            }

            let top_ready = ready.peek().map(|item| item.ready);
            if top_ready.map(|t| t < sched).unwrap_or(false) {
                // cannot schedule just yet, put back in the list for later
                if sched < TIME_INFINITE {
                    ready.push(SchedItem {
                        ready: sched,
                        ..next
                    });
                }
                continue;
            }
            if sched == TIME_INFINITE {
                break;
            }

            // schedule the task now
            left -= 1;
            scheduled[n] = true;
            self.graph.node_mut(n).start = sched;
            let end = sched + duration;
            for &cid in &processors {
                self.core_occs[cid].occupy(sched, end.max(sched + 1), n);
            }

            if mapping.is_none() {
                let total = self.graph.node(n).total_mem_use;
                let core = processors[0];
                for &g in &self.platform.cores[core].groups {
                    if total > 0 && duration > 0 {
                        self.group_occs[g].occupy(sched, end, total);
                    }
                }
            } else {
                let in_edges: Vec<crate::graph::EdgeId> = self.graph.in_edges(n).to_vec();
                for e in in_edges {
                    let src = self.graph.source(e);
                    let Some((slot, u)) = self.graph.edge(e).from_dist else {
                        continue; // inserted ordering edge
                    };
                    let released = {
                        let du = &mut self.graph.node_mut(src).data_dist[slot][u];
                        du.ref_count -= 1;
                        du.ref_count == 0
                    };
                    if released {
                        mem_free[self.graph.edge(e).mem as usize] += self.graph.edge(e).size;
                    }
                }

                for i in (0..mem_alloc.len()).rev() {
                    if mem_alloc[i] > 0 {
                        let ok = self.mem_occs[i].occupy(sched, TIME_INFINITE, mem_alloc[i]);
                        debug_assert!(ok, "memory reservation vanished");
                    }
                    if mem_free[i] > 0 {
                        let ok = self.mem_occs[i].unoccupy(end, TIME_INFINITE, mem_free[i]);
                        debug_assert!(ok, "released more memory than allocated");
                        let avail =
                            self.mem_occs[i].capacity() - self.mem_occs[i].occupied_at(end);
                        let mut requeue = Vec::new();
                        for req in &mem_requirements[i] {
                            // freed memory: blocked tasks may fit again
                            if req.amount <= avail {
                                requeue.push(req.node);
                            }
                        }
                        for m in requeue {
                            let node = self.graph.node_mut(m);
                            if end > node.start {
                                node.start = end;
                            }
                            let item = SchedItem {
                                ready: self.graph.node(m).start,
                                priority: priority(self.graph.node(m), weight, prerun),
                                node: m,
                            };
                            ready.push(item);
                        }
                    }
                    if prerun && mem_alloc[i] > 0 {
                        self.runtime_occ_ends[i].entry(end).or_insert(n);
                    }
                }
            }

            // successors may have become ready
            let out_edges: Vec<NodeId> = self
                .graph
                .out_edges(n)
                .iter()
                .map(|&e| self.graph.target(e))
                .collect();
            for succ in out_edges {
                {
                    let node = self.graph.node_mut(succ);
                    if end > node.start {
                        node.start = end;
                    }
                    node.open_deps -= 1;
                }
                if self.graph.node(succ).open_deps == 0 {
                    let item = SchedItem {
                        ready: self.graph.node(succ).start,
                        priority: priority(self.graph.node(succ), weight, prerun),
                        node: succ,
                    };
                    ready.push(item);
                }
            }
        }

        if left > 0 {
            diags.error(
                codes::E0600,
                "List scheduling failed: Not all tasks could be scheduled.",
            );
            return false;
        }
        true
    }

    // ── Driver ──────────────────────────────────────────────────────────

    /// Computes the full schedule. Without an interface mapping the memory
    /// model degrades to per-core-group envelopes and no transfer tasks are
    /// inserted.
    pub fn compute(
        &mut self,
        args: &ScheduleArgs,
        mapping: Option<(&IfaceMapping, &SpillMapping)>,
        diags: &mut DiagSink,
    ) -> Option<ItemMap<NodeId, TaskTimings>> {
        if !self.build_graph(mapping, diags) {
            return None;
        }
        if !self.alap_with_retries() {
            diags.error(
                codes::E0600,
                "List scheduling failed: Not all tasks could be scheduled.",
            );
            return None;
        }

        // prerun: buffers "temporarily disappear" between transfer and
        // consumer tasks
        if !self.list_scheduling(args.weight, mapping, true, diags) {
            return None;
        }

        if mapping.is_some() {
            self.insert_runtime_edges();
            if !self.list_scheduling(args.weight, mapping, false, diags) {
                return None;
            }
        }
        Some(self.task_timings())
    }

    /// ALAP by reverse list scheduling, retried under several priority
    /// functions: out-degree, in-degree, pseudo-random, ALAP itself.
    fn alap_with_retries(&mut self) -> bool {
        let nodes: Vec<NodeId> = self.graph.node_ids().collect();
        for &n in &nodes {
            self.graph.node_mut(n).alap = -TIME_INFINITE;
        }

        let mut out_degrees = self.graph.node_map(0i64);
        let mut in_degrees = self.graph.node_map(0i64);
        for &n in &nodes {
            out_degrees[n] = self.graph.out_degree(n) as i64;
            in_degrees[n] = self.graph.in_degree(n) as i64;
        }

        if self.reverse_pass(|n, _| out_degrees[n]) {
            return true;
        }
        if self.reverse_pass(|n, _| in_degrees[n]) {
            return true;
        }
        if self.reverse_pass(|_, rng_val| rng_val) {
            return true;
        }
        // last resort: the ALAP values refined by the failed attempts
        let mut alap_snap = self.graph.node_map(0i64);
        for &n in &nodes {
            alap_snap[n] = self.graph.node(n).alap;
        }
        self.reverse_pass(|n, _| -alap_snap[n])
    }

    /// One reverse pass with a per-node priority function.
    fn reverse_pass(&mut self, priority: impl Fn(NodeId, i64) -> i64) -> bool {
        let mut rng = XorShift(0x2545f4914f6cdd1d);
        let mut ready: std::collections::BinaryHeap<SchedItem> = std::collections::BinaryHeap::new();
        let nodes: Vec<NodeId> = self.graph.node_ids().collect();
        for &n in &nodes {
            let out = self.graph.out_degree(n);
            let node = self.graph.node_mut(n);
            node.start = 0;
            node.open_deps = out;
            if out == 0 {
                ready.push(SchedItem {
                    ready: 0,
                    priority: priority(n, rng.next()),
                    node: n,
                });
            }
        }
        for occ in &mut self.core_occs {
            occ.clear();
        }

        let mut left = self.graph.node_count();
        while let Some(next) = ready.pop() {
            let n = next.node;
            let (duration, processors) = {
                let node = self.graph.node(n);
                (node.duration, node.processors.clone())
            };

            let mut sched = next.ready;
            for &cid in &processors {
                sched = sched.max(self.core_occs[cid].available(sched, duration.max(1), n));
            }

            let top_ready = ready.peek().map(|item| item.ready);
            if top_ready.map(|t| t < sched).unwrap_or(false) {
                ready.push(SchedItem {
                    ready: sched,
                    ..next
                });
                continue;
            }

            left -= 1;
            let end = sched + duration;
            {
                let node = self.graph.node_mut(n);
                node.start = -end;
                if -end > node.alap {
                    node.alap = -end;
                }
            }
            for &cid in &processors {
                self.core_occs[cid].occupy(sched, end.max(sched + 1), n);
            }

            let preds: Vec<NodeId> = self
                .graph
                .in_edges(n)
                .iter()
                .map(|&e| self.graph.source(e))
                .collect();
            for pred in preds {
                {
                    let node = self.graph.node_mut(pred);
                    if end > node.start {
                        node.start = end;
                    }
                    node.open_deps -= 1;
                }
                if self.graph.node(pred).open_deps == 0 {
                    ready.push(SchedItem {
                        ready: self.graph.node(pred).start,
                        priority: priority(pred, rng.next()),
                        node: pred,
                    });
                }
            }
        }
        left == 0
    }

    /// After the prerun: make sure no transfer task is scheduled earlier than
    /// the memory it needs becomes free, by inserting ordering edges from the
    /// tasks whose reservations end by then.
    fn insert_runtime_edges(&mut self) {
        let transfer_nodes: Vec<NodeId> = self
            .graph
            .node_ids()
            .filter(|&n| self.graph.node(n).spec.is_none())
            .collect();
        for n in transfer_nodes {
            let out_edges = self.graph.out_edges(n).to_vec();
            if out_edges.is_empty() {
                continue;
            }
            let late_alloc = out_edges
                .iter()
                .map(|&e| self.graph.node(self.graph.target(e)).start)
                .min()
                .unwrap();
            let mem = self.graph.edge(out_edges[0]).mem;
            if mem < 0 {
                continue;
            }
            let need = self.graph.node(n).total_mem_use / 2;
            let early_alloc = self.mem_occs[mem as usize].available_since(late_alloc, need);
            let sources: Vec<NodeId> = self.runtime_occ_ends[mem as usize]
                .range(..=early_alloc)
                .map(|(_, &node)| node)
                .collect();
            for src in sources {
                if src != n {
                    self.graph.add_edge(src, n, SchedEdge::default());
                }
            }
        }
    }

    /// Per-user-task (start, end, slack).
    fn task_timings(&self) -> ItemMap<NodeId, TaskTimings> {
        let mut ret = self.prog.task_graph.node_map(TaskTimings::default());
        for (_, node) in self.graph.nodes() {
            if let Some(spec) = node.spec {
                ret[spec] = TaskTimings {
                    start: node.start,
                    end: node.start + node.duration,
                    slack: node.alap - node.start,
                };
            }
        }
        ret
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::diag::DiagSink;
    use crate::model::{
        base_type, Anchor, AnchorTask, Dependency, Kernel, KernelId, Packet, Task, TaskDivision,
        TaskGroup,
    };
    use crate::space::Range;

    fn f32t() -> crate::model::BaseTypeRef {
        base_type("float", 4)
    }

    fn sp(n: i64) -> Space {
        Space::from_ranges(vec![Range::begin_count(0, n)])
    }

    /// Two cores, two memories, one DMA controller connecting them.
    fn two_memory_platform() -> Platform {
        let mut pf = Platform::new();
        let ct = pf.add_core_type("pe");
        let c0 = pf.add_core("core0", ct);
        let c1 = pf.add_core("core1", ct);
        let m0 = pf.add_memory("mem0", 1 << 20);
        let m1 = pf.add_memory("mem1", 1 << 20);
        let dma = pf.add_dma_controller("dma0");
        pf.connect_core(c0, m0, 1, 1);
        pf.connect_core(c1, m1, 1, 1);
        pf.add_group(vec![c0], vec![m0]);
        pf.add_group(vec![c1], vec![m1]);
        pf.connect_memories(m0, m1, 50, 1, vec![dma]);
        pf
    }

    /// Task A (core0) produces 8 floats read by task B (core1).
    fn two_task_program() -> (Program, NodeId, NodeId) {
        let mut kernels: Arena<Kernel, KernelId> = Arena::new();
        let mut pk = Kernel::native("produce", "produce_impl");
        pk.packets = vec![Packet::new("o", crate::model::Access::Out, f32t(), vec![8])];
        let produce = kernels.insert(pk);
        let mut ck = Kernel::native("consume", "consume_impl");
        ck.packets = vec![Packet::new("i", crate::model::Access::In, f32t(), vec![8])];
        let consume = kernels.insert(ck);

        let mut prog = Program::new();
        let mut ta = Task::instantiate(&kernels, produce, "A", vec![], vec![]);
        ta.cost = 100.0;
        let mut tb = Task::instantiate(&kernels, consume, "B", vec![], vec![]);
        tb.cost = 100.0;
        prog.kernels = kernels;
        let a = prog.task_graph.add_node(ta);
        let b = prog.task_graph.add_node(tb);
        prog.task_graph.add_edge(a, b, ());
        prog.dependencies.push(Dependency::new(
            Anchor::new(AnchorTask::Node(a), 0, sp(8)),
            Anchor::new(AnchorTask::Node(b), 0, sp(8)),
        ));

        // one group per task, bound to its core
        for (i, n) in [a, b].into_iter().enumerate() {
            let gid = prog.groups.len();
            let mut g = TaskGroup::new(gid, format!("core{i}"));
            g.add_task(n);
            g.binding = Some(i);
            g.division = Some(0);
            prog.task_graph.node_mut(n).group = Some(gid);
            prog.groups.push(g);
        }
        prog.divisions.push(TaskDivision {
            groups: vec![0, 1],
            buffers: Vec::new(),
        });
        (prog, a, b)
    }

    #[test]
    fn dma_task_inserted_between_memories() {
        let pf = two_memory_platform();
        let (prog, a, b) = two_task_program();

        let mut pdm: IfaceMapping = HashMap::new();
        pdm.insert(
            IfaceKey {
                task: AnchorTask::Node(a),
                iface: 0,
            },
            0,
        );
        pdm.insert(
            IfaceKey {
                task: AnchorTask::Node(b),
                iface: 0,
            },
            1,
        );
        let psm: SpillMapping = [(0usize, None)].into_iter().collect();

        let mut sched = Scheduler::new(&prog, &pf);
        let mut diags = DiagSink::new();
        let timings = sched
            .compute(&ScheduleArgs { weight: 0 }, Some((&pdm, &psm)), &mut diags)
            .unwrap_or_else(|| panic!("{:?}", diags.diagnostics()));

        // a transfer node exists besides the two user tasks
        assert_eq!(sched.graph.node_count(), 3);
        let transfer = sched
            .graph
            .node_ids()
            .find(|&n| sched.graph.node(n).spec.is_none())
            .expect("no transfer task inserted");
        // fix cost 50 + 1 per byte × 32 bytes
        assert_eq!(sched.graph.node(transfer).duration, 50 + 32);

        // B starts no earlier than A's end plus the DMA duration
        assert!(timings[b].start >= timings[a].end + 82);
        assert_eq!(timings[a].end, timings[a].start + 100);
    }

    #[test]
    fn unreachable_memory_is_reported() {
        let pf = two_memory_platform();
        let (prog, a, b) = two_task_program();

        // core1 cannot reach mem0 in this platform: mapping B's interface
        // there must fail the duration computation
        let mut pdm: IfaceMapping = HashMap::new();
        for n in [a, b] {
            pdm.insert(
                IfaceKey {
                    task: AnchorTask::Node(n),
                    iface: 0,
                },
                0,
            );
        }
        let psm: SpillMapping = [(0usize, None)].into_iter().collect();
        let mut sched = Scheduler::new(&prog, &pf);
        let mut diags = DiagSink::new();
        let result = sched.compute(&ScheduleArgs { weight: 0 }, Some((&pdm, &psm)), &mut diags);
        assert!(result.is_none());
        assert!(diags
            .diagnostics()
            .iter()
            .any(|d| d.code == Some(codes::E0404)));
    }

    #[test]
    fn unmapped_schedule_orders_by_dependencies() {
        let pf = two_memory_platform();
        let (prog, a, b) = two_task_program();

        let mut sched = Scheduler::new(&prog, &pf);
        let mut diags = DiagSink::new();
        let timings = sched
            .compute(&ScheduleArgs { weight: 0 }, None, &mut diags)
            .unwrap_or_else(|| panic!("{:?}", diags.diagnostics()));

        assert!(timings[b].start >= timings[a].end);
        assert!(timings[a].start >= 0);
        // both tasks sit on the critical path: identical slack
        assert_eq!(timings[a].slack, timings[b].slack);
    }

    #[test]
    fn independent_tasks_share_no_core() {
        // two independent tasks mapped to the same core must serialize
        let mut pf = Platform::new();
        let ct = pf.add_core_type("pe");
        let c0 = pf.add_core("core0", ct);
        let m0 = pf.add_memory("mem0", 1 << 20);
        pf.connect_core(c0, m0, 1, 1);
        pf.add_group(vec![c0], vec![m0]);

        let mut kernels: Arena<Kernel, KernelId> = Arena::new();
        let mut k = Kernel::native("work", "work_impl");
        k.packets = vec![];
        let work = kernels.insert(k);

        let mut prog = Program::new();
        let mut t0 = Task::instantiate(&kernels, work, "t0", vec![], vec![]);
        t0.cost = 10.0;
        let mut t1 = Task::instantiate(&kernels, work, "t1", vec![], vec![]);
        t1.cost = 10.0;
        prog.kernels = kernels;
        let n0 = prog.task_graph.add_node(t0);
        let n1 = prog.task_graph.add_node(t1);
        let gid = 0;
        let mut g = TaskGroup::new(gid, "core0");
        g.add_task(n0);
        g.add_task(n1);
        g.binding = Some(0);
        g.division = Some(0);
        prog.task_graph.node_mut(n0).group = Some(gid);
        prog.task_graph.node_mut(n1).group = Some(gid);
        prog.groups.push(g);
        prog.divisions.push(TaskDivision {
            groups: vec![0],
            buffers: Vec::new(),
        });

        let mut sched = Scheduler::new(&prog, &pf);
        let mut diags = DiagSink::new();
        let timings = sched
            .compute(&ScheduleArgs { weight: 0 }, None, &mut diags)
            .unwrap_or_else(|| panic!("{:?}", diags.diagnostics()));

        let (first, second) = if timings[n0].start <= timings[n1].start {
            (n0, n1)
        } else {
            (n1, n0)
        };
        assert!(timings[second].start >= timings[first].end);
    }

    #[test]
    fn spill_memory_adds_two_transfers() {
        let mut pf = two_memory_platform();
        let spill = pf.add_memory("spill", 1 << 20);
        let dma2 = pf.add_dma_controller("dma1");
        pf.connect_memories(0, 2, 10, 1, vec![dma2]);
        pf.connect_memories(2, 1, 10, 1, vec![dma2]);

        let (prog, a, b) = two_task_program();
        let mut pdm: IfaceMapping = HashMap::new();
        pdm.insert(
            IfaceKey {
                task: AnchorTask::Node(a),
                iface: 0,
            },
            0,
        );
        pdm.insert(
            IfaceKey {
                task: AnchorTask::Node(b),
                iface: 0,
            },
            1,
        );
        let psm: SpillMapping = [(0usize, Some(spill))].into_iter().collect();

        let mut sched = Scheduler::new(&prog, &pf);
        let mut diags = DiagSink::new();
        let timings = sched
            .compute(&ScheduleArgs { weight: 0 }, Some((&pdm, &psm)), &mut diags)
            .unwrap_or_else(|| panic!("{:?}", diags.diagnostics()));

        // two transfer tasks besides the two user tasks
        let transfers = sched
            .graph
            .node_ids()
            .filter(|&n| sched.graph.node(n).spec.is_none())
            .count();
        assert_eq!(transfers, 2);
        assert!(timings[b].start >= timings[a].end + 2 * (10 + 32));
    }
}
