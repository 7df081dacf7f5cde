// banks.rs — Memory bank assignment and cache-index offsets
//
// Step 1 places every merged buffer into one of N equally sized banks.
// Measured task timings yield pairwise overlaps; for overlapping tasks, every
// pair of buffers they touch gets a penalty edge (and a group penalty when
// the tasks' groups collide modulo the hardware group count), while buffers
// touched by the same task reward co-location. Buffers are removed
// smallest-last and re-inserted greedily, maximizing (-penalty, reward,
// free space) over the banks that still fit. On failure the whole pass
// retries with an increasing correction that biases the removal order
// towards size, giving up after a fixed budget and reporting the per-bank
// residuals.
//
// Step 2 spreads the buffers of each bank over the cache index space:
// buffers co-accessed by a task should not share a cache index. Colors are
// evenly spaced addresses modulo the cache-line footprint; coloring is
// greedy and tolerates `associativity` conflicts per color before warning.
//
// The weighting constants below are hand-tuned; treat them as tunables.

use std::collections::HashMap;

use crate::chart::Time;
use crate::diag::{codes, DiagSink, Diagnostic};
use crate::graph::{EdgeRegister, Graph, NodeId};
use crate::model::{BufferId, Program};
use crate::platform::CacheConfig;

/// Measured start/stop time of one task (cost boundary input).
#[derive(Debug, Clone)]
pub struct TaskTiming {
    pub task: NodeId,
    pub start: Time,
    pub stop: Time,
}

/// A pair of tasks with a measured simultaneous-execution time.
#[derive(Debug, Clone)]
pub struct TaskOverlap {
    pub task1: NodeId,
    pub task2: NodeId,
    pub overlap: i64,
}

/// Overlaps shorter than this are ignored.
const OVERLAP_THRESHOLD: i64 = 200;
/// Bank-assignment retry budget.
const MAX_CORRECTION: i32 = 10;
/// Weight of the group reward relative to the plain reward (×3/8).
const GROUP_REWARD_NUM: i64 = 3;
const GROUP_REWARD_DEN: i64 = 8;
/// Number of bank groups the reward aggregation works over.
const BANK_GROUPS: usize = 2;

/// Derives the task-overlap list from measured timings.
pub fn overlaps_from_timings(timings: &[TaskTiming]) -> Vec<TaskOverlap> {
    let mut overlaps = Vec::new();
    for (i, t1) in timings.iter().enumerate() {
        for t2 in &timings[..i] {
            let overlap = t1.stop.min(t2.stop) - t1.start.max(t2.start);
            if overlap > OVERLAP_THRESHOLD {
                overlaps.push(TaskOverlap {
                    task1: t1.task,
                    task2: t2.task,
                    overlap,
                });
            }
        }
    }
    overlaps
}

/// Parameters of the bank-assignment pass.
#[derive(Debug, Clone)]
pub struct BankAssignArgs {
    pub bank_count: usize,
    pub bank_capacity: i64,
    /// Modulus for the group-penalty congruence test.
    pub hw_group_count: usize,
    pub cache: CacheConfig,
}

struct BufNode {
    buffer: BufferId,
    ignore: bool,
    access_task_count: i64,
}

#[derive(Default)]
struct BufEdge {
    penalty: i64,
    group_penalty: i64,
    reward: i64,
}

type BufferRelationGraph = Graph<BufNode, BufEdge>;

pub struct BankAssignment<'p> {
    prog: &'p mut Program,
    args: BankAssignArgs,
    overlaps: Vec<TaskOverlap>,
}

impl<'p> BankAssignment<'p> {
    pub fn new(prog: &'p mut Program, args: BankAssignArgs, overlaps: Vec<TaskOverlap>) -> Self {
        BankAssignment {
            prog,
            args,
            overlaps,
        }
    }

    /// Buffer relation graph for one division: penalty edges from the task
    /// overlaps, reward edges from per-task co-accesses.
    fn create_buffer_graph(&self, div_index: usize) -> (BufferRelationGraph, HashMap<BufferId, NodeId>) {
        let prog = &*self.prog;
        let mut g: BufferRelationGraph = Graph::new();
        let mut buffer_nodes: HashMap<BufferId, NodeId> = HashMap::new();
        for &b in &prog.divisions[div_index].buffers {
            buffer_nodes.insert(
                b,
                g.add_node(BufNode {
                    buffer: b,
                    ignore: false,
                    access_task_count: 0,
                }),
            );
        }

        let mut edges = EdgeRegister::undirected(&g);
        for ov in &self.overlaps {
            let g1 = prog.task_graph.node(ov.task1).group.expect("ungrouped task");
            let g2 = prog.task_graph.node(ov.task2).group.expect("ungrouped task");
            let punish_group =
                prog.groups[g1].id % self.args.hw_group_count == prog.groups[g2].id % self.args.hw_group_count;

            for d1 in &prog.task_graph.node(ov.task1).ifaces {
                let Some(b1) = d1.buffer else { continue };
                let Some(&n1) = buffer_nodes.get(&b1) else { continue };
                for d2 in &prog.task_graph.node(ov.task2).ifaces {
                    let Some(b2) = d2.buffer else { continue };
                    if b1 == b2 {
                        continue;
                    }
                    let Some(&n2) = buffer_nodes.get(&b2) else { continue };
                    let e = edges.get_or_insert(&mut g, n1, n2);
                    g.edge_mut(e).penalty += ov.overlap;
                    if punish_group {
                        g.edge_mut(e).group_penalty += ov.overlap;
                    }
                }
            }
        }

        for task in prog.divisions[div_index].tasks(&prog.groups) {
            let ifaces = &prog.task_graph.node(task).ifaces;
            for (i1, d1) in ifaces.iter().enumerate() {
                let Some(b1) = d1.buffer else { continue };
                let Some(&n1) = buffer_nodes.get(&b1) else { continue };
                g.node_mut(n1).access_task_count += 1;
                for d2 in &ifaces[..i1] {
                    let Some(b2) = d2.buffer else { continue };
                    if b1 == b2 {
                        continue; // buddies can link several ifaces to one buffer
                    }
                    let Some(&n2) = buffer_nodes.get(&b2) else { continue };
                    let e = edges.get_or_insert(&mut g, n1, n2);
                    g.edge_mut(e).reward += 1;
                }
            }
        }
        (g, buffer_nodes)
    }

    fn count_penalty_edges(g: &BufferRelationGraph, n: NodeId) -> (i64, i64) {
        let mut count = 0;
        let mut penalties = 0;
        for e in g.incident_edges(n) {
            if !g.node(g.opposite(n, e)).ignore && g.edge(e).penalty > 0 {
                count += 1;
                penalties += g.edge(e).penalty;
            }
        }
        (count, penalties)
    }

    /// One assignment attempt over the relation graph; `correction` biases
    /// the removal order towards size-first.
    fn assign_banks(
        &mut self,
        g: &mut BufferRelationGraph,
        correction: i32,
        diags: &mut DiagSink,
        verbose: &mut Option<&mut dyn FnMut(String)>,
    ) -> bool {
        let nbanks = self.args.bank_count;
        let capacity = self.args.bank_capacity;
        let mut ret = true;

        // clear previous assignments, reject oversized buffers up front
        let mut total_size = 0i64;
        for (_, node) in g.nodes() {
            let buffer = &mut self.prog.buffers[node.buffer];
            buffer.mem_bank = -1;
            if buffer.size > capacity {
                ret = false;
                diags.error(
                    codes::E0300,
                    format!(
                        "Buffer is too big to fit in any memory bank ({} Bytes).",
                        buffer.size
                    ),
                );
            }
            total_size += buffer.size;
        }
        if !ret {
            return false;
        }
        if total_size > nbanks as i64 * capacity {
            diags.error(
                codes::E0301,
                format!(
                    "Insufficient memory on the target platform. Program demands {} Bytes.",
                    total_size
                ),
            );
            return false;
        }
        if total_size * 10 > nbanks as i64 * capacity * 9 && correction == 0 {
            diags.warning(
                codes::W0300,
                "Program is using more than 90% of the memory on the platform. This may be hard to map.",
            );
        }

        // 1st step: remove nodes smallest-first onto a stack
        let mut stack: Vec<NodeId> = Vec::new();
        let node_count = g.node_count();
        for _ in 0..node_count {
            let mut best: Option<(NodeId, (i64, i64, i64, i64))> = None;
            let candidates: Vec<NodeId> = g.node_ids().filter(|&n| !g.node(n).ignore).collect();
            for n in candidates {
                let (neighbours, penalty) = Self::count_penalty_edges(g, n);
                let size = self.prog.buffers[g.node(n).buffer].size;
                let key = (
                    -g.node(n).access_task_count + ((size << correction) / capacity),
                    neighbours,
                    penalty,
                    size,
                );
                if best.map(|(_, bk)| key < bk).unwrap_or(true) {
                    best = Some((n, key));
                }
            }
            let (picked, _) = best.expect("node count mismatch");
            stack.push(picked);
            g.node_mut(picked).ignore = true;
        }

        // bank bookkeeping
        #[derive(Clone, Default)]
        struct BankState {
            penalty: i64,
            group_penalty: i64,
            reward: i64,
            free_space: i64,
        }
        let mut banks = vec![
            BankState {
                free_space: capacity,
                ..BankState::default()
            };
            nbanks
        ];

        // 2nd step: rebuild the graph back to front and color the nodes
        while let Some(n) = stack.pop() {
            g.node_mut(n).ignore = false;

            for bank in &mut banks {
                bank.penalty = 0;
                bank.group_penalty = 0;
                bank.reward = 0;
            }
            for e in g.incident_edges(n) {
                let other = g.opposite(n, e);
                if g.node(other).ignore {
                    continue;
                }
                let bank = self.prog.buffers[g.node(other).buffer].mem_bank;
                if bank < 0 {
                    continue;
                }
                let b = &mut banks[bank as usize];
                b.penalty += g.edge(e).penalty;
                b.group_penalty += g.edge(e).group_penalty;
                b.reward += g.edge(e).reward;
            }

            // per bank-group aggregates
            let mut group_reward = vec![0i64; BANK_GROUPS];
            let mut group_penalty = vec![0i64; BANK_GROUPS];
            for (i, bank) in banks.iter().enumerate() {
                group_reward[i % BANK_GROUPS] += bank.reward;
                group_penalty[i % BANK_GROUPS] += bank.group_penalty;
            }

            let buffer_size = self.prog.buffers[g.node(n).buffer].size;
            let mut selected: Option<(usize, (i64, i64, i64))> = None;
            for (i, bank) in banks.iter().enumerate().rev() {
                if bank.free_space < buffer_size {
                    continue;
                }
                let key = (
                    -bank.penalty - group_penalty[i % BANK_GROUPS],
                    bank.reward + group_reward[i % BANK_GROUPS] * GROUP_REWARD_NUM / GROUP_REWARD_DEN,
                    bank.free_space,
                );
                if selected.map(|(_, sk)| key > sk).unwrap_or(true) {
                    selected = Some((i, key));
                }
            }

            match selected {
                Some((i, _)) => {
                    self.prog.buffers[g.node(n).buffer].mem_bank = i as i32;
                    banks[i].free_space -= buffer_size;
                }
                None => {
                    self.prog.buffers[g.node(n).buffer].mem_bank = -1;
                    if let Some(cb) = verbose.as_mut() {
                        cb(format!("Failed to assign bank to buffer {}", g.node(n).buffer.0));
                    }
                    ret = false;
                }
            }
        }

        if !ret {
            if correction < MAX_CORRECTION {
                if let Some(cb) = verbose.as_mut() {
                    cb(format!(
                        "Assignment failed. Starting over with correction factor {}",
                        correction + 1
                    ));
                }
                return self.assign_banks(g, correction + 1, diags, verbose);
            }

            diags.report(
                Diagnostic::error(
                    "Not all buffers could be mapped to memory banks. Final assignment status:",
                )
                .with_code(codes::E0302)
                .with_hint(self.assignment_report(g)),
            );
        }
        ret
    }

    /// Per-bank usage plus the unassigned residual, for the give-up report.
    fn assignment_report(&self, g: &BufferRelationGraph) -> String {
        let mut by_bank: Vec<Vec<BufferId>> = vec![Vec::new(); self.args.bank_count + 1];
        for (_, node) in g.nodes() {
            let bank = self.prog.buffers[node.buffer].mem_bank;
            by_bank[(bank + 1) as usize].push(node.buffer);
        }

        let mut out = String::new();
        let mut all_free = 0i64;
        for i in 0..self.args.bank_count {
            let used: i64 = by_bank[i + 1]
                .iter()
                .map(|&b| self.prog.buffers[b].size)
                .sum();
            let free = self.args.bank_capacity - used;
            all_free += free;
            out.push_str(&format!("Bank {i}:\t"));
            for &b in &by_bank[i + 1] {
                out.push_str(&format!("T{}={}; ", b.0, self.prog.buffers[b].size));
            }
            out.push_str(&format!("Free: {free}\n"));
        }
        let unassigned: i64 = by_bank[0].iter().map(|&b| self.prog.buffers[b].size).sum();
        out.push_str("Unassigned:\t");
        for &b in &by_bank[0] {
            out.push_str(&format!("T{}={}; ", b.0, self.prog.buffers[b].size));
        }
        out.push_str(&format!("(total {unassigned} with {all_free} free.)"));
        out
    }

    /// Runs bank assignment followed by the cache-offset pass over every
    /// division.
    pub fn run(
        &mut self,
        diags: &mut DiagSink,
        verbose: &mut Option<&mut dyn FnMut(String)>,
    ) -> bool {
        let mut ret = true;
        for div_index in 0..self.prog.divisions.len() {
            let (mut g, _) = self.create_buffer_graph(div_index);
            let ok = self.assign_banks(&mut g, 0, diags, verbose);
            let cache_ok = if ok {
                let mut cio = CacheIndexOpt {
                    prog: &mut *self.prog,
                    cluster_banks: self.args.bank_count,
                    bank_size: self.args.bank_capacity,
                    cache: self.args.cache,
                };
                cio.optimize(div_index, diags)
            } else {
                false
            };
            ret = ok && cache_ok && ret;
        }
        ret
    }
}

// ── Cache-index optimization ────────────────────────────────────────────────

/// Preferred spacing between consecutive colors, in bytes.
const IDEAL_COLOR_OFFSET: i64 = 256;

struct ColorInfo {
    count: i64,
    offset: i64,
    gap: i64,
}

struct CacheIndexOpt<'p> {
    prog: &'p mut Program,
    cluster_banks: usize,
    bank_size: i64,
    cache: CacheConfig,
}

#[derive(Clone)]
struct BankInfo {
    free_space: i64,
    slots: Vec<(i64, i64)>, // (start, end) of placed buffers
}

impl<'p> CacheIndexOpt<'p> {
    /// Chooses offsets for all buffers of one division so that co-accessed
    /// buffers rarely share a cache index.
    fn optimize(&mut self, div_index: usize, diags: &mut DiagSink) -> bool {
        let (mut g, _) = self.create_buffer_graph(div_index);
        let mut banks = match self.fill_bank_info(&g, diags) {
            Some(banks) => banks,
            None => return false,
        };
        self.run_coloring(&mut g, &mut banks, diags);
        true
    }

    /// Penalty graph: one edge per pair of buffers accessed by the same task.
    fn create_buffer_graph(
        &self,
        div_index: usize,
    ) -> (Graph<(BufferId, bool, i32), i64>, HashMap<BufferId, NodeId>) {
        let prog = &*self.prog;
        let mut g: Graph<(BufferId, bool, i32), i64> = Graph::new();
        let mut buffer_nodes = HashMap::new();
        for &b in &prog.divisions[div_index].buffers {
            buffer_nodes.insert(b, g.add_node((b, false, -1)));
        }

        let mut edges = EdgeRegister::undirected(&g);
        for task in prog.divisions[div_index].tasks(&prog.groups) {
            let ifaces = &prog.task_graph.node(task).ifaces;
            for (i1, d1) in ifaces.iter().enumerate() {
                let Some(b1) = d1.buffer else { continue };
                let Some(&n1) = buffer_nodes.get(&b1) else { continue };
                for d2 in &ifaces[..i1] {
                    let Some(b2) = d2.buffer else { continue };
                    if b1 == b2 {
                        continue;
                    }
                    let Some(&n2) = buffer_nodes.get(&b2) else { continue };
                    let e = edges.get_or_insert(&mut g, n1, n2);
                    *g.edge_mut(e) += 1;
                }
            }
        }
        (g, buffer_nodes)
    }

    fn fill_bank_info(
        &mut self,
        g: &Graph<(BufferId, bool, i32), i64>,
        diags: &mut DiagSink,
    ) -> Option<Vec<BankInfo>> {
        let mut banks = vec![
            BankInfo {
                free_space: self.bank_size,
                slots: Vec::new(),
            };
            self.cluster_banks
        ];

        let mut ok = true;
        for (_, &(b, _, _)) in g.nodes() {
            let buffer = &mut self.prog.buffers[b];
            if buffer.mem_bank < 0 {
                ok = false;
                diags.error(
                    codes::E0303,
                    format!(
                        "Optimizing cache indices: Buffer {} has not been assigned a memory bank",
                        b.0
                    ),
                );
                continue;
            }
            if buffer.mem_bank as usize >= self.cluster_banks {
                ok = false;
                diags.error(
                    codes::E0303,
                    format!(
                        "Optimizing cache indices: Buffer {} has been assigned an invalid memory bank",
                        b.0
                    ),
                );
                continue;
            }
            banks[buffer.mem_bank as usize].free_space -= buffer.size;
            buffer.bank_offset = -1;
        }
        if ok {
            Some(banks)
        } else {
            None
        }
    }

    /// Number, spacing and wrap-around gap of the available colors.
    fn colors(&self, g: &Graph<(BufferId, bool, i32), i64>, diags: &mut DiagSink) -> ColorInfo {
        let max_degree = g.node_ids().map(|n| g.degree(n)).max().unwrap_or(0) as i64;
        let ncolors = max_degree + 1; // safe upper bound
        let line_span = self.cache.line_count * self.cache.word_size;

        if ncolors > self.cache.line_count {
            diags.warning(
                codes::W0303,
                "Too many constraints between buffers; cannot guarantee optimal cache behaviour.",
            );
            return ColorInfo {
                count: self.cache.line_count,
                offset: self.cache.word_size,
                gap: 0,
            };
        }
        let mut offset = (self.cache.line_count / ncolors) * self.cache.word_size;
        if offset > IDEAL_COLOR_OFFSET {
            offset = IDEAL_COLOR_OFFSET; // don't waste space on huge spacings
        } else {
            diags.warning(
                codes::W0302,
                "Many constraints between buffers. Reducing the cache index distances.",
            );
        }
        let count = line_span / offset; // if more colors fit, use them
        ColorInfo {
            count,
            offset,
            gap: line_span - count * offset,
        }
    }

    fn run_coloring(
        &mut self,
        g: &mut Graph<(BufferId, bool, i32), i64>,
        banks: &mut [BankInfo],
        diags: &mut DiagSink,
    ) {
        let index_mask = self.cache.line_count * self.cache.word_size - 1;
        let colors = self.colors(g, diags);

        // 1st step: remove nodes smallest-last onto a stack, preferring
        // full banks first
        let mut stack: Vec<NodeId> = Vec::new();
        for _ in 0..g.node_count() {
            let mut best: Option<(NodeId, (i64, i64))> = None;
            let candidates: Vec<NodeId> = g.node_ids().filter(|&n| !g.node(n).1).collect();
            for n in candidates {
                let bank = self.prog.buffers[g.node(n).0].mem_bank as usize;
                let key = (-banks[bank].free_space, g.degree(n) as i64);
                if best.map(|(_, bk)| key < bk).unwrap_or(true) {
                    best = Some((n, key));
                }
            }
            let (picked, _) = best.expect("node count mismatch");
            stack.push(picked);
            g.node_mut(picked).1 = true;
        }

        // 2nd step: rebuild and color
        while let Some(n) = stack.pop() {
            let mut conflicts = vec![0i64; colors.count as usize];
            for e in g.incident_edges(n) {
                let other = g.node(g.opposite(n, e));
                if other.1 {
                    continue;
                }
                if other.2 >= 0 {
                    conflicts[other.2 as usize] += 1;
                }
            }

            let buffer_id = g.node(n).0;
            let bank_index = self.prog.buffers[buffer_id].mem_bank as usize;
            let bank = &mut banks[bank_index];

            let mut start_pos = 0i64;
            let mut pos = 0i64;
            let mut color = 0i64;
            let next_color = |color: &mut i64, pos: &mut i64| {
                *pos += colors.offset;
                *color += 1;
                if *color >= colors.count {
                    *color = 0;
                    *pos += colors.gap;
                }
            };

            if let Some(&(_, end)) = bank.slots.last() {
                start_pos = end;
                color = ((start_pos - 1) & index_mask) / colors.offset;
                pos = start_pos - 1 - (((start_pos - 1) & index_mask) % colors.offset);
                next_color(&mut color, &mut pos);
            }

            let mut best_color = color;
            let mut best_conflicts = i64::MAX;
            let mut best_pos = start_pos;
            for _ in 0..colors.count {
                if pos - start_pos > bank.free_space {
                    break; // no longer fits into the bank
                }
                if conflicts[color as usize] < best_conflicts {
                    best_color = color;
                    best_conflicts = conflicts[color as usize];
                    best_pos = pos;
                }
                next_color(&mut color, &mut pos);
            }

            debug_assert!(best_color >= 0 && best_color < colors.count);
            g.node_mut(n).2 = best_color as i32;
            g.node_mut(n).1 = false;
            let size = self.prog.buffers[buffer_id].size;
            self.prog.buffers[buffer_id].bank_offset = best_pos;
            bank.free_space -= best_pos - start_pos;
            bank.slots.push((best_pos, best_pos + size));

            if best_conflicts != i64::MAX && best_conflicts > self.cache.associativity {
                diags.warning(
                    codes::W0301,
                    format!(
                        "Buffer {}: Cache index conflict with {} other buffers (cache associativity: {}). \
                         This may significantly slow down execution.",
                        buffer_id.0, best_conflicts, self.cache.associativity
                    ),
                );
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
