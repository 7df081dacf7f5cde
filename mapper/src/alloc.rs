// alloc.rs — Buffer allocation by lifetime-aware merging
//
// Per task division, builds a conflict graph over the preallocated buffers:
// two buffers conflict if their live ranges can coexist, i.e. neither
// buffer's last accesses strictly dominate every access of the other per the
// task-reachability matrix. The nodes are then ordered by the smallest-last
// heuristic and colored greedily; each color is a physical buffer whose size
// grows to the largest member. Finally every interface is rebound from its
// preallocated buffer to the merged one.
//
// Preconditions: buffer preallocation done; successor matrix computed;
//                groups populated.
// Postconditions: division buffer lists hold the merged buffers only; the
//                 preallocated ones are destroyed.

use std::collections::HashMap;

use crate::arena::{ItemSet};
use crate::diag::{codes, DiagSink};
use crate::graph::{Graph, NodeId};
use crate::model::{Buffer, BufferId, Program};

struct BufNode {
    buffer: BufferId,
    accesses: ItemSet<NodeId>,
    last_accesses: Vec<NodeId>,
}

type BufferGraph = Graph<BufNode, ()>;

/// Adds one node per non-external buffer accessed in the division and fills
/// the per-buffer task access sets.
fn add_buffer_graph_nodes(
    prog: &Program,
    div_index: usize,
    g: &mut BufferGraph,
    diags: &mut DiagSink,
) -> Option<HashMap<BufferId, NodeId>> {
    let mut buffer_nodes: HashMap<BufferId, NodeId> = HashMap::new();
    let div = &prog.divisions[div_index];
    let own_buffers: std::collections::HashSet<BufferId> = div.buffers.iter().copied().collect();

    for task in div.tasks(&prog.groups) {
        for iface in &prog.task_graph.node(task).ifaces {
            let buffer = iface.buffer.expect("iface without buffer after preallocation");
            if prog.buffers[buffer].external_source.is_some() {
                continue; // don't merge external buffers
            }
            if !own_buffers.contains(&buffer) {
                diags.error(
                    codes::E0115,
                    "Buffers spanning across task divisions. \
                     Ensure communication tasks were properly inserted.",
                );
                return None;
            }
            let node = *buffer_nodes.entry(buffer).or_insert_with(|| {
                g.add_node(BufNode {
                    buffer,
                    accesses: prog.task_graph.node_set(false),
                    last_accesses: Vec::new(),
                })
            });
            g.node_mut(node).accesses.insert(task);
        }
    }
    Some(buffer_nodes)
}

/// Determines for every buffer node the set of accessing tasks that no other
/// accessing task succeeds — the accesses that end the buffer's lifetime.
fn fill_last_accesses(prog: &Program, div_tasks: &[NodeId], g: &mut BufferGraph) {
    let mut succ_counts = prog.task_graph.node_map(0usize);
    for t in prog.task_graph.node_ids() {
        succ_counts[t] = prog.reachability[t].element_count();
    }

    let buf_nodes: Vec<NodeId> = g.node_ids().collect();
    for bn in buf_nodes {
        let mut accesses: Vec<NodeId> = div_tasks
            .iter()
            .copied()
            .filter(|&t| g.node(bn).accesses.contains(t))
            .collect();
        accesses.sort_by_key(|&t| succ_counts[t]);

        let mut last_set = prog.task_graph.node_set(false);
        let mut last = Vec::new();
        let mut it = accesses.iter();
        let first = *it.next().expect("buffer without accesses");
        let min_succs = succ_counts[first];
        last_set.insert(first);
        last.push(first);
        let mut rest = Vec::new();
        for &t in it {
            if succ_counts[t] == min_succs {
                last_set.insert(t);
                last.push(t);
            } else {
                rest.push(t);
            }
        }
        for t in rest {
            if !prog.reachability[t].intersects(&last_set) {
                last_set.insert(t);
                last.push(t);
            }
        }
        g.node_mut(bn).last_accesses = last;
    }
}

/// True if every access of `b` comes strictly after all of `a`'s last
/// accesses.
fn all_before(prog: &Program, a: &BufNode, b: &BufNode) -> bool {
    a.last_accesses
        .iter()
        .all(|&t| prog.reachability[t].contains_set(&b.accesses))
}

fn has_conflicts(prog: &Program, a: &BufNode, b: &BufNode) -> bool {
    !(all_before(prog, a, b) || all_before(prog, b, a))
}

fn add_buffer_graph_edges(prog: &Program, g: &mut BufferGraph) {
    let nodes: Vec<NodeId> = g.node_ids().collect();
    for i in 0..nodes.len() {
        for j in i + 1..nodes.len() {
            if has_conflicts(prog, g.node(nodes[i]), g.node(nodes[j])) {
                g.add_edge(nodes[i], nodes[j], ());
            }
        }
    }
}

/// Smallest-last ordering: repeatedly take the node of smallest remaining
/// degree, fill the order back to front. The front of the returned list holds
/// the highest-degree nodes, which are colored first.
fn smallest_last_order(g: &BufferGraph) -> Vec<NodeId> {
    let mut order: Vec<NodeId> = g.node_ids().collect();
    let mut degrees = g.node_map(0i64);
    for n in g.node_ids() {
        degrees[n] = g.degree(n) as i64;
    }

    for pos in (0..order.len()).rev() {
        let mut best = 0;
        for j in 1..=pos {
            if degrees[order[j]] < degrees[order[best]] {
                best = j;
            }
        }
        order.swap(best, pos);
        let picked = order[pos];
        for e in g.incident_edges(picked) {
            degrees[g.opposite(picked, e)] -= 1;
        }
    }
    order
}

/// Merges the buffers of one division.
fn allocate_division(
    prog: &mut Program,
    div_index: usize,
    diags: &mut DiagSink,
    verbose: &mut Option<&mut dyn FnMut(String)>,
) -> bool {
    let mut g: BufferGraph = Graph::new();
    if add_buffer_graph_nodes(prog, div_index, &mut g, diags).is_none() {
        return false;
    }
    let div_tasks = prog.divisions[div_index].tasks(&prog.groups);
    if g.node_count() > 0 {
        fill_last_accesses(prog, &div_tasks, &mut g);
        add_buffer_graph_edges(prog, &mut g);
    }

    let order = smallest_last_order(&g);

    // Greedy coloring: each color is a final buffer. Pick the valid color
    // whose size and access proximity match best; open a new one if nothing
    // fits.
    let mut final_buffers: Vec<BufferId> = Vec::new();
    let mut final_of = g.node_map(None::<usize>);
    let mut buffer_accesses: Vec<Vec<i64>> = Vec::new();

    for &n in &order {
        let mut valid = vec![true; final_buffers.len()];
        for e in g.incident_edges(n) {
            if let Some(c) = final_of[g.opposite(n, e)] {
                valid[c] = false;
            }
        }

        let ref_size = prog.buffers[g.node(n).buffer].size;
        let ref_id = g.node(n).last_accesses[0].0 as i64;
        let proximity = |c: usize| -> i64 {
            buffer_accesses[c]
                .iter()
                .map(|&a| (a - ref_id).abs())
                .min()
                .unwrap_or(i64::MAX)
        };

        let mut selected: Option<usize> = None;
        for c in 0..final_buffers.len() {
            if !valid[c] {
                continue;
            }
            let better = match selected {
                None => true,
                Some(s) => {
                    let key_c = (
                        (prog.buffers[final_buffers[c]].size - ref_size).abs(),
                        proximity(c),
                    );
                    let key_s = (
                        (prog.buffers[final_buffers[s]].size - ref_size).abs(),
                        proximity(s),
                    );
                    key_c < key_s
                }
            };
            if better {
                selected = Some(c);
            }
        }

        let color = match selected {
            Some(c) => {
                let fb = final_buffers[c];
                if ref_size > prog.buffers[fb].size {
                    prog.buffers[fb].size = ref_size;
                }
                c
            }
            None => {
                // use this buffer as a template for the new one
                let template = prog.buffers[g.node(n).buffer].clone();
                let fb = prog.buffers.insert(Buffer { ..template });
                final_buffers.push(fb);
                buffer_accesses.push(Vec::new());
                final_buffers.len() - 1
            }
        };
        final_of[n] = Some(color);
        buffer_accesses[color].push(ref_id);
    }

    if let Some(cb) = verbose.as_mut() {
        let old_total: i64 = prog.divisions[div_index]
            .buffers
            .iter()
            .map(|&b| prog.buffers[b].size)
            .sum();
        let new_total: i64 = final_buffers.iter().map(|&b| prog.buffers[b].size).sum();
        cb(format!(
            "Buffer merging statistics: before: {} buffers, in total {} bytes; after: {} buffers, in total {} bytes",
            prog.divisions[div_index].buffers.len(),
            old_total,
            final_buffers.len(),
            new_total
        ));
    }

    // Rebind interfaces and swap the division's buffer pool.
    let mut old_to_new: HashMap<BufferId, BufferId> = HashMap::new();
    for n in g.node_ids() {
        let color = final_of[n].expect("uncolored buffer node");
        old_to_new.insert(g.node(n).buffer, final_buffers[color]);
    }

    for task in div_tasks {
        for iface in &mut prog.task_graph.node_mut(task).ifaces {
            let buffer = iface.buffer.expect("iface without buffer");
            if prog.buffers[buffer].external_source.is_none() {
                iface.relocate_buffer(old_to_new[&buffer]);
            }
        }
    }

    let old_buffers = std::mem::replace(&mut prog.divisions[div_index].buffers, final_buffers);
    for b in old_buffers {
        prog.buffers.remove(b);
    }
    true
}

/// Merges buffers with disjoint lifetimes, division by division.
pub fn buffer_allocation(
    prog: &mut Program,
    diags: &mut DiagSink,
    verbose: &mut Option<&mut dyn FnMut(String)>,
) -> bool {
    for div_index in 0..prog.divisions.len() {
        if !allocate_division(prog, div_index, diags, verbose) {
            return false;
        }
    }
    true
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::diag::DiagSink;
    use crate::model::{
        base_type, Access, Anchor, AnchorTask, Dependency, Kernel, KernelId, Packet, Task,
    };
    use crate::space::{Range, Space};

    fn f32t() -> crate::model::BaseTypeRef {
        base_type("float", 4)
    }

    fn sp(n: i64) -> Space {
        Space::from_ranges(vec![Range::begin_count(0, n)])
    }

    /// A chain a -> b -> c where a→b uses one variable and b→c another;
    /// the two gang buffers have disjoint lifetimes only if a's buffer dies
    /// when b runs — it does not (b reads it while writing the second), so
    /// they conflict and stay separate... unless the chain is long enough.
    /// Here we build a 4-stage chain where buffer 0 (a→b) and buffer 2
    /// (c→d) can share storage.
    fn chain_program() -> Program {
        let mut kernels: Arena<Kernel, KernelId> = Arena::new();
        let mut copyk = Kernel::native("copy", "copy_impl");
        copyk.packets = vec![
            Packet::new("i", Access::In, f32t(), vec![8]),
            Packet::new("o", Access::Out, f32t(), vec![8]),
        ];
        let copy = kernels.insert(copyk);
        let mut srck = Kernel::native("src", "src_impl");
        srck.packets = vec![Packet::new("o", Access::Out, f32t(), vec![8])];
        let src = kernels.insert(srck);
        let mut sinkk = Kernel::native("sink", "sink_impl");
        sinkk.packets = vec![Packet::new("i", Access::In, f32t(), vec![8])];
        let sink = kernels.insert(sinkk);
        let mut rootk = Kernel::native("root", "");
        rootk.body = Some(Default::default());
        let root = kernels.insert(rootk);

        let mut prog = Program::new();
        prog.main_task = Task {
            name: "root".into(),
            kernel: Some(root),
            ..Task::default()
        };

        let mut mk_task = |kernels: &Arena<Kernel, KernelId>, k, name: &str| {
            let mut t = Task::instantiate(kernels, k, name, vec![], vec![]);
            for iface in &mut t.ifaces {
                iface.pos_hint = sp(8);
            }
            t
        };
        let a = prog.task_graph.add_node(mk_task(&kernels, src, "a"));
        let b = prog.task_graph.add_node(mk_task(&kernels, copy, "b"));
        let c = prog.task_graph.add_node(mk_task(&kernels, copy, "c"));
        let d = prog.task_graph.add_node(mk_task(&kernels, sink, "d"));
        prog.kernels = kernels;
        for (f, t) in [(a, b), (b, c), (c, d)] {
            prog.task_graph.add_edge(f, t, ());
        }
        // a.o -> b.i ; b.o -> c.i ; c.o -> d.i
        prog.dependencies.push(Dependency::new(
            Anchor::new(AnchorTask::Node(a), 0, sp(8)),
            Anchor::new(AnchorTask::Node(b), 0, sp(8)),
        ));
        prog.dependencies.push(Dependency::new(
            Anchor::new(AnchorTask::Node(b), 1, sp(8)),
            Anchor::new(AnchorTask::Node(c), 0, sp(8)),
        ));
        prog.dependencies.push(Dependency::new(
            Anchor::new(AnchorTask::Node(c), 1, sp(8)),
            Anchor::new(AnchorTask::Node(d), 0, sp(8)),
        ));
        prog.reachability = crate::graph::reachability_matrix(&prog.task_graph);
        crate::grouping::populate_groups(&mut prog);

        let mut diags = DiagSink::new();
        assert!(
            crate::prealloc::buffer_preallocation(&mut prog, &mut diags),
            "{:?}",
            diags.diagnostics()
        );
        prog
    }

    #[test]
    fn disjoint_lifetimes_are_merged() {
        let mut prog = chain_program();
        assert_eq!(prog.divisions[0].buffers.len(), 3);

        let mut diags = DiagSink::new();
        assert!(buffer_allocation(&mut prog, &mut diags, &mut None));

        // buffer(a→b) dies once b ran; buffer(c→d) is born at c, which runs
        // strictly after b — the two share one physical buffer.
        assert_eq!(prog.divisions[0].buffers.len(), 2);

        // all interfaces point at division buffers
        for (_, task) in prog.task_graph.nodes() {
            for iface in &task.ifaces {
                assert!(prog.divisions[0].buffers.contains(&iface.buffer.unwrap()));
            }
        }
        // producer of the first edge and consumer of the last share storage
        let nodes: Vec<_> = prog.task_graph.node_ids().collect();
        let a_buf = prog.task_graph.node(nodes[0]).ifaces[0].buffer;
        let d_buf = prog.task_graph.node(nodes[3]).ifaces[0].buffer;
        assert_eq!(a_buf, d_buf);
    }

    #[test]
    fn merged_buffer_takes_maximum_size() {
        let mut prog = chain_program();
        // inflate the c→d buffer before merging
        let big = prog.divisions[0].buffers[2];
        prog.buffers[big].size = 1024;

        let mut diags = DiagSink::new();
        assert!(buffer_allocation(&mut prog, &mut diags, &mut None));
        let max_size = prog.divisions[0]
            .buffers
            .iter()
            .map(|&b| prog.buffers[b].size)
            .max()
            .unwrap();
        assert_eq!(max_size, 1024);
    }

    #[test]
    fn idempotent_merge_result() {
        let mut p1 = chain_program();
        let mut p2 = chain_program();
        let mut d1 = DiagSink::new();
        let mut d2 = DiagSink::new();
        assert!(buffer_allocation(&mut p1, &mut d1, &mut None));
        assert!(buffer_allocation(&mut p2, &mut d2, &mut None));

        let sizes = |p: &Program| -> Vec<i64> {
            p.divisions[0]
                .buffers
                .iter()
                .map(|&b| p.buffers[b].size)
                .collect()
        };
        assert_eq!(sizes(&p1), sizes(&p2));

        // same sharing structure up to buffer identity
        let shape = |p: &Program| -> Vec<Vec<usize>> {
            p.divisions[0]
                .buffers
                .iter()
                .map(|&b| {
                    let mut tasks: Vec<usize> = p
                        .task_graph
                        .nodes()
                        .enumerate()
                        .filter(|(_, (_, t))| {
                            t.ifaces.iter().any(|d| d.buffer == Some(b))
                        })
                        .map(|(i, _)| i)
                        .collect();
                    tasks.sort();
                    tasks
                })
                .collect()
        };
        assert_eq!(shape(&p1), shape(&p2));
    }
}
