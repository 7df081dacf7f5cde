// prealloc.rs — Buffer preallocation
//
// Determines which interfaces share a buffer and where each interface sits
// inside it. An auxiliary graph with one node per interface and one edge per
// dependency partitions the interfaces into connected components ("buffer
// gangs"); each gang gets one buffer whose dimensions are the bounding box of
// the members' position hints. Before that, the access pattern is validated:
// every input cell must be defined exactly once, and a region flowing to
// several readers may be modified by at most one of them unless the
// reachability matrix linearizes the accesses.
//
// Preconditions: successor matrix computed; groups and divisions populated.
// Postconditions: every interface is bound to a buffer with offset and
//                 stride vector; buffers are owned by their division (or by
//                 the program for boundary interfaces).

use std::collections::HashMap;

use crate::diag::{codes, DiagSink, Diagnostic};
use crate::division::SpaceDivision;
use crate::graph::{Graph, NodeId};
use crate::model::{Access, AnchorTask, Buffer, BufferId, IfaceKey, Program};
use crate::space::Space;

struct IfNode {
    key: IfaceKey,
    buffer: Option<BufferId>,
}

type IfaceGraph = Graph<IfNode, usize>;

/// Builds the interface graph: all interfaces as nodes, all dependencies as
/// edges. Rejects writes into program outputs and incompatible anchors.
fn create_iface_graph(prog: &Program, diags: &mut DiagSink) -> Option<IfaceGraph> {
    let mut g: IfaceGraph = Graph::new();
    let mut nodes: HashMap<IfaceKey, NodeId> = HashMap::new();

    let mut add_ifaces = |g: &mut IfaceGraph, task: AnchorTask, count: usize| {
        for i in 0..count {
            let key = IfaceKey { task, iface: i };
            nodes.insert(key, g.add_node(IfNode { key, buffer: None }));
        }
    };
    add_ifaces(&mut g, AnchorTask::Main, prog.main_task.ifaces.len());
    let task_ids: Vec<NodeId> = prog.task_graph.node_ids().collect();
    for n in task_ids {
        add_ifaces(
            &mut g,
            AnchorTask::Node(n),
            prog.task_graph.node(n).ifaces.len(),
        );
    }

    let mut ok = true;
    for (di, dep) in prog.dependencies.iter().enumerate() {
        let to_iface = prog.iface(dep.to.key());
        if to_iface.access == Access::Out && dep.to.task != AnchorTask::Main {
            diags.error(
                codes::E0112,
                format!("Trying to write to output iface {}", prog.anchor_id(&dep.to)),
            );
            ok = false;
            continue;
        }
        if !dep.check_compatibility(prog.iface(dep.from.key()), to_iface) {
            diags.error(
                codes::E0114,
                format!(
                    "Internal error: dependency between incompatible ifaces: {} -> {}",
                    prog.anchor_id(&dep.from),
                    prog.anchor_id(&dep.to)
                ),
            );
            ok = false;
            continue;
        }
        g.add_edge(nodes[&dep.from.key()], nodes[&dep.to.key()], di);
    }

    if ok {
        Some(g)
    } else {
        None
    }
}

fn iface_id(prog: &Program, key: IfaceKey) -> String {
    format!(
        "{}.{}",
        prog.task_full_name(key.task),
        prog.iface(key).name
    )
}

/// Every cell read through this interface must be defined once and once only.
fn check_iface_input(prog: &Program, g: &IfaceGraph, n: NodeId, diags: &mut DiagSink) -> bool {
    let mut ret = true;
    let key = g.node(n).key;

    let mut sd: SpaceDivision<Option<usize>> =
        SpaceDivision::new(Space::from_dimensions(&prog.iface(key).dims));
    // dummy assignment so uncovered regions can be detected afterwards
    sd.assign_section(sd.full_space().clone(), None);

    for &e in g.in_edges(n) {
        let di = *g.edge(e);
        let dep = &prog.dependencies[di];
        for idx in sd.find_overlaps(&dep.to.index) {
            if let (Some(other), sec) = (&sd.sections()[idx].0, &sd.sections()[idx].1) {
                let other_dep = &prog.dependencies[*other];
                diags.error(
                    codes::E0110,
                    format!(
                        "Overlapping accesses for {}: From {} and {} on index/indices {}",
                        iface_id(prog, key),
                        iface_id(prog, other_dep.from.key()),
                        iface_id(prog, dep.from.key()),
                        other_dep.to.index.intersection(&dep.to.index)
                    ),
                );
                let _ = sec;
                ret = false;
            }
        }
        sd.assign_section(dep.to.index.clone(), Some(di));
    }

    let dummies: Vec<&Space> = sd
        .sections()
        .iter()
        .filter(|(label, _)| label.is_none())
        .map(|(_, s)| s)
        .collect();
    if dummies.is_empty() {
        return ret;
    }

    if dummies.len() == 1 && *dummies[0] == *sd.full_space() {
        diags.error(
            codes::E0113,
            format!("Unconnected input iface: {}", iface_id(prog, key)),
        );
    } else {
        for sec in dummies {
            diags.error(
                codes::E0113,
                format!(
                    "Unconnected input interface: {} on index/indices {}",
                    iface_id(prog, key),
                    sec
                ),
            );
        }
    }
    false
}

/// When the same produced region flows to multiple readers, at most one of
/// them may be a writer — unless the reachability matrix proves the plain
/// readers run strictly before it.
fn check_iface_output(prog: &Program, g: &IfaceGraph, n: NodeId, diags: &mut DiagSink) -> bool {
    let mut ret = true;

    for &e1 in g.out_edges(n) {
        let dep1 = &prog.dependencies[*g.edge(e1)];
        if prog.iface(dep1.to.key()).access == Access::In {
            continue; // mere inputs can happen in parallel
        }

        let mut new_error = true;
        for &e2 in g.out_edges(n) {
            if e1 == e2 {
                continue;
            }
            let dep2 = &prog.dependencies[*g.edge(e2)];
            if !dep1.from.index.overlaps(&dep2.from.index) {
                continue;
            }

            // If the modifying task depends (possibly indirectly) on the
            // plain reader, the accesses are ordered and there is no problem.
            if prog.iface(dep2.to.key()).access == Access::In {
                let ordered = match (dep1.to.task, dep2.to.task) {
                    (AnchorTask::Main, _) => true,
                    (AnchorTask::Node(writer), AnchorTask::Node(reader)) => {
                        prog.reachability[reader].contains(writer)
                    }
                    _ => false,
                };
                if ordered {
                    continue;
                }
            }

            if new_error {
                diags.report(
                    Diagnostic::error("Unresolved false dependency:")
                        .with_code(codes::E0111)
                        .with_related(
                            None,
                            format!(
                                "{} -> {}",
                                prog.anchor_id(&dep1.from),
                                prog.anchor_id(&dep1.to)
                            ),
                        )
                        .with_related(
                            None,
                            format!(
                                "{} -> {}",
                                prog.anchor_id(&dep2.from),
                                prog.anchor_id(&dep2.to)
                            ),
                        ),
                );
                new_error = false;
            }
            ret = false;
        }
    }
    ret
}

/// Checks write overlaps and read coverage for every interface except the
/// program boundary's.
fn check_accesses(prog: &Program, g: &IfaceGraph, diags: &mut DiagSink) -> bool {
    let mut ret = true;
    for (n, node) in g.nodes() {
        if node.key.task == AnchorTask::Main {
            continue;
        }
        let access = prog.iface(node.key).access;
        if access != Access::Out {
            ret = check_iface_input(prog, g, n, diags) && ret;
        }
        if access != Access::In {
            ret = check_iface_output(prog, g, n, diags) && ret;
        }
    }
    ret
}

/// Depth-first collection of all interfaces connected to `start`; they will
/// share one buffer.
fn collect_gang(g: &mut IfaceGraph, start: NodeId, buffer: BufferId) -> Vec<IfaceKey> {
    let mut gang = Vec::new();
    let mut stack = vec![start];
    g.node_mut(start).buffer = Some(buffer);
    while let Some(n) = stack.pop() {
        gang.push(g.node(n).key);
        let neighbors: Vec<NodeId> = g
            .out_edges(n)
            .iter()
            .map(|&e| g.target(e))
            .chain(g.in_edges(n).iter().map(|&e| g.source(e)))
            .collect();
        for m in neighbors {
            if g.node(m).buffer.is_none() {
                g.node_mut(m).buffer = Some(buffer);
                stack.push(m);
            }
        }
    }
    gang
}

/// Bounding union of the position hints of all gang members.
fn gang_index_space(prog: &Program, gang: &[IfaceKey]) -> Space {
    let mut it = gang.iter();
    let mut s = prog.iface(*it.next().expect("empty gang")).pos_hint.clone();
    for &key in it {
        s.union_assign(&prog.iface(key).pos_hint);
    }
    s
}

/// Sizes the buffer for one gang and computes each member's byte offset and
/// per-dimension element stride vector.
fn adjust_indices(prog: &mut Program, gang: &[IfaceKey], buffer: BufferId) {
    let mut s = gang_index_space(prog, gang);
    let origin = s.origin();
    s.displace_neg(&origin);
    let dim = s.dimensions();

    // absolute element strides per buffer dimension
    let mut mulvec = vec![0i64; dim.len()];
    let mut mul = 1i64;
    for i in (0..dim.len()).rev() {
        mulvec[i] = mul;
        mul *= dim[i];
    }
    let elem_size = prog.iface(gang[0]).elem_size();
    prog.buffers[buffer].size = mul * elem_size;

    for &key in gang {
        let iface = prog.iface_mut(key);
        iface.pos_hint.displace_neg(&origin);
        let offset = iface.pos_hint.origin();

        // stride per interface dimension, skipping collapsed hint entries
        let mut dispvec = iface.dims.clone();
        let ph: Vec<i64> = iface.pos_hint.dimensions();
        let mut iidx = ph.len();
        let mut idim = dim.len();
        let mut mul = 1i64;
        for disp in dispvec.iter_mut().rev() {
            while *disp != ph[iidx - 1] {
                debug_assert_eq!(ph[iidx - 1], 1);
                iidx -= 1;
                mul *= dim[idim - 1];
                idim -= 1;
            }
            *disp = mul;
            iidx -= 1;
            mul = dim[idim - 1];
            idim -= 1;
        }

        let byte_offset: i64 = offset
            .iter()
            .zip(&mulvec)
            .map(|(&o, &m)| o * m)
            .sum::<i64>()
            * elem_size;
        iface.set_buffer(buffer, dim.clone(), dispvec, byte_offset);
    }
}

/// Determines what buffers are necessary and calculates for each interface
/// which buffer it accesses at which indices.
pub fn buffer_preallocation(prog: &mut Program, diags: &mut DiagSink) -> bool {
    for iface in &mut prog.main_task.ifaces {
        iface.pos_hint = Space::from_dimensions(&iface.dims);
    }

    let mut g = match create_iface_graph(prog, diags) {
        Some(g) => g,
        None => return false,
    };
    if !check_accesses(prog, &g, diags) {
        return false;
    }

    let iface_nodes: Vec<NodeId> = g.node_ids().collect();
    for n in iface_nodes {
        let key = g.node(n).key;
        if g.node(n).buffer.is_some() || prog.iface(key).buffer.is_some() {
            continue; // interface already handled
        }

        let buffer = match key.task {
            AnchorTask::Main => {
                let kernel = prog.main_task.kernel.expect("main task without kernel");
                let packet_index = prog.iface(key).packet_index;
                let id = prog.buffers.insert(Buffer {
                    external_source: Some((kernel, packet_index)),
                    ..Buffer::default()
                });
                prog.external_buffers.push(id);
                id
            }
            AnchorTask::Node(task) => {
                let group = prog.task_graph.node(task).group.expect("ungrouped task");
                let div = prog.groups[group].division.expect("group without division");
                let id = prog.buffers.insert(Buffer::default());
                prog.divisions[div].buffers.push(id);
                id
            }
            _ => unreachable!("meta-kernel anchor after adoption"),
        };

        let gang = collect_gang(&mut g, n, buffer);
        adjust_indices(prog, &gang, buffer);
    }
    true
}

// ── Tests ───────────────────────────────────────────────────────────────────
