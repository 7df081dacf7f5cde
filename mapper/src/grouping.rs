// grouping.rs — Task ordering, reachability and group population
//
// The structural passes between flattening and buffer allocation:
//  * `task_topo_sort` reorders the task graph topologically (cyclic programs
//    are reported as their strongly connected components),
//  * `calc_successor_matrix` prunes shortcut edges and rebuilds the
//    task-reachability matrix,
//  * `apply_mapping` turns the externally supplied task-to-group records
//    into groups, divisions and core bindings,
//  * `populate_groups` guarantees every task has a group and every group a
//    division, then wires the inter-group ports and channels.

use std::collections::{HashMap, VecDeque};

use serde::Deserialize;

use crate::diag::{codes, DiagSink};
use crate::graph::{prune_edges, strongly_connected, NodeId};
use crate::model::{AnchorTask, Channel, Port, Program, TaskDivision, TaskGroup};
use crate::platform::Platform;

// ── Topological sort ────────────────────────────────────────────────────────

/// Kahn's queue over the task graph; returns None if the graph is cyclic.
fn topological_order(prog: &Program) -> Option<Vec<NodeId>> {
    let tg = &prog.task_graph;
    let mut in_counts = tg.node_map(0usize);
    for n in tg.node_ids() {
        in_counts[n] = tg.in_degree(n);
    }

    let mut order = Vec::with_capacity(tg.node_count());
    let mut candidates: VecDeque<NodeId> = VecDeque::new();
    for n in tg.node_ids() {
        if in_counts[n] == 0 {
            candidates.push_back(n);
        }
    }
    while let Some(cur) = candidates.pop_front() {
        order.push(cur);
        for &e in tg.out_edges(cur) {
            let t = tg.target(e);
            in_counts[t] -= 1;
            if in_counts[t] == 0 {
                candidates.push_back(t);
            }
        }
    }

    if order.len() == tg.node_count() {
        Some(order)
    } else {
        None
    }
}

/// Sorts the task list topologically, rewriting the dependency anchors to the
/// renumbered node ids. Cyclic dependencies are a topology error listing the
/// strongly connected components.
pub fn task_topo_sort(prog: &mut Program, diags: &mut DiagSink) -> bool {
    let order = match topological_order(prog) {
        Some(order) => order,
        None => {
            let (sccs, _) = strongly_connected(&prog.task_graph);
            let mut diag = crate::diag::Diagnostic::error(format!(
                "The program has cyclic dependencies between the tasks ({} strongly connected components)",
                sccs.len()
            ))
            .with_code(codes::E0200);
            for scc in &sccs {
                let names: Vec<&str> = scc
                    .iter()
                    .map(|&n| prog.task_graph.node(n).name.as_str())
                    .collect();
                diag = diag.with_related(None, names.join(" "));
            }
            diags.report(diag);
            return false;
        }
    };

    let remap = prog.task_graph.reorder_nodes(&order);
    for dep in &mut prog.dependencies {
        if let AnchorTask::Node(n) = dep.from.task {
            dep.from.task = AnchorTask::Node(remap[n]);
        }
        if let AnchorTask::Node(n) = dep.to.task {
            dep.to.task = AnchorTask::Node(remap[n]);
        }
    }
    true
}

// ── Reachability ────────────────────────────────────────────────────────────

/// Strict successors for every task: tasks that can never run at the same
/// time as their predecessors. Shortcut edges are removed along the way
/// (reachability is unchanged by that).
pub fn calc_successor_matrix(prog: &mut Program) -> bool {
    prog.reachability = prune_edges(&mut prog.task_graph);
    true
}

// ── Mapping boundary ────────────────────────────────────────────────────────

/// One task group as delivered by the mapping collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub tasks: Vec<String>,
}

/// Externally supplied task-to-group assignment, optional division layout and
/// optional group-to-core binding (groups are named after the core they are
/// bound to).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingSpec {
    pub grouping: Vec<GroupRecord>,
    #[serde(default)]
    pub divisions: Vec<Vec<String>>,
    #[serde(default)]
    pub bind_to_cores: bool,
}

/// Creates groups, divisions and core bindings from `spec`. Group records
/// are sorted by name and member tasks by id so the result does not depend
/// on the collaborator's enumeration order.
pub fn apply_mapping(
    prog: &mut Program,
    spec: &MappingSpec,
    platform: Option<&Platform>,
    diags: &mut DiagSink,
) -> bool {
    let mark = diags.mark();

    let mut tasks_by_name: HashMap<String, NodeId> = HashMap::new();
    for (n, task) in prog.task_graph.nodes() {
        if tasks_by_name.insert(task.name.clone(), n).is_some() {
            diags.warning(codes::W0100, format!("Ambiguous task name: {}", task.name));
        }
    }

    let mut records: Vec<&GroupRecord> = spec.grouping.iter().collect();
    records.sort_by(|a, b| a.name.cmp(&b.name));

    let mut groups_by_name: HashMap<String, usize> = HashMap::new();
    for record in records {
        let mut members: Vec<NodeId> = Vec::with_capacity(record.tasks.len());
        for name in &record.tasks {
            match tasks_by_name.get(name) {
                Some(&n) => members.push(n),
                None => diags.error(
                    codes::E0400,
                    format!("Task '{name}', as specified in grouping table, does not exist"),
                ),
            }
        }
        if members.is_empty() {
            diags.error(
                codes::E0402,
                format!("Group '{}' contains no members", record.name),
            );
            continue;
        }
        members.sort();

        let gid = prog.groups.len();
        let mut group = TaskGroup::new(gid, record.name.clone());
        for n in members {
            prog.task_graph.node_mut(n).group = Some(gid);
            group.add_task(n);
        }
        groups_by_name.insert(record.name.clone(), gid);
        prog.groups.push(group);
    }

    for (n, task) in prog.task_graph.nodes() {
        let _ = n;
        if task.group.is_none() {
            diags.warning(
                codes::W0100,
                format!("Task '{}' is not included in the mapping", task.name),
            );
        }
    }

    for div_groups in &spec.divisions {
        let div_index = prog.divisions.len();
        let mut division = TaskDivision::default();
        for gname in div_groups {
            match groups_by_name.get(gname) {
                None => diags.error(
                    codes::E0400,
                    format!("Group '{gname}', as specified in division table, does not exist"),
                ),
                Some(&gid) => {
                    if prog.groups[gid].division.is_some() {
                        diags.error(
                            codes::E0403,
                            format!("Trying to assign group '{gname}' to multiple divisions"),
                        );
                        continue;
                    }
                    prog.groups[gid].division = Some(div_index);
                    division.groups.push(gid);
                }
            }
        }
        prog.divisions.push(division);
    }

    if spec.bind_to_cores {
        let platform = platform.expect("core binding requested without a platform");
        for group in &mut prog.groups {
            match platform.core_by_name(&group.name) {
                Some(core) => group.binding = Some(core),
                None => diags.error(
                    codes::E0401,
                    format!(
                        "Processing element '{}', as specified in the given binding, does not exist in the platform",
                        group.name
                    ),
                ),
            }
        }
    }

    diags.since(mark).iter().all(|d| d.level != crate::diag::DiagLevel::Error)
}

// ── Group population ────────────────────────────────────────────────────────

/// Makes sure each task is part of a group (creating a single-task group per
/// loose task) and each group part of a division (one shared extra division
/// if needed), then populates the inter-group ports and channels.
pub fn populate_groups(prog: &mut Program) -> bool {
    create_trivial_groups(prog);
    create_trivial_division(prog);
    populate_inputs_outputs(prog);
    true
}

fn create_trivial_groups(prog: &mut Program) {
    let loose: Vec<NodeId> = prog
        .task_graph
        .nodes()
        .filter(|(_, t)| t.group.is_none())
        .map(|(n, _)| n)
        .collect();
    for n in loose {
        let gid = prog.groups.len();
        let name = prog.task_graph.node(n).name.clone();
        let mut group = TaskGroup::new(gid, name);
        group.add_task(n);
        prog.task_graph.node_mut(n).group = Some(gid);
        prog.groups.push(group);
    }
}

fn create_trivial_division(prog: &mut Program) {
    let loose: Vec<usize> = (0..prog.groups.len())
        .filter(|&g| prog.groups[g].division.is_none())
        .collect();
    if loose.is_empty() {
        return;
    }
    let div_index = prog.divisions.len();
    let mut division = TaskDivision::default();
    for g in loose {
        prog.groups[g].division = Some(div_index);
        division.groups.push(g);
    }
    prog.divisions.push(division);
}

/// For every dependency crossing a group boundary, adds an output port to the
/// producing group, an input port to the consuming group and a channel
/// between them. Boundary dependencies to the main task carry no channel.
fn populate_inputs_outputs(prog: &mut Program) {
    for di in 0..prog.dependencies.len() {
        let (from_task, to_task) = {
            let dep = &prog.dependencies[di];
            (dep.from.task, dep.to.task)
        };
        let (from_node, to_node) = match (from_task, to_task) {
            (AnchorTask::Node(f), AnchorTask::Node(t)) => (f, t),
            _ => continue, // main-task boundary: no channel
        };
        let from_group = prog.task_graph.node(from_node).group.expect("ungrouped task");
        let to_group = prog.task_graph.node(to_node).group.expect("ungrouped task");
        if from_group == to_group {
            continue; // passed on internally
        }

        let channel = prog.channels.len();
        let (from_key, to_key) = {
            let dep = &prog.dependencies[di];
            (dep.from.key(), dep.to.key())
        };

        let out_op = prog.groups[from_group]
            .operations
            .iter_mut()
            .find(|op| op.task == from_node)
            .expect("task missing from its group");
        out_op.outputs.push(Port {
            iface: from_key,
            channel: Some(channel),
        });

        let in_op = prog.groups[to_group]
            .operations
            .iter_mut()
            .find(|op| op.task == to_node)
            .expect("task missing from its group");
        in_op.inputs.push(Port {
            iface: to_key,
            channel: Some(channel),
        });

        prog.channels.push(Channel {
            from_group,
            to_group,
            dep: di,
        });
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Anchor, Dependency, Task};
    use crate::space::Space;

    fn add_task(prog: &mut Program, name: &str) -> NodeId {
        prog.task_graph.add_node(Task {
            name: name.into(),
            ..Task::default()
        })
    }

    fn dep(from: NodeId, to: NodeId) -> Dependency {
        Dependency::new(
            Anchor::new(AnchorTask::Node(from), 0, Space::new()),
            Anchor::new(AnchorTask::Node(to), 0, Space::new()),
        )
    }

    #[test]
    fn topo_sort_orders_tasks() {
        let mut prog = Program::new();
        let a = add_task(&mut prog, "a");
        let b = add_task(&mut prog, "b");
        let c = add_task(&mut prog, "c");
        // insert edges against topological order: c depends on b depends on a
        prog.task_graph.add_edge(b, c, ());
        prog.task_graph.add_edge(a, b, ());
        prog.dependencies.push(dep(b, c));
        prog.dependencies.push(dep(a, b));

        let mut diags = DiagSink::new();
        assert!(task_topo_sort(&mut prog, &mut diags));

        let names: Vec<&str> = prog.task_graph.nodes().map(|(_, t)| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        // anchors rewritten to the new ids
        for d in &prog.dependencies {
            let (AnchorTask::Node(f), AnchorTask::Node(t)) = (d.from.task, d.to.task) else {
                panic!()
            };
            assert!(f < t, "dependencies point forward after sorting");
        }
    }

    #[test]
    fn cycle_reported_as_scc() {
        let mut prog = Program::new();
        let a = add_task(&mut prog, "ping");
        let b = add_task(&mut prog, "pong");
        prog.task_graph.add_edge(a, b, ());
        prog.task_graph.add_edge(b, a, ());

        let mut diags = DiagSink::new();
        assert!(!task_topo_sort(&mut prog, &mut diags));
        let d = &diags.diagnostics()[0];
        assert_eq!(d.code, Some(codes::E0200));
        assert_eq!(d.related.len(), 1);
        assert!(d.related[0].1.contains("ping") && d.related[0].1.contains("pong"));
    }

    #[test]
    fn successor_matrix_prunes_shortcuts() {
        let mut prog = Program::new();
        let a = add_task(&mut prog, "a");
        let b = add_task(&mut prog, "b");
        let c = add_task(&mut prog, "c");
        prog.task_graph.add_edge(a, b, ());
        prog.task_graph.add_edge(b, c, ());
        prog.task_graph.add_edge(a, c, ());

        calc_successor_matrix(&mut prog);
        assert_eq!(prog.task_graph.edge_count(), 2);
        assert!(prog.reachability[a].contains(c));
        assert!(prog.reachability[a].contains(b));
        assert!(!prog.reachability[c].contains(a));
    }

    #[test]
    fn trivial_groups_and_division() {
        let mut prog = Program::new();
        let a = add_task(&mut prog, "a");
        let b = add_task(&mut prog, "b");
        prog.task_graph.add_edge(a, b, ());
        prog.dependencies.push(dep(a, b));

        populate_groups(&mut prog);
        assert_eq!(prog.groups.len(), 2);
        assert_eq!(prog.divisions.len(), 1);
        assert_eq!(prog.divisions[0].groups.len(), 2);
        // one channel for the group-crossing dependency
        assert_eq!(prog.channels.len(), 1);
        assert_eq!(prog.groups[0].operations[0].outputs.len(), 1);
        assert_eq!(prog.groups[1].operations[0].inputs.len(), 1);
    }

    #[test]
    fn mapping_creates_groups_and_bindings() {
        let mut prog = Program::new();
        let a = add_task(&mut prog, "a");
        let b = add_task(&mut prog, "b");
        let _ = (a, b);

        let mut pf = Platform::new();
        let ct = pf.add_core_type("pe");
        pf.add_core("core0", ct);
        pf.add_core("core1", ct);

        let spec = MappingSpec {
            grouping: vec![
                GroupRecord {
                    name: "core1".into(),
                    tasks: vec!["b".into()],
                },
                GroupRecord {
                    name: "core0".into(),
                    tasks: vec!["a".into()],
                },
            ],
            divisions: vec![vec!["core0".into(), "core1".into()]],
            bind_to_cores: true,
        };

        let mut diags = DiagSink::new();
        assert!(apply_mapping(&mut prog, &spec, Some(&pf), &mut diags));
        assert_eq!(prog.groups.len(), 2);
        // records sorted by name: core0 first
        assert_eq!(prog.groups[0].name, "core0");
        assert_eq!(prog.groups[0].binding, Some(0));
        assert_eq!(prog.groups[1].binding, Some(1));
        assert_eq!(prog.divisions.len(), 1);
        assert_eq!(prog.divisions[0].groups, vec![0, 1]);
    }

    #[test]
    fn mapping_errors() {
        let mut prog = Program::new();
        add_task(&mut prog, "a");

        let spec = MappingSpec {
            grouping: vec![
                GroupRecord {
                    name: "g0".into(),
                    tasks: vec!["nosuch".into()],
                },
                GroupRecord {
                    name: "g1".into(),
                    tasks: vec!["a".into()],
                },
            ],
            divisions: vec![vec!["g1".into()], vec!["g1".into()]],
            bind_to_cores: false,
        };

        let mut diags = DiagSink::new();
        assert!(!apply_mapping(&mut prog, &spec, None, &mut diags));
        let codes_seen: Vec<_> = diags.diagnostics().iter().filter_map(|d| d.code).collect();
        assert!(codes_seen.contains(&codes::E0400), "unknown task");
        assert!(codes_seen.contains(&codes::E0402), "empty group");
        assert!(codes_seen.contains(&codes::E0403), "group in two divisions");
    }
}
