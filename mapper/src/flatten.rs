// flatten.rs — Meta-kernel expansion and program adoption
//
// Recursively substitutes every task that instantiates a meta-kernel by
// clones of that meta-kernel's internal tasks, rewriting the dependencies
// that crossed the boundary: an outer dependency ending at the instance is
// redirected to each internal reader of the corresponding input, and
// symmetrically for the outputs. Dependencies running straight from the
// synthetic inputs to the synthetic outputs (untouched inout packets) take a
// two-step expansion through a temporary definition list.
//
// `adopt` turns the flattened root body into the program's task graph: one
// node per task, one edge per distinct (from, to) task pair; all
// dependencies are kept on the side with their anchors rewritten to
// program-level handles.

use std::collections::HashMap;

use crate::arena::Arena;
use crate::division::SpaceDivision;
use crate::graph::EdgeRegister;
use crate::model::{
    Anchor, AnchorTask, Dependency, Kernel, KernelId, MetaBody, Program, Task,
};
use crate::space::Space;

/// Translates an absolute index sub-space into a side's local coordinates,
/// walking the collapsed (size-1) dimensions of that side's full space.
fn indices_abs_to_rel(abs: &Space, abs_full: &Space, rel_full: &Space) -> Space {
    let mut rel = rel_full.clone();
    let mut iabs: usize = 0;
    let mut first = true;
    for i in 0..rel.dimensionality() {
        if rel[i].size() == 1 {
            continue;
        }
        if first {
            while abs_full[iabs].size() == 1 {
                iabs += 1;
            }
            first = false;
        } else {
            iabs += 1;
            while abs_full[iabs].size() == 1 {
                iabs += 1;
            }
        }
        let offset = rel[i].first() - abs_full[iabs].first();
        rel[i] = abs[iabs].displaced(offset);
    }
    rel
}

/// A definition feeding one interface, with its from-anchor already at the
/// parent level.
struct DefView {
    from_task: AnchorTask,
    from_iface: usize,
    from_index: Space,
    to_index: Space,
}

/// Distributes `use_from_index` over the definitions that produced it,
/// emitting one call per (definition, exact sub-range) pair. Every cell of
/// the use must be covered by the definitions.
fn expand_dependency(
    use_from_index: &Space,
    defs: &[DefView],
    mut emit: impl FnMut(&DefView, &Space),
) {
    let mut sdiv: SpaceDivision<Option<usize>> = SpaceDivision::new(use_from_index.clone());
    sdiv.assign_section(use_from_index.clone(), None);

    for (di, def) in defs.iter().enumerate() {
        sdiv.assign_section(def.to_index.clone(), Some(di));
        let secs: Vec<Space> = sdiv
            .sections()
            .iter()
            .filter(|(label, _)| *label == Some(di))
            .map(|(_, s)| s.clone())
            .collect();
        for sec in &secs {
            emit(def, sec);
        }
        sdiv.unassign(&Some(di));
        if sdiv.is_empty() {
            break;
        }
    }
    debug_assert!(
        sdiv.is_empty(),
        "dependency use not fully covered by its definitions"
    );
}

/// Propagates position and buffer hints from a parent instance into a cloned
/// child task. A child interface that pointed at a parent interface
/// (buffer hint) is rewritten through the parent's own hints.
fn adjust_buffer_hints(target: &mut Task, source: &Task, parent: &Task) {
    debug_assert_eq!(target.ifaces.len(), source.ifaces.len());
    for (tiface, siface) in target.ifaces.iter_mut().zip(&source.ifaces) {
        let hint = match siface.buffer_hint {
            None => {
                tiface.pos_hint = siface.pos_hint.clone();
                continue;
            }
            Some(h) => h,
        };

        let piface = &parent.ifaces[hint];
        tiface.buffer_hint = piface.buffer_hint;
        tiface.pos_hint = Space::new();
        debug_assert!(piface.pos_hint.dimensionality() >= siface.pos_hint.dimensionality());

        let pdims = &piface.dims;
        let mut ipdim = 0;
        let mut isidx = 0;
        for pidx in piface.pos_hint.ranges() {
            if pidx.size() == 1 {
                tiface.pos_hint.push(*pidx);
                if ipdim < pdims.len() && pdims[ipdim] == 1 {
                    ipdim += 1;
                    isidx += 1;
                }
            } else {
                debug_assert!(ipdim < pdims.len());
                debug_assert_eq!(pidx.size(), pdims[ipdim]);
                let sidx = siface.pos_hint[isidx];
                debug_assert!(sidx.size() <= pdims[ipdim]);
                tiface.pos_hint.push(sidx.displaced(pidx.begin()));
                ipdim += 1;
                isidx += 1;
            }
        }
    }
}

/// Replaces the task in slot `pos` (an instance of a meta-kernel) with
/// clones of that meta-kernel's internal tasks and rewrites all crossing
/// dependencies.
fn expand(kernels: &Arena<Kernel, KernelId>, body: &mut MetaBody, pos: usize) {
    let parent = body.tasks[pos].take().expect("expanding an empty task slot");
    let child = kernels[parent.kernel.expect("task without kernel")]
        .body
        .as_ref()
        .expect("expanding a native kernel")
        .clone();

    // Clone the child's tasks to the end of the parent's list, prefixing
    // names and propagating hints. Child slot i becomes parent slot map[i].
    let name_prefix = format!("{}.", parent.name);
    let mut sub_map: HashMap<usize, usize> = HashMap::new();
    for (i, slot) in child.tasks.iter().enumerate() {
        let source = match slot {
            Some(t) => t,
            None => continue,
        };
        let mut clone = source.clone();
        clone.name.insert_str(0, &name_prefix);
        adjust_buffer_hints(&mut clone, source, &parent);
        sub_map.insert(i, body.tasks.len());
        body.tasks.push(Some(clone));
    }
    let map_child = |task: AnchorTask| -> AnchorTask {
        match task {
            AnchorTask::Sub(i) => AnchorTask::Sub(sub_map[&i]),
            other => other,
        }
    };

    // Pull the dependencies crossing the instance boundary out of the parent
    // list: inbound ones keyed by the parent interface they feed.
    let mut outer_inputs: HashMap<usize, Vec<Dependency>> = HashMap::new();
    let mut outer_outputs: Vec<Dependency> = Vec::new();
    let mut kept: Vec<Dependency> = Vec::new();
    for dep in body.dependencies.drain(..) {
        if dep.to.task == AnchorTask::Sub(pos) {
            debug_assert!(dep.from.task != AnchorTask::Sub(pos));
            outer_inputs.entry(dep.to.iface).or_default().push(dep);
        } else if dep.from.task == AnchorTask::Sub(pos) {
            outer_outputs.push(dep);
        } else {
            kept.push(dep);
        }
    }
    body.dependencies = kept;

    // Definitions of each parent output interface, collected for the second
    // phase; from-anchors are already parent-level.
    let mut inner_outputs: HashMap<usize, Vec<DefView>> = HashMap::new();

    for innerdep in &child.dependencies {
        if innerdep.from.task == AnchorTask::Inputs {
            let defs: Vec<DefView> = outer_inputs
                .get(&innerdep.from.iface)
                .map(|deps| {
                    deps.iter()
                        .map(|d| DefView {
                            from_task: d.from.task,
                            from_iface: d.from.iface,
                            from_index: d.from.index.clone(),
                            to_index: d.to.index.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            if innerdep.to.task == AnchorTask::Outputs {
                // Input feeding an output directly (untouched inout): first
                // extraction lands in the definition list of the output
                // interface, to be consumed by the second phase.
                let extra = inner_outputs.entry(innerdep.to.iface).or_default();
                expand_dependency(&innerdep.from.index, &defs, |def, sec| {
                    extra.push(DefView {
                        from_task: def.from_task,
                        from_iface: def.from_iface,
                        from_index: indices_abs_to_rel(sec, &def.to_index, &def.from_index),
                        to_index: indices_abs_to_rel(sec, &innerdep.from.index, &innerdep.to.index),
                    });
                });
            } else {
                let to_task = map_child(innerdep.to.task);
                let deps = &mut body.dependencies;
                expand_dependency(&innerdep.from.index, &defs, |def, sec| {
                    deps.push(Dependency::new(
                        Anchor::new(
                            def.from_task,
                            def.from_iface,
                            indices_abs_to_rel(sec, &def.to_index, &def.from_index),
                        ),
                        Anchor::new(
                            to_task,
                            innerdep.to.iface,
                            indices_abs_to_rel(sec, &innerdep.from.index, &innerdep.to.index),
                        ),
                    ));
                });
            }
        } else if innerdep.to.task == AnchorTask::Outputs {
            inner_outputs
                .entry(innerdep.to.iface)
                .or_default()
                .push(DefView {
                    from_task: map_child(innerdep.from.task),
                    from_iface: innerdep.from.iface,
                    from_index: innerdep.from.index.clone(),
                    to_index: innerdep.to.index.clone(),
                });
        } else {
            // purely internal dependency
            body.dependencies.push(Dependency::new(
                Anchor::new(
                    map_child(innerdep.from.task),
                    innerdep.from.iface,
                    innerdep.from.index.clone(),
                ),
                Anchor::new(
                    map_child(innerdep.to.task),
                    innerdep.to.iface,
                    innerdep.to.index.clone(),
                ),
            ));
        }
    }

    // Second phase: distribute each outbound dependency over the definitions
    // of the parent interface it reads from.
    let empty: Vec<DefView> = Vec::new();
    for usedep in &outer_outputs {
        let defs = inner_outputs.get(&usedep.from.iface).unwrap_or(&empty);
        let deps = &mut body.dependencies;
        expand_dependency(&usedep.from.index, defs, |def, sec| {
            deps.push(Dependency::new(
                Anchor::new(
                    def.from_task,
                    def.from_iface,
                    indices_abs_to_rel(sec, &def.to_index, &def.from_index),
                ),
                Anchor::new(
                    usedep.to.task,
                    usedep.to.iface,
                    indices_abs_to_rel(sec, &usedep.from.index, &usedep.to.index),
                ),
            ));
        });
    }
}

/// Recursively expands every meta-kernel instance in `body`.
pub fn flatten(kernels: &Arena<Kernel, KernelId>, body: &mut MetaBody) {
    let mut pos = 0;
    while pos < body.tasks.len() {
        let is_meta = match &body.tasks[pos] {
            Some(task) => kernels[task.kernel.expect("task without kernel")].is_meta(),
            None => false,
        };
        if is_meta {
            expand(kernels, body, pos);
        }
        pos += 1;
    }
}

/// Instantiates the root meta-kernel as the program's main task, flattens
/// its body and builds the final task graph: one node per task and one edge
/// per distinct (from-task, to-task) pair. All dependencies are preserved in
/// `Program::dependencies` with program-level anchors.
pub fn adopt(prog: &mut Program, root: KernelId) {
    assert!(prog.kernels[root].is_meta(), "main task must be a meta-kernel");

    prog.main_task = Task::instantiate(
        &prog.kernels,
        root,
        prog.kernels[root].name.clone(),
        vec![],
        vec![],
    );

    let mut body = prog.kernels[root].body.as_ref().unwrap().clone();
    flatten(&prog.kernels, &mut body);

    // tasks move into the graph; compacted slot → node mapping
    let mut node_of: HashMap<usize, crate::graph::NodeId> = HashMap::new();
    for (i, slot) in body.tasks.into_iter().enumerate() {
        if let Some(task) = slot {
            node_of.insert(i, prog.task_graph.add_node(task));
        }
    }

    let rewrite = |task: AnchorTask| -> AnchorTask {
        match task {
            AnchorTask::Sub(i) => AnchorTask::Node(node_of[&i]),
            AnchorTask::Inputs | AnchorTask::Outputs => AnchorTask::Main,
            other => other,
        }
    };

    let mut register = EdgeRegister::directed(&prog.task_graph);
    for mut dep in body.dependencies {
        dep.from.task = rewrite(dep.from.task);
        dep.to.task = rewrite(dep.to.task);
        if let (AnchorTask::Node(from), AnchorTask::Node(to)) = (dep.from.task, dep.to.task) {
            register.get_or_insert(&mut prog.task_graph, from, to);
        }
        prog.dependencies.push(dep);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::DiagSink;
    use crate::model::{base_type, Access, Packet};
    use crate::resolve::{resolve, Argument, KernelCall, MetaKernelSeq, VarRef};
    use crate::space::Range;

    fn f32t() -> crate::model::BaseTypeRef {
        base_type("float", 4)
    }

    fn sp(ranges: &[(i64, i64)]) -> Space {
        Space::from_ranges(ranges.iter().map(|&(b, e)| Range::begin_end(b, e)).collect())
    }

    fn native(kernels: &mut Arena<Kernel, KernelId>, name: &str, packets: Vec<Packet>) -> KernelId {
        let mut k = Kernel::native(name, format!("{name}_impl"));
        k.packets = packets;
        kernels.insert(k)
    }

    /// A meta-kernel `inner(in x[8], out y[8])` that pipes x through `work`.
    fn build_inner(kernels: &mut Arena<Kernel, KernelId>, work: KernelId) -> KernelId {
        let mut k = Kernel::native("inner", "");
        k.packets = vec![
            Packet::new("x", Access::In, f32t(), vec![8]),
            Packet::new("y", Access::Out, f32t(), vec![8]),
        ];
        let inner = kernels.insert(k);

        let x = Packet::new("x", Access::In, f32t(), vec![8]);
        let y = Packet::new("y", Access::Out, f32t(), vec![8]);
        let seq = MetaKernelSeq {
            operations: vec![KernelCall::new(
                kernels,
                work,
                vec![
                    Argument::new(VarRef::Boundary(0), &x, Space::new()),
                    Argument::new(VarRef::Boundary(1), &y, Space::new()),
                ],
                vec![],
                vec![],
            )],
            variables: vec![],
        };
        let mut diags = DiagSink::new();
        assert!(resolve(&seq, kernels, inner, &mut diags), "{:?}", diags.diagnostics());
        inner
    }

    #[test]
    fn nested_meta_kernel_flattens_to_work_tasks() {
        let mut kernels = Arena::new();
        let work = native(
            &mut kernels,
            "work",
            vec![
                Packet::new("i", Access::In, f32t(), vec![8]),
                Packet::new("o", Access::Out, f32t(), vec![8]),
            ],
        );
        let inner = build_inner(&mut kernels, work);

        // root: a[8] local; inner(a in, a out)? Use two calls chained through
        // a local variable.
        let mut rootk = Kernel::native("root", "");
        rootk.packets = vec![
            Packet::new("src", Access::In, f32t(), vec![8]),
            Packet::new("dst", Access::Out, f32t(), vec![8]),
        ];
        let root = kernels.insert(rootk);

        let srcp = Packet::new("src", Access::In, f32t(), vec![8]);
        let dstp = Packet::new("dst", Access::Out, f32t(), vec![8]);
        let tmp = Packet::new("tmp", Access::InOut, f32t(), vec![8]);
        let seq = MetaKernelSeq {
            operations: vec![
                KernelCall::new(
                    &kernels,
                    inner,
                    vec![
                        Argument::new(VarRef::Boundary(0), &srcp, Space::new()),
                        Argument::new(VarRef::Local(0), &tmp, Space::new()),
                    ],
                    vec![],
                    vec![],
                ),
                KernelCall::new(
                    &kernels,
                    inner,
                    vec![
                        Argument::new(VarRef::Local(0), &tmp, Space::new()),
                        Argument::new(VarRef::Boundary(1), &dstp, Space::new()),
                    ],
                    vec![],
                    vec![],
                ),
            ],
            variables: vec![tmp],
        };
        let mut diags = DiagSink::new();
        assert!(resolve(&seq, &mut kernels, root, &mut diags), "{:?}", diags.diagnostics());

        let mut prog = Program::new();
        prog.kernels = kernels;
        adopt(&mut prog, root);

        // both inner instances expanded to one work task each
        assert_eq!(prog.task_graph.node_count(), 2);
        let names: Vec<String> = prog
            .task_graph
            .nodes()
            .map(|(_, t)| t.name.clone())
            .collect();
        assert!(names.contains(&"inner[0].work[0]".to_string()), "{names:?}");
        assert!(names.contains(&"inner[1].work[0]".to_string()), "{names:?}");

        // dependency chain: main -> w0 -> w1 -> main
        assert_eq!(prog.task_graph.edge_count(), 1, "one task-to-task edge");
        let boundary_deps = prog
            .dependencies
            .iter()
            .filter(|d| d.from.task == AnchorTask::Main || d.to.task == AnchorTask::Main)
            .count();
        assert_eq!(boundary_deps, 2);
        assert_eq!(prog.dependencies.len(), 3);
    }

    #[test]
    fn split_input_expansion_carries_subranges() {
        // root feeds halves of src into two instances of a meta-kernel that
        // consumes 4 elements; expansion must keep the exact sub-ranges.
        let mut kernels = Arena::new();
        let work = native(
            &mut kernels,
            "work",
            vec![
                Packet::new("i", Access::In, f32t(), vec![4]),
                Packet::new("o", Access::Out, f32t(), vec![4]),
            ],
        );
        let mut k = Kernel::native("quarter", "");
        k.packets = vec![
            Packet::new("x", Access::In, f32t(), vec![4]),
            Packet::new("y", Access::Out, f32t(), vec![4]),
        ];
        let quarter = kernels.insert(k);
        {
            let x = Packet::new("x", Access::In, f32t(), vec![4]);
            let y = Packet::new("y", Access::Out, f32t(), vec![4]);
            let seq = MetaKernelSeq {
                operations: vec![KernelCall::new(
                    &kernels,
                    work,
                    vec![
                        Argument::new(VarRef::Boundary(0), &x, Space::new()),
                        Argument::new(VarRef::Boundary(1), &y, Space::new()),
                    ],
                    vec![],
                    vec![],
                )],
                variables: vec![],
            };
            let mut diags = DiagSink::new();
            assert!(resolve(&seq, &mut kernels, quarter, &mut diags));
        }

        let mut rootk = Kernel::native("root", "");
        rootk.packets = vec![
            Packet::new("src", Access::In, f32t(), vec![8]),
            Packet::new("dst", Access::Out, f32t(), vec![8]),
        ];
        let root = kernels.insert(rootk);
        let srcp = Packet::new("src", Access::In, f32t(), vec![8]);
        let dstp = Packet::new("dst", Access::Out, f32t(), vec![8]);
        let seq = MetaKernelSeq {
            operations: vec![
                KernelCall::new(
                    &kernels,
                    quarter,
                    vec![
                        Argument::new(VarRef::Boundary(0), &srcp, sp(&[(0, 4)])),
                        Argument::new(VarRef::Boundary(1), &dstp, sp(&[(0, 4)])),
                    ],
                    vec![],
                    vec![],
                ),
                KernelCall::new(
                    &kernels,
                    quarter,
                    vec![
                        Argument::new(VarRef::Boundary(0), &srcp, sp(&[(4, 8)])),
                        Argument::new(VarRef::Boundary(1), &dstp, sp(&[(4, 8)])),
                    ],
                    vec![],
                    vec![],
                ),
            ],
            variables: vec![],
        };
        let mut diags = DiagSink::new();
        assert!(resolve(&seq, &mut kernels, root, &mut diags), "{:?}", diags.diagnostics());

        let mut prog = Program::new();
        prog.kernels = kernels;
        adopt(&mut prog, root);

        assert_eq!(prog.task_graph.node_count(), 2);
        // every dependency runs between main and a work task
        for dep in &prog.dependencies {
            assert!(dep.from.task == AnchorTask::Main || dep.to.task == AnchorTask::Main);
        }
        // the inbound deps carry the original halves in main coordinates
        let inbound: Vec<&Dependency> = prog
            .dependencies
            .iter()
            .filter(|d| d.from.task == AnchorTask::Main)
            .collect();
        assert_eq!(inbound.len(), 2);
        let mut from_spaces: Vec<Space> = inbound.iter().map(|d| d.from.index.clone()).collect();
        from_spaces.sort_by_key(|s| s[0].begin());
        assert_eq!(from_spaces[0], sp(&[(0, 4)]));
        assert_eq!(from_spaces[1], sp(&[(4, 8)]));
        // ...while the reader side is in the work task's own coordinates
        for d in &inbound {
            assert_eq!(d.to.index, sp(&[(0, 4)]));
        }
    }

    #[test]
    fn untouched_inout_packet_survives_expansion() {
        // meta-kernel with an inout packet nobody touches: after expanding an
        // instance of it, the outer producer connects straight to the outer
        // consumer.
        let mut kernels = Arena::new();
        let mut k = Kernel::native("idmk", "");
        k.packets = vec![Packet::new("io", Access::InOut, f32t(), vec![4])];
        let idmk = kernels.insert(k);
        {
            let seq = MetaKernelSeq::default();
            let mut diags = DiagSink::new();
            assert!(resolve(&seq, &mut kernels, idmk, &mut diags));
        }

        let mut rootk = Kernel::native("root", "");
        rootk.packets = vec![
            Packet::new("src", Access::In, f32t(), vec![4]),
            Packet::new("dst", Access::Out, f32t(), vec![4]),
        ];
        let root = kernels.insert(rootk);
        let srcp = Packet::new("src", Access::In, f32t(), vec![4]);
        let dstp = Packet::new("dst", Access::Out, f32t(), vec![4]);
        let tmp = Packet::new("tmp", Access::InOut, f32t(), vec![4]);
        let copy = native(
            &mut kernels,
            "copy",
            vec![
                Packet::new("i", Access::In, f32t(), vec![4]),
                Packet::new("o", Access::Out, f32t(), vec![4]),
            ],
        );
        let seq = MetaKernelSeq {
            operations: vec![
                KernelCall::new(
                    &kernels,
                    copy,
                    vec![
                        Argument::new(VarRef::Boundary(0), &srcp, Space::new()),
                        Argument::new(VarRef::Local(0), &tmp, Space::new()),
                    ],
                    vec![],
                    vec![],
                ),
                KernelCall::new(
                    &kernels,
                    idmk,
                    vec![Argument::new(VarRef::Local(0), &tmp, Space::new())],
                    vec![],
                    vec![],
                ),
                KernelCall::new(
                    &kernels,
                    copy,
                    vec![
                        Argument::new(VarRef::Local(0), &tmp, Space::new()),
                        Argument::new(VarRef::Boundary(1), &dstp, Space::new()),
                    ],
                    vec![],
                    vec![],
                ),
            ],
            variables: vec![tmp],
        };
        let mut diags = DiagSink::new();
        assert!(resolve(&seq, &mut kernels, root, &mut diags), "{:?}", diags.diagnostics());

        let mut prog = Program::new();
        prog.kernels = kernels;
        adopt(&mut prog, root);

        // idmk dissolved entirely: only the two copy tasks remain
        assert_eq!(prog.task_graph.node_count(), 2);
        // copy[0] -> copy[1] via the pass-through
        assert_eq!(prog.task_graph.edge_count(), 1);
        let internal: Vec<&Dependency> = prog
            .dependencies
            .iter()
            .filter(|d| {
                matches!(d.from.task, AnchorTask::Node(_)) && matches!(d.to.task, AnchorTask::Node(_))
            })
            .collect();
        assert_eq!(internal.len(), 1);
        assert_eq!(internal[0].from.index, sp(&[(0, 4)]));
    }

    #[test]
    fn hint_rewrite_through_parent() {
        // child iface with a buffer hint pointing at parent iface 0, whose
        // pos hint places it at [4..8) of the grandparent variable.
        let mut parent = Task::default();
        parent.ifaces.push(crate::model::Iface {
            name: "p".into(),
            dims: vec![4],
            pos_hint: sp(&[(4, 8)]),
            buffer_hint: Some(2),
            ..crate::model::Iface::default()
        });

        let mut source = Task::default();
        source.ifaces.push(crate::model::Iface {
            name: "c".into(),
            dims: vec![2],
            pos_hint: sp(&[(1, 3)]),
            buffer_hint: Some(0),
            ..crate::model::Iface::default()
        });

        let mut target = source.clone();
        adjust_buffer_hints(&mut target, &source, &parent);
        assert_eq!(target.ifaces[0].buffer_hint, Some(2));
        // child block [1,3) inside parent block at offset 4 → [5,7)
        assert_eq!(target.ifaces[0].pos_hint, sp(&[(5, 7)]));
    }
}
