// resolve.rs — Dataflow resolution for meta-kernel call sequences
//
// The front-end hands over, per meta-kernel, an ordered list of `KernelCall`
// records on sub-arrays of local variables and boundary packets. The
// resolver validates them and turns the sequence into a task graph with
// point-to-point dependencies carrying exact index sub-ranges: a per-variable
// `SpaceDivision` tracks which write produced each sub-region, so every read
// can be wired to its live definition (fresh writes shadow older ones).
// Inputs of a call are processed before its outputs, otherwise an inout
// argument would produce a self-dependency.
//
// Preconditions: kernels referenced by the calls are registered; parameter
//                and derived-parameter integers are already evaluated.
// Postconditions: the meta-kernel's body holds one task per call and the
//                 complete dependency list, or `diags` carries errors.

use std::collections::HashMap;

use crate::arena::Arena;
use crate::diag::{codes, DiagCode, DiagSink};
use crate::model::{Access, Anchor, AnchorTask, Dependency, Kernel, KernelId, MetaBody, Packet, Task};
use crate::space::{Range, Space};

// ── Front-end boundary types ────────────────────────────────────────────────

/// A variable visible inside a meta-kernel body: either a local variable or
/// one of the meta-kernel's own packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarRef {
    Local(usize),
    Boundary(usize),
}

/// An actual argument of a kernel call: a variable and an index space in the
/// variable's coordinate system. An index space shorter than the variable's
/// dimensionality implicitly covers the missing trailing axes in full.
#[derive(Debug)]
pub struct Argument {
    variable: VarRef,
    var_name: String,
    var_access: Access,
    var_base: crate::model::BaseTypeRef,
    indices: Space,
    relevant_dims: Vec<usize>,
    resulting_dim: Vec<i64>,
    buffer_hint: Option<usize>,
    errors: Vec<(DiagCode, String)>,
}

impl Argument {
    /// Builds the argument and checks that it denotes a correct sub-array of
    /// `var_packet` (bounds, no zero-sized ranges). Shape compatibility with
    /// the callee is checked later by [`KernelCall::new`].
    pub fn new(variable: VarRef, var_packet: &Packet, mut indices: Space) -> Argument {
        let vdims = &var_packet.dims;
        let mut errors = Vec::new();

        let oldsize = indices.dimensionality();
        if oldsize > vdims.len() {
            errors.push((
                codes::E0106,
                format!("Too many indexing operations on variable {}", var_packet.name),
            ));
            indices.ranges_mut().truncate(vdims.len());
        } else {
            for &d in &vdims[oldsize..] {
                indices.push(Range::begin_count(0, d));
            }
        }

        let mut resulting_dim = Vec::new();
        for i in 0..indices.dimensionality() {
            let r = indices[i];
            if !Range::begin_count(0, vdims[i]).contains(&r) {
                errors.push((
                    codes::E0104,
                    format!(
                        "Out of bounds access for index {} of variable {}",
                        i + 1,
                        var_packet.name
                    ),
                ));
            }
            match r.size() {
                0 => errors.push((
                    codes::E0105,
                    format!(
                        "Zero-sized range for index {} of variable {}",
                        i + 1,
                        var_packet.name
                    ),
                )),
                1 => {}
                s => resulting_dim.push(s),
            }
        }

        Argument {
            variable,
            var_name: var_packet.name.clone(),
            var_access: var_packet.access,
            var_base: var_packet.base,
            indices,
            relevant_dims: Vec::new(),
            resulting_dim,
            buffer_hint: None,
            errors,
        }
    }

    pub fn variable(&self) -> VarRef {
        self.variable
    }

    /// Index ranges of the passed sub-block, padded to the variable's
    /// dimensionality.
    pub fn indices(&self) -> &Space {
        &self.indices
    }

    /// For each callee packet dimension, the index of the variable dimension
    /// it maps to.
    pub fn relevant_dims(&self) -> &[usize] {
        &self.relevant_dims
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Marks the parent interface whose buffer this argument should reuse.
    pub fn set_buffer_hint(&mut self, parent_iface: usize) {
        self.buffer_hint = Some(parent_iface);
    }
}

/// One invocation of a kernel with concrete parameter values.
#[derive(Debug)]
pub struct KernelCall {
    callee: KernelId,
    args: Vec<Argument>,
    params: Vec<i64>,
    derived_params: Vec<i64>,
    errors: Vec<(DiagCode, String)>,
}

impl KernelCall {
    /// Builds the call and checks the arguments against the callee's packet
    /// list: count, base types, access kinds, and block shapes (matched back
    /// to front, with size-1 ranges collapsing away).
    pub fn new(
        kernels: &Arena<Kernel, KernelId>,
        callee: KernelId,
        mut args: Vec<Argument>,
        params: Vec<i64>,
        derived_params: Vec<i64>,
    ) -> KernelCall {
        let kernel = &kernels[callee];
        let mut errors = Vec::new();

        if args.len() != kernel.packets.len() {
            errors.push((codes::E0101, "Wrong number of arguments.".to_string()));
            return KernelCall {
                callee,
                args,
                params,
                derived_params,
                errors,
            };
        }

        for (argidx, arg) in args.iter_mut().enumerate() {
            let demand = &kernel.packets[argidx];

            if !arg.var_base.is_compatible(demand.base) {
                errors.push((
                    codes::E0102,
                    format!(
                        "Incompatible base type for argument {}: Passed {} where {} was requested",
                        argidx + 1,
                        arg.var_base.name,
                        demand.base.name
                    ),
                ));
            }

            if arg.var_access == Access::In && demand.access != Access::In {
                errors.push((
                    codes::E0103,
                    format!(
                        "Incompatible access type for argument {}: Passed {} where {} was requested",
                        argidx + 1,
                        arg.var_access.name(),
                        demand.access.name()
                    ),
                ));
            }

            // Match the callee's block shape against the passed indices,
            // back to front, collapsing size-1 index ranges.
            let argdims: Vec<i64> = demand
                .dims
                .iter()
                .map(|&d| {
                    if d < 0 {
                        derived_params[(-d - 1) as usize]
                    } else {
                        d
                    }
                })
                .collect();

            arg.relevant_dims = vec![0; argdims.len()];
            let mut suppidx = arg.indices.dimensionality();
            let mut shape_ok = true;

            for i in (0..argdims.len()).rev() {
                let curargdim = argdims[i];
                let mut cursize = if suppidx > 0 {
                    suppidx -= 1;
                    arg.indices[suppidx].size()
                } else {
                    -1
                };
                if cursize != curargdim {
                    while cursize == 1 && suppidx > 0 {
                        suppidx -= 1;
                        cursize = arg.indices[suppidx].size();
                    }
                    if cursize != curargdim {
                        errors.push((
                            codes::E0107,
                            format!(
                                "Incompatible block size for argument {}: Passed {} where {} was requested",
                                params.len() + argidx + 1,
                                fmt_dims(&arg.resulting_dim),
                                fmt_dims(&argdims)
                            ),
                        ));
                        suppidx = 0;
                        shape_ok = false;
                        break;
                    }
                }
                arg.relevant_dims[i] = suppidx;
            }
            if shape_ok
                && arg.indices.ranges()[..suppidx]
                    .iter()
                    .any(|r| r.size() != 1)
            {
                errors.push((
                    codes::E0107,
                    format!(
                        "Incompatible block size for argument {}: Passed {} where {} was requested",
                        params.len() + argidx + 1,
                        fmt_dims(&arg.resulting_dim),
                        fmt_dims(&argdims)
                    ),
                ));
                break;
            }
        }

        KernelCall {
            callee,
            args,
            params,
            derived_params,
            errors,
        }
    }

    pub fn callee(&self) -> KernelId {
        self.callee
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.args
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.args.iter().all(|a| a.is_valid())
    }
}

fn fmt_dims(dims: &[i64]) -> String {
    let mut s = String::new();
    for d in dims {
        s.push_str(&format!("[{}]", d));
    }
    if s.is_empty() {
        s.push_str("[]");
    }
    s
}

/// Sequential representation of a meta-kernel, as delivered by the
/// front-end: local variable declarations plus the ordered call list.
#[derive(Debug, Default)]
pub struct MetaKernelSeq {
    pub variables: Vec<Packet>,
    pub operations: Vec<KernelCall>,
}

// ── Resolution ──────────────────────────────────────────────────────────────

/// The write that currently owns a sub-region of a variable.
struct DefRecord {
    task: AnchorTask,
    iface: usize,
    indices: Space,
    relevant_dims: Vec<usize>,
}

/// Translates an absolute overlap into one side's local coordinates,
/// keeping only that side's relevant dimensions.
fn indices_abs_to_rel(abs: &Space, reference: &Space, relevant_dims: &[usize]) -> Space {
    let mut rel = Space::new();
    for &dim in relevant_dims {
        rel.push(abs[dim].displaced(-reference[dim].first()));
    }
    rel
}

/// Resolves `seq` into the body of the meta-kernel `meta`: one task per
/// call, dependencies between the live definitions and their readers, and
/// boundary dependencies to the synthetic inputs/outputs pseudo-tasks.
/// Returns false (with diagnostics) on any specification error.
pub fn resolve(
    seq: &MetaKernelSeq,
    kernels: &mut Arena<Kernel, KernelId>,
    meta: KernelId,
    diags: &mut DiagSink,
) -> bool {
    let mark = diags.mark();

    // Reject the whole sequence if any call failed construction-time checks.
    for op in &seq.operations {
        for (code, msg) in &op.errors {
            diags.error(*code, msg.clone());
        }
        for arg in &op.args {
            for (code, msg) in &arg.errors {
                diags.error(*code, msg.clone());
            }
        }
    }
    if diags.since(mark).len() > 0 {
        return false;
    }

    let mut body = MetaBody {
        inputs: Task::instantiate(kernels, meta, "<meta-kernel inputs>", vec![], vec![]),
        outputs: Task::instantiate(kernels, meta, "<meta-kernel outputs>", vec![], vec![]),
        ..MetaBody::default()
    };

    // Live definitions per variable; label = index into def_records, None for
    // uninitialized regions.
    let mut def_records: Vec<DefRecord> = Vec::new();
    let mut defs: HashMap<VarRef, crate::division::SpaceDivision<Option<usize>>> = HashMap::new();

    for (i, var) in seq.variables.iter().enumerate() {
        let mut sdiv = crate::division::SpaceDivision::new(Space::from_dimensions(&var.dims));
        sdiv.assign_section(sdiv.full_space().clone(), None);
        defs.insert(VarRef::Local(i), sdiv);
    }
    let boundary_packets: Vec<(Access, Vec<i64>)> = kernels[meta]
        .packets
        .iter()
        .map(|p| (p.access, p.dims.clone()))
        .collect();
    for (i, (access, dims)) in boundary_packets.iter().enumerate() {
        let full = Space::from_dimensions(dims);
        let mut sdiv = crate::division::SpaceDivision::new(full.clone());
        if *access == Access::Out {
            sdiv.assign_section(full, None);
        } else {
            let di = def_records.len();
            def_records.push(DefRecord {
                task: AnchorTask::Inputs,
                iface: i,
                indices: full.clone(),
                relevant_dims: (0..dims.len()).collect(),
            });
            sdiv.assign_section(full, Some(di));
        }
        defs.insert(VarRef::Boundary(i), sdiv);
    }

    // One task per operation, wiring reads before writes.
    let mut inst_counts: HashMap<KernelId, usize> = HashMap::new();
    for op in &seq.operations {
        let count = inst_counts.entry(op.callee).or_insert(0);
        let task_index = body.tasks.len();
        let mut task = Task::instantiate(
            kernels,
            op.callee,
            format!("{}[{}]", kernels[op.callee].name, *count),
            op.params.clone(),
            op.derived_params.clone(),
        );
        *count += 1;

        let accesses: Vec<Access> = kernels[op.callee].packets.iter().map(|p| p.access).collect();

        for (i, arg) in op.args.iter().enumerate() {
            task.ifaces[i].pos_hint = arg.indices.clone();
            task.ifaces[i].buffer_hint = arg.buffer_hint;
        }

        // reads
        for (i, arg) in op.args.iter().enumerate() {
            if accesses[i] == Access::Out {
                continue;
            }
            let vardefs = defs.get(&arg.variable).expect("unknown variable");
            let subdiv = vardefs.sub_division(arg.indices());
            for (label, sec) in subdiv.sections() {
                match label {
                    None => diags.error(
                        codes::E0108,
                        format!(
                            "Kernel call {}: Use of uninitialized variable {} as input (uninitialized in indices {})",
                            task.name, arg.var_name, sec
                        ),
                    ),
                    Some(di) => {
                        let def = &def_records[*di];
                        body.dependencies.push(Dependency::new(
                            Anchor::new(
                                def.task,
                                def.iface,
                                indices_abs_to_rel(sec, &def.indices, &def.relevant_dims),
                            ),
                            Anchor::new(
                                AnchorTask::Sub(task_index),
                                i,
                                indices_abs_to_rel(sec, arg.indices(), arg.relevant_dims()),
                            ),
                        ));
                    }
                }
            }
        }

        // writes shadow older definitions
        for (i, arg) in op.args.iter().enumerate() {
            if accesses[i] == Access::In {
                continue;
            }
            let di = def_records.len();
            def_records.push(DefRecord {
                task: AnchorTask::Sub(task_index),
                iface: i,
                indices: arg.indices().clone(),
                relevant_dims: arg.relevant_dims().to_vec(),
            });
            defs.get_mut(&arg.variable)
                .expect("unknown variable")
                .assign_section(arg.indices().clone(), Some(di));
        }

        body.tasks.push(Some(task));
    }

    // Boundary outputs: whatever lives in each region feeds the synthetic
    // outputs pseudo-task; regions never written are an error for pure outs.
    for (i, (access, _)) in boundary_packets.iter().enumerate() {
        if *access == Access::In {
            continue;
        }
        let sdiv = defs.get(&VarRef::Boundary(i)).unwrap();
        for (label, sec) in sdiv.sections() {
            match label {
                Some(di) => {
                    let def = &def_records[*di];
                    body.dependencies.push(Dependency::new(
                        Anchor::new(
                            def.task,
                            def.iface,
                            indices_abs_to_rel(sec, &def.indices, &def.relevant_dims),
                        ),
                        Anchor::new(AnchorTask::Outputs, i, sec.clone()),
                    ));
                }
                None => {
                    if *access == Access::Out {
                        diags.error(
                            codes::E0109,
                            format!(
                                "Kernel output '{}' is unspecified for indices {}",
                                kernels[meta].packets[i].name, sec
                            ),
                        );
                    }
                }
            }
        }
    }

    let ok = diags.since(mark).is_empty();
    kernels[meta].body = Some(body);
    ok
}

// ── Tests ───────────────────────────────────────────────────────────────────
