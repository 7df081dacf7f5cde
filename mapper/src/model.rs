// model.rs — Program data model
//
// Kernels, packets, tasks, interfaces, dependencies, buffers, groups and
// divisions, plus the `Program` that owns them. Everything lives in arenas
// and refers to other entities through ids; back-references of the original
// pointer web (packet→kernel, interface→task, group→division) become lookups
// through the owning `Program`.
//
// Anchors name one end of a dependency as (task handle, interface index,
// index space). Inside an unflattened meta-kernel body the handle is
// `Sub(i)`/`Inputs`/`Outputs`; after adoption into the program it is
// `Node(id)`/`Main`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, OnceLock};

use crate::arena::{define_id, Arena};
use crate::graph::{Graph, NodeId};
use crate::space::Space;

// ── Base types ──────────────────────────────────────────────────────────────

/// A base type (int, char, ...) from which arrays are built.
#[derive(Debug)]
pub struct BaseType {
    pub name: String,
    pub size: i64,
}

impl BaseType {
    /// Binary compatibility: equal sizes are interchangeable.
    pub fn is_compatible(&self, other: &BaseType) -> bool {
        self.size == other.size
    }
}

pub type BaseTypeRef = &'static BaseType;

fn intern_table() -> &'static Mutex<HashMap<String, BaseTypeRef>> {
    static TABLE: OnceLock<Mutex<HashMap<String, BaseTypeRef>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Interns a base type by name. The process-wide table is built lazily on
/// first reference; entries live until process teardown. A second request
/// for the same name must carry the same size.
pub fn base_type(name: &str, size: i64) -> BaseTypeRef {
    let mut table = intern_table().lock().unwrap();
    if let Some(&bt) = table.get(name) {
        assert_eq!(bt.size, size, "base type '{name}' re-interned with a different size");
        return bt;
    }
    let bt: BaseTypeRef = Box::leak(Box::new(BaseType {
        name: name.to_string(),
        size,
    }));
    table.insert(name.to_string(), bt);
    bt
}

// ── Packets ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    In,
    Out,
    InOut,
    Param,
}

impl Access {
    pub fn name(self) -> &'static str {
        match self {
            Access::In => "in",
            Access::Out => "out",
            Access::InOut => "inout",
            Access::Param => "param",
        }
    }
}

/// A data packet (argument or parameter) of a kernel. A negative array
/// dimension entry `-k-1` refers to derived-parameter expression `k`,
/// evaluated at instantiation time.
#[derive(Debug, Clone)]
pub struct Packet {
    pub name: String,
    pub access: Access,
    pub base: BaseTypeRef,
    pub dims: Vec<i64>,
    /// Indices of packets of the same kernel this one may share storage with.
    pub buddies: BTreeSet<usize>,
}

impl Packet {
    pub fn new(name: impl Into<String>, access: Access, base: BaseTypeRef, dims: Vec<i64>) -> Self {
        Packet {
            name: name.into(),
            access,
            base,
            dims,
            buddies: BTreeSet::new(),
        }
    }
}

// ── Kernels ─────────────────────────────────────────────────────────────────

define_id!(
    /// Stable identifier of a kernel in the program's kernel arena.
    KernelId
);

/// A kernel: a function with a certain amount of work. A kernel whose `body`
/// is set is a meta-kernel.
#[derive(Debug)]
pub struct Kernel {
    pub name: String,
    /// Symbol name of the C function implementing the kernel.
    pub function_name: String,
    pub packets: Vec<Packet>,
    pub params: Vec<Packet>,
    /// Formulae for the derived parameters, evaluated by the front-end.
    pub derived_params: Vec<String>,
    pub body: Option<MetaBody>,
}

impl Kernel {
    pub fn native(name: impl Into<String>, function_name: impl Into<String>) -> Self {
        Kernel {
            name: name.into(),
            function_name: function_name.into(),
            packets: Vec::new(),
            params: Vec::new(),
            derived_params: Vec::new(),
            body: None,
        }
    }

    pub fn is_meta(&self) -> bool {
        self.body.is_some()
    }

    pub fn packet_index(&self, name: &str) -> Option<usize> {
        self.packets.iter().position(|p| p.name == name)
    }

    /// Registers `a` and `b` as buddies of each other. Returns false if they
    /// already were.
    pub fn add_buddies(&mut self, a: usize, b: usize) -> bool {
        assert!(a != b && a < self.packets.len() && b < self.packets.len());
        let fresh = self.packets[a].buddies.insert(b);
        self.packets[b].buddies.insert(a);
        fresh
    }
}

/// The internal task graph of a meta-kernel. Task slots are tombstoned so
/// that `Sub` anchor indices stay valid while expansion removes tasks.
#[derive(Debug, Default, Clone)]
pub struct MetaBody {
    pub tasks: Vec<Option<Task>>,
    pub inputs: Task,
    pub outputs: Task,
    pub dependencies: Vec<Dependency>,
}

impl MetaBody {
    pub fn task(&self, handle: AnchorTask) -> &Task {
        match handle {
            AnchorTask::Sub(i) => self.tasks[i].as_ref().expect("stale sub-task index"),
            AnchorTask::Inputs => &self.inputs,
            AnchorTask::Outputs => &self.outputs,
            _ => panic!("program-level anchor in meta-kernel body"),
        }
    }

    pub fn iface(&self, anchor: &Anchor) -> &Iface {
        &self.task(anchor.task).ifaces[anchor.iface]
    }
}

// ── Tasks and interfaces ────────────────────────────────────────────────────

/// A task's per-packet port: concrete dimensions for this instance, the
/// buffer binding established by allocation, and the position/buffer hints
/// consumed by buffer preallocation.
#[derive(Debug, Clone, Default)]
pub struct Iface {
    pub name: String,
    pub access: Access,
    pub base: Option<BaseTypeRef>,
    pub packet_index: usize,
    pub dims: Vec<i64>,

    pub buffer: Option<BufferId>,
    /// Dimensions of the bound buffer.
    pub buffer_dims: Vec<i64>,
    /// Per-dimension element strides of this interface within the buffer.
    pub buffer_dims_adj: Vec<i64>,
    /// Byte offset of this interface's block within the buffer.
    pub buffer_offset: Option<i64>,

    /// Preferred location within a shared buffer.
    pub pos_hint: Space,
    /// Index of a parent interface whose buffer this one prefers.
    pub buffer_hint: Option<usize>,

    /// Measured access counts (cost boundary).
    pub reads: i64,
    pub writes: i64,
}

impl Default for Access {
    fn default() -> Self {
        Access::In
    }
}

impl Iface {
    pub fn mem_size(&self) -> i64 {
        let elems: i64 = self.dims.iter().product();
        elems * self.base.map(|b| b.size).unwrap_or(0)
    }

    pub fn elem_size(&self) -> i64 {
        self.base.map(|b| b.size).unwrap_or(0)
    }

    pub fn set_buffer(
        &mut self,
        buffer: BufferId,
        buffer_dims: Vec<i64>,
        buffer_dims_adj: Vec<i64>,
        offset: i64,
    ) {
        self.buffer = Some(buffer);
        self.buffer_dims = buffer_dims;
        self.buffer_dims_adj = buffer_dims_adj;
        self.buffer_offset = Some(offset);
    }

    /// Replaces the buffer with another one (e.g. when merging buffers).
    pub fn relocate_buffer(&mut self, buffer: BufferId) {
        self.buffer = Some(buffer);
    }
}

/// An instantiation of a kernel with concrete parameter values.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub name: String,
    pub kernel: Option<KernelId>,
    pub params: Vec<i64>,
    pub derived_params: Vec<i64>,
    pub cost: f64,
    pub ifaces: Vec<Iface>,
    /// Index into `Program::groups`, set by grouping/mapping.
    pub group: Option<usize>,
}

impl Task {
    /// Instantiates `kernel` with the given parameters, creating one
    /// interface per packet with the dimensions resolved for this instance.
    pub fn instantiate(
        kernels: &Arena<Kernel, KernelId>,
        kernel: KernelId,
        name: impl Into<String>,
        params: Vec<i64>,
        derived_params: Vec<i64>,
    ) -> Task {
        let k = &kernels[kernel];
        let ifaces = k
            .packets
            .iter()
            .enumerate()
            .map(|(i, packet)| {
                let dims = packet
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
                Iface {
                    name: packet.name.clone(),
                    access: packet.access,
                    base: Some(packet.base),
                    packet_index: i,
                    dims,
                    ..Iface::default()
                }
            })
            .collect();
        Task {
            name: name.into(),
            kernel: Some(kernel),
            params,
            derived_params,
            cost: 0.0,
            ifaces,
            group: None,
        }
    }

    pub fn iface_by_name(&self, name: &str) -> Option<&Iface> {
        self.ifaces.iter().find(|d| d.name == name)
    }
}

// ── Dependencies ────────────────────────────────────────────────────────────

/// Task handle of an anchor, across both representation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnchorTask {
    /// Synthetic inputs pseudo-task of the enclosing meta-kernel.
    Inputs,
    /// Synthetic outputs pseudo-task of the enclosing meta-kernel.
    Outputs,
    /// Sub-task slot of the enclosing meta-kernel body.
    Sub(usize),
    /// The program's main task (boundary interfaces).
    Main,
    /// A task node of the program task graph.
    Node(NodeId),
}

/// Interface handle: task plus interface index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IfaceKey {
    pub task: AnchorTask,
    pub iface: usize,
}

/// One end of a dependency: an interface and a sub-space of its index space.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub task: AnchorTask,
    pub iface: usize,
    pub index: Space,
}

impl Anchor {
    pub fn new(task: AnchorTask, iface: usize, index: Space) -> Anchor {
        Anchor { task, iface, index }
    }

    pub fn key(&self) -> IfaceKey {
        IfaceKey {
            task: self.task,
            iface: self.iface,
        }
    }
}

/// A data-flow edge transporting the bytes of a sub-array from one interface
/// to another.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub from: Anchor,
    pub to: Anchor,
}

impl Dependency {
    pub fn new(from: Anchor, to: Anchor) -> Dependency {
        Dependency { from, to }
    }

    /// The anchors must agree on their effective dimensions and transport the
    /// same number of bytes.
    pub fn check_compatibility(&self, from_iface: &Iface, to_iface: &Iface) -> bool {
        let compatible = match (from_iface.base, to_iface.base) {
            (Some(a), Some(b)) => a.is_compatible(b),
            _ => false,
        };
        compatible
            && self.from.index.effective_dimensions() == self.to.index.effective_dimensions()
    }

    /// Amount of memory transported, in bytes.
    pub fn mem_size(&self, from_iface: &Iface) -> i64 {
        self.from.index.volume() * from_iface.elem_size()
    }
}

// ── Buffers ─────────────────────────────────────────────────────────────────

define_id!(
    /// Stable identifier of a buffer in the program's buffer arena.
    BufferId
);

/// A contiguous byte region carrying one or more interface payloads.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub size: i64,
    /// Assigned memory bank, -1 while unassigned.
    pub mem_bank: i32,
    /// Byte offset within the bank, -1 while unassigned.
    pub bank_offset: i64,
    /// For packets provided from outside at the program boundary.
    pub external_source: Option<(KernelId, usize)>,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer {
            size: 1,
            mem_bank: -1,
            bank_offset: -1,
            external_source: None,
        }
    }
}

// ── Groups and divisions ────────────────────────────────────────────────────

/// An external port of a task group, created for a dependency that crosses
/// the group boundary.
#[derive(Debug, Clone)]
pub struct Port {
    pub iface: IfaceKey,
    /// Index into `Program::channels` once connected.
    pub channel: Option<usize>,
}

/// One task of a group together with its boundary ports.
#[derive(Debug, Clone)]
pub struct Operation {
    pub task: NodeId,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
}

/// A point-to-point connection between an output port of one group and an
/// input port of another; `dep` indexes `Program::dependencies`.
#[derive(Debug, Clone)]
pub struct Channel {
    pub from_group: usize,
    pub to_group: usize,
    pub dep: usize,
}

/// An ordered set of tasks intended to run on one core.
#[derive(Debug, Default)]
pub struct TaskGroup {
    pub name: String,
    pub id: usize,
    pub operations: Vec<Operation>,
    /// Index into `Program::divisions`.
    pub division: Option<usize>,
    /// Bound platform core index.
    pub binding: Option<usize>,
}

impl TaskGroup {
    pub fn new(id: usize, name: impl Into<String>) -> Self {
        TaskGroup {
            name: name.into(),
            id,
            operations: Vec::new(),
            division: None,
            binding: None,
        }
    }

    pub fn contains(&self, task: NodeId) -> bool {
        self.operations.iter().any(|op| op.task == task)
    }

    pub fn task_count(&self) -> usize {
        self.operations.len()
    }

    pub fn add_task(&mut self, task: NodeId) {
        debug_assert!(!self.contains(task));
        self.operations.push(Operation {
            task,
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
    }

    pub fn tasks(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.operations.iter().map(|op| op.task)
    }
}

/// An ordered list of task groups sharing a pool of buffers.
#[derive(Debug, Default)]
pub struct TaskDivision {
    pub groups: Vec<usize>,
    pub buffers: Vec<BufferId>,
}

impl TaskDivision {
    /// Tasks of all member groups, in group order.
    pub fn tasks(&self, groups: &[TaskGroup]) -> Vec<NodeId> {
        self.groups
            .iter()
            .flat_map(|&g| groups[g].tasks().collect::<Vec<_>>())
            .collect()
    }
}

// ── Program ─────────────────────────────────────────────────────────────────

pub type TaskGraph = Graph<Task, ()>;
pub type ReachabilityMap = crate::arena::ItemMap<NodeId, crate::arena::ItemSet<NodeId>>;

/// The single program state mutated in place by the pass pipeline.
#[derive(Default)]
pub struct Program {
    pub kernels: Arena<Kernel, KernelId>,
    pub kernel_names: HashMap<String, KernelId>,

    /// Instance of the root meta-kernel; its interfaces are the program
    /// boundary.
    pub main_task: Task,
    pub task_graph: TaskGraph,
    pub dependencies: Vec<Dependency>,
    /// Rebuilt by the successor-matrix pass whenever the task graph changes.
    pub reachability: ReachabilityMap,

    pub groups: Vec<TaskGroup>,
    pub divisions: Vec<TaskDivision>,
    pub buffers: Arena<Buffer, BufferId>,
    pub external_buffers: Vec<BufferId>,
    pub channels: Vec<Channel>,

    /// Names of the passes successfully applied so far.
    pub passes_performed: BTreeSet<String>,
}

impl Program {
    pub fn new() -> Program {
        Program::default()
    }

    pub fn add_kernel(&mut self, kernel: Kernel) -> KernelId {
        let name = kernel.name.clone();
        let id = self.kernels.insert(kernel);
        let prev = self.kernel_names.insert(name, id);
        debug_assert!(prev.is_none(), "kernel name registered twice");
        id
    }

    pub fn kernel_by_name(&self, name: &str) -> Option<KernelId> {
        self.kernel_names.get(name).copied()
    }

    pub fn task(&self, handle: AnchorTask) -> &Task {
        match handle {
            AnchorTask::Main => &self.main_task,
            AnchorTask::Node(id) => self.task_graph.node(id),
            _ => panic!("meta-kernel anchor in adopted program"),
        }
    }

    pub fn task_mut(&mut self, handle: AnchorTask) -> &mut Task {
        match handle {
            AnchorTask::Main => &mut self.main_task,
            AnchorTask::Node(id) => self.task_graph.node_mut(id),
            _ => panic!("meta-kernel anchor in adopted program"),
        }
    }

    pub fn iface(&self, key: IfaceKey) -> &Iface {
        &self.task(key.task).ifaces[key.iface]
    }

    pub fn iface_mut(&mut self, key: IfaceKey) -> &mut Iface {
        &mut self.task_mut(key.task).ifaces[key.iface]
    }

    /// Bytes transported by `dep`.
    pub fn dep_mem_size(&self, dep: &Dependency) -> i64 {
        dep.mem_size(self.iface(dep.from.key()))
    }

    pub fn task_full_name(&self, handle: AnchorTask) -> String {
        match handle {
            AnchorTask::Main => self.main_task.name.clone(),
            AnchorTask::Node(id) => self.task_graph.node(id).name.clone(),
            AnchorTask::Inputs => "<meta-kernel inputs>".to_string(),
            AnchorTask::Outputs => "<meta-kernel outputs>".to_string(),
            AnchorTask::Sub(i) => format!("<sub-task {i}>"),
        }
    }

    pub fn anchor_id(&self, anchor: &Anchor) -> String {
        format!(
            "{}.{}{}",
            self.task_full_name(anchor.task),
            self.iface(anchor.key()).name,
            anchor.index
        )
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("kernels", &self.kernels.len())
            .field("tasks", &self.task_graph.node_count())
            .field("dependencies", &self.dependencies.len())
            .field("groups", &self.groups.len())
            .field("divisions", &self.divisions.len())
            .field("buffers", &self.buffers.len())
            .field("passes_performed", &self.passes_performed)
            .finish()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::Range;

    #[test]
    fn base_types_are_interned() {
        let a = base_type("float", 4);
        let b = base_type("float", 4);
        assert!(std::ptr::eq(a, b));
        let c = base_type("double", 8);
        assert!(!a.is_compatible(c));
        let d = base_type("int32_t", 4);
        assert!(a.is_compatible(d), "equal sizes are compatible");
    }

    #[test]
    fn task_instantiation_resolves_derived_dims() {
        let mut kernels: Arena<Kernel, KernelId> = Arena::new();
        let mut k = Kernel::native("fir", "fir_impl");
        let f32t = base_type("float", 4);
        k.packets.push(Packet::new("x", Access::In, f32t, vec![-1, 8]));
        k.packets.push(Packet::new("y", Access::Out, f32t, vec![8]));
        k.derived_params.push("n/2".to_string());
        let kid = kernels.insert(k);

        let t = Task::instantiate(&kernels, kid, "fir[0]", vec![32], vec![16]);
        assert_eq!(t.ifaces[0].dims, vec![16, 8]);
        assert_eq!(t.ifaces[1].dims, vec![8]);
        assert_eq!(t.ifaces[0].mem_size(), 16 * 8 * 4);
    }

    #[test]
    fn buddies_are_symmetric() {
        let mut k = Kernel::native("k", "k_impl");
        let bt = base_type("u8", 1);
        k.packets.push(Packet::new("a", Access::In, bt, vec![4]));
        k.packets.push(Packet::new("b", Access::Out, bt, vec![4]));
        assert!(k.add_buddies(0, 1));
        assert!(!k.add_buddies(0, 1), "second registration reports false");
        assert!(k.packets[0].buddies.contains(&1));
        assert!(k.packets[1].buddies.contains(&0));
    }

    #[test]
    fn dependency_compatibility() {
        let bt = base_type("i16", 2);
        let mk_iface = |dims: Vec<i64>| Iface {
            name: "p".into(),
            access: Access::In,
            base: Some(bt),
            dims,
            ..Iface::default()
        };
        let from = mk_iface(vec![8]);
        let to = mk_iface(vec![2, 4]);

        // 1x4 from an 8-vector matches a 1x4 block of a 2x4 array
        let dep = Dependency::new(
            Anchor::new(
                AnchorTask::Sub(0),
                0,
                Space::from_ranges(vec![Range::begin_end(0, 4)]),
            ),
            Anchor::new(
                AnchorTask::Sub(1),
                0,
                Space::from_ranges(vec![Range::begin_end(1, 2), Range::begin_end(0, 4)]),
            ),
        );
        assert!(dep.check_compatibility(&from, &to));
        assert_eq!(dep.mem_size(&from), 8);

        let bad = Dependency::new(
            Anchor::new(
                AnchorTask::Sub(0),
                0,
                Space::from_ranges(vec![Range::begin_end(0, 3)]),
            ),
            Anchor::new(
                AnchorTask::Sub(1),
                0,
                Space::from_ranges(vec![Range::begin_end(0, 1), Range::begin_end(0, 4)]),
            ),
        );
        assert!(!bad.check_compatibility(&from, &to));
    }

    #[test]
    fn group_membership() {
        let mut g = TaskGroup::new(0, "g0");
        g.add_task(NodeId(3));
        assert!(g.contains(NodeId(3)));
        assert!(!g.contains(NodeId(4)));
        assert_eq!(g.task_count(), 1);
    }
}
