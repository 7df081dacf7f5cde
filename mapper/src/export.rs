// export.rs — Serializable projection for the back-end boundary
//
// Every collaborator (code generators, serializers, inspection tools)
// consumes the same flat projection of the program data model: kernels,
// tasks, interfaces with their buffer coordinates, buffers with bank and
// offset, groups, divisions, dependencies and, when available, the schedule.
// The canonical compact JSON form is hashed into a fingerprint so identical
// mapping results can be recognized across runs.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::arena::ItemMap;
use crate::graph::NodeId;
use crate::model::Program;
use crate::schedule::TaskTimings;

#[derive(Debug, Serialize)]
pub struct ExportPacket {
    pub name: String,
    pub access: &'static str,
    pub base_type: String,
    pub base_size: i64,
    pub dims: Vec<i64>,
    pub buddies: Vec<usize>,
}

#[derive(Debug, Serialize)]
pub struct ExportKernel {
    pub name: String,
    pub function_name: String,
    pub is_meta: bool,
    pub packets: Vec<ExportPacket>,
    pub derived_params: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ExportIface {
    pub packet: String,
    pub dims: Vec<i64>,
    pub buffer: Option<u32>,
    pub offset: Option<i64>,
    pub buffer_dims: Vec<i64>,
    pub stride_vector: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct ExportTask {
    pub name: String,
    pub kernel: String,
    pub parameters: Vec<i64>,
    pub derived_params: Vec<i64>,
    pub group: Option<usize>,
    pub ifaces: Vec<ExportIface>,
}

#[derive(Debug, Serialize)]
pub struct ExportBuffer {
    pub id: u32,
    pub size: i64,
    pub bank: i32,
    pub offset: i64,
    pub external_source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExportAnchor {
    pub task: String,
    pub packet: String,
    pub index: Vec<(i64, i64)>,
}

#[derive(Debug, Serialize)]
pub struct ExportDependency {
    pub from: ExportAnchor,
    pub to: ExportAnchor,
}

#[derive(Debug, Serialize)]
pub struct ExportGroup {
    pub name: String,
    pub members: Vec<String>,
    pub core: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExportDivision {
    pub groups: Vec<usize>,
    pub buffers: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct ExportTiming {
    pub task: String,
    pub start: i64,
    pub end: i64,
    pub slack: i64,
}

/// The complete projection handed to back-ends.
#[derive(Debug, Serialize)]
pub struct ExportProgram {
    pub kernels: Vec<ExportKernel>,
    pub tasks: Vec<ExportTask>,
    pub buffers: Vec<ExportBuffer>,
    pub dependencies: Vec<ExportDependency>,
    pub groups: Vec<ExportGroup>,
    pub divisions: Vec<ExportDivision>,
    pub timings: Option<Vec<ExportTiming>>,
}

fn export_anchor(prog: &Program, anchor: &crate::model::Anchor) -> ExportAnchor {
    ExportAnchor {
        task: prog.task_full_name(anchor.task),
        packet: prog.iface(anchor.key()).name.clone(),
        index: anchor
            .index
            .ranges()
            .iter()
            .map(|r| (r.first(), r.last()))
            .collect(),
    }
}

/// Projects `prog` (plus optional schedule timings) into the flat form.
pub fn project(
    prog: &Program,
    timings: Option<&ItemMap<NodeId, TaskTimings>>,
    platform: Option<&crate::platform::Platform>,
) -> ExportProgram {
    let kernels = prog
        .kernels
        .iter()
        .map(|(_, k)| ExportKernel {
            name: k.name.clone(),
            function_name: k.function_name.clone(),
            is_meta: k.is_meta(),
            packets: k
                .packets
                .iter()
                .map(|p| ExportPacket {
                    name: p.name.clone(),
                    access: p.access.name(),
                    base_type: p.base.name.clone(),
                    base_size: p.base.size,
                    dims: p.dims.clone(),
                    buddies: p.buddies.iter().copied().collect(),
                })
                .collect(),
            derived_params: k.derived_params.clone(),
        })
        .collect();

    let export_task = |task: &crate::model::Task| -> ExportTask {
        ExportTask {
            name: task.name.clone(),
            kernel: task
                .kernel
                .map(|k| prog.kernels[k].name.clone())
                .unwrap_or_default(),
            parameters: task.params.clone(),
            derived_params: task.derived_params.clone(),
            group: task.group,
            ifaces: task
                .ifaces
                .iter()
                .map(|d| ExportIface {
                    packet: d.name.clone(),
                    dims: d.dims.clone(),
                    buffer: d.buffer.map(|b| b.0),
                    offset: d.buffer_offset,
                    buffer_dims: d.buffer_dims.clone(),
                    stride_vector: d.buffer_dims_adj.clone(),
                })
                .collect(),
        }
    };
    let tasks = prog
        .task_graph
        .nodes()
        .map(|(_, task)| export_task(task))
        .collect();

    let buffers = prog
        .buffers
        .iter()
        .map(|(id, b)| ExportBuffer {
            id: id.0,
            size: b.size,
            bank: b.mem_bank,
            offset: b.bank_offset,
            external_source: b
                .external_source
                .map(|(k, p)| prog.kernels[k].packets[p].name.clone()),
        })
        .collect();

    let dependencies = prog
        .dependencies
        .iter()
        .map(|dep| ExportDependency {
            from: export_anchor(prog, &dep.from),
            to: export_anchor(prog, &dep.to),
        })
        .collect();

    let groups = prog
        .groups
        .iter()
        .map(|g| ExportGroup {
            name: g.name.clone(),
            members: g
                .tasks()
                .map(|n| prog.task_graph.node(n).name.clone())
                .collect(),
            core: g
                .binding
                .and_then(|c| platform.map(|pf| pf.cores[c].name.clone())),
        })
        .collect();

    let divisions = prog
        .divisions
        .iter()
        .map(|d| ExportDivision {
            groups: d.groups.clone(),
            buffers: d.buffers.iter().map(|b| b.0).collect(),
        })
        .collect();

    let timings = timings.map(|map| {
        prog.task_graph
            .nodes()
            .map(|(n, task)| {
                let t = map[n];
                ExportTiming {
                    task: task.name.clone(),
                    start: t.start,
                    end: t.end,
                    slack: t.slack,
                }
            })
            .collect()
    });

    ExportProgram {
        kernels,
        tasks,
        buffers,
        dependencies,
        groups,
        divisions,
        timings,
    }
}

impl ExportProgram {
    /// Human-oriented pretty JSON.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("projection serialization should not fail")
    }

    /// Canonical compact JSON (no whitespace); input to the fingerprint.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("projection serialization should not fail")
    }

    /// SHA-256 over the canonical JSON. Two identical mapping results have
    /// identical fingerprints.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    }

    /// Hex string of the fingerprint (64 characters).
    pub fn fingerprint_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in self.fingerprint() {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
        }
        s
    }
}

/// Main-task boundary interfaces are exported alongside; keeps export users
/// from needing the task handle enum.
pub fn project_boundary(prog: &Program) -> ExportTask {
    let task = &prog.main_task;
    ExportTask {
        name: task.name.clone(),
        kernel: task
            .kernel
            .map(|k| prog.kernels[k].name.clone())
            .unwrap_or_default(),
        parameters: task.params.clone(),
        derived_params: task.derived_params.clone(),
        group: None,
        ifaces: task
            .ifaces
            .iter()
            .map(|d| ExportIface {
                packet: d.name.clone(),
                dims: d.dims.clone(),
                buffer: d.buffer.map(|b| b.0),
                offset: d.buffer_offset,
                buffer_dims: d.buffer_dims.clone(),
                stride_vector: d.buffer_dims_adj.clone(),
            })
            .collect(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
