// Buffer allocation and bank assignment, driven through the pass pipeline.

use lbm::arena::Arena;
use lbm::diag::{codes, DiagSink};
use lbm::flatten::adopt;
use lbm::model::{base_type, Access, Kernel, KernelId, Packet, Program};
use lbm::pipeline::{PassInvocation, Pipeline};
use lbm::platform::CacheConfig;
use lbm::resolve::{resolve, Argument, KernelCall, MetaKernelSeq, VarRef};
use lbm::space::{Range, Space};

fn f32t() -> lbm::model::BaseTypeRef {
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

/// A linear pipeline of `stages` copy tasks chained through `stages + 1`
/// variables of `width` floats each.
fn chain_program(stages: usize, width: i64) -> Program {
    let mut kernels = Arena::new();
    let src = native(
        &mut kernels,
        "src",
        vec![Packet::new("o", Access::Out, f32t(), vec![width])],
    );
    let copy = native(
        &mut kernels,
        "copy",
        vec![
            Packet::new("i", Access::In, f32t(), vec![width]),
            Packet::new("o", Access::Out, f32t(), vec![width]),
        ],
    );
    let sink = native(
        &mut kernels,
        "sink",
        vec![Packet::new("i", Access::In, f32t(), vec![width])],
    );
    let root = kernels.insert(Kernel::native("main", ""));

    let variables: Vec<Packet> = (0..stages + 1)
        .map(|i| Packet::new(format!("v{i}"), Access::InOut, f32t(), vec![width]))
        .collect();

    let mut operations = vec![KernelCall::new(
        &kernels,
        src,
        vec![Argument::new(VarRef::Local(0), &variables[0], Space::new())],
        vec![],
        vec![],
    )];
    for i in 0..stages {
        operations.push(KernelCall::new(
            &kernels,
            copy,
            vec![
                Argument::new(VarRef::Local(i), &variables[i], Space::new()),
                Argument::new(VarRef::Local(i + 1), &variables[i + 1], Space::new()),
            ],
            vec![],
            vec![],
        ));
    }
    operations.push(KernelCall::new(
        &kernels,
        sink,
        vec![Argument::new(
            VarRef::Local(stages),
            &variables[stages],
            Space::new(),
        )],
        vec![],
        vec![],
    ));

    let seq = MetaKernelSeq {
        operations,
        variables,
    };
    let mut diags = DiagSink::new();
    assert!(resolve(&seq, &mut kernels, root, &mut diags), "{:?}", diags.diagnostics());

    let mut prog = Program::new();
    prog.kernels = kernels;
    adopt(&mut prog, root);
    prog
}

fn structural_passes() -> Vec<PassInvocation<'static>> {
    vec![
        PassInvocation::TaskTopoSort,
        PassInvocation::CalcSuccessorMatrix,
        PassInvocation::PopulateGroups,
        PassInvocation::BufferPreallocation,
        PassInvocation::BufferAllocation,
    ]
}

#[test]
fn chain_buffers_alternate_after_merging() {
    // a 6-stage chain has 7 variable buffers; merging folds them onto a
    // small working set because early buffers die before late ones are born
    let mut prog = chain_program(6, 16);
    let mut diags = DiagSink::new();
    let mut pipeline = Pipeline::new();
    pipeline
        .run(&mut prog, structural_passes(), &mut diags)
        .map_err(|p| format!("{p:?}: {:?}", diags.diagnostics()))
        .unwrap();

    let merged = prog.divisions[0].buffers.len();
    assert!(merged < 7, "expected merging, still {merged} buffers");
    assert!(merged >= 2, "adjacent stages can never share storage");

    // interfaces all point into the division pool, with intact sizes
    for (_, task) in prog.task_graph.nodes() {
        for iface in &task.ifaces {
            let b = iface.buffer.expect("unbound interface after allocation");
            assert!(prog.divisions[0].buffers.contains(&b));
            assert!(prog.buffers[b].size >= 16 * 4);
        }
    }
}

#[test]
fn allocation_is_reproducible() {
    let run = || {
        let mut prog = chain_program(5, 8);
        let mut diags = DiagSink::new();
        Pipeline::new()
            .run(&mut prog, structural_passes(), &mut diags)
            .ok()
            .unwrap();
        let export = lbm::export::project(&prog, None, None);
        export.fingerprint_hex()
    };
    assert_eq!(run(), run());
}

#[test]
fn banks_after_full_allocation() {
    let mut prog = chain_program(4, 64);
    let mut diags = DiagSink::new();
    let mut steps = structural_passes();
    steps.push(PassInvocation::AssignBanks(
        lbm::banks::BankAssignArgs {
            bank_count: 4,
            bank_capacity: 2048,
            hw_group_count: 8,
            cache: CacheConfig {
                word_size: 64,
                associativity: 2,
                line_count: 64,
            },
        },
        Vec::new(),
    ));
    Pipeline::new()
        .run(&mut prog, steps, &mut diags)
        .map_err(|p| format!("{p:?}: {:?}", diags.diagnostics()))
        .unwrap();

    for &b in &prog.divisions[0].buffers {
        let buffer = &prog.buffers[b];
        assert!((0..4).contains(&buffer.mem_bank), "unassigned buffer");
        assert!(buffer.bank_offset >= 0);
    }
    assert!(prog.passes_performed.contains("AssignBanks"));
}

#[test]
fn bank_overflow_gives_up_with_report() {
    // 17 buffers barely over half a bank on 16 banks: the total fits, the
    // layout cannot
    use lbm::model::{Buffer, Task, TaskDivision, TaskGroup};

    let mut prog = Program::new();
    let mut division = TaskDivision::default();
    let cap = 4096i64;
    for i in 0..17 {
        let b = prog.buffers.insert(Buffer {
            size: cap / 2 + 1,
            ..Buffer::default()
        });
        division.buffers.push(b);
        let mut task = Task {
            name: format!("t{i}"),
            ..Task::default()
        };
        task.ifaces.push(lbm::model::Iface {
            name: "x".into(),
            buffer: Some(b),
            ..lbm::model::Iface::default()
        });
        let node = prog.task_graph.add_node(task);
        let gid = prog.groups.len();
        let mut group = TaskGroup::new(gid, format!("t{i}"));
        group.add_task(node);
        group.division = Some(0);
        prog.task_graph.node_mut(node).group = Some(gid);
        division.groups.push(gid);
        prog.groups.push(group);
    }
    prog.divisions.push(division);
    for name in ["CalcSuccessorMatrix", "PopulateGroups", "BufferPreallocation"] {
        prog.passes_performed.insert(name.to_string());
    }

    let mut diags = DiagSink::new();
    let result = Pipeline::new().run(
        &mut prog,
        vec![PassInvocation::AssignBanks(
            lbm::banks::BankAssignArgs {
                bank_count: 16,
                bank_capacity: cap,
                hw_group_count: 8,
                cache: CacheConfig {
                    word_size: 64,
                    associativity: 2,
                    line_count: 64,
                },
            },
            Vec::new(),
        )],
        &mut diags,
    );
    assert!(result.is_err());

    let report = diags
        .diagnostics()
        .iter()
        .find(|d| d.code == Some(codes::E0302))
        .expect("expected the give-up report");
    let hint = report.hint.as_ref().unwrap();
    assert!(hint.contains("Bank 0"), "{hint}");
    assert!(hint.contains("Bank 15"), "{hint}");
    assert!(hint.contains("Unassigned"), "{hint}");
}

#[test]
fn external_buffers_stay_unmerged() {
    // a program with boundary packets: the main-task gangs become external
    // buffers and survive allocation untouched
    let mut kernels = Arena::new();
    let copy = native(
        &mut kernels,
        "copy",
        vec![
            Packet::new("i", Access::In, f32t(), vec![8]),
            Packet::new("o", Access::Out, f32t(), vec![8]),
        ],
    );
    let mut rootk = Kernel::native("main", "");
    rootk.packets = vec![
        Packet::new("src", Access::In, f32t(), vec![8]),
        Packet::new("dst", Access::Out, f32t(), vec![8]),
    ];
    let root = kernels.insert(rootk);

    let srcp = Packet::new("src", Access::In, f32t(), vec![8]);
    let dstp = Packet::new("dst", Access::Out, f32t(), vec![8]);
    let seq = MetaKernelSeq {
        operations: vec![KernelCall::new(
            &kernels,
            copy,
            vec![
                Argument::new(VarRef::Boundary(0), &srcp, Space::new()),
                Argument::new(VarRef::Boundary(1), &dstp, Space::new()),
            ],
            vec![],
            vec![],
        )],
        variables: vec![],
    };
    let mut diags = DiagSink::new();
    assert!(resolve(&seq, &mut kernels, root, &mut diags), "{:?}", diags.diagnostics());

    let mut prog = Program::new();
    prog.kernels = kernels;
    adopt(&mut prog, root);

    let mut diags = DiagSink::new();
    Pipeline::new()
        .run(&mut prog, structural_passes(), &mut diags)
        .map_err(|p| format!("{p:?}: {:?}", diags.diagnostics()))
        .unwrap();

    // both boundary gangs ended up external
    assert_eq!(prog.external_buffers.len(), 2);
    for &b in &prog.external_buffers {
        let buffer = &prog.buffers[b];
        assert!(buffer.external_source.is_some());
        assert_eq!(buffer.size, 8 * 4);
    }
    // the copy task's interfaces point at the external buffers
    let (_, task) = prog.task_graph.nodes().next().unwrap();
    for iface in &task.ifaces {
        assert!(prog.external_buffers.contains(&iface.buffer.unwrap()));
    }
}
