// pass.rs — Pass descriptor module
//
// Declares the mapper's passes, their prerequisite sets and the results they
// invalidate. The pipeline runner checks `requires` against the program's
// performed-pass set before invoking a pass and removes the `destroys`
// entries afterwards.

use std::collections::HashSet;

/// Identifies each mapper pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    TaskTopoSort,
    CalcSuccessorMatrix,
    PopulateGroups,
    LoadMapping,
    BufferPreallocation,
    BufferAllocation,
    AssignBanks,
    ComputeSchedule,
}

/// Static metadata about a mapper pass.
pub struct PassDescriptor {
    /// Name under which the pass registers itself in the performed set.
    pub name: &'static str,
    /// Passes that must have been applied (and not invalidated) before.
    pub requires: &'static [&'static str],
    /// Passes whose results this pass invalidates.
    pub destroys: &'static [&'static str],
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::TaskTopoSort => PassDescriptor {
            name: "TaskTopoSort",
            requires: &[],
            destroys: &["CalcSuccessorMatrix", "LoadMapping", "PopulateGroups"],
        },
        PassId::CalcSuccessorMatrix => PassDescriptor {
            name: "CalcSuccessorMatrix",
            requires: &[],
            destroys: &[],
        },
        PassId::PopulateGroups => PassDescriptor {
            name: "PopulateGroups",
            requires: &[],
            destroys: &[],
        },
        PassId::LoadMapping => PassDescriptor {
            name: "LoadMapping",
            requires: &[],
            destroys: &[],
        },
        PassId::BufferPreallocation => PassDescriptor {
            name: "BufferPreallocation",
            requires: &["CalcSuccessorMatrix", "PopulateGroups"],
            destroys: &[],
        },
        PassId::BufferAllocation => PassDescriptor {
            name: "BufferAllocation",
            requires: &["BufferPreallocation", "CalcSuccessorMatrix", "PopulateGroups"],
            destroys: &[],
        },
        PassId::AssignBanks => PassDescriptor {
            name: "AssignBanks",
            requires: &["BufferPreallocation"],
            destroys: &[],
        },
        PassId::ComputeSchedule => PassDescriptor {
            name: "ComputeSchedule",
            requires: &["PopulateGroups", "LoadMapping"],
            destroys: &[],
        },
    }
}

/// All pass ids in declaration order.
pub const ALL_PASSES: [PassId; 8] = [
    PassId::TaskTopoSort,
    PassId::CalcSuccessorMatrix,
    PassId::PopulateGroups,
    PassId::LoadMapping,
    PassId::BufferPreallocation,
    PassId::BufferAllocation,
    PassId::AssignBanks,
    PassId::ComputeSchedule,
];

/// Resolves a pass by its registered name.
pub fn by_name(name: &str) -> Option<PassId> {
    ALL_PASSES.iter().copied().find(|&id| descriptor(id).name == name)
}

/// Checks that every prerequisite of `id` is contained in `performed`.
/// Returns the missing names.
pub fn missing_prerequisites(id: PassId, performed: &HashSet<&str>) -> Vec<&'static str> {
    descriptor(id)
        .requires
        .iter()
        .copied()
        .filter(|name| !performed.contains(name))
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────
