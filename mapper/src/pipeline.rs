// pipeline.rs — In-process pass orchestration
//
// Runs a user-chosen sequence of passes over one program. Each step checks
// its prerequisites against the program's performed-pass set, records its
// success by name and removes the names of results it invalidates; the
// pipeline stops at the first failing pass. Collaborators can describe a
// sequence declaratively as a `PipelineSpec` and resolve it against the
// in-memory resources (platform, mappings, timings) they hold.

use serde::Deserialize;

use crate::arena::ItemMap;
use crate::banks::{BankAssignArgs, BankAssignment, TaskOverlap};
use crate::diag::{codes, DiagSink};
use crate::graph::NodeId;
use crate::grouping::{self, MappingSpec};
use crate::model::Program;
use crate::pass::{descriptor, missing_prerequisites, by_name, PassId};
use crate::platform::Platform;
use crate::schedule::{IfaceMapping, ScheduleArgs, Scheduler, SpillMapping, TaskTimings};

/// One step of a pipeline run, carrying the arguments its pass needs.
pub enum PassInvocation<'a> {
    TaskTopoSort,
    CalcSuccessorMatrix,
    PopulateGroups,
    LoadMapping(&'a MappingSpec),
    BufferPreallocation,
    BufferAllocation,
    AssignBanks(BankAssignArgs, Vec<TaskOverlap>),
    ComputeSchedule(ScheduleArgs, Option<(&'a IfaceMapping, &'a SpillMapping)>),
}

impl<'a> PassInvocation<'a> {
    pub fn id(&self) -> PassId {
        match self {
            PassInvocation::TaskTopoSort => PassId::TaskTopoSort,
            PassInvocation::CalcSuccessorMatrix => PassId::CalcSuccessorMatrix,
            PassInvocation::PopulateGroups => PassId::PopulateGroups,
            PassInvocation::LoadMapping(_) => PassId::LoadMapping,
            PassInvocation::BufferPreallocation => PassId::BufferPreallocation,
            PassInvocation::BufferAllocation => PassId::BufferAllocation,
            PassInvocation::AssignBanks(..) => PassId::AssignBanks,
            PassInvocation::ComputeSchedule(..) => PassId::ComputeSchedule,
        }
    }
}

/// Results a pipeline run leaves behind besides the mutated program.
#[derive(Default)]
pub struct PipelineResult {
    pub schedule: Option<ItemMap<NodeId, TaskTimings>>,
}

/// Pass orchestrator. `verbose` receives one line per pass plus whatever the
/// passes report through their verbose channel.
pub struct Pipeline<'a> {
    pub platform: Option<&'a Platform>,
    pub verbose: Option<&'a mut dyn FnMut(String)>,
}

impl<'a> Pipeline<'a> {
    pub fn new() -> Self {
        Pipeline {
            platform: None,
            verbose: None,
        }
    }

    pub fn with_platform(platform: &'a Platform) -> Self {
        Pipeline {
            platform: Some(platform),
            verbose: None,
        }
    }

    fn say(&mut self, msg: String) {
        if let Some(cb) = self.verbose.as_mut() {
            cb(msg);
        }
    }

    /// Runs `steps` in order, stopping at the first failure. Returns the
    /// side results of the successful prefix.
    pub fn run(
        &mut self,
        prog: &mut Program,
        steps: Vec<PassInvocation<'_>>,
        diags: &mut DiagSink,
    ) -> Result<PipelineResult, PassId> {
        let mut result = PipelineResult::default();

        for step in steps {
            let id = step.id();
            let desc = descriptor(id);

            let performed: std::collections::HashSet<&str> =
                prog.passes_performed.iter().map(|s| s.as_str()).collect();
            let missing = missing_prerequisites(id, &performed);
            if !missing.is_empty() {
                diags.error(
                    codes::E0500,
                    format!(
                        "Pass {} requires {} to have been applied first",
                        desc.name,
                        missing.join(", ")
                    ),
                );
                return Err(id);
            }

            let ok = self.run_step(prog, step, &mut result, diags);
            if !ok {
                self.say(format!("pass {} failed", desc.name));
                return Err(id);
            }

            for destroyed in desc.destroys {
                prog.passes_performed.remove(*destroyed);
            }
            prog.passes_performed.insert(desc.name.to_string());
            self.say(format!("pass {} complete", desc.name));
        }
        Ok(result)
    }

    fn run_step(
        &mut self,
        prog: &mut Program,
        step: PassInvocation<'_>,
        result: &mut PipelineResult,
        diags: &mut DiagSink,
    ) -> bool {
        match step {
            PassInvocation::TaskTopoSort => grouping::task_topo_sort(prog, diags),
            PassInvocation::CalcSuccessorMatrix => grouping::calc_successor_matrix(prog),
            PassInvocation::PopulateGroups => grouping::populate_groups(prog),
            PassInvocation::LoadMapping(spec) => {
                grouping::apply_mapping(prog, spec, self.platform, diags)
            }
            PassInvocation::BufferPreallocation => {
                crate::prealloc::buffer_preallocation(prog, diags)
            }
            PassInvocation::BufferAllocation => {
                crate::alloc::buffer_allocation(prog, diags, &mut self.verbose)
            }
            PassInvocation::AssignBanks(args, overlaps) => {
                let mut ba = BankAssignment::new(prog, args, overlaps);
                ba.run(diags, &mut self.verbose)
            }
            PassInvocation::ComputeSchedule(args, mapping) => {
                let platform = self
                    .platform
                    .expect("scheduling requires a platform");
                let mut scheduler = Scheduler::new(prog, platform);
                match scheduler.compute(&args, mapping, diags) {
                    Some(timings) => {
                        result.schedule = Some(timings);
                        true
                    }
                    None => false,
                }
            }
        }
    }
}

impl<'a> Default for Pipeline<'a> {
    fn default() -> Self {
        Pipeline::new()
    }
}

// ── Declarative pipeline description ────────────────────────────────────────

/// Plain-data bank parameters of a declarative step.
#[derive(Debug, Clone, Deserialize)]
pub struct BankParams {
    pub bank_count: usize,
    pub bank_capacity: i64,
    #[serde(default = "default_hw_groups")]
    pub hw_group_count: usize,
    pub cache_word_size: i64,
    pub cache_associativity: i64,
    pub cache_line_count: i64,
}

fn default_hw_groups() -> usize {
    8
}

/// One declarative step: the pass name plus the plain-data arguments it
/// accepts. Resources that only exist in memory (task timings, interface
/// mappings) are supplied when the description is resolved.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineStep {
    pub pass: String,
    #[serde(default)]
    pub mapping: Option<MappingSpec>,
    #[serde(default)]
    pub banks: Option<BankParams>,
    #[serde(default)]
    pub weight: u32,
}

/// A declarative pipeline description, e.g. deserialized from a collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSpec {
    pub steps: Vec<PipelineStep>,
}

impl PipelineSpec {
    /// Resolves the description into invocations. `overlaps` feeds
    /// `AssignBanks`; `iface_mapping`/`spill_mapping` feed `ComputeSchedule`.
    /// Unknown pass names are a pass-sequence error.
    pub fn resolve<'a>(
        &'a self,
        overlaps: &[TaskOverlap],
        iface_mapping: Option<&'a IfaceMapping>,
        spill_mapping: Option<&'a SpillMapping>,
        diags: &mut DiagSink,
    ) -> Option<Vec<PassInvocation<'a>>> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let id = match by_name(&step.pass) {
                Some(id) => id,
                None => {
                    diags.error(codes::E0500, format!("Unknown pass '{}'", step.pass));
                    return None;
                }
            };
            steps.push(match id {
                PassId::TaskTopoSort => PassInvocation::TaskTopoSort,
                PassId::CalcSuccessorMatrix => PassInvocation::CalcSuccessorMatrix,
                PassId::PopulateGroups => PassInvocation::PopulateGroups,
                PassId::LoadMapping => {
                    let Some(mapping) = step.mapping.as_ref() else {
                        diags.error(
                            codes::E0500,
                            "Pass LoadMapping needs a mapping argument".to_string(),
                        );
                        return None;
                    };
                    PassInvocation::LoadMapping(mapping)
                }
                PassId::BufferPreallocation => PassInvocation::BufferPreallocation,
                PassId::BufferAllocation => PassInvocation::BufferAllocation,
                PassId::AssignBanks => {
                    let Some(banks) = step.banks.as_ref() else {
                        diags.error(
                            codes::E0500,
                            "Pass AssignBanks needs bank parameters".to_string(),
                        );
                        return None;
                    };
                    PassInvocation::AssignBanks(
                        BankAssignArgs {
                            bank_count: banks.bank_count,
                            bank_capacity: banks.bank_capacity,
                            hw_group_count: banks.hw_group_count,
                            cache: crate::platform::CacheConfig {
                                word_size: banks.cache_word_size,
                                associativity: banks.cache_associativity,
                                line_count: banks.cache_line_count,
                            },
                        },
                        overlaps.to_vec(),
                    )
                }
                PassId::ComputeSchedule => PassInvocation::ComputeSchedule(
                    ScheduleArgs {
                        weight: step.weight,
                    },
                    match (iface_mapping, spill_mapping) {
                        (Some(pdm), Some(psm)) => Some((pdm, psm)),
                        _ => None,
                    },
                ),
            });
        }
        Some(steps)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
