// lbm — Ladybirds Mapper
//
// Takes a parallel-program specification — a DAG of kernels communicating
// through typed multi-dimensional data packets — and produces an executable
// mapping of that graph onto a heterogeneous hardware platform: dataflow
// resolution, meta-kernel flattening, buffer allocation, bank and cache
// placement, and memory-aware list scheduling. Parsing, CLI plumbing and
// code generation live with the collaborators around this crate.

pub mod arena;
pub mod space;
pub mod division;
pub mod graph;
pub mod chart;
pub mod diag;
pub mod model;
pub mod platform;
pub mod resolve;
pub mod flatten;
pub mod grouping;
pub mod prealloc;
pub mod alloc;
pub mod banks;
pub mod schedule;
pub mod pass;
pub mod pipeline;
pub mod export;
