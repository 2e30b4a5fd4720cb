//! Tiling and fusion scheduler for fused tensor-operator groups.
//!
//! Given a [`FusedGroup`], the scheduler decides how each operator's
//! iteration domain is tiled across a multi-level memory hierarchy, at which
//! level every buffer is staged, and which producer/consumer loop nests share
//! loops. It works on a tile tree and an integer constraint model over it.
//!
//! # Module Organization
//!
//! - [`builder`] - fused group to unfused tile tree
//! - [`merge`] - producer/consumer loop-nest fusion on the tree
//! - [`init`] - solver context: tile-size and placement variables, footprints
//! - [`constraints`] - coverage, materialization, causality, capacity, cost
//! - [`solve`] - search driver and [`Solution`] read-back
//! - [`lower`] - solved tree to a nested-loop [`Proc`]
//! - [`config`] - target description and solver limits
//!
//! # Pipeline
//!
//! ```text
//! build → merge* → initialize → constraints → search → lower
//! ```
//!
//! The tree is only mutated by [`merge()`]. Everything the solver derives
//! lives in a per-solve side table keyed by node id and buffer identity.

pub mod builder;
pub mod config;
pub mod constraints;
pub mod error;
pub mod init;
pub mod lower;
pub mod merge;
pub mod solve;


pub use builder::build;
pub use config::{KernelHints, MemoryLevel, SolverConfig, TargetOptions};
pub use error::{Error, Result};
pub use init::BufferTable;
pub use lower::{lower, lower_into};
pub use merge::merge;
pub use solve::{Cost, Placed, Solution, solve, solve_all};

use strata_ir::{FusedGroup, OpId, Proc, Tree};

/// A fusion request: merge `producer` into `consumer` at memory `level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fusion {
    pub consumer: OpId,
    pub producer: OpId,
    pub level: usize,
}

/// Output of [`schedule_group`].
#[derive(Debug, Clone)]
pub struct Scheduled {
    pub tree: Tree,
    pub solution: Solution,
    pub proc: Proc,
    /// Requested fusions the merger rejected.
    pub rejected: Vec<Fusion>,
}

/// Build, apply `fusions` in order, solve and lower.
///
/// Rejected fusions are skipped and reported; they never abort the run.
/// Returns `Ok(None)` when no schedule fits the target.
#[tracing::instrument(skip_all, fields(ops = group.ops.len(), fusions = fusions.len()))]
pub fn schedule_group(
    group: &FusedGroup,
    target: &TargetOptions,
    config: &SolverConfig,
    fusions: &[Fusion],
    name: &str,
) -> Result<Option<Scheduled>> {
    let mut tree = build(group, target.num_levels())?;
    let rejected: Vec<Fusion> =
        fusions.iter().copied().filter(|f| !merge(&mut tree, f.consumer, f.producer, f.level)).collect();

    let Some(solution) = solve(&tree, target, config)? else {
        return Ok(None);
    };
    let proc = lower(&tree, &solution, name)?;
    tracing::debug!(total = solution.cost().total, rejected = rejected.len(), "group scheduled");
    Ok(Some(Scheduled { tree, solution, proc, rejected }))
}
