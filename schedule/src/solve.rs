//! Solving a tile tree and reading the schedule back out.

use std::collections::HashMap;

use smallvec::SmallVec;
use snafu::{ResultExt, ensure};
use strata_cp::{Assignment, SearchStatus};
use strata_ir::{BufferId, NodeId, Tree};

use crate::config::{SolverConfig, TargetOptions};
use crate::constraints::{self, Objective};
use crate::error::*;
use crate::init::{self, BufferTable, SolverContext};

/// Estimated cycles of a schedule, broken down by term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cost {
    /// Maximum of every other term.
    pub total: i64,
    pub compute: i64,
    /// Transfer cycles per staging level, innermost first.
    pub per_level: Vec<i64>,
    pub resident: i64,
}

/// One materialization chosen by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placed {
    pub node: NodeId,
    pub buffer: BufferId,
    pub level: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBuffer {
    pub shape: SmallVec<[i64; 4]>,
    pub bytes: i64,
}

/// A concrete schedule: tile sizes, placements and their footprints.
#[derive(Debug, Clone)]
pub struct Solution {
    tile_sizes: HashMap<NodeId, SmallVec<[i64; 4]>>,
    tile_extents: HashMap<NodeId, SmallVec<[i64; 4]>>,
    placements: Vec<Placed>,
    stages: HashMap<(NodeId, BufferId), StagedBuffer>,
    buffers: BufferTable,
    cost: Cost,
    status: SearchStatus,
    search_rounds: u64,
}

impl Solution {
    fn project(
        tree: &Tree,
        ctx: &SolverContext,
        objective: &Objective,
        assignment: &Assignment,
        status: SearchStatus,
        search_rounds: u64,
    ) -> Result<Self> {
        let tile_sizes: HashMap<NodeId, SmallVec<[i64; 4]>> = ctx
            .tiles
            .iter()
            .map(|(&node, vars)| (node, vars.vars.iter().map(|&v| assignment.value(v)).collect()))
            .collect();

        let mut tile_extents = HashMap::with_capacity(tile_sizes.len());
        for &node in tile_sizes.keys() {
            let Some(tile) = tree.tile(node) else { continue };
            let mut extent: SmallVec<[i64; 4]> = SmallVec::from_elem(1, tile.num_dims());
            for below in tree.chain(tile.op) {
                if below == node || !tree.is_ancestor(node, below) {
                    continue;
                }
                let related = tree.related_dims(tile.op, below).context(TreeSnafu)?;
                for (d, k) in related.iter().enumerate() {
                    if let (Some(k), Some(sizes)) = (*k, tile_sizes.get(&below)) {
                        extent[d] *= sizes[k];
                    }
                }
            }
            tile_extents.insert(node, extent);
        }

        let placements: Vec<Placed> = ctx
            .placements
            .iter()
            .filter(|p| assignment.is_set(p.var))
            .map(|p| Placed { node: p.node, buffer: p.buffer, level: p.level })
            .collect();
        for &buffer in ctx.buffers.canonical_buffers() {
            let count = placements.iter().filter(|p| p.buffer == buffer && p.level == 0).count();
            ensure!(
                count == 1,
                InternalConsistencySnafu { reason: format!("{buffer} materialized {count} times at level 0") }
            );
        }

        let stages = ctx
            .stages
            .iter()
            .map(|(&key, stage)| {
                let shape = stage.shape.iter().map(|&e| assignment.eval(&ctx.model, e)).collect();
                (key, StagedBuffer { shape, bytes: assignment.eval(&ctx.model, stage.size) })
            })
            .collect();

        let cost = Cost {
            total: assignment.objective(),
            compute: objective.compute,
            per_level: objective.levels.iter().map(|&e| assignment.eval(&ctx.model, e)).collect(),
            resident: assignment.eval(&ctx.model, objective.resident),
        };

        Ok(Self {
            tile_sizes,
            tile_extents,
            placements,
            stages,
            buffers: ctx.buffers.clone(),
            cost,
            status,
            search_rounds,
        })
    }

    /// Tile size of `node` along its dimension `dim`.
    pub fn tile_size(&self, node: NodeId, dim: usize) -> Option<i64> {
        self.tile_sizes.get(&node).and_then(|s| s.get(dim).copied())
    }

    pub fn tile_sizes(&self, node: NodeId) -> Option<&[i64]> {
        self.tile_sizes.get(&node).map(|s| s.as_slice())
    }

    /// Per-iteration extent of `node`'s own op along `dim`: the product of
    /// the tile sizes below `node` in the op's chain.
    pub fn tile_extent(&self, node: NodeId, dim: usize) -> Option<i64> {
        self.tile_extents.get(&node).and_then(|s| s.get(dim).copied())
    }

    pub fn placements(&self) -> &[Placed] {
        &self.placements
    }

    /// Placements chosen at `node`, outermost level first.
    pub fn placements_at(&self, node: NodeId) -> impl Iterator<Item = &Placed> + '_ {
        let mut at: SmallVec<[&Placed; 4]> = self.placements.iter().filter(|p| p.node == node).collect();
        at.sort_by_key(|p| std::cmp::Reverse(p.level));
        at.into_iter()
    }

    pub fn is_placed(&self, node: NodeId, buffer: BufferId, level: usize) -> bool {
        self.placements.contains(&Placed { node, buffer: self.buffers.canonical(buffer), level })
    }

    pub fn buffer_shape(&self, node: NodeId, buffer: BufferId) -> Option<&[i64]> {
        self.stages.get(&(node, self.buffers.canonical(buffer))).map(|s| s.shape.as_slice())
    }

    pub fn buffer_size(&self, node: NodeId, buffer: BufferId) -> Option<i64> {
        self.stages.get(&(node, self.buffers.canonical(buffer))).map(|s| s.bytes)
    }

    /// Bytes placed at memory level `level`.
    pub fn level_usage(&self, level: usize) -> i64 {
        self.placements
            .iter()
            .filter(|p| p.level == level)
            .filter_map(|p| self.stages.get(&(p.node, p.buffer)))
            .map(|s| s.bytes)
            .sum()
    }

    pub fn buffers(&self) -> &BufferTable {
        &self.buffers
    }

    pub fn cost(&self) -> &Cost {
        &self.cost
    }

    /// Status of the search that produced this solution.
    pub fn status(&self) -> SearchStatus {
        self.status
    }

    /// Solver calls made by the search.
    pub fn search_rounds(&self) -> u64 {
        self.search_rounds
    }
}

/// Solve `tree` for `target` and return up to `config.keep_best` solutions,
/// best first. An empty vector means no feasible schedule exists.
#[tracing::instrument(skip_all, fields(ops = tree.num_ops(), levels = tree.levels()))]
pub fn solve_all(tree: &Tree, target: &TargetOptions, config: &SolverConfig) -> Result<Vec<Solution>> {
    target.validate()?;
    config.validate()?;
    ensure!(
        tree.levels() == target.num_levels(),
        LevelMismatchSnafu { tree: tree.levels(), target: target.num_levels() }
    );
    tree.validate().context(TreeSnafu)?;

    let mut ctx = init::initialize(tree, target)?;
    let objective = constraints::build(tree, &mut ctx, target)?;
    let outcome = ctx.model.minimize(objective.total, &config.limits());
    if outcome.solutions.is_empty() {
        tracing::debug!(status = %outcome.status, rounds = outcome.rounds, "no feasible schedule");
    }

    outcome
        .solutions
        .iter()
        .map(|a| Solution::project(tree, &ctx, &objective, a, outcome.status, outcome.rounds))
        .collect()
}

/// Best schedule for `tree`, or `None` when the constraints are infeasible.
pub fn solve(tree: &Tree, target: &TargetOptions, config: &SolverConfig) -> Result<Option<Solution>> {
    Ok(solve_all(tree, target, config)?.into_iter().next())
}
