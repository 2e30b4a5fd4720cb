//! Constraints and the cost objective over an initialized [`SolverContext`].

use std::collections::HashMap;

use smallvec::SmallVec;
use snafu::ResultExt;
use strata_cp::Expr;
use strata_ir::{BufferId, NodeId, Tree};

use crate::config::TargetOptions;
use crate::error::*;
use crate::init::SolverContext;

/// Objective terms kept for reporting the cost of a solution.
#[derive(Debug, Clone)]
pub struct Objective {
    pub total: Expr,
    /// Compute cycles, independent of the schedule.
    pub compute: i64,
    /// Transfer cycles per staging level.
    pub levels: Vec<Expr>,
    /// Transfer cycles against main memory.
    pub resident: Expr,
}

/// Every op dimension is covered exactly by the tiles of its chain.
fn add_coverage(tree: &Tree, ctx: &mut SolverContext) -> Result<()> {
    for op in tree.ops() {
        let chain = tree.chain(op.op);
        let mut factors: SmallVec<[SmallVec<[Expr; 4]>; 4]> = SmallVec::from_elem(SmallVec::new(), op.num_dims());
        for &tile in &chain {
            let related = tree.related_dims(op.op, tile).context(TreeSnafu)?;
            let vars = ctx.tile_vars(tile)?;
            for (d, k) in related.iter().enumerate() {
                if let Some(k) = *k {
                    factors[d].push(vars.sizes[k]);
                }
            }
        }
        for (d, f) in factors.into_iter().enumerate() {
            let covered = ctx.model.product(f);
            let bound = ctx.model.constant(op.bounds[d]);
            ctx.model.add_eq(covered, bound, "coverage");
        }
    }
    Ok(())
}

/// Each canonical buffer is materialized at level 0 exactly once, and a
/// node stages a buffer at no more than one level.
fn add_materialization(ctx: &mut SolverContext) {
    let mut at_zero: HashMap<BufferId, SmallVec<[Expr; 4]>> = HashMap::new();
    let mut per_node: HashMap<(NodeId, BufferId), SmallVec<[Expr; 4]>> = HashMap::new();
    for p in &ctx.placements {
        if p.level == 0 {
            at_zero.entry(p.buffer).or_default().push(p.expr);
        }
        per_node.entry((p.node, p.buffer)).or_default().push(p.expr);
    }

    let one = ctx.model.constant(1);
    for &buffer in ctx.buffers.canonical_buffers() {
        let terms = at_zero.remove(&buffer).unwrap_or_default();
        let count = ctx.model.sum(terms);
        ctx.model.add_eq(count, one, "single-materialization");
    }
    for terms in per_node.into_values().filter(|t| t.len() > 1) {
        let count = ctx.model.sum(terms);
        ctx.model.add_le(count, one, "one-level-per-node");
    }
}

/// A buffer staged at level `s` needs a copy at level `s + 1` in an
/// enclosing tile to be filled from. The outermost staging level is filled
/// from main memory.
fn add_causality(tree: &Tree, ctx: &mut SolverContext) {
    let levels = tree.levels();
    let mut rules: Vec<(Expr, SmallVec<[Expr; 4]>)> = Vec::new();
    for p in &ctx.placements {
        if p.level + 1 >= levels {
            continue;
        }
        let sources = tree
            .ancestors(p.node)
            .filter(|&a| tree.tile(a).is_some_and(|t| t.level > p.level))
            .filter_map(|a| ctx.placement(a, p.buffer, p.level + 1))
            .map(|q| q.expr)
            .collect();
        rules.push((p.expr, sources));
    }
    for (placed, sources) in rules {
        let available = ctx.model.sum(sources);
        ctx.model.add_le(placed, available, "causality");
    }
}

fn add_capacity(ctx: &mut SolverContext, target: &TargetOptions) -> Result<()> {
    for (level, mem) in target.levels.iter().enumerate() {
        let mut usage: SmallVec<[Expr; 8]> = SmallVec::new();
        for i in 0..ctx.placements.len() {
            let p = ctx.placements[i];
            if p.level != level {
                continue;
            }
            let size = ctx.stage(p.node, p.buffer)?.size;
            usage.push(ctx.model.product([p.expr, size]));
        }
        let used = ctx.model.sum(usage);
        let capacity = ctx.model.constant(mem.capacity);
        ctx.model.add_le(used, capacity, "capacity");
    }
    Ok(())
}

/// Compute cycles: per op, elements over its kernel's granularity, times
/// that kernel's cycles. Saturates rather than wrapping on huge domains.
pub fn compute_cycles(tree: &Tree, target: &TargetOptions) -> i64 {
    tree.ops()
        .map(|op| {
            let hints = target.hints_for(op.primitive);
            let points = op.bounds.iter().fold(1i64, |acc, &b| acc.saturating_mul(b));
            let calls = points / hints.granularity + i64::from(points % hints.granularity != 0);
            calls.saturating_mul(hints.kernel_cycles)
        })
        .fold(0i64, i64::saturating_add)
}

fn build_objective(tree: &Tree, ctx: &mut SolverContext, target: &TargetOptions) -> Result<Objective> {
    let num_levels = target.num_levels();
    let mut written: Vec<SmallVec<[Expr; 8]>> = vec![SmallVec::new(); num_levels];
    let mut resident: SmallVec<[Expr; 8]> = SmallVec::new();

    for i in 0..ctx.placements.len() {
        let p = ctx.placements[i];
        let stage = ctx.stage(p.node, p.buffer)?;
        let (fills, size) = (stage.fills, stage.size);
        let traffic = ctx.model.product([p.expr, fills, size]);
        written[p.level].push(traffic);
        if p.level + 1 == num_levels && ctx.buffers.is_resident(p.buffer) {
            resident.push(traffic);
        }
    }

    let written: Vec<Expr> = written.into_iter().map(|w| ctx.model.sum(w)).collect();
    let mut levels = Vec::with_capacity(num_levels);
    for (s, mem) in target.levels.iter().enumerate() {
        let traffic = match s {
            0 => written[0],
            _ => ctx.model.sum([written[s], written[s - 1]]),
        };
        levels.push(ctx.model.ceil_div(traffic, mem.bandwidth).context(ModelSnafu)?);
    }
    let resident_bytes = ctx.model.sum(resident);
    let resident = ctx.model.ceil_div(resident_bytes, target.resident_bandwidth).context(ModelSnafu)?;

    let compute = compute_cycles(tree, target);
    let compute_expr = ctx.model.constant(compute);
    let total = ctx.model.max(levels.iter().copied().chain([resident, compute_expr]));
    Ok(Objective { total, compute, levels, resident })
}

/// Add every constraint of the scheduling model and return the objective.
#[tracing::instrument(skip_all, fields(placements = ctx.placements.len()))]
pub fn build(tree: &Tree, ctx: &mut SolverContext, target: &TargetOptions) -> Result<Objective> {
    add_coverage(tree, ctx)?;
    add_materialization(ctx);
    add_causality(tree, ctx);
    add_capacity(ctx, target)?;
    let objective = build_objective(tree, ctx, target)?;
    tracing::debug!(constraints = ctx.model.constraints().len(), compute = objective.compute, "model built");
    Ok(objective)
}
