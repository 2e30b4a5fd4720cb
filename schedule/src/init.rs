//! Decision variables and derived expressions over a tile tree.
//!
//! All solver state lives in a [`SolverContext`] that is threaded through
//! the initializer's visitor calls; nothing is stored on tree nodes. The walk
//! is top-down: a tile creates its tile-size variables, forward extents and
//! placement booleans before its subtree is visited, and the per-buffer
//! shape, size and fill expressions after, once every tile below it has its
//! variables.

use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;
use snafu::ResultExt;
use strata_affine::AffineExpr;
use strata_cp::{Expr, IntVar, Model};
use strata_ir::{BufferId, ElemType, NodeId, OpId, OpNode, ScopeNode, Slot, TileNode, Tree, Visitor};

use crate::config::TargetOptions;
use crate::error::*;

/// Buffer identities after aliasing.
///
/// A consumer input produced by an op that shares a tile with it (a fused
/// intermediate) is an alias of the producer's output; the output is the
/// canonical identity. Every other buffer is its own canonical identity.
#[derive(Debug, Clone, Default)]
pub struct BufferTable {
    canonical: HashMap<BufferId, BufferId>,
    /// Where the data lives in main memory: producer outputs for every
    /// produced input, fused or not.
    storage: HashMap<BufferId, BufferId>,
    accessors: HashMap<BufferId, SmallVec<[(OpId, Slot); 2]>>,
    resident: HashSet<BufferId>,
    order: Vec<BufferId>,
}

impl BufferTable {
    pub fn new(tree: &Tree) -> Self {
        let mut table = Self::default();
        for op in tree.ops() {
            for buffer in op.buffers() {
                let (canonical, storage) = match buffer.slot {
                    Slot::Input(i) => match op.producer_of(i) {
                        Some(p) if tree.share_tile(p, op.op) => (BufferId::output(p), BufferId::output(p)),
                        Some(p) => (buffer, BufferId::output(p)),
                        None => (buffer, buffer),
                    },
                    Slot::Output => (buffer, buffer),
                };
                table.canonical.insert(buffer, canonical);
                table.storage.insert(buffer, storage);
                table.accessors.entry(canonical).or_default().push((op.op, buffer.slot));
                if !table.order.contains(&canonical) {
                    table.order.push(canonical);
                }
            }
        }

        for &buffer in &table.order {
            let resident = match buffer.slot {
                Slot::Input(_) => true,
                Slot::Output => tree.op(buffer.op).is_some_and(|op| op.is_output) || has_unlinked_consumer(tree, buffer.op),
            };
            if resident {
                table.resident.insert(buffer);
            }
        }
        table
    }

    pub fn canonical(&self, buffer: BufferId) -> BufferId {
        self.canonical.get(&buffer).copied().unwrap_or(buffer)
    }

    pub fn storage(&self, buffer: BufferId) -> BufferId {
        self.storage.get(&buffer).copied().unwrap_or(buffer)
    }

    /// Ops and slots that touch the canonical buffer `buffer`.
    pub fn accessors(&self, buffer: BufferId) -> &[(OpId, Slot)] {
        self.accessors.get(&buffer).map_or(&[], |a| a.as_slice())
    }

    /// Whether the canonical buffer also lives in main memory.
    pub fn is_resident(&self, buffer: BufferId) -> bool {
        self.resident.contains(&self.canonical(buffer))
    }

    /// Canonical buffers in first-use order.
    pub fn canonical_buffers(&self) -> &[BufferId] {
        &self.order
    }

    /// Canonical buffers touched by the ops under `node`.
    pub fn under(&self, tree: &Tree, node: NodeId) -> SmallVec<[BufferId; 8]> {
        let mut out = SmallVec::new();
        for op in tree.ops_under(node) {
            for buffer in tree.op(op).into_iter().flat_map(OpNode::buffers) {
                let c = self.canonical(buffer);
                if !out.contains(&c) {
                    out.push(c);
                }
            }
        }
        out
    }
}

fn has_unlinked_consumer(tree: &Tree, producer: OpId) -> bool {
    tree.ops().any(|c| c.deps.iter().any(|d| d.producer == producer) && !tree.share_tile(producer, c.op))
}

/// Variables of one tile node, one entry per dimension.
#[derive(Debug, Clone)]
pub struct TileVars {
    pub level: usize,
    pub vars: SmallVec<[IntVar; 4]>,
    pub sizes: SmallVec<[Expr; 4]>,
    /// Own tile size times the related enclosing forward extent.
    pub forward: SmallVec<[Expr; 4]>,
}

/// A buffer staged at a tile node: per-iteration footprint and refill count.
#[derive(Debug, Clone)]
pub struct Stage {
    pub shape: SmallVec<[Expr; 4]>,
    /// Bytes.
    pub size: Expr,
    /// Own dimensions the footprint depends on.
    pub mask: SmallVec<[bool; 4]>,
    pub fills: Expr,
    pub elem: ElemType,
}

/// "Buffer is materialized at memory level `level` at `node`."
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub node: NodeId,
    pub buffer: BufferId,
    pub level: usize,
    pub var: IntVar,
    pub expr: Expr,
}

pub struct SolverContext {
    pub model: Model,
    pub buffers: BufferTable,
    pub tiles: HashMap<NodeId, TileVars>,
    pub stages: HashMap<(NodeId, BufferId), Stage>,
    pub placements: Vec<Placement>,
    /// Full-domain tensor shape of every buffer slot.
    pub full_shapes: HashMap<BufferId, SmallVec<[i64; 4]>>,
    /// Tile nodes in creation (pre-)order.
    tile_order: Vec<NodeId>,
}

impl SolverContext {
    pub fn new(tree: &Tree) -> Self {
        Self {
            model: Model::new(),
            buffers: BufferTable::new(tree),
            tiles: HashMap::new(),
            stages: HashMap::new(),
            placements: Vec::new(),
            full_shapes: HashMap::new(),
            tile_order: Vec::new(),
        }
    }

    pub fn tile_vars(&self, node: NodeId) -> Result<&TileVars> {
        self.tiles.get(&node).ok_or_else(|| Error::InternalConsistency { reason: format!("no tile variables for {node:?}") })
    }

    pub fn stage(&self, node: NodeId, buffer: BufferId) -> Result<&Stage> {
        self.stages
            .get(&(node, buffer))
            .ok_or_else(|| Error::InternalConsistency { reason: format!("{buffer} is not staged at {node:?}") })
    }

    pub fn placement(&self, node: NodeId, buffer: BufferId, level: usize) -> Option<&Placement> {
        self.placements.iter().find(|p| p.node == node && p.buffer == buffer && p.level == level)
    }

    fn op<'t>(tree: &'t Tree, op: OpId) -> Result<&'t OpNode> {
        tree.op(op).ok_or_else(|| Error::InternalConsistency { reason: format!("{op} has no op node") })
    }

    fn add_tile(&mut self, tree: &Tree, id: NodeId, tile: &TileNode, target: &TargetOptions) -> Result<()> {
        let op = Self::op(tree, tile.op)?;
        let parent = tree.parent_tile(id);
        let parent_dims = tree.parent_dims(id);
        let granularity = target.hints_for(op.primitive).granularity;

        let mut vars = TileVars { level: tile.level, vars: SmallVec::new(), sizes: SmallVec::new(), forward: SmallVec::new() };
        for (k, name) in tile.dims.iter().enumerate() {
            let bound = op.bounds[k];
            let mut domain = divisors(bound);
            if tile.level == 0 && k + 1 == op.num_dims() && granularity > 1 && bound % granularity == 0 {
                domain.retain(|t| *t % granularity == 0);
            }
            let var = self
                .model
                .new_int_var(domain, format!("t[{}.L{}.{name}]", tile.op, tile.level))
                .context(ModelSnafu)?;
            let size = self.model.var(var);
            let forward = match (parent, parent_dims.get(k).copied().flatten()) {
                (Some(p), Some(pk)) => {
                    let outer = self.tile_vars(p)?.forward[pk];
                    self.model.product([size, outer])
                }
                _ => size,
            };
            vars.vars.push(var);
            vars.sizes.push(size);
            vars.forward.push(forward);
        }
        self.tiles.insert(id, vars);
        self.tile_order.push(id);
        Ok(())
    }

    fn add_placements(&mut self, tree: &Tree, id: NodeId, tile: &TileNode) {
        for buffer in self.buffers.under(tree, id) {
            for level in (0..=tile.level).rev() {
                let var = self.model.new_bool_var(format!("p[{buffer}@{}.L{}.s{level}]", tile.op, tile.level));
                let expr = self.model.var(var);
                self.placements.push(Placement { node: id, buffer, level, var, expr });
            }
        }
    }

    /// Per-iteration extent of each dimension of `op` at `node`: the product
    /// of the tile sizes of `op`'s tiles strictly below `node`.
    fn region(&mut self, tree: &Tree, node: NodeId, op: &OpNode) -> Result<SmallVec<[Expr; 4]>> {
        let mut factors: SmallVec<[SmallVec<[Expr; 4]>; 4]> = SmallVec::from_elem(SmallVec::new(), op.num_dims());
        for tile in tree.chain(op.op) {
            if tile == node || !tree.is_ancestor(node, tile) {
                continue;
            }
            let related = tree.related_dims(op.op, tile).context(TreeSnafu)?;
            let vars = self.tile_vars(tile)?;
            for (d, k) in related.iter().enumerate() {
                if let Some(k) = *k {
                    factors[d].push(vars.sizes[k]);
                }
            }
        }
        Ok(factors.into_iter().map(|f| self.model.product(f)).collect())
    }

    fn add_stages(&mut self, tree: &Tree, id: NodeId, tile: &TileNode) -> Result<()> {
        let parent = tree.parent_tile(id);
        let parent_dims = tree.parent_dims(id);
        let mut regions: HashMap<OpId, SmallVec<[Expr; 4]>> = HashMap::new();
        let under = tree.ops_under(id);

        for buffer in self.buffers.under(tree, id) {
            let accessors: SmallVec<[(OpId, Slot); 2]> =
                self.buffers.accessors(buffer).iter().copied().filter(|(o, _)| under.contains(o)).collect();
            let mut shape_terms: SmallVec<[SmallVec<[Expr; 2]>; 4]> = SmallVec::new();
            let mut mask: SmallVec<[bool; 4]> = SmallVec::from_elem(false, tile.num_dims());
            let mut elem = None;

            for &(o, slot) in &accessors {
                let op = Self::op(tree, o)?;
                elem.get_or_insert(op.elem);
                let region = match regions.get(&o) {
                    Some(r) => r.clone(),
                    None => {
                        let r = self.region(tree, id, op)?;
                        regions.insert(o, r.clone());
                        r
                    }
                };
                let access = op.access(slot);
                if shape_terms.is_empty() {
                    shape_terms.resize(access.num_results(), SmallVec::new());
                }
                for (j, row) in access.results().iter().enumerate() {
                    let extent = footprint(&mut self.model, row, &region).context(ModelSnafu)?;
                    if let Some(terms) = shape_terms.get_mut(j) {
                        terms.push(extent);
                    }
                }
                let related = tree.related_dims(o, id).context(TreeSnafu)?;
                for (d, k) in related.iter().enumerate() {
                    let used = access.results().iter().any(|r| r.coeff(d) != 0);
                    if let (Some(k), true) = (*k, used) {
                        mask[k] = true;
                    }
                }
            }

            let elem = elem.ok_or_else(|| Error::InternalConsistency { reason: format!("{buffer} has no accessor") })?;
            let shape: SmallVec<[Expr; 4]> = shape_terms.into_iter().map(|t| self.model.max(t)).collect();
            let elements = self.model.product(shape.iter().copied());
            let size = self.model.scale(elements, elem.bytes()).context(ModelSnafu)?;

            let vars = self.tile_vars(id)?;
            let mut fill_factors: SmallVec<[Expr; 4]> = SmallVec::new();
            for (k, &used) in mask.iter().enumerate() {
                if used {
                    fill_factors.push(vars.forward[k]);
                } else if let (Some(p), Some(pk)) = (parent, parent_dims.get(k).copied().flatten()) {
                    fill_factors.push(self.tile_vars(p)?.forward[pk]);
                }
            }
            let fills = self.model.product(fill_factors);

            self.stages.insert((id, buffer), Stage { shape, size, mask, fills, elem });
        }
        Ok(())
    }

    /// Placements first (top-down, 1 before 0), then tile sizes from the
    /// innermost level outwards, largest first.
    fn set_branch_order(&mut self) {
        let mut order: Vec<IntVar> = self.placements.iter().map(|p| p.var).collect();
        let mut tiles: Vec<(usize, NodeId)> = self.tile_order.iter().map(|&n| (self.tiles[&n].level, n)).collect();
        tiles.sort_by_key(|&(level, _)| level);
        for (_, node) in tiles {
            order.extend(self.tiles[&node].vars.iter().copied());
        }
        self.model.set_branch_order(order);
    }
}

/// Divisors of `n`, largest first.
pub fn divisors(n: i64) -> Vec<i64> {
    let mut high = Vec::new();
    let mut low = Vec::new();
    let mut d = 1i64;
    while d <= n / d {
        if n % d == 0 {
            low.push(d);
            if d != n / d {
                high.push(n / d);
            }
        }
        d += 1;
    }
    high.extend(low.into_iter().rev());
    high
}

/// `Σ |cᵢ|·(regionᵢ − 1) + 1` as a model expression.
fn footprint(model: &mut Model, row: &AffineExpr, region: &[Expr]) -> strata_cp::Result<Expr> {
    let mut terms: SmallVec<[Expr; 4]> = SmallVec::new();
    let mut base = 1;
    for (d, &c) in row.coeffs().iter().enumerate() {
        if c == 0 {
            continue;
        }
        terms.push(model.scale(region[d], c.abs())?);
        base -= c.abs();
    }
    if terms.is_empty() {
        return Ok(model.constant(1));
    }
    if base != 0 {
        terms.push(model.constant(base));
    }
    Ok(model.sum(terms))
}

struct Initializer<'t> {
    target: &'t TargetOptions,
}

impl<'c> Visitor<&'c mut SolverContext> for Initializer<'_> {
    type Output = Result<()>;

    fn visit_scope(&mut self, tree: &Tree, _: NodeId, scope: &ScopeNode, ctx: &'c mut SolverContext) -> Result<()> {
        for &child in &scope.children {
            tree.accept(child, self, &mut *ctx)?;
        }
        Ok(())
    }

    fn visit_tile(&mut self, tree: &Tree, id: NodeId, tile: &TileNode, ctx: &'c mut SolverContext) -> Result<()> {
        ctx.add_tile(tree, id, tile, self.target)?;
        ctx.add_placements(tree, id, tile);
        tree.accept(tile.child, self, &mut *ctx)?;
        ctx.add_stages(tree, id, tile)
    }

    fn visit_op(&mut self, _: &Tree, _: NodeId, op: &OpNode, ctx: &'c mut SolverContext) -> Result<()> {
        for buffer in op.buffers() {
            ctx.full_shapes.insert(buffer, op.full_shape(buffer.slot));
        }
        Ok(())
    }
}

/// Create every variable and derived expression for `tree`.
#[tracing::instrument(skip_all, fields(nodes = tree.len()))]
pub fn initialize(tree: &Tree, target: &TargetOptions) -> Result<SolverContext> {
    let mut ctx = SolverContext::new(tree);
    tree.accept(tree.root(), &mut Initializer { target }, &mut ctx)?;
    ctx.set_branch_order();
    tracing::debug!(
        vars = ctx.model.num_vars(),
        exprs = ctx.model.num_exprs(),
        placements = ctx.placements.len(),
        "solver context initialized"
    );
    Ok(ctx)
}
