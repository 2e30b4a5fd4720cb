//! Solved tile tree to nested-loop program.
//!
//! Lowering walks the tree once. A tile opens one loop per dimension with
//! the solved tile size as trip count, then binds every buffer placed at it.
//! When the nearest enclosing holder already lives at the same memory level
//! the binding is a zero-copy view into it; otherwise a local buffer is
//! allocated, filled from the holder, and copied back out after the subtree
//! if anything below writes it. An op reads and writes single-element views
//! of the innermost holder of each of its buffers. Fused intermediates have
//! no main-memory holder: their outermost placement is allocated empty and
//! never copied out.

use std::collections::HashMap;

use smallvec::SmallVec;
use snafu::ResultExt;
use strata_ir::{
    BufferDecl, BufferId, Emit, IndexExpr, LoopVar, MemSpace, NodeId, OpNode, Param, ParamDir, Proc, ProcBuilder,
    ScopeNode, Slot, TileNode, Tree, Value, Visitor,
};

use crate::error::*;
use crate::init::BufferTable;
use crate::solve::Solution;

/// Where a buffer currently lives.
#[derive(Debug, Clone)]
struct Holder {
    name: String,
    /// Staging node, `None` for main memory.
    node: Option<NodeId>,
    space: MemSpace,
}

struct Lowering<'a, E> {
    solution: &'a Solution,
    emit: &'a mut E,
    /// Per canonical buffer, innermost holder last.
    holders: HashMap<BufferId, Vec<Holder>>,
    /// Open loops, outermost first.
    loops: Vec<(NodeId, usize, LoopVar)>,
    next_local: usize,
}

fn missing(what: String) -> Error {
    Error::InternalConsistency { reason: what }
}

impl<E: Emit> Lowering<'_, E> {
    fn loop_var(&self, node: NodeId, dim: usize) -> Option<LoopVar> {
        self.loops.iter().find(|(n, d, _)| *n == node && *d == dim).map(|&(_, _, v)| v)
    }

    /// Index of `op`'s point within the block staged at `holder`, per op
    /// dimension: open loops of the op's chain strictly below the holder,
    /// each scaled by the tile sizes below it.
    fn local_point(&self, tree: &Tree, op: &OpNode, holder: Option<NodeId>) -> Result<SmallVec<[IndexExpr; 4]>> {
        let mut point: SmallVec<[IndexExpr; 4]> = SmallVec::from_elem(IndexExpr::default(), op.num_dims());
        let mut stride: SmallVec<[i64; 4]> = SmallVec::from_elem(1, op.num_dims());
        // Innermost first, so each tile's stride is the product of the sizes below it.
        for tile in tree.chain(op.op) {
            if holder.is_some_and(|h| h == tile || !tree.is_ancestor(h, tile)) {
                break;
            }
            let related = tree.related_dims(op.op, tile).context(TreeSnafu)?;
            for (d, k) in related.iter().enumerate() {
                let Some(k) = *k else { continue };
                if let Some(var) = self.loop_var(tile, k) {
                    point[d].add_term(var, stride[d]);
                }
                let size = self.solution.tile_size(tile, k).ok_or_else(|| missing(format!("no tile size for {tile:?}")))?;
                stride[d] *= size;
            }
        }
        Ok(point)
    }

    /// Tensor offsets of `op`'s `slot` access within `holder`.
    fn offsets(&self, tree: &Tree, op: &OpNode, slot: Slot, holder: &Holder) -> Result<SmallVec<[IndexExpr; 4]>> {
        let point = self.local_point(tree, op, holder.node)?;
        Ok(op
            .access(slot)
            .results()
            .iter()
            .map(|row| {
                let mut index = IndexExpr::constant(if holder.node.is_none() { row.offset() } else { 0 });
                for (d, &c) in row.coeffs().iter().enumerate() {
                    index.add(&point[d].scaled(c));
                }
                index
            })
            .collect())
    }

    fn innermost(&self, buffer: BufferId) -> Option<&Holder> {
        self.holders.get(&buffer).and_then(|stack| stack.last())
    }

    fn holder(&self, buffer: BufferId) -> Result<&Holder> {
        self.innermost(buffer).ok_or_else(|| missing(format!("{buffer} has no holder")))
    }

    /// First accessor of `buffer` under `node`, used to position its block.
    fn representative<'t>(&self, tree: &'t Tree, node: NodeId, buffer: BufferId) -> Result<(&'t OpNode, Slot)> {
        let under = tree.ops_under(node);
        self.solution
            .buffers()
            .accessors(buffer)
            .iter()
            .find(|(o, _)| under.contains(o))
            .and_then(|&(o, slot)| tree.op(o).map(|op| (op, slot)))
            .ok_or_else(|| missing(format!("{buffer} has no accessor under {node:?}")))
    }

    /// Bind every buffer placed at `id`; returns `(buffer, name, is_view)`.
    fn stage(&mut self, tree: &Tree, id: NodeId, tile: &TileNode) -> Result<SmallVec<[(BufferId, String, bool); 4]>> {
        let mut staged = SmallVec::new();
        let placed: SmallVec<[_; 4]> = self.solution.placements_at(id).copied().collect();
        for p in placed {
            let shape: SmallVec<[i64; 4]> = self
                .solution
                .buffer_shape(id, p.buffer)
                .ok_or_else(|| missing(format!("{} is not staged at {:?}", p.buffer, id)))?
                .into();
            let (op, slot) = self.representative(tree, id, p.buffer)?;
            let name = format!("{}_l{}_{}", p.buffer, p.level, self.next_local);
            self.next_local += 1;
            let space = MemSpace::Level(p.level);
            let outer = self.innermost(p.buffer).cloned();
            let is_view = outer.as_ref().is_some_and(|h| h.space == space);

            match outer {
                Some(outer) if is_view => {
                    let offsets = self.offsets(tree, op, slot, &outer)?;
                    let view = self.emit.emit_subview(&outer.name, offsets, shape);
                    self.emit.emit_let(&name, view);
                }
                outer => {
                    let (reads, writes) = accesses_under(tree, self.solution, id, p.buffer);
                    // Without a holder the data must be produced inside this tile.
                    if outer.is_none() && !writes {
                        return Err(missing(format!("{} has no holder at {id:?}", p.buffer)));
                    }
                    let decl = BufferDecl { name: name.clone(), elem: op.elem, shape: shape.clone(), space };
                    self.emit.emit_alloc(decl);
                    if let Some(outer) = outer.filter(|_| reads && !writes) {
                        let offsets = self.offsets(tree, op, slot, &outer)?;
                        let src = self.emit.emit_subview(&outer.name, offsets, shape);
                        self.emit.emit_copy(Value::Buffer(name.clone()), src);
                    }
                }
            }
            self.holders.entry(p.buffer).or_default().push(Holder { name: name.clone(), node: Some(id), space });
            staged.push((p.buffer, name, is_view));
        }
        tracing::trace!(op = %tile.op, level = tile.level, staged = staged.len(), "tile lowered");
        Ok(staged)
    }

    fn unstage(&mut self, tree: &Tree, id: NodeId, staged: SmallVec<[(BufferId, String, bool); 4]>) -> Result<()> {
        for (buffer, name, is_view) in staged.into_iter().rev() {
            if let Some(stack) = self.holders.get_mut(&buffer) {
                stack.pop();
            }
            let (_, writes) = accesses_under(tree, self.solution, id, buffer);
            if is_view || !writes {
                continue;
            }
            // The outermost stage of a fused intermediate.
            let Some(outer) = self.innermost(buffer).cloned() else { continue };
            let (op, slot) = self.representative(tree, id, buffer)?;
            let offsets = self.offsets(tree, op, slot, &outer)?;
            let shape: SmallVec<[i64; 4]> =
                self.solution.buffer_shape(id, buffer).map(SmallVec::from).unwrap_or_default();
            let dst = self.emit.emit_subview(&outer.name, offsets, shape);
            self.emit.emit_copy(dst, Value::Buffer(name));
        }
        Ok(())
    }
}

fn accesses_under(tree: &Tree, solution: &Solution, node: NodeId, buffer: BufferId) -> (bool, bool) {
    let under = tree.ops_under(node);
    let mut reads = false;
    let mut writes = false;
    for (o, slot) in solution.buffers().accessors(buffer) {
        if under.contains(o) {
            match slot {
                Slot::Input(_) => reads = true,
                Slot::Output => writes = true,
            }
        }
    }
    (reads, writes)
}

impl<E: Emit> Visitor<()> for Lowering<'_, E> {
    type Output = Result<()>;

    fn visit_scope(&mut self, tree: &Tree, _: NodeId, scope: &ScopeNode, _: ()) -> Result<()> {
        for &child in &scope.children {
            tree.accept(child, self, ())?;
        }
        Ok(())
    }

    fn visit_tile(&mut self, tree: &Tree, id: NodeId, tile: &TileNode, _: ()) -> Result<()> {
        for (k, dim) in tile.dims.iter().enumerate() {
            let trip = self.solution.tile_size(id, k).ok_or_else(|| missing(format!("no tile size for {id:?}")))?;
            let var = self.emit.emit_loop(dim, trip);
            self.loops.push((id, k, var));
        }
        let staged = self.stage(tree, id, tile)?;
        tree.accept(tile.child, self, ())?;
        self.unstage(tree, id, staged)?;
        for _ in 0..tile.num_dims() {
            self.loops.pop();
            self.emit.close_loop();
        }
        Ok(())
    }

    fn visit_op(&mut self, tree: &Tree, _: NodeId, op: &OpNode, _: ()) -> Result<()> {
        let mut operands = Vec::with_capacity(op.inputs.len() + 1);
        for slot in (0..op.inputs.len()).map(Slot::Input).chain([Slot::Output]) {
            let buffer = BufferId { op: op.op, slot };
            let holder = self.holder(self.solution.buffers().canonical(buffer))?.clone();
            let offsets = self.offsets(tree, op, slot, &holder)?;
            let extents = SmallVec::from_elem(1, op.access(slot).num_results());
            let view = self.emit.emit_subview(&holder.name, offsets, extents);
            let name = format!("{buffer}_v");
            self.emit.emit_let(&name, view);
            operands.push(name);
        }
        self.emit.emit_compute(&op.name, op.primitive, operands);
        Ok(())
    }
}

/// Parameters (external inputs, then group outputs) and main-memory
/// backing for every other op output that is resident.
fn declare_storage<E: Emit>(tree: &Tree, buffers: &BufferTable, emit: &mut E) -> HashMap<BufferId, String> {
    let mut names = HashMap::new();
    for op in tree.ops() {
        for slot in (0..op.inputs.len()).filter(|&i| op.producer_of(i).is_none()).map(Slot::Input) {
            let buffer = BufferId { op: op.op, slot };
            emit.emit_param(Param { name: buffer.to_string(), elem: op.elem, shape: op.full_shape(slot), dir: ParamDir::In });
            names.insert(buffer, buffer.to_string());
        }
    }
    for op in tree.ops().filter(|op| op.is_output) {
        let buffer = BufferId::output(op.op);
        emit.emit_param(Param {
            name: buffer.to_string(),
            elem: op.elem,
            shape: op.full_shape(Slot::Output),
            dir: ParamDir::Out,
        });
        names.insert(buffer, buffer.to_string());
    }
    for op in tree.ops().filter(|op| !op.is_output && buffers.is_resident(BufferId::output(op.op))) {
        let buffer = BufferId::output(op.op);
        emit.emit_alloc(BufferDecl {
            name: buffer.to_string(),
            elem: op.elem,
            shape: op.full_shape(Slot::Output),
            space: MemSpace::Resident,
        });
        names.insert(buffer, buffer.to_string());
    }
    names
}

/// Lower `tree` under `solution` through `emit`.
#[tracing::instrument(skip_all, fields(ops = tree.num_ops()))]
pub fn lower_into<E: Emit>(tree: &Tree, solution: &Solution, emit: &mut E) -> Result<()> {
    let storage = declare_storage(tree, solution.buffers(), emit);
    let mut holders: HashMap<BufferId, Vec<Holder>> = HashMap::new();
    for &buffer in solution.buffers().canonical_buffers() {
        let backing = solution.buffers().storage(buffer);
        if let Some(name) = storage.get(&backing) {
            holders.insert(buffer, vec![Holder { name: name.clone(), node: None, space: MemSpace::Resident }]);
        }
    }

    let mut lowering = Lowering { solution, emit, holders, loops: Vec::new(), next_local: 0 };
    tree.accept(tree.root(), &mut lowering, ())
}

/// Lower `tree` under `solution` into a [`Proc`] named `name`.
pub fn lower(tree: &Tree, solution: &Solution, name: &str) -> Result<Proc> {
    let mut builder = ProcBuilder::new(name);
    lower_into(tree, solution, &mut builder)?;
    tracing::debug!(depth = builder.depth(), "lowering finished");
    Ok(builder.finish())
}
