//! Producer/consumer loop-nest fusion.
//!
//! `merge(consumer, producer, level)` moves the producer's tiles below
//! `level` inside the consumer's tile at `level`, so both ops share every
//! loop from `level` outwards. The producer's coordinates are then derived
//! from the consumer's through `R = W⁻¹ ∘ A` (consumer read map `A`,
//! producer write map `W` inverted over the producer domain). Fusion is only
//! legal when `R` is a projected permutation: each producer dimension follows
//! exactly one consumer dimension with unit stride, so every consumer tile
//! reads exactly the producer tile computed alongside it.

use smallvec::SmallVec;
use snafu::{ResultExt, Snafu, ensure};
use strata_affine::AffineMap;
use strata_ir::{Node, NodeId, OpId, ScopeNode, Tree};

#[derive(Debug, Snafu)]
enum Rejection {
    #[snafu(display("level 0 has no tile below the producer to carry the relation"))]
    InnermostLevel,

    #[snafu(display("an op cannot be merged into itself"))]
    SameOp,

    #[snafu(display("{op} has no tile at level {level}"))]
    NoTile { op: OpId, level: usize },

    #[snafu(display("producer and consumer tiles are not adjacent siblings"))]
    NotAdjacent,

    #[snafu(display("consumer does not read the producer"))]
    NoDependence,

    #[snafu(display("producer write map is not invertible: {source}"))]
    NotInvertible { source: strata_affine::AffineError },

    #[snafu(display("relation composition failed: {source}"))]
    Compose { source: strata_affine::AffineError },

    #[snafu(display("reads of the producer disagree on the relation"))]
    InconsistentReads,

    #[snafu(display("relation {relation} is not a projected permutation"))]
    NotProjectedPermutation { relation: AffineMap },

    #[snafu(display("restructuring failed: {source}"))]
    Restructure { source: strata_ir::Error },
}

struct Plan {
    scope: NodeId,
    producer_tile: NodeId,
    consumer_tile: NodeId,
    relation: AffineMap,
}

/// Fuse `producer` into `consumer` at `level`.
///
/// Returns `false` and leaves the tree untouched when the tiles are not
/// adjacent siblings, the consumer does not read the producer, or the
/// relation is not a projected permutation.
#[tracing::instrument(skip_all, fields(%consumer, %producer, level))]
pub fn merge(tree: &mut Tree, consumer: OpId, producer: OpId, level: usize) -> bool {
    let merged = plan(tree, consumer, producer, level).and_then(|plan| {
        let mut next = tree.clone();
        apply(&mut next, &plan)?;
        Ok(next)
    });
    match merged {
        Ok(next) => {
            *tree = next;
            tracing::debug!("merged");
            true
        }
        Err(reason) => {
            tracing::debug!(%reason, "merge rejected");
            false
        }
    }
}

fn tile_at(tree: &Tree, op: OpId, level: usize) -> Result<NodeId, Rejection> {
    tree.chain(op)
        .into_iter()
        .find(|&t| tree.tile(t).is_some_and(|tile| tile.op == op && tile.level == level))
        .ok_or(Rejection::NoTile { op, level })
}

fn plan(tree: &Tree, consumer: OpId, producer: OpId, level: usize) -> Result<Plan, Rejection> {
    ensure!(level > 0, InnermostLevelSnafu);
    ensure!(consumer != producer, SameOpSnafu);
    let producer_tile = tile_at(tree, producer, level)?;
    let consumer_tile = tile_at(tree, consumer, level)?;

    let scope = tree.parent(producer_tile).ok_or(Rejection::NotAdjacent)?;
    ensure!(tree.parent(consumer_tile) == Some(scope), NotAdjacentSnafu);
    let siblings = tree.scope(scope).ok_or(Rejection::NotAdjacent)?;
    let adjacent = siblings.children.windows(2).any(|w| w[0] == producer_tile && w[1] == consumer_tile);
    ensure!(adjacent, NotAdjacentSnafu);

    let (Some(c), Some(p)) = (tree.op(consumer), tree.op(producer)) else {
        return NoDependenceSnafu.fail();
    };
    let slots: SmallVec<[usize; 2]> = c.deps.iter().filter(|d| d.producer == producer).map(|d| d.slot).collect();
    ensure!(!slots.is_empty(), NoDependenceSnafu);

    let write_inv = p.output.invert(&p.bounds).context(NotInvertibleSnafu)?;
    let mut relation: Option<AffineMap> = None;
    for slot in slots {
        let r = write_inv.compose(&c.inputs[slot]).context(ComposeSnafu)?;
        match &relation {
            Some(prev) => ensure!(*prev == r, InconsistentReadsSnafu),
            None => relation = Some(r),
        }
    }
    let relation = relation.ok_or(Rejection::NoDependence)?;
    ensure!(relation.is_projected_permutation(), NotProjectedPermutationSnafu { relation });

    tracing::trace!(%relation, "merge relation");
    Ok(Plan { scope, producer_tile, consumer_tile, relation })
}

fn apply(tree: &mut Tree, plan: &Plan) -> Result<(), Rejection> {
    let inner = tree.tile(plan.producer_tile).map(|t| t.child).ok_or(Rejection::NotAdjacent)?;
    let consumer_child = tree.tile(plan.consumer_tile).map(|t| t.child).ok_or(Rejection::NotAdjacent)?;

    // Detach the producer tile; its subtree moves below.
    if let Node::Scope(s) = tree.node_mut(plan.scope) {
        s.children.retain(|&c| c != plan.producer_tile);
    }
    tree.remove(plan.producer_tile);

    let spliced: Vec<NodeId> = match tree.scope(inner) {
        Some(s) => {
            let children = s.children.clone();
            tree.remove(inner);
            children
        }
        None => vec![inner],
    };

    for &top in &spliced {
        if let Node::Tile(t) = tree.node_mut(top) {
            t.relation = t.relation.compose(&plan.relation).context(ComposeSnafu)?;
        }
    }

    if let Node::Scope(s) = tree.node_mut(consumer_child) {
        s.children.splice(0..0, spliced.iter().copied());
        for &c in &spliced {
            tree.set_parent(c, Some(consumer_child));
        }
    } else {
        let mut children = spliced;
        children.push(consumer_child);
        let scope = tree.insert(Node::Scope(ScopeNode { children }));
        tree.set_parent(scope, Some(plan.consumer_tile));
        if let Node::Tile(t) = tree.node_mut(plan.consumer_tile) {
            t.child = scope;
        }
    }

    tree.collapse_scopes();
    tree.validate().context(RestructureSnafu)
}
