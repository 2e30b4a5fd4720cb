//! Fused group to initial, fully unfused tile tree.

use itertools::Itertools;
use snafu::{ResultExt, ensure};
use strata_affine::AffineMap;
use strata_ir::{Body, Dep, FusedGroup, Node, OpId, OpNode, TileNode, Tree};

use crate::error::*;

/// Build the unfused tree for `group` tiled over `levels` memory levels.
///
/// Ops are numbered producers-first. Each op gets a chain of `levels` tiles,
/// outermost (`levels - 1`) to innermost (`0`), each with an identity
/// relation and the op's dimension names. All chains are siblings under the
/// root scope.
#[tracing::instrument(skip_all, fields(ops = group.ops.len(), levels))]
pub fn build(group: &FusedGroup, levels: usize) -> Result<Tree> {
    ensure!(levels > 0, NoLevelsSnafu);
    group.validate().context(InvalidGroupSnafu)?;
    let order = group.topo_order().context(InvalidGroupSnafu)?;

    let mut ids = vec![OpId(0); group.ops.len()];
    for (k, &i) in order.iter().enumerate() {
        ids[i] = OpId(k as u32);
    }

    let mut tree = Tree::new(levels);
    for &i in &order {
        let desc = &group.ops[i];
        let primitive = match &desc.body {
            Body::Primitive(p) => *p,
            Body::Opaque(body) => return UnrecognizedBodySnafu { op: desc.name.clone(), body: body.clone() }.fail(),
        };
        let deps = group
            .deps
            .iter()
            .filter(|d| d.consumer == i)
            .map(|d| Dep { slot: d.slot, producer: ids[d.producer] })
            .sorted_by_key(|d| d.slot)
            .collect();
        let op = OpNode {
            op: ids[i],
            name: desc.name.clone(),
            dims: desc.dims.clone(),
            bounds: desc.bounds.clone(),
            inputs: desc.inputs.clone(),
            output: desc.output.clone(),
            deps,
            primitive,
            elem: desc.elem,
            is_output: group.is_output(i),
        };

        let mut below = tree.insert(Node::Op(op));
        for level in 0..levels {
            below = tree.insert(Node::Tile(TileNode {
                op: ids[i],
                level,
                dims: desc.dims.clone(),
                relation: AffineMap::identity(desc.num_dims()),
                child: below,
            }));
        }
        tree.push_child(tree.root(), below).context(TreeSnafu)?;
        tracing::trace!(op = %ids[i], name = %desc.name, "op chain built");
    }

    tracing::debug!(nodes = tree.len(), "tile tree built");
    Ok(tree)
}
