use smallvec::{SmallVec, smallvec};
use strata_affine::AffineMap;

use crate::{ElemType, Error, Node, NodeId, OpId, OpNode, Primitive, ScopeNode, Snapshot, TileNode, Tree};

fn op_node(op: u32, bounds: &[i64]) -> OpNode {
    let n = bounds.len();
    OpNode {
        op: OpId(op),
        name: format!("e{op}"),
        dims: (0..n).map(|d| format!("d{d}")).collect(),
        bounds: SmallVec::from_slice(bounds),
        inputs: smallvec![AffineMap::identity(n)],
        output: AffineMap::identity(n),
        deps: SmallVec::new(),
        primitive: Primitive::Elementwise,
        elem: ElemType::F32,
        is_output: true,
    }
}

fn tile(op: u32, level: usize, dims: usize, child: NodeId) -> Node {
    Node::Tile(TileNode {
        op: OpId(op),
        level,
        dims: (0..dims).map(|d| format!("d{d}")).collect(),
        relation: AffineMap::identity(dims),
        child,
    })
}

/// One chain of `levels` tiles per op, as siblings under the root.
fn unfused(levels: usize, ops: &[&[i64]]) -> (Tree, Vec<Vec<NodeId>>) {
    let mut tree = Tree::new(levels);
    let mut chains = Vec::new();
    for (i, bounds) in ops.iter().enumerate() {
        let mut below = tree.insert(Node::Op(op_node(i as u32, bounds)));
        let mut chain = Vec::new();
        for level in 0..levels {
            below = tree.insert(tile(i as u32, level, bounds.len(), below));
            chain.push(below);
        }
        tree.push_child(tree.root(), below).unwrap();
        chains.push(chain);
    }
    (tree, chains)
}

#[test]
fn test_unfused_tree_is_valid() {
    let (tree, chains) = unfused(2, &[&[8, 8], &[8]]);
    tree.validate().unwrap();
    assert_eq!(tree.num_ops(), 2);
    assert_eq!(tree.children(tree.root()).len(), 2);
    assert_eq!(tree.chain(OpId(0)).as_slice(), chains[0].as_slice());
    assert!(!tree.share_tile(OpId(0), OpId(1)));
    assert_eq!(tree.ops().map(|o| o.op).collect::<Vec<_>>(), vec![OpId(0), OpId(1)]);
    assert_eq!(tree.pre_order().len(), tree.len());
}

#[test]
fn test_display() {
    let (tree, _) = unfused(2, &[&[8, 4]]);
    let text = tree.to_string();
    assert!(text.starts_with("scope\n"));
    assert!(text.contains("  tile op0 L1 [d0, d1] (d0, d1) -> (d0, d1)"));
    assert!(text.contains("      op op0 'e0' elementwise f32 [8, 4]"));
}

#[test]
fn test_snapshot_tracks_structure() {
    let (mut tree, chains) = unfused(2, &[&[8]]);
    let before = tree.snapshot();
    assert_eq!(tree.clone().snapshot(), before);
    let Snapshot::Scope(children) = &before else { panic!("root must be a scope") };
    assert_eq!(children.len(), 1);

    if let Node::Tile(t) = tree.node_mut(chains[0][1]) {
        t.dims[0] = "renamed".to_string();
    }
    assert_ne!(tree.snapshot(), before);
}

/// Nest op1's level-0 tile next to op0's inside op0's level-1 tile, reading
/// op0's domain transposed.
fn nested() -> (Tree, Vec<Vec<NodeId>>) {
    let (mut tree, chains) = unfused(2, &[&[4, 8], &[8, 4]]);
    let (c1, c0) = (chains[0][1], chains[0][0]);
    let (p1, p0) = (chains[1][1], chains[1][0]);

    let root = tree.root();
    if let Node::Scope(s) = tree.node_mut(root) {
        s.children.retain(|&c| c != p1);
    }
    tree.remove(p1);
    let scope = tree.insert(Node::Scope(ScopeNode { children: vec![p0, c0] }));
    tree.set_parent(scope, Some(c1));
    if let Node::Tile(t) = tree.node_mut(c1) {
        t.child = scope;
    }
    if let Node::Tile(t) = tree.node_mut(p0) {
        t.relation = AffineMap::projection(2, &[1, 0]).unwrap();
    }
    (tree, chains)
}

#[test]
fn test_nested_domain_map() {
    let (tree, chains) = nested();
    tree.validate().unwrap();
    assert!(tree.share_tile(OpId(0), OpId(1)));
    assert!(tree.is_ancestor(chains[0][1], tree.op_node(OpId(1)).unwrap()));

    let map = tree.domain_map(OpId(1), chains[0][1]).unwrap();
    assert_eq!(map, AffineMap::projection(2, &[1, 0]).unwrap());
    assert_eq!(tree.related_dims(OpId(1), chains[0][1]).unwrap().as_slice(), &[Some(1), Some(0)]);
    assert_eq!(tree.parent_dims(chains[1][0]).as_slice(), &[Some(1), Some(0)]);
    assert_eq!(tree.ops_under(chains[0][1]).as_slice(), &[OpId(1), OpId(0)]);

    // Not an enclosing tile.
    assert!(matches!(tree.domain_map(OpId(0), chains[1][0]), Err(Error::TreeInvariant { .. })));
}

#[test]
fn test_collapse_single_child_scope() {
    let (mut tree, chains) = unfused(2, &[&[8]]);
    let (t1, t0) = (chains[0][1], chains[0][0]);
    let scope = tree.insert(Node::Scope(ScopeNode { children: vec![t0] }));
    tree.set_parent(scope, Some(t1));
    if let Node::Tile(t) = tree.node_mut(t1) {
        t.child = scope;
    }
    assert!(tree.validate().is_err());

    tree.collapse_scopes();
    tree.validate().unwrap();
    assert_eq!(tree.children(t1), &[t0]);
    assert!(!tree.contains(scope));
}

#[test]
fn test_validate_rejects_bad_relation() {
    let (mut tree, chains) = unfused(2, &[&[8, 8]]);
    if let Node::Tile(t) = tree.node_mut(chains[0][0]) {
        t.relation = AffineMap::identity(3);
    }
    assert!(matches!(tree.validate(), Err(Error::TreeInvariant { .. })));
}

#[test]
fn test_validate_rejects_level_order() {
    let (mut tree, chains) = unfused(2, &[&[8]]);
    if let Node::Tile(t) = tree.node_mut(chains[0][0]) {
        t.level = 1;
    }
    assert!(matches!(tree.validate(), Err(Error::TreeInvariant { reason: "level not below enclosing tile", .. })));
}
