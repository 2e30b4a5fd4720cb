use strata_affine::AffineMap;
use strata_ir::{Body, FusedGroup, Node, OpDesc, OpId, Primitive};
use test_case::test_case;

use crate::builder::build;
use crate::error::Error;
use crate::test::helpers::*;

#[test_case(1; "single level")]
#[test_case(3; "three levels")]
fn test_build_chains(levels: usize) {
    let tree = build(&chain(2, &[16, 8]), levels).unwrap();
    tree.validate().unwrap();
    assert_eq!(tree.num_ops(), 2);
    assert_eq!(tree.children(tree.root()).len(), 2);

    for op in [OpId(0), OpId(1)] {
        let chain = tree.chain(op);
        assert_eq!(chain.len(), levels);
        for (level, &tile) in chain.iter().enumerate() {
            let tile = tree.tile(tile).unwrap();
            assert_eq!(tile.level, level);
            assert_eq!(tile.op, op);
            assert!(tile.relation.is_identity());
            assert_eq!(tile.dims.as_slice(), ["d0", "d1"]);
        }
    }
    assert!(!tree.share_tile(OpId(0), OpId(1)));
}

#[test]
fn test_build_numbers_producers_first() {
    // Consumer declared before its producer.
    let mut group = FusedGroup::new();
    let consumer = group.add_op(elementwise("late", &[8]));
    let producer = group.add_op(elementwise("early", &[8]));
    group.add_dep(producer, consumer, 0);

    let tree = build(&group, 2).unwrap();
    assert_eq!(tree.op(OpId(0)).unwrap().name, "early");
    assert_eq!(tree.op(OpId(1)).unwrap().name, "late");
    assert_eq!(tree.op(OpId(1)).unwrap().producer_of(0), Some(OpId(0)));
    assert!(!tree.op(OpId(0)).unwrap().is_output);
    assert!(tree.op(OpId(1)).unwrap().is_output);
}

#[test]
fn test_build_sorts_deps_by_slot() {
    let mut group = FusedGroup::new();
    let a = group.add_op(elementwise("a", &[4]));
    let b = group.add_op(elementwise("b", &[4]));
    let add = group.add_op(
        OpDesc::new("add", &[4], AffineMap::identity(1), Body::Primitive(Primitive::Elementwise))
            .with_input(AffineMap::identity(1))
            .with_input(AffineMap::identity(1)),
    );
    group.add_dep(b, add, 1);
    group.add_dep(a, add, 0);

    let tree = build(&group, 1).unwrap();
    let add = tree.ops().find(|o| o.name == "add").unwrap();
    let slots: Vec<usize> = add.deps.iter().map(|d| d.slot).collect();
    assert_eq!(slots, vec![0, 1]);
}

#[test]
fn test_build_rejects_zero_levels() {
    assert_eq!(build(&chain(1, &[8]), 0).unwrap_err(), Error::NoLevels);
}

#[test]
fn test_build_rejects_opaque_body() {
    let mut group = FusedGroup::new();
    group.add_op(OpDesc::new("custom", &[8], AffineMap::identity(1), Body::Opaque("sort".into())));
    let err = build(&group, 1).unwrap_err();
    assert!(matches!(err, Error::UnrecognizedBody { ref op, ref body } if op == "custom" && body == "sort"));
}

#[test]
fn test_build_rejects_cycle() {
    let mut group = chain(2, &[8]);
    group.add_dep(1, 0, 0);
    assert!(matches!(build(&group, 1), Err(Error::InvalidGroup { .. })));
}

#[test]
fn test_build_op_leaves() {
    let tree = build(&scaled_matmul(8), 2).unwrap();
    let mm = tree.op(OpId(1)).unwrap();
    assert_eq!(mm.primitive, Primitive::Matmul);
    assert_eq!(mm.bounds.as_slice(), [8, 8, 8]);
    let node = tree.op_node(OpId(1)).unwrap();
    assert!(matches!(tree.node(node), Node::Op(_)));
    assert_eq!(tree.parent_tile(node), tree.chain(OpId(1)).first().copied());
}
