use strata_ir::{BufferId, OpId, Primitive};

use crate::builder::build;
use crate::config::KernelHints;
use crate::init::{BufferTable, divisors, initialize};
use crate::merge::merge;
use crate::test::helpers::*;

#[test]
fn test_divisors_descend() {
    assert_eq!(divisors(12), vec![12, 6, 4, 3, 2, 1]);
    assert_eq!(divisors(1), vec![1]);
    assert_eq!(divisors(16), vec![16, 8, 4, 2, 1]);
    assert_eq!(divisors(97), vec![97, 1]);
    assert_eq!(divisors(1 << 40).len(), 41);
}

#[test]
fn test_unfused_buffers_are_distinct() {
    let tree = build(&chain(2, &[8]), 2).unwrap();
    let table = BufferTable::new(&tree);
    let read = BufferId::input(OpId(1), 0);

    assert_eq!(table.canonical(read), read);
    assert_eq!(table.storage(read), BufferId::output(OpId(0)));
    assert_eq!(table.canonical_buffers().len(), 4);
    // Crosses main memory between the two nests.
    assert!(table.is_resident(BufferId::output(OpId(0))));
    assert!(table.is_resident(read));
}

#[test]
fn test_fused_intermediate_aliases_producer() {
    let mut tree = build(&chain(2, &[8]), 2).unwrap();
    assert!(merge(&mut tree, OpId(1), OpId(0), 1));
    let table = BufferTable::new(&tree);
    let read = BufferId::input(OpId(1), 0);
    let written = BufferId::output(OpId(0));

    assert_eq!(table.canonical(read), written);
    assert_eq!(table.canonical_buffers().len(), 3);
    assert!(!table.is_resident(written));
    assert!(!table.is_resident(read));
    assert!(table.is_resident(BufferId::input(OpId(0), 0)));
    assert!(table.is_resident(BufferId::output(OpId(1))));
    assert_eq!(table.accessors(written).len(), 2);
}

#[test]
fn test_initialize_counts() {
    let tree = build(&chain(1, &[1024]), 2).unwrap();
    let ctx = initialize(&tree, &roomy_target(2)).unwrap();
    // Two buffers: both levels at the outer tile, level 0 at the inner one.
    assert_eq!(ctx.placements.len(), 2 * 2 + 2);
    assert_eq!(ctx.tiles.len(), 2);
    assert_eq!(ctx.stages.len(), 4);
    assert_eq!(ctx.full_shapes[&BufferId::input(OpId(0), 0)].as_slice(), [1024]);

    let inner = tree.chain(OpId(0))[0];
    let vars = ctx.tile_vars(inner).unwrap();
    assert_eq!(vars.level, 0);
    assert_eq!(ctx.model.domain(vars.vars[0]).len(), 11);
}

#[test]
fn test_granularity_restricts_innermost_tile() {
    let tree = build(&chain(1, &[4, 24]), 2).unwrap();
    let mut target = roomy_target(2);
    target.hints.granularity = 8;
    let ctx = initialize(&tree, &target).unwrap();

    let inner = ctx.tile_vars(tree.chain(OpId(0))[0]).unwrap();
    assert_eq!(ctx.model.domain(inner.vars[0]), [4, 2, 1]);
    assert_eq!(ctx.model.domain(inner.vars[1]), [24, 8]);

    let outer = ctx.tile_vars(tree.chain(OpId(0))[1]).unwrap();
    assert_eq!(ctx.model.domain(outer.vars[1]).len(), divisors(24).len());
}

#[test]
fn test_granularity_follows_primitive() {
    let tree = build(&scaled_matmul(64), 2).unwrap();
    let mut target = roomy_target(2).with_kernel(Primitive::Matmul, KernelHints { granularity: 16, kernel_cycles: 4 });
    target.hints.granularity = 8;
    let ctx = initialize(&tree, &target).unwrap();

    let scale = ctx.tile_vars(tree.chain(OpId(0))[0]).unwrap();
    assert_eq!(ctx.model.domain(scale.vars[1]), [64, 32, 16, 8]);
    let mm = ctx.tile_vars(tree.chain(OpId(1))[0]).unwrap();
    assert_eq!(ctx.model.domain(mm.vars[2]), [64, 32, 16]);
    assert_eq!(ctx.model.domain(mm.vars[1]).len(), divisors(64).len());
}
