//! Solved schedules satisfy coverage, single materialization and capacity.

use proptest::prelude::*;
use strata_ir::OpId;

use crate::builder::build;
use crate::config::TargetOptions;
use crate::lower::lower;
use crate::merge::merge;
use crate::solve::solve;
use crate::test::helpers::*;

fn bound() -> impl Strategy<Value = i64> {
    prop::sample::select(vec![4i64, 16, 64])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn roomy_solutions_hold_invariants(
        len in 1usize..=2,
        levels in 1usize..=3,
        bound in bound(),
        fuse in any::<bool>(),
    ) {
        let mut tree = build(&chain(len, &[bound]), levels).unwrap();
        if fuse && len == 2 && levels > 1 {
            prop_assert!(merge(&mut tree, OpId(1), OpId(0), levels - 1));
        }
        let target = roomy_target(levels);

        let solution = solve(&tree, &target, &first_fit()).unwrap();
        prop_assert!(solution.is_some());
        let solution = solution.unwrap();
        assert_covered(&tree, &solution);
        assert_single_materialization(&solution);
        assert_within_capacity(&solution, &target);
        prop_assert!(lower(&tree, &solution, "k").is_ok());
    }

    #[test]
    fn capacity_is_never_exceeded(
        bound in bound(),
        capacity in 4i64..=256,
    ) {
        let tree = build(&chain(2, &[bound]), 2).unwrap();
        let target: TargetOptions = target(&[(ROOMY, ROOMY), (capacity, ROOMY)]);

        // Every buffer needs at least one element at level 1.
        match solve(&tree, &target, &first_fit()).unwrap() {
            Some(solution) => {
                assert_covered(&tree, &solution);
                assert_within_capacity(&solution, &target);
            }
            None => prop_assert!(capacity < 4 * 4),
        }
    }
}
