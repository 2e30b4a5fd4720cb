use strata_cp::SearchStatus;
use strata_ir::{BufferId, NodeId, OpId, Primitive};

use crate::builder::build;
use crate::config::{KernelHints, MemoryLevel, SolverConfig, TargetOptions};
use crate::constraints::compute_cycles;
use crate::error::Error;
use crate::merge::merge;
use crate::solve::{solve, solve_all};
use crate::test::helpers::*;

#[test]
fn test_single_op_stages_whole_domain() {
    let tree = build(&chain(1, &[1024]), 2).unwrap();
    let target = target(&[(ROOMY, ROOMY), (1 << 20, ROOMY)]);
    let solution = solve(&tree, &target, &SolverConfig::default()).unwrap().unwrap();

    let [inner, outer]: [NodeId; 2] = tree.chain(OpId(0)).as_slice().try_into().unwrap();
    assert_eq!(solution.tile_extent(outer, 0), Some(1024));
    assert_eq!(solution.tile_size(outer, 0), Some(1));
    assert_eq!(solution.tile_size(inner, 0), Some(1024));

    let at_zero: Vec<_> = solution.placements().iter().filter(|p| p.level == 0).collect();
    assert_eq!(at_zero.len(), 2);
    assert!(at_zero.iter().all(|p| p.node == inner));
    assert!(solution.is_placed(outer, BufferId::input(OpId(0), 0), 1));
    assert_eq!(solution.buffer_size(outer, BufferId::output(OpId(0))), Some(4096));
    assert_eq!(solution.buffer_shape(inner, BufferId::output(OpId(0))), Some([1].as_slice()));

    assert_covered(&tree, &solution);
    assert_single_materialization(&solution);
    assert_within_capacity(&solution, &target);
    assert_eq!(solution.status(), SearchStatus::Optimal);
}

#[test]
fn test_merged_matmul_fits_tight_level() {
    let mut tree = build(&scaled_matmul(64), 2).unwrap();
    assert!(merge(&mut tree, OpId(1), OpId(0), 1));
    let tight = target(&[(1024, ROOMY), (4096, ROOMY)]);
    let roomy = target(&[(1024, ROOMY), (ROOMY, ROOMY)]);

    let unbounded = solve(&tree, &roomy, &SolverConfig::default()).unwrap().unwrap();
    assert!(unbounded.level_usage(1) > 4096);

    let solution = solve(&tree, &tight, &SolverConfig::default()).unwrap().unwrap();
    assert_covered(&tree, &solution);
    assert_single_materialization(&solution);
    assert_within_capacity(&solution, &tight);
    assert!(solution.level_usage(1) <= 4096);

    // The fused intermediate is one buffer shared by both ops.
    let staged = solution.buffers().canonical(BufferId::input(OpId(1), 0));
    assert_eq!(staged, BufferId::output(OpId(0)));
    assert_eq!(solution.placements().iter().filter(|p| p.buffer == staged && p.level == 0).count(), 1);
}

#[test]
fn test_unmerged_matmul_respects_capacity() {
    let tree = build(&scaled_matmul(64), 2).unwrap();
    let tight = target(&[(1024, ROOMY), (4096, ROOMY)]);
    let roomy = target(&[(1024, ROOMY), (ROOMY, ROOMY)]);
    let outer = tree.chain(OpId(1))[1];
    let staged_points = |solution: &crate::solve::Solution| -> i64 {
        (0..3).map(|d| solution.tile_extent(outer, d).unwrap()).product()
    };

    let unbounded = solve(&tree, &roomy, &SolverConfig::default()).unwrap().unwrap();
    assert_eq!(staged_points(&unbounded), 64 * 64 * 64);
    assert!(unbounded.level_usage(1) > 4096);

    // Three matmul operands and two scale buffers share 1024 elements.
    let solution = solve(&tree, &tight, &SolverConfig::default()).unwrap().unwrap();
    assert_covered(&tree, &solution);
    assert_within_capacity(&solution, &tight);
    assert!(staged_points(&solution) < 64 * 64 * 64);
    assert!(solution.level_usage(1) < unbounded.level_usage(1));
}

#[test]
fn test_fusion_saves_main_memory_traffic() {
    let target = TargetOptions::builder()
        .levels(vec![MemoryLevel::new(ROOMY, ROOMY); 2])
        .resident_bandwidth(1)
        .build();

    let unfused = build(&chain(2, &[64, 64]), 2).unwrap();
    let mut fused = unfused.clone();
    assert!(merge(&mut fused, OpId(1), OpId(0), 1));

    let unfused = solve(&unfused, &target, &first_fit()).unwrap().unwrap();
    let fused = solve(&fused, &target, &first_fit()).unwrap().unwrap();

    // Four 16 KiB tensors cross main memory unfused, two fused.
    assert_eq!(unfused.cost().resident, 4 * 64 * 64 * 4);
    assert_eq!(fused.cost().resident, 2 * 64 * 64 * 4);
    assert!(fused.cost().total < unfused.cost().total);
    assert_eq!(fused.cost().compute, 2 * 64 * 64);
}

#[test]
fn test_capacity_below_one_element_is_infeasible() {
    let tree = build(&chain(1, &[16]), 2).unwrap();
    let target = target(&[(ROOMY, ROOMY), (2, ROOMY)]);
    assert!(solve(&tree, &target, &SolverConfig::default()).unwrap().is_none());
    assert!(solve_all(&tree, &target, &SolverConfig::default()).unwrap().is_empty());
}

#[test]
fn test_granularity_respected() {
    let tree = build(&chain(1, &[4, 32]), 2).unwrap();
    let mut target = roomy_target(2);
    target.hints.granularity = 8;

    let solutions = solve_all(&tree, &target, &SolverConfig::default()).unwrap();
    assert!(!solutions.is_empty());
    let inner = tree.chain(OpId(0))[0];
    for solution in &solutions {
        assert_eq!(solution.tile_size(inner, 1).unwrap() % 8, 0);
    }
    assert_eq!(solutions[0].cost().compute, 4 * 32 / 8);
}

#[test]
fn test_solutions_best_first() {
    let tree = build(&chain(2, &[16]), 3).unwrap();
    let target = target(&[(64, 4), (512, 2), (4096, 1)]);
    let config = SolverConfig::builder().keep_best(4).build();

    let solutions = solve_all(&tree, &target, &config).unwrap();
    assert!(!solutions.is_empty());
    assert!(solutions.len() <= 4);
    for pair in solutions.windows(2) {
        assert!(pair[0].cost().total <= pair[1].cost().total);
    }
    for solution in &solutions {
        assert_covered(&tree, solution);
        assert_within_capacity(solution, &target);
    }
}

#[test]
fn test_level_mismatch() {
    let tree = build(&chain(1, &[8]), 2).unwrap();
    let err = solve(&tree, &roomy_target(3), &SolverConfig::default()).unwrap_err();
    assert_eq!(err, Error::LevelMismatch { tree: 2, target: 3 });
}

#[test]
fn test_invalid_config() {
    let tree = build(&chain(1, &[8]), 1).unwrap();
    let config = SolverConfig::builder().solution_limit(0).build();
    assert!(matches!(solve(&tree, &roomy_target(1), &config), Err(Error::InvalidConfig { .. })));
}

#[test]
fn test_resource_limit_stops_search() {
    let tree = build(&chain(2, &[64, 64]), 3).unwrap();
    // Far less work than one solver call needs.
    let starved = SolverConfig::builder().resource_limit(1).build();
    assert!(solve_all(&tree, &roomy_target(3), &starved).unwrap().is_empty());

    let solution = solve(&tree, &roomy_target(3), &first_fit()).unwrap().unwrap();
    assert_eq!(solution.status(), SearchStatus::SolutionLimit);
    assert_eq!(solution.search_rounds(), 1);
}

#[test]
fn test_compute_cycles_per_primitive() {
    let tree = build(&scaled_matmul(64), 2).unwrap();
    let target = roomy_target(2).with_kernel(Primitive::Matmul, KernelHints { granularity: 16, kernel_cycles: 4 });

    // Scale runs the default 1-wide kernel; the matmul a 16-wide one.
    assert_eq!(compute_cycles(&tree, &target), 64 * 64 + 64 * 64 * 64 / 16 * 4);
    let solution = solve(&tree, &target, &first_fit()).unwrap().unwrap();
    assert_eq!(solution.cost().compute, 64 * 64 + 64 * 64 * 64 / 16 * 4);
}

#[test]
fn test_compute_cycles_saturate() {
    let tree = build(&chain(1, &[1 << 40, 1 << 40]), 1).unwrap();
    let mut target = roomy_target(1);
    target.hints.kernel_cycles = 3;
    assert_eq!(compute_cycles(&tree, &target), i64::MAX);
}
