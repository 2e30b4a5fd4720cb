use strata_ir::{BufferDecl, Emit, LoopVar, MemSpace, OpId, Param, ParamDir, Primitive, Proc, Stmt, Value};

use crate::builder::build;
use crate::config::SolverConfig;
use crate::lower::{lower, lower_into};
use crate::merge::merge;
use crate::solve::solve;
use crate::test::helpers::*;

fn count(proc: &Proc, pred: impl Fn(&Stmt) -> bool) -> usize {
    proc.stmts().into_iter().filter(|s| pred(s)).count()
}

fn computes(proc: &Proc) -> Vec<&str> {
    proc.stmts()
        .into_iter()
        .filter_map(|s| match s {
            Stmt::Compute { op, .. } => Some(op.as_str()),
            _ => None,
        })
        .collect()
}

#[test]
fn test_lower_single_op() {
    let tree = build(&chain(1, &[1024]), 2).unwrap();
    let solution = solve(&tree, &roomy_target(2), &SolverConfig::default()).unwrap().unwrap();
    let proc = lower(&tree, &solution, "k").unwrap();

    assert_eq!(proc.inputs().count(), 1);
    assert_eq!(proc.outputs().count(), 1);
    assert_eq!(count(&proc, |s| matches!(s, Stmt::Alloc(d) if d.space == MemSpace::Level(1))), 2);
    assert_eq!(count(&proc, |s| matches!(s, Stmt::Alloc(d) if d.space == MemSpace::Level(0))), 2);
    assert_eq!(count(&proc, |s| matches!(s, Stmt::Copy { .. })), 4);
    assert_eq!(computes(&proc), ["e0"]);

    let text = proc.to_string();
    assert!(text.starts_with("proc k(in op0_in0: f32[1024], out op0_out: f32[1024]) {\n"));
    assert!(text.contains("for i0 in 0..1 { // d0"));
    assert!(text.contains("for i1 in 0..1024 { // d0"));
    assert!(text.contains("alloc op0_in0_l1_0 : f32[1024] @ L1"));
    assert!(text.contains("copy op0_in0_l1_0 <- op0_in0[1024*i0 +: 1024]"));
    assert!(text.contains("copy op0_in0_l0_2 <- op0_in0_l1_0[i1 +: 1]"));
    assert!(text.contains("let op0_in0_v = op0_in0_l0_2[0 +: 1]"));
    assert!(text.contains("elementwise e0(op0_in0_v, op0_out_v)"));
    assert!(text.contains("copy op0_out_l1_1[i1 +: 1] <- op0_out_l0_3"));
    assert!(text.contains("copy op0_out[1024*i0 +: 1024] <- op0_out_l1_1"));
}

#[test]
fn test_lower_unfused_chain_goes_through_main_memory() {
    let tree = build(&chain(2, &[8]), 1).unwrap();
    let solution = solve(&tree, &roomy_target(1), &SolverConfig::default()).unwrap().unwrap();
    let proc = lower(&tree, &solution, "k").unwrap();

    let Stmt::Alloc(scratch) = &proc.body[0] else { panic!("expected the intermediate first") };
    assert_eq!(scratch.name, "op0_out");
    assert_eq!(scratch.space, MemSpace::Resident);
    assert_eq!(proc.body.iter().filter(|s| matches!(s, Stmt::Loop { .. })).count(), 2);

    let text = proc.to_string();
    assert!(text.contains("copy op0_out[i0 +: 1] <- op0_out_l0_1"));
    assert!(text.contains("copy op1_in0_l0_2 <- op0_out[i1 +: 1]"));
    assert_eq!(computes(&proc), ["e0", "e1"]);
}

#[test]
fn test_lower_fused_chain_shares_loop_nest() {
    let mut tree = build(&chain(2, &[8]), 2).unwrap();
    assert!(merge(&mut tree, OpId(1), OpId(0), 1));
    let solution = solve(&tree, &roomy_target(2), &SolverConfig::default()).unwrap().unwrap();
    let proc = lower(&tree, &solution, "fused").unwrap();

    assert_eq!(proc.body.iter().filter(|s| matches!(s, Stmt::Loop { .. })).count(), 1);
    assert_eq!(computes(&proc), ["e0", "e1"]);
    // The intermediate is staged once and never read back from main memory.
    assert!(!proc.to_string().contains("<- op0_out["));
}

#[test]
fn test_lower_fused_intermediate_has_no_main_memory_backing() {
    let mut tree = build(&chain(3, &[8]), 2).unwrap();
    assert!(merge(&mut tree, OpId(1), OpId(0), 1));
    let solution = solve(&tree, &roomy_target(2), &SolverConfig::default()).unwrap().unwrap();
    let proc = lower(&tree, &solution, "fused").unwrap();

    let resident: Vec<&str> = proc
        .stmts()
        .into_iter()
        .filter_map(|s| match s {
            Stmt::Alloc(d) if d.space == MemSpace::Resident => Some(d.name.as_str()),
            _ => None,
        })
        .collect();
    // op1 still hands its result to the unfused e2 through main memory.
    assert_eq!(resident, ["op1_out"]);
    let text = proc.to_string();
    assert!(!text.contains("op0_out["));
    assert!(text.contains("alloc op0_out_l1_"));
    assert_eq!(computes(&proc), ["e0", "e1", "e2"]);
}

#[test]
fn test_lower_param_order() {
    let tree = build(&scaled_matmul(8), 1).unwrap();
    let solution = solve(&tree, &roomy_target(1), &first_fit()).unwrap().unwrap();
    let proc = lower(&tree, &solution, "mm").unwrap();

    let params: Vec<(&str, ParamDir)> = proc.params.iter().map(|p| (p.name.as_str(), p.dir)).collect();
    assert_eq!(params, [("op0_in0", ParamDir::In), ("op1_in1", ParamDir::In), ("op1_out", ParamDir::Out)]);
    assert!(proc.params.iter().all(|p| p.shape.as_slice() == [8, 8]));
    assert!(proc.stmts().iter().any(|s| matches!(s, Stmt::Compute { primitive: Primitive::Matmul, .. })));
}

/// Records emission events only.
#[derive(Default)]
struct Recorder {
    depth: usize,
    max_depth: usize,
    loops: Vec<i64>,
    params: usize,
    copies: usize,
    computes: usize,
    next: u32,
}

impl Emit for Recorder {
    fn emit_param(&mut self, _: Param) {
        self.params += 1;
    }

    fn emit_loop(&mut self, _: &str, trip: i64) -> LoopVar {
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);
        self.loops.push(trip);
        self.next += 1;
        LoopVar(self.next - 1)
    }

    fn close_loop(&mut self) {
        self.depth -= 1;
    }

    fn emit_let(&mut self, _: &str, _: Value) {}

    fn emit_alloc(&mut self, _: BufferDecl) {}

    fn emit_copy(&mut self, _: Value, _: Value) {
        self.copies += 1;
    }

    fn emit_compute(&mut self, _: &str, _: Primitive, _: Vec<String>) {
        self.computes += 1;
    }
}

#[test]
fn test_lower_into_custom_emitter() {
    let tree = build(&chain(1, &[16, 4]), 2).unwrap();
    let solution = solve(&tree, &roomy_target(2), &SolverConfig::default()).unwrap().unwrap();
    let mut recorder = Recorder::default();
    lower_into(&tree, &solution, &mut recorder).unwrap();

    assert_eq!(recorder.depth, 0);
    assert_eq!(recorder.max_depth, 4);
    assert_eq!(recorder.loops.len(), 4);
    assert_eq!(recorder.loops.iter().product::<i64>(), 16 * 4);
    assert_eq!(recorder.params, 2);
    assert_eq!(recorder.copies, 4);
    assert_eq!(recorder.computes, 1);
}
