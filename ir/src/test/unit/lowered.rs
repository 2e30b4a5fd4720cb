use smallvec::smallvec;

use crate::{BufferDecl, ElemType, Emit, IndexExpr, LoopVar, MemSpace, Param, ParamDir, Primitive, ProcBuilder, Stmt, Value};

#[test]
fn test_index_expr_merges_terms() {
    let mut e = IndexExpr::var(LoopVar(0));
    e.add_term(LoopVar(1), 4);
    e.add_term(LoopVar(0), -1);
    assert_eq!(e.terms(), &[(LoopVar(1), 4)]);
    e.add(&IndexExpr::constant(3));
    assert_eq!(e.to_string(), "4*i1 + 3");
    assert_eq!(e.scaled(2).eval(|v| if v == LoopVar(1) { 5 } else { 0 }), 46);
    assert!(IndexExpr::default().is_zero());
}

#[test]
fn test_builder_nests_loops() {
    let mut b = ProcBuilder::new("k");
    b.emit_param(Param { name: "x".into(), elem: ElemType::F32, shape: smallvec![16], dir: ParamDir::In });
    b.emit_param(Param { name: "y".into(), elem: ElemType::F32, shape: smallvec![16], dir: ParamDir::Out });
    let outer = b.emit_loop("d0", 4);
    b.emit_alloc(BufferDecl { name: "t".into(), elem: ElemType::F32, shape: smallvec![4], space: MemSpace::Level(1) });
    let view = b.emit_subview("x", smallvec![IndexExpr::var(outer).scaled(4)], smallvec![4]);
    b.emit_copy(Value::Buffer("t".into()), view);
    let inner = b.emit_loop("d0", 4);
    assert_eq!(b.depth(), 2);
    b.emit_let("a", b_view("t", inner));
    b.emit_compute("op0", Primitive::Elementwise, vec!["a".into()]);
    let proc = b.finish();

    assert_eq!(proc.inputs().count(), 1);
    assert_eq!(proc.outputs().count(), 1);
    assert_eq!(proc.body.len(), 1);
    let Stmt::Loop { trip, body, .. } = &proc.body[0] else { panic!("expected loop") };
    assert_eq!(*trip, 4);
    assert_eq!(body.len(), 3);
    assert!(matches!(proc.stmts().last(), Some(Stmt::Compute { .. })));

    let text = proc.to_string();
    assert!(text.starts_with("proc k(in x: f32[16], out y: f32[16])"));
    assert!(text.contains("copy t <- x[4*i0 +: 4]"));
    assert!(text.contains("alloc t : f32[4] @ L1"));
}

fn b_view(base: &str, var: LoopVar) -> Value {
    Value::SubView(crate::SubView { base: base.into(), offsets: smallvec![IndexExpr::var(var)], extents: smallvec![1] })
}
