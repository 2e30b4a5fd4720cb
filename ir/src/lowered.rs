//! Lowered nested-loop program.
//!
//! The scheduler never builds statements directly; it drives an [`Emit`]
//! implementation. [`ProcBuilder`] is the in-crate one and produces a
//! [`Proc`] that prints as readable pseudo-code.

use std::fmt;

use itertools::Itertools;
use smallvec::SmallVec;

use crate::group::{ElemType, Primitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopVar(pub u32);

impl fmt::Display for LoopVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// Affine expression over loop variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexExpr {
    terms: SmallVec<[(LoopVar, i64); 4]>,
    constant: i64,
}

impl IndexExpr {
    pub fn constant(value: i64) -> Self {
        Self { terms: SmallVec::new(), constant: value }
    }

    pub fn var(var: LoopVar) -> Self {
        let mut e = Self::default();
        e.add_term(var, 1);
        e
    }

    /// Add `coeff · var`, merging with an existing term for `var`.
    pub fn add_term(&mut self, var: LoopVar, coeff: i64) {
        if coeff == 0 {
            return;
        }
        match self.terms.iter().position(|(v, _)| *v == var) {
            Some(i) => {
                self.terms[i].1 += coeff;
                if self.terms[i].1 == 0 {
                    self.terms.remove(i);
                }
            }
            None => self.terms.push((var, coeff)),
        }
    }

    pub fn scaled(&self, factor: i64) -> Self {
        let mut out = Self::constant(self.constant * factor);
        for &(v, c) in &self.terms {
            out.add_term(v, c * factor);
        }
        out
    }

    pub fn add(&mut self, other: &IndexExpr) {
        self.constant += other.constant;
        for &(v, c) in &other.terms {
            self.add_term(v, c);
        }
    }

    pub fn terms(&self) -> &[(LoopVar, i64)] {
        &self.terms
    }

    pub fn offset(&self) -> i64 {
        self.constant
    }

    pub fn is_zero(&self) -> bool {
        self.terms.is_empty() && self.constant == 0
    }

    pub fn eval(&self, value_of: impl Fn(LoopVar) -> i64) -> i64 {
        self.terms.iter().map(|&(v, c)| c * value_of(v)).sum::<i64>() + self.constant
    }
}

impl fmt::Display for IndexExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return write!(f, "{}", self.constant);
        }
        for (i, &(v, c)) in self.terms.iter().enumerate() {
            let sep = match (i, c < 0) {
                (0, true) => "-",
                (0, false) => "",
                (_, true) => " - ",
                (_, false) => " + ",
            };
            match c.abs() {
                1 => write!(f, "{sep}{v}")?,
                a => write!(f, "{sep}{a}*{v}")?,
            }
        }
        match self.constant {
            0 => Ok(()),
            k if k < 0 => write!(f, " - {}", -k),
            k => write!(f, " + {k}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemSpace {
    /// Main memory: parameters and unfused intermediates.
    Resident,
    Level(usize),
}

impl fmt::Display for MemSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resident => write!(f, "resident"),
            Self::Level(l) => write!(f, "L{l}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDecl {
    pub name: String,
    pub elem: ElemType,
    pub shape: SmallVec<[i64; 4]>,
    pub space: MemSpace,
}

impl BufferDecl {
    pub fn bytes(&self) -> i64 {
        self.shape.iter().product::<i64>() * self.elem.bytes()
    }
}

/// Rectangular window `base[offsets .. offsets + extents]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubView {
    pub base: String,
    pub offsets: SmallVec<[IndexExpr; 4]>,
    pub extents: SmallVec<[i64; 4]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Buffer(String),
    SubView(SubView),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(name) => write!(f, "{name}"),
            Self::SubView(view) => write!(
                f,
                "{}[{}]",
                view.base,
                view.offsets.iter().zip(&view.extents).map(|(o, e)| format!("{o} +: {e}")).join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ParamDir {
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub elem: ElemType,
    pub shape: SmallVec<[i64; 4]>,
    pub dir: ParamDir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    /// `for var in 0..trip`, unit step.
    Loop { var: LoopVar, dim: String, trip: i64, body: Vec<Stmt> },
    Let { name: String, value: Value },
    Alloc(BufferDecl),
    Copy { dst: Value, src: Value },
    Compute { op: String, primitive: Primitive, operands: Vec<String> },
}

/// A callable unit: ordered parameters (inputs, then outputs) and a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proc {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

impl Proc {
    /// All statements, pre-order.
    pub fn stmts(&self) -> Vec<&Stmt> {
        fn walk<'a>(stmts: &'a [Stmt], out: &mut Vec<&'a Stmt>) {
            for stmt in stmts {
                out.push(stmt);
                if let Stmt::Loop { body, .. } = stmt {
                    walk(body, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.body, &mut out);
        out
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Param> + '_ {
        self.params.iter().filter(|p| p.dir == ParamDir::In)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Param> + '_ {
        self.params.iter().filter(|p| p.dir == ParamDir::Out)
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, stmts: &[Stmt], depth: usize) -> fmt::Result {
    let pad = depth * 2;
    for stmt in stmts {
        match stmt {
            Stmt::Loop { var, dim, trip, body } => {
                writeln!(f, "{:pad$}for {var} in 0..{trip} {{ // {dim}", "")?;
                write_block(f, body, depth + 1)?;
                writeln!(f, "{:pad$}}}", "")?;
            }
            Stmt::Let { name, value } => writeln!(f, "{:pad$}let {name} = {value}", "")?,
            Stmt::Alloc(decl) => writeln!(
                f,
                "{:pad$}alloc {} : {}[{}] @ {}",
                "",
                decl.name,
                decl.elem,
                decl.shape.iter().join(", "),
                decl.space
            )?,
            Stmt::Copy { dst, src } => writeln!(f, "{:pad$}copy {dst} <- {src}", "")?,
            Stmt::Compute { op, primitive, operands } => {
                writeln!(f, "{:pad$}{primitive} {op}({})", "", operands.iter().join(", "))?
            }
        }
    }
    Ok(())
}

impl fmt::Display for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|p| format!("{} {}: {}[{}]", p.dir, p.name, p.elem, p.shape.iter().join(", ")))
            .join(", ");
        writeln!(f, "proc {}({params}) {{", self.name)?;
        write_block(f, &self.body, 1)?;
        writeln!(f, "}}")
    }
}

/// Emission primitives of the downstream IR.
pub trait Emit {
    fn emit_param(&mut self, param: Param);

    /// Open a loop. Everything emitted until the matching [`Emit::close_loop`]
    /// lands in its body.
    fn emit_loop(&mut self, dim: &str, trip: i64) -> LoopVar;

    fn close_loop(&mut self);

    fn emit_let(&mut self, name: &str, value: Value);

    fn emit_alloc(&mut self, decl: BufferDecl);

    fn emit_subview(&mut self, base: &str, offsets: SmallVec<[IndexExpr; 4]>, extents: SmallVec<[i64; 4]>) -> Value {
        Value::SubView(SubView { base: base.to_string(), offsets, extents })
    }

    fn emit_copy(&mut self, dst: Value, src: Value);

    fn emit_compute(&mut self, op: &str, primitive: Primitive, operands: Vec<String>);
}

struct OpenLoop {
    var: LoopVar,
    dim: String,
    trip: i64,
    body: Vec<Stmt>,
}

/// [`Emit`] implementation building a [`Proc`].
pub struct ProcBuilder {
    name: String,
    params: Vec<Param>,
    body: Vec<Stmt>,
    open: Vec<OpenLoop>,
    next_var: u32,
}

impl ProcBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), params: Vec::new(), body: Vec::new(), open: Vec::new(), next_var: 0 }
    }

    pub fn depth(&self) -> usize {
        self.open.len()
    }

    fn push(&mut self, stmt: Stmt) {
        match self.open.last_mut() {
            Some(l) => l.body.push(stmt),
            None => self.body.push(stmt),
        }
    }

    /// Close any loops still open and return the procedure.
    pub fn finish(mut self) -> Proc {
        while !self.open.is_empty() {
            self.close_loop();
        }
        Proc { name: self.name, params: self.params, body: self.body }
    }
}

impl Emit for ProcBuilder {
    fn emit_param(&mut self, param: Param) {
        self.params.push(param);
    }

    fn emit_loop(&mut self, dim: &str, trip: i64) -> LoopVar {
        let var = LoopVar(self.next_var);
        self.next_var += 1;
        self.open.push(OpenLoop { var, dim: dim.to_string(), trip, body: Vec::new() });
        var
    }

    fn close_loop(&mut self) {
        if let Some(l) = self.open.pop() {
            self.push(Stmt::Loop { var: l.var, dim: l.dim, trip: l.trip, body: l.body });
        }
    }

    fn emit_let(&mut self, name: &str, value: Value) {
        self.push(Stmt::Let { name: name.to_string(), value });
    }

    fn emit_alloc(&mut self, decl: BufferDecl) {
        self.push(Stmt::Alloc(decl));
    }

    fn emit_copy(&mut self, dst: Value, src: Value) {
        self.push(Stmt::Copy { dst, src });
    }

    fn emit_compute(&mut self, op: &str, primitive: Primitive, operands: Vec<String>) {
        self.push(Stmt::Compute { op: op.to_string(), primitive, operands });
    }
}
