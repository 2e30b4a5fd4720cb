//! Decision variables, the expression arena and constraints.

use std::fmt;

use smallvec::SmallVec;
use snafu::ensure;

use crate::error::*;

/// Handle to a decision variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntVar(pub(crate) u32);

impl IntVar {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to an expression in a [`Model`]'s arena.
///
/// Operands are always created before the expressions that use them, so
/// arena order is a valid evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Expr(pub(crate) u32);

impl Expr {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Const(i64),
    Var(IntVar),
    Sum(SmallVec<[Expr; 4]>),
    Product(SmallVec<[Expr; 4]>),
    Max(SmallVec<[Expr; 4]>),
    Scale(Expr, i64),
    CeilDiv(Expr, i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Le,
    Eq,
    Ge,
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Le => write!(f, "<="),
            Self::Eq => write!(f, "=="),
            Self::Ge => write!(f, ">="),
        }
    }
}

/// `lhs <rel> rhs`, tagged with a static label for diagnostics.
#[derive(Debug, Clone)]
pub struct Constraint {
    pub lhs: Expr,
    pub rel: Relation,
    pub rhs: Expr,
    pub label: &'static str,
}

#[derive(Debug, Clone)]
pub(crate) struct VarInfo {
    pub name: String,
    /// Values in preference order.
    pub domain: SmallVec<[i64; 8]>,
}

/// A finite-domain model.
///
/// Among assignments of equal standing, the search prefers the one whose
/// values come earliest in their domains, comparing variables in creation
/// order unless [`Model::set_branch_order`] says otherwise.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub(crate) vars: Vec<VarInfo>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) constraints: Vec<Constraint>,
    pub(crate) branch_order: Option<Vec<IntVar>>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn num_exprs(&self) -> usize {
        self.nodes.len()
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Integer variable over `domain`, preferring earlier values.
    pub fn new_int_var(&mut self, domain: impl IntoIterator<Item = i64>, name: impl Into<String>) -> Result<IntVar> {
        let name = name.into();
        let mut values: SmallVec<[i64; 8]> = SmallVec::new();
        for v in domain {
            ensure!(v >= 0, NegativeDomainSnafu { name: name.clone(), value: v });
            if !values.contains(&v) {
                values.push(v);
            }
        }
        ensure!(!values.is_empty(), EmptyDomainSnafu { name });
        let id = IntVar(self.vars.len() as u32);
        self.vars.push(VarInfo { name, domain: values });
        Ok(id)
    }

    /// 0/1 variable; tries 1 first.
    pub fn new_bool_var(&mut self, name: impl Into<String>) -> IntVar {
        let id = IntVar(self.vars.len() as u32);
        self.vars.push(VarInfo { name: name.into(), domain: SmallVec::from_slice(&[1, 0]) });
        id
    }

    pub fn var_name(&self, var: IntVar) -> &str {
        &self.vars[var.index()].name
    }

    pub fn domain(&self, var: IntVar) -> &[i64] {
        &self.vars[var.index()].domain
    }

    /// Set the order in which variable preferences are compared. Variables
    /// left out follow in creation order.
    pub fn set_branch_order(&mut self, order: Vec<IntVar>) {
        self.branch_order = Some(order);
    }

    pub(crate) fn resolved_branch_order(&self) -> Vec<IntVar> {
        let mut seen = vec![false; self.vars.len()];
        let mut order = Vec::with_capacity(self.vars.len());
        for &v in self.branch_order.iter().flatten() {
            if !seen[v.index()] {
                seen[v.index()] = true;
                order.push(v);
            }
        }
        order.extend((0..self.vars.len() as u32).map(IntVar).filter(|v| !seen[v.index()]));
        order
    }

    fn push(&mut self, node: Node) -> Expr {
        let id = Expr(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn constant(&mut self, value: i64) -> Expr {
        self.push(Node::Const(value))
    }

    pub fn var(&mut self, var: IntVar) -> Expr {
        self.push(Node::Var(var))
    }

    /// Sum of terms; the empty sum is 0.
    pub fn sum(&mut self, terms: impl IntoIterator<Item = Expr>) -> Expr {
        let terms: SmallVec<[Expr; 4]> = terms.into_iter().collect();
        match terms.len() {
            0 => self.constant(0),
            1 => terms[0],
            _ => self.push(Node::Sum(terms)),
        }
    }

    /// Product of non-negative terms; the empty product is 1.
    pub fn product(&mut self, factors: impl IntoIterator<Item = Expr>) -> Expr {
        let factors: SmallVec<[Expr; 4]> = factors.into_iter().collect();
        match factors.len() {
            0 => self.constant(1),
            1 => factors[0],
            _ => self.push(Node::Product(factors)),
        }
    }

    /// Maximum of terms; the empty maximum is 0.
    pub fn max(&mut self, terms: impl IntoIterator<Item = Expr>) -> Expr {
        let terms: SmallVec<[Expr; 4]> = terms.into_iter().collect();
        match terms.len() {
            0 => self.constant(0),
            1 => terms[0],
            _ => self.push(Node::Max(terms)),
        }
    }

    pub fn scale(&mut self, expr: Expr, factor: i64) -> Result<Expr> {
        ensure!(factor >= 0, NegativeScaleSnafu { factor });
        Ok(match factor {
            1 => expr,
            _ => self.push(Node::Scale(expr, factor)),
        })
    }

    /// `⌈expr / divisor⌉`.
    pub fn ceil_div(&mut self, expr: Expr, divisor: i64) -> Result<Expr> {
        ensure!(divisor > 0, NonPositiveDivisorSnafu { divisor });
        Ok(match divisor {
            1 => expr,
            _ => self.push(Node::CeilDiv(expr, divisor)),
        })
    }

    pub fn add_constraint(&mut self, lhs: Expr, rel: Relation, rhs: Expr, label: &'static str) {
        self.constraints.push(Constraint { lhs, rel, rhs, label });
    }

    pub fn add_le(&mut self, lhs: Expr, rhs: Expr, label: &'static str) {
        self.add_constraint(lhs, Relation::Le, rhs, label);
    }

    pub fn add_eq(&mut self, lhs: Expr, rhs: Expr, label: &'static str) {
        self.add_constraint(lhs, Relation::Eq, rhs, label);
    }

    pub fn add_ge(&mut self, lhs: Expr, rhs: Expr, label: &'static str) {
        self.add_constraint(lhs, Relation::Ge, rhs, label);
    }

    /// Evaluate `expr` under a complete variable valuation.
    pub fn eval(&self, expr: Expr, values: &[i64]) -> i64 {
        let mut out = vec![0i64; expr.index() + 1];
        for (i, node) in self.nodes.iter().enumerate().take(expr.index() + 1) {
            out[i] = match node {
                Node::Const(c) => *c,
                Node::Var(v) => values[v.index()],
                Node::Sum(terms) => terms.iter().fold(0i64, |acc, t| acc.saturating_add(out[t.index()])),
                Node::Product(factors) => factors.iter().fold(1i64, |acc, t| acc.saturating_mul(out[t.index()])),
                Node::Max(terms) => terms.iter().map(|t| out[t.index()]).max().unwrap_or(0),
                Node::Scale(e, k) => out[e.index()].saturating_mul(*k),
                Node::CeilDiv(e, k) => {
                    let v = out[e.index()];
                    v.div_euclid(*k) + i64::from(v.rem_euclid(*k) != 0)
                }
            };
        }
        out[expr.index()]
    }
}
