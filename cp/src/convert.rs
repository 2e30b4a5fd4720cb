//! Model → Z3 conversion.
//!
//! Every variable is encoded through its *rank*: an integer in
//! `[0, |domain|)` selecting a domain value, so the value is an `ite` chain
//! over the rank. Minimizing ranks lexicographically in branch order picks
//! the assignment a depth-first search would reach first.

use z3::ast::{Bool, Int};

use crate::model::{Model, Node, Relation};

/// Z3 terms for one [`Model`].
pub(crate) struct Encoding {
    /// Rank of every variable, by variable index.
    pub ranks: Vec<Int>,
    /// Term of every arena expression, by expression index.
    pub exprs: Vec<Int>,
    /// Domain bounds on ranks and every model constraint.
    pub assertions: Vec<Bool>,
}

impl Encoding {
    pub fn new(model: &Model) -> Self {
        let mut assertions = Vec::with_capacity(model.vars.len() + model.constraints.len());

        let mut ranks = Vec::with_capacity(model.vars.len());
        let mut values = Vec::with_capacity(model.vars.len());
        for (i, info) in model.vars.iter().enumerate() {
            let name = format!("r{i}_{}", info.name);
            let rank = Int::new_const(name.as_str());
            assertions.push(rank.ge(Int::from_i64(0)));
            assertions.push(rank.lt(Int::from_i64(info.domain.len() as i64)));

            let (&last, rest) = match info.domain.split_last() {
                Some(split) => split,
                None => (&0, &[][..]),
            };
            let value = rest
                .iter()
                .enumerate()
                .rev()
                .fold(Int::from_i64(last), |acc, (k, &v)| rank.eq(Int::from_i64(k as i64)).ite(&Int::from_i64(v), &acc));
            ranks.push(rank);
            values.push(value);
        }

        let mut exprs: Vec<Int> = Vec::with_capacity(model.nodes.len());
        for node in &model.nodes {
            let term = match node {
                Node::Const(c) => Int::from_i64(*c),
                Node::Var(v) => values[v.index()].clone(),
                Node::Sum(terms) => {
                    terms.iter().fold(Int::from_i64(0), |acc, t| acc + exprs[t.index()].clone())
                }
                Node::Product(factors) => {
                    factors.iter().fold(Int::from_i64(1), |acc, t| acc * exprs[t.index()].clone())
                }
                Node::Max(terms) => {
                    let mut it = terms.iter().map(|t| exprs[t.index()].clone());
                    match it.next() {
                        Some(first) => it.fold(first, |l, r| l.gt(&r).ite(&l, &r)),
                        None => Int::from_i64(0),
                    }
                }
                Node::Scale(e, k) => exprs[e.index()].clone() * Int::from_i64(*k),
                // Operands are non-negative, so Z3's Euclidean division floors.
                Node::CeilDiv(e, k) => (exprs[e.index()].clone() + Int::from_i64(k - 1)) / Int::from_i64(*k),
            };
            exprs.push(term);
        }

        for c in &model.constraints {
            let (lhs, rhs) = (&exprs[c.lhs.index()], &exprs[c.rhs.index()]);
            assertions.push(match c.rel {
                Relation::Le => lhs.le(rhs),
                Relation::Eq => lhs.eq(rhs.clone()),
                Relation::Ge => lhs.ge(rhs),
            });
        }

        Self { ranks, exprs, assertions }
    }
}
