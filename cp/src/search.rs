//! Anytime minimization on top of `z3::Optimize`.
//!
//! # Algorithm
//!
//! 1. Assert the model's constraints and minimize variable ranks
//!    lexicographically in branch order
//! 2. Each `check` yields the preferred assignment whose objective beats the
//!    incumbent; record it and require `objective < value` from then on
//! 3. Stop when the solver proves no better assignment exists, after
//!    `solution_limit` improving solutions, or when a call exhausts
//!    `resource_limit`
//!
//! The resource limit is Z3's deterministic `rlimit`, not a wall clock, so a
//! search is reproducible.

use std::fmt;

use z3::ast::Int;
use z3::{Optimize, Params, SatResult};

use crate::convert::Encoding;
use crate::model::{Expr, IntVar, Model};

/// Work limits for [`Model::minimize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchLimits {
    /// Stop after this many improving solutions.
    pub solution_limit: usize,
    /// How many of the best solutions to return.
    pub keep_best: usize,
    /// Z3 `rlimit` granted to each solver call.
    pub resource_limit: u32,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self { solution_limit: 32, keep_best: 3, resource_limit: 50_000_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStatus {
    /// No better assignment exists; the first solution is optimal.
    Optimal,
    /// No feasible assignment exists.
    Infeasible,
    /// Stopped after `solution_limit` improvements.
    SolutionLimit,
    /// A solver call ran out of `resource_limit`.
    ResourceLimit,
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Optimal => write!(f, "optimal"),
            Self::Infeasible => write!(f, "infeasible"),
            Self::SolutionLimit => write!(f, "solution-limit"),
            Self::ResourceLimit => write!(f, "resource-limit"),
        }
    }
}

/// A complete variable valuation with its objective value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    values: Vec<i64>,
    objective: i64,
}

impl Assignment {
    pub fn value(&self, var: IntVar) -> i64 {
        self.values[var.index()]
    }

    pub fn is_set(&self, var: IntVar) -> bool {
        self.values[var.index()] != 0
    }

    pub fn objective(&self) -> i64 {
        self.objective
    }

    pub fn values(&self) -> &[i64] {
        &self.values
    }

    /// Evaluate any expression of `model` under this assignment.
    pub fn eval(&self, model: &Model, expr: Expr) -> i64 {
        model.eval(expr, &self.values)
    }
}

/// Result of a search: best solutions first.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub solutions: Vec<Assignment>,
    pub status: SearchStatus,
    /// Solver calls made.
    pub rounds: u64,
}

impl SearchOutcome {
    pub fn best(&self) -> Option<&Assignment> {
        self.solutions.first()
    }
}

/// Read variable values back out of a Z3 model through their ranks.
fn read_values(model: &Model, encoding: &Encoding, z3_model: &z3::Model) -> Option<Vec<i64>> {
    model
        .vars
        .iter()
        .zip(&encoding.ranks)
        .map(|(info, rank)| {
            let k = z3_model.eval(rank, true)?.as_i64()?;
            usize::try_from(k).ok().and_then(|k| info.domain.get(k)).copied()
        })
        .collect()
}

impl Model {
    /// Minimize `objective` subject to all constraints.
    ///
    /// Infeasibility is reported through [`SearchStatus::Infeasible`] with no
    /// solutions, never as an error.
    #[tracing::instrument(skip_all, fields(vars = self.vars.len(), constraints = self.constraints.len()))]
    pub fn minimize(&self, objective: Expr, limits: &SearchLimits) -> SearchOutcome {
        let encoding = Encoding::new(self);
        let optimize = Optimize::new();
        let mut params = Params::new();
        params.set_u32("rlimit", limits.resource_limit);
        optimize.set_params(&params);

        for assertion in &encoding.assertions {
            optimize.assert(assertion);
        }
        for var in self.resolved_branch_order() {
            optimize.minimize(&encoding.ranks[var.index()]);
        }

        let solution_limit = limits.solution_limit.max(1);
        let target = &encoding.exprs[objective.index()];
        let mut found: Vec<Assignment> = Vec::new();
        let mut rounds = 0u64;
        let status = loop {
            rounds += 1;
            match optimize.check(&[]) {
                SatResult::Unsat if found.is_empty() => break SearchStatus::Infeasible,
                SatResult::Unsat => break SearchStatus::Optimal,
                SatResult::Unknown => break SearchStatus::ResourceLimit,
                SatResult::Sat => {}
            }
            let Some(values) = optimize.get_model().and_then(|m| read_values(self, &encoding, &m)) else {
                tracing::warn!(rounds, "solver reported sat without a readable model");
                break SearchStatus::ResourceLimit;
            };
            let value = self.eval(objective, &values);
            tracing::debug!(objective = value, rounds, "improving solution");
            found.push(Assignment { values, objective: value });
            if found.len() >= solution_limit {
                break SearchStatus::SolutionLimit;
            }
            optimize.assert(&target.lt(Int::from_i64(value)));
        };

        let keep = limits.keep_best.max(1);
        let solutions: Vec<Assignment> = found.into_iter().rev().take(keep).collect();
        tracing::debug!(%status, rounds, best = solutions.first().map(|s| s.objective), "search finished");

        SearchOutcome { solutions, status, rounds }
    }
}
