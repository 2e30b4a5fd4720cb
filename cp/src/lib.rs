//! Finite-domain integer constraint model minimized with Z3.
//!
//! Every variable ranges over an explicit, non-negative domain and every
//! expression is built from operators that are non-decreasing in each
//! operand (`+`, `×` of non-negative terms, `max`, `⌈·/k⌉`). The model is
//! translated to Z3 integer terms and minimized one improving solution at a
//! time, so the search can stop early with the best few schedules found.
//!
//! # Module Organization
//!
//! - [`model`] - variables, expression arena, constraints
//! - `convert` - translation of a model into Z3 terms
//! - [`search`] - anytime minimization with solution and resource limits
//! - [`error`] - error types

mod convert;
pub mod error;
pub mod model;
pub mod search;


pub use error::{CpError, Result};
pub use model::{Constraint, Expr, IntVar, Model, Relation};
pub use search::{Assignment, SearchLimits, SearchOutcome, SearchStatus};
