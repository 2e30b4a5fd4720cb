//! Integer affine maps for the strata scheduler.
//!
//! Access maps (loop indices → buffer coordinates) and domain relations
//! (parent tile domain → child tile domain) are both [`AffineMap`]s. The
//! scheduler needs three operations from them:
//!
//! - [`AffineMap::compose`] - associative composition, used when fused
//!   producer subtrees are nested several levels deep
//! - [`AffineMap::invert`] - exact inversion over a bounded domain, used to
//!   express a producer's write map in terms of buffer coordinates
//! - [`AffineMap::is_projected_permutation`] - the fusion legality test
//!
//! # Module Organization
//!
//! - [`expr`] - single affine expressions `Σ cᵢ·dᵢ + k`
//! - [`map`] - multi-result maps
//! - [`rational`] - exact rationals used by the elimination in `invert`
//! - [`error`] - error types

pub mod error;
pub mod expr;
pub mod map;
pub mod rational;


pub use error::{AffineError, Result};
pub use expr::AffineExpr;
pub use map::AffineMap;
pub use rational::Rational;
