use snafu::Snafu;

use crate::group::OpId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Domain bounds must be positive compile-time integers.
    #[snafu(display("op '{op}' has non-positive bound {bound} on dimension {dim}"))]
    NonPositiveBound { op: String, dim: usize, bound: i64 },

    #[snafu(display("op '{op}' declares {names} dimension names for {dims} dimensions"))]
    DimNameCount { op: String, names: usize, dims: usize },

    #[snafu(display("op '{op}' access map for slot {slot} expects {found} dimensions, domain has {expected}"))]
    AccessArity { op: String, slot: usize, expected: usize, found: usize },

    #[snafu(display("dependence #{index} references op {op} but the group has {len} ops"))]
    DependenceOutOfRange { index: usize, op: usize, len: usize },

    #[snafu(display("dependence #{index} feeds input slot {slot} of op '{op}', which has {inputs} inputs"))]
    SlotOutOfRange { index: usize, op: String, slot: usize, inputs: usize },

    #[snafu(display("input slot {slot} of op '{op}' is fed by more than one producer"))]
    SlotFedTwice { op: String, slot: usize },

    #[snafu(display("op '{consumer}' reads a rank-{read} tensor from '{producer}', which writes rank {written}"))]
    RankMismatch { producer: String, consumer: String, read: usize, written: usize },

    #[snafu(display("dependence #{index} makes op '{op}' depend on itself"))]
    SelfDependence { index: usize, op: String },

    #[snafu(display("dependence cycle through op '{op}'"))]
    DependenceCycle { op: String },

    #[snafu(display("group output index {index} is out of range for {len} ops"))]
    OutputOutOfRange { index: usize, len: usize },

    /// Structural invariant of the tile tree does not hold.
    #[snafu(display("tree invariant violated at {node}: {reason}"))]
    TreeInvariant { node: String, reason: &'static str },

    #[snafu(display("{op} has no op node in the tree"))]
    UnknownOp { op: OpId },

    #[snafu(display("domain relation composition failed: {source}"))]
    Relation { source: strata_affine::AffineError },
}
