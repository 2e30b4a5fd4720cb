use snafu::Snafu;

pub type Result<T, E = AffineError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum AffineError {
    /// Composition or construction with mismatched dimension counts.
    #[snafu(display("arity mismatch: expected {expected} dimensions, found {found}"))]
    ArityMismatch { expected: usize, found: usize },

    /// A unit expression or projection names a dimension that does not exist.
    #[snafu(display("dimension d{dim} out of range for {num_dims} dimensions"))]
    DimOutOfRange { dim: usize, num_dims: usize },

    #[snafu(display("rational {num}/0 has a zero denominator"))]
    ZeroDenominator { num: i64 },

    /// Bounded domain passed to `invert` does not match the map's input arity.
    #[snafu(display("domain arity mismatch: map has {expected} dimensions, domain has {found}"))]
    DomainArity { expected: usize, found: usize },

    /// Domain extent is not positive.
    #[snafu(display("empty domain: dimension d{dim} has extent {extent}"))]
    EmptyDomain { dim: usize, extent: i64 },

    /// A dimension with extent > 1 is not recoverable from the map's results.
    #[snafu(display("map is not injective: dimension d{dim} cannot be recovered from its results"))]
    NotInjective { dim: usize },

    /// The inverse exists over the rationals but not over the integers.
    #[snafu(display("inverse of dimension d{dim} has non-integral coefficients"))]
    NonIntegral { dim: usize },
}
