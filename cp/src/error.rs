use snafu::Snafu;

pub type Result<T, E = CpError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum CpError {
    #[snafu(display("variable '{name}' has an empty domain"))]
    EmptyDomain { name: String },

    /// Domains are non-negative so every expression stays monotone.
    #[snafu(display("variable '{name}' has negative domain value {value}"))]
    NegativeDomain { name: String, value: i64 },

    #[snafu(display("scale factor must be non-negative, got {factor}"))]
    NegativeScale { factor: i64 },

    #[snafu(display("ceil-div divisor must be positive, got {divisor}"))]
    NonPositiveDivisor { divisor: i64 },
}
