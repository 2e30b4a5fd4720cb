use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("invalid fused group: {source}"))]
    InvalidGroup { source: strata_ir::Error },

    /// The operator body is not a primitive the scheduler can emit.
    #[snafu(display("op '{op}' has an unrecognized body: {body}"))]
    UnrecognizedBody { op: String, body: String },

    #[snafu(display("a tile tree needs at least one memory level"))]
    NoLevels,

    #[snafu(display("tree is tiled over {tree} levels but the target describes {target}"))]
    LevelMismatch { tree: usize, target: usize },

    #[snafu(display("invalid target options: {reason}"))]
    InvalidTarget { reason: &'static str },

    #[snafu(display("invalid solver config: {reason}"))]
    InvalidConfig { reason: &'static str },

    #[snafu(display("constraint model construction failed: {source}"))]
    Model { source: strata_cp::CpError },

    #[snafu(display("tree operation failed: {source}"))]
    Tree { source: strata_ir::Error },

    /// A builder or merger bug surfaced later in the pipeline.
    #[snafu(display("internal consistency violation: {reason}"))]
    InternalConsistency { reason: String },
}
