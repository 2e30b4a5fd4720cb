//! Target description and solver configuration.
//!
//! Both follow the same pattern: typed structs with `bon` builders and an
//! environment-variable fallback for the knobs worth overriding per run.

use std::collections::HashMap;

use bon::bon;
use snafu::ensure;
use strata_cp::SearchLimits;
use strata_ir::Primitive;

use crate::error::*;

// ============================================================================
// TARGET
// ============================================================================

/// One staging level of the memory hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLevel {
    /// Bytes that may be resident at this level at once.
    pub capacity: i64,
    /// Bytes moved per cycle.
    pub bandwidth: i64,
}

impl MemoryLevel {
    pub const fn new(capacity: i64, bandwidth: i64) -> Self {
        Self { capacity, bandwidth }
    }
}

/// Micro-kernel capability of one primitive, treated as opaque beyond these
/// two numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHints {
    /// Native vector width: innermost tiles prefer multiples of it and one
    /// kernel invocation covers this many iterations.
    pub granularity: i64,
    /// Cycles per kernel invocation.
    pub kernel_cycles: i64,
}

impl Default for KernelHints {
    fn default() -> Self {
        Self { granularity: 1, kernel_cycles: 1 }
    }
}

/// Memory hierarchy the scheduler tiles for.
///
/// `levels[0]` is closest to compute. Main memory sits above the last entry:
/// it is unbounded, holds every parameter and unfused intermediate, and
/// only contributes a bandwidth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOptions {
    pub levels: Vec<MemoryLevel>,
    /// Main-memory bytes per cycle.
    pub resident_bandwidth: i64,
    /// Capability of every primitive without an entry in `kernels`.
    pub hints: KernelHints,
    pub kernels: HashMap<Primitive, KernelHints>,
}

#[bon]
impl TargetOptions {
    /// Create target options with builder pattern.
    #[builder]
    pub fn builder(
        levels: Vec<MemoryLevel>,
        #[builder(default = 16)] resident_bandwidth: i64,
        #[builder(default)] hints: KernelHints,
        #[builder(default)] kernels: HashMap<Primitive, KernelHints>,
    ) -> Self {
        Self { levels, resident_bandwidth, hints, kernels }
    }

    /// A generic CPU: registers, L1, L2.
    pub fn cpu() -> Self {
        let contraction = KernelHints { granularity: 16, kernel_cycles: 4 };
        Self {
            levels: vec![MemoryLevel::new(512, 128), MemoryLevel::new(32 * 1024, 64), MemoryLevel::new(1024 * 1024, 32)],
            resident_bandwidth: 16,
            hints: KernelHints { granularity: 8, kernel_cycles: 1 },
            kernels: HashMap::from([(Primitive::Matmul, contraction), (Primitive::Conv2d, contraction)]),
        }
    }

    /// Override the kernel capability of one primitive.
    pub fn with_kernel(mut self, primitive: Primitive, hints: KernelHints) -> Self {
        self.kernels.insert(primitive, hints);
        self
    }

    /// Kernel capability used for ops of `primitive`.
    pub fn hints_for(&self, primitive: Primitive) -> KernelHints {
        self.kernels.get(&primitive).copied().unwrap_or(self.hints)
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.levels.is_empty(), InvalidTargetSnafu { reason: "no memory levels" });
        ensure!(
            self.levels.iter().all(|l| l.capacity >= 0),
            InvalidTargetSnafu { reason: "negative level capacity" }
        );
        ensure!(
            self.levels.iter().all(|l| l.bandwidth > 0) && self.resident_bandwidth > 0,
            InvalidTargetSnafu { reason: "bandwidth must be positive" }
        );
        for hints in std::iter::once(&self.hints).chain(self.kernels.values()) {
            ensure!(hints.granularity > 0, InvalidTargetSnafu { reason: "kernel granularity must be positive" });
            ensure!(hints.kernel_cycles >= 0, InvalidTargetSnafu { reason: "negative kernel cycles" });
        }
        Ok(())
    }
}

// ============================================================================
// SOLVER
// ============================================================================

/// Limits for the solver search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolverConfig {
    /// Stop after this many improving solutions.
    pub solution_limit: usize,
    /// Number of best solutions kept in the result.
    pub keep_best: usize,
    /// Z3 resource limit (`rlimit`) for each solver call. Deterministic,
    /// unlike a timeout.
    pub resource_limit: u32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self { solution_limit: 32, keep_best: 3, resource_limit: 50_000_000 }
    }
}

#[bon]
impl SolverConfig {
    /// Create a solver configuration with builder pattern.
    #[builder]
    pub fn builder(
        #[builder(default = 32)] solution_limit: usize,
        #[builder(default = 3)] keep_best: usize,
        #[builder(default = 50_000_000)] resource_limit: u32,
    ) -> Self {
        Self { solution_limit, keep_best, resource_limit }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `STRATA_SOLUTION_LIMIT` - Improving solutions before stopping (default: 32)
    /// * `STRATA_KEEP_BEST` - Solutions kept in the result (default: 3)
    /// * `STRATA_RESOURCE_LIMIT` - Z3 `rlimit` per solver call (default: 50000000)
    pub fn from_env() -> Self {
        let solution_limit = std::env::var("STRATA_SOLUTION_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(32);
        let keep_best = std::env::var("STRATA_KEEP_BEST").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        let resource_limit =
            std::env::var("STRATA_RESOURCE_LIMIT").ok().and_then(|s| s.parse().ok()).unwrap_or(50_000_000);
        Self { solution_limit, keep_best, resource_limit }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.solution_limit > 0, InvalidConfigSnafu { reason: "solution_limit must be positive" });
        ensure!(self.keep_best > 0, InvalidConfigSnafu { reason: "keep_best must be positive" });
        ensure!(self.resource_limit > 0, InvalidConfigSnafu { reason: "resource_limit must be positive" });
        Ok(())
    }

    pub fn limits(&self) -> SearchLimits {
        SearchLimits {
            solution_limit: self.solution_limit,
            keep_best: self.keep_best,
            resource_limit: self.resource_limit,
        }
    }
}
