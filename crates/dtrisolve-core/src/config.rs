//! Solve-time configuration (§10.1): everything a caller can tune without
//! touching the factorization, permutation, or communication-plan inputs.
//!
//! Transport selection is deliberately not one of these tunables: which
//! [`crate::transport::TransportKind`] a run uses is a property of the
//! [`crate::world::LocalWorld`] passed to [`crate::solve::solve`], since the
//! transport mesh has to be built (and its windows/channels sized) before
//! the solve starts, not decided afterward by a value `solve` merely reads.

use crate::error::{SolveError, SolveResult};

/// Tunables for one call to [`crate::solve::solve`]. Defaults favor
/// correctness and determinism over throughput (one worker thread).
#[derive(Debug, Clone)]
pub struct SolveConfig {
    /// Worker threads the forward/backward update kernels may use for the
    /// task-parallel leaf/update loop (§4.4.6). `lsum` is over-allocated by
    /// this many replicas.
    pub num_threads: usize,
    /// Supernode size at or below which the intrinsic (non-BLAS) triangular
    /// inversion substitution is always used regardless of any BLAS backend
    /// being linked (§4.2, §9 "intrinsic fallback").
    pub small_block_threshold: usize,
    /// Absolute tolerance used by this crate's own residual checks in
    /// tests; not consulted by the solve path itself.
    pub test_tolerance: f64,
}

impl Default for SolveConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            small_block_threshold: 8,
            test_tolerance: 1e-9,
        }
    }
}

impl SolveConfig {
    pub fn validate(&self) -> SolveResult<()> {
        if self.num_threads == 0 {
            return Err(SolveError::protocol("num_threads must be at least 1"));
        }
        if self.test_tolerance < 0.0 {
            return Err(SolveError::protocol("test_tolerance must be non-negative"));
        }
        Ok(())
    }
}
