use thiserror::Error;

/// Errors surfaced by the transport abstraction (§10.4). Both the in-process
/// two-sided and shared-window transports report through this type instead
/// of panicking, so a caller driving a mesh of worker threads can unwind
/// cleanly and tear down the other ranks.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rank {rank} disconnected from the mesh before the solve completed")]
    RankDisconnected { rank: usize },

    #[error("collective exchange size mismatch: expected {expected} entries, got {actual}")]
    CollectiveSizeMismatch { expected: usize, actual: usize },

    #[error("shared window overflow: slot for origin {origin} needs {needed} doubles, window has {capacity}")]
    WindowOverflow {
        origin: usize,
        needed: usize,
        capacity: usize,
    },

    /// Another rank in this mesh returned an error; the process group is
    /// tearing down (§5 "any MPI error aborts the process group"). Raised by
    /// a rank still blocked in `recv_any` once it notices the shared abort
    /// flag another rank's failure set, so it can unwind instead of hanging.
    #[error("mesh aborted: another rank reported an error")]
    Aborted,
}

/// Numerical failure recorded by the diagonal-block inverter (C2). Per the
/// historical contract this does not abort the run: the offending block's
/// inverse is still returned (with whatever NaNs/Infs fall out), and the
/// caller is expected to check `metrics` before trusting the result.
#[derive(Debug, Error)]
pub enum InversionError {
    #[error("diagonal block for supernode {supernode} is singular at pivot {pivot}")]
    SingularPivot { supernode: usize, pivot: usize },
}

/// Top-level error type for the solve entry point and its components.
#[derive(Debug, Error)]
pub enum SolveError {
    /// Argument validation failure (§7 taxonomy item 1). Carries the
    /// 1-based negative `info` convention of the historical reference: the
    /// `arg_index` is the position of the offending argument.
    #[error("invalid argument #{arg_index} ({name}): {reason}")]
    InvalidArgument {
        arg_index: i32,
        name: &'static str,
        reason: String,
    },

    #[error("allocation failed: {context}")]
    Allocation { context: &'static str },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("numerical failure during diagonal-block inversion: {0}")]
    Inversion(#[from] InversionError),

    /// A protocol invariant (counter underflow, unexpected tag, mesh
    /// topology mismatch) was violated. This always indicates a bug in the
    /// caller-supplied factorization/tree/comm-plan inputs or in this
    /// crate, never a runtime condition to recover from.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type SolveResult<T> = Result<T, SolveError>;

impl SolveError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// `info` value for the C-style entry point: negative argument index on
    /// validation failure, zero on success semantics are the caller's to
    /// assign.
    pub fn info(&self) -> i32 {
        match self {
            SolveError::InvalidArgument { arg_index, .. } => -*arg_index,
            _ => -1,
        }
    }
}
