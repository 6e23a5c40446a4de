//! In-process realization of a process mesh (§10.4): spawns one worker
//! thread per rank, each handed its own [`ProcessGrid`] coordinate, a
//! point-to-point [`Transport`] handle, and a shared collective, and joins
//! them back into a single per-rank result vector.
//!
//! This is the concrete "two transport variants selectable at build or
//! runtime" (§4.4.4) realized without a real multi-host message-passing
//! library: every example repo this crate draws on ships no MPI binding, so
//! the mesh is simulated with OS threads rather than real processes. It is
//! what makes the end-to-end scenarios of §8 runnable as ordinary tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::error::SolveResult;
use crate::mesh::ProcessGrid;
use crate::transport::collective::CollectiveWorld;
use crate::transport::{Transport, TransportKind};

/// A `pr x pc` mesh realized as `pr * pc` OS threads sharing one
/// [`CollectiveWorld`] and one point-to-point transport mesh.
#[derive(Debug, Clone, Copy)]
pub struct LocalWorld {
    pub pr: usize,
    pub pc: usize,
    pub transport_kind: TransportKind,
}

impl LocalWorld {
    pub fn new(pr: usize, pc: usize, transport_kind: TransportKind) -> Self {
        Self {
            pr,
            pc,
            transport_kind,
        }
    }

    pub fn nprocs(&self) -> usize {
        self.pr * self.pc
    }

    pub fn is_single_process(&self) -> bool {
        self.nprocs() == 1
    }

    /// Runs `f` once per rank, in its own thread, passing that rank's
    /// [`ProcessGrid`] coordinate, its point-to-point transport handle, and
    /// a shared [`CollectiveWorld`]. Blocks until every rank's closure
    /// returns, then collects the results in rank order. The first error
    /// any rank reports is returned; per §5 "any MPI error aborts the
    /// process group", this crate does not attempt partial recovery.
    ///
    /// The moment any rank's closure returns `Err`, a shared abort flag is
    /// set before that error is recorded, so every other rank still blocked
    /// in `transport.recv_any()` notices within one poll interval and
    /// unwinds with `TransportError::Aborted` instead of hanging forever on
    /// a message that will now never arrive.
    pub fn run<F, R>(&self, f: F) -> SolveResult<Vec<R>>
    where
        F: Fn(ProcessGrid, Box<dyn Transport>, Arc<CollectiveWorld>) -> SolveResult<R>
            + Send
            + Sync,
        R: Send,
    {
        let nprocs = self.nprocs();
        let collective = CollectiveWorld::new(nprocs);
        let abort = Arc::new(AtomicBool::new(false));
        let transports = self.transport_kind.build(nprocs, Arc::clone(&abort)).into_boxed();
        let f = &f;
        let results: Vec<SolveResult<R>> = thread::scope(|scope| {
            let handles: Vec<_> = transports
                .into_iter()
                .enumerate()
                .map(|(rank, transport)| {
                    let grid = ProcessGrid::new(self.pr, self.pc, rank / self.pc, rank % self.pc);
                    let collective = Arc::clone(&collective);
                    let abort = Arc::clone(&abort);
                    scope.spawn(move || {
                        let result = f(grid, transport, collective);
                        if result.is_err() {
                            abort.store(true, Ordering::Release);
                        }
                        result
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("mesh worker thread panicked"))
                .collect()
        });
        results.into_iter().collect()
    }
}
