//! C4: forward solve engine. Solves `L*Y = B'` with `B'` already
//! distributed into `x` by the redistributor (§4.4).
//!
//! The dataflow is a self-scheduled state machine per row-block, driven by
//! a combined modification counter (§3 "Modification counters", §4.4.2):
//! every row-block `i` this rank owns (`grid.owns_row_block(i)`) needs the
//! contribution of every off-diagonal `L_{i,j}` with `j` a local column
//! (`grid.owns_col_block(j)`) applied to `lsum[i]` before it is complete.
//! The *diagonal* process of row `i` additionally needs `frecv[i]` reduction
//! messages from the other process-columns in its mesh row before it can
//! fold `lsum[i]` into `x[i]` and run the diagonal `GEMM`. Because
//! [`crate::trees::StarTree`] already drops the root from its own
//! participant list, `fact.l_rtree(i).dest_count()` is exactly that count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::{debug, instrument, trace};

use crate::error::{SolveError, SolveResult};
use crate::factor::Factorization;
use crate::lsum::{LsumBuffer, XBuffer, col_major_index};
use crate::mesh::{LBi, ProcessGrid, SupernodePartition};
use crate::transport::{Message, Transport};
use crate::types::Tag;

/// `y[k] <- a * y[k]` where `a` is `n x n` column-major and `y[k]` is
/// `n x nrhs` column-major: the diagonal `GEMM` against the precomputed
/// inverse (§4.4.5 "Leaf / diagonal solve").
pub(crate) fn apply_square(a: &ndarray::Array2<f64>, y: &mut [f64], n: usize, nrhs: usize) {
    let mut out = vec![0.0; n * nrhs];
    for col in 0..nrhs {
        for row in 0..n {
            let mut acc = 0.0;
            for p in 0..n {
                acc += a[[row, p]] * y[col_major_index(p, col, n)];
            }
            out[col_major_index(row, col, n)] = acc;
        }
    }
    y.copy_from_slice(&out);
}

/// `lsum[i] -= block * x[k]` where `block` is `ni x nk`, `x[k]` is
/// `nk x nrhs`, `lsum[i]` is `ni x nrhs` (§4.4.1, §4.4.5 "Update kernel").
pub(crate) fn apply_update(
    block: &ndarray::Array2<f64>,
    xk: &[f64],
    lsum_i: &mut [f64],
    ni: usize,
    nk: usize,
    nrhs: usize,
) {
    for col in 0..nrhs {
        for row in 0..ni {
            let mut acc = 0.0;
            for p in 0..nk {
                acc += block[[row, p]] * xk[col_major_index(p, col, nk)];
            }
            lsum_i[col_major_index(row, col, ni)] -= acc;
        }
    }
}

/// Per-rank mutable state for one forward solve. Counters are atomic
/// because the update kernel may be invoked from several rayon worker
/// threads concurrently for distinct row-blocks (§4.4.6).
struct ForwardState<'a> {
    grid: &'a ProcessGrid,
    part: &'a SupernodePartition,
    fact: &'a Factorization,
    nrhs: usize,
    num_threads: usize,
    /// Remaining local (same-process-column) contributions for row-block
    /// `lbi`, combined with `frecv` on diagonal rows (§4.4.2).
    remaining: Vec<AtomicUsize>,
    /// Whether this rank ever had work to do for row-block `lbi` at all
    /// (i.e. was a genuine participant, §4.4.1): rows with no local
    /// dependency and no `frecv` never send or receive anything.
    participates: Vec<bool>,
    x: Mutex<&'a mut XBuffer>,
    lsum: Mutex<&'a mut LsumBuffer>,
}

impl<'a> ForwardState<'a> {
    fn new(
        grid: &'a ProcessGrid,
        part: &'a SupernodePartition,
        fact: &'a Factorization,
        nrhs: usize,
        num_threads: usize,
        x: &'a mut XBuffer,
        lsum: &'a mut LsumBuffer,
    ) -> Self {
        let num_local = lsum.layout.num_local();
        let mut remaining = Vec::with_capacity(num_local);
        let mut participates = Vec::with_capacity(num_local);
        for lbi in 0..num_local {
            let i = lsum.layout.super_at(lbi);
            let local_deps = fact
                .l_deps_of_row(i)
                .iter()
                .filter(|&&j| grid.owns_col_block(j))
                .count();
            let frecv = if grid.owns_diagonal(i) {
                fact.l_rtree(i).dest_count()
            } else {
                0
            };
            participates.push(local_deps > 0 || frecv > 0 || grid.owns_diagonal(i));
            remaining.push(AtomicUsize::new(local_deps + frecv));
        }
        Self {
            grid,
            part,
            fact,
            nrhs,
            num_threads: num_threads.max(1),
            remaining,
            participates,
            x: Mutex::new(x),
            lsum: Mutex::new(lsum),
        }
    }

    /// Decrements `remaining[lbi]` by one and reports whether this call
    /// drove it to zero (the exactly-once state transition, §5 "Ordering
    /// guarantees").
    fn decrement(&self, lbi: LBi) -> bool {
        let prev = self.remaining[lbi.0].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "fmod underflow on row-block {}", lbi.0);
        prev == 1
    }

    fn tid(&self) -> usize {
        rayon::current_thread_index().unwrap_or(0) % self.num_threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn apply_square_solves_diagonal_system() {
        // a == Linv for l = [[1,0],[3,1]]; y starts as l*x, a*y should recover x.
        let linv = array![[1.0, 0.0], [-3.0, 1.0]];
        let mut y = vec![5.0, 1.0]; // l * [5, -14] = [5, 1]
        apply_square(&linv, &mut y, 2, 1);
        assert!((y[0] - 5.0).abs() < 1e-12);
        assert!((y[1] - (-14.0)).abs() < 1e-12);
    }

    #[test]
    fn apply_square_is_columnwise_independent_across_rhs() {
        let linv = array![[1.0, 0.0], [-3.0, 1.0]];
        // two right-hand sides packed column-major, back to back.
        let mut y = vec![5.0, 1.0, 10.0, 2.0];
        apply_square(&linv, &mut y, 2, 2);
        assert!((y[col_major_index(1, 0, 2)] - (-14.0)).abs() < 1e-12);
        assert!((y[col_major_index(1, 1, 2)] - (-28.0)).abs() < 1e-12);
    }

    #[test]
    fn apply_update_subtracts_block_times_x() {
        let block = array![[2.0, 0.0], [1.0, 3.0]];
        let xk = vec![1.0, 2.0];
        let mut lsum = vec![10.0, 10.0];
        apply_update(&block, &xk, &mut lsum, 2, 2, 1);
        // lsum -= block * xk == [2*1+0*2, 1*1+3*2] == [2, 7]
        assert!((lsum[0] - 8.0).abs() < 1e-12);
        assert!((lsum[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn apply_update_leaves_lsum_untouched_for_zero_rhs() {
        let block = array![[1.0]];
        let xk: Vec<f64> = vec![];
        let mut lsum: Vec<f64> = vec![];
        apply_update(&block, &xk, &mut lsum, 1, 1, 0);
        assert!(lsum.is_empty());
    }
}

/// Drives the forward solve to completion for this rank. `transport` is
/// `None` on a single-process mesh, where every supernode is diagonal to
/// itself and no broadcast/reduction message is ever actually sent (the
/// generic algorithm below degenerates to pure local application).
#[instrument(level = "debug", skip_all, fields(rank = grid.myrank()))]
pub fn solve_forward(
    grid: &ProcessGrid,
    part: &SupernodePartition,
    fact: &Factorization,
    nrhs: usize,
    num_threads: usize,
    x: &mut XBuffer,
    lsum: &mut LsumBuffer,
    transport: Option<&dyn Transport>,
) -> SolveResult<()> {
    let state = ForwardState::new(grid, part, fact, nrhs, num_threads, x, lsum);

    let mut pending = 0usize;
    for lbi in 0..state.remaining.len() {
        if !state.participates[lbi] {
            continue;
        }
        pending += 1;
    }

    // §4.4.3: rows with fmod == 0 at entry are leaves; drain them before
    // entering the message loop so a zero-message single-process run never
    // calls into the transport at all.
    for lbi in 0..state.remaining.len() {
        if state.participates[lbi] && state.remaining[lbi.0].load(Ordering::Acquire) == 0 {
            finalize_row(&state, LBi(lbi), transport)?;
            pending -= 1;
        }
    }

    while pending > 0 {
        let transport = transport.ok_or_else(|| {
            SolveError::protocol("forward solve needs a transport for a multi-process mesh")
        })?;
        let msg = transport.recv_any()?;
        match msg.tag {
            Tag::BcastL => {
                apply_broadcast(&state, &msg, transport)?;
            }
            Tag::ReduceL => {
                let i = msg.supernode;
                let lbi = grid.lbi(i);
                {
                    let mut lsum = state.lsum.lock().unwrap();
                    let body = lsum.body_mut(lbi, part);
                    for (slot, v) in body.iter_mut().zip(msg.body.iter()) {
                        *slot += v;
                    }
                }
                if state.decrement(lbi) {
                    finalize_row(&state, lbi, Some(transport))?;
                    pending -= 1;
                }
            }
            other => {
                return Err(SolveError::protocol(format!(
                    "forward solve received unexpected tag {other:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Applies a received broadcast of `x[k]` to every locally-owned row-block
/// this rank has an off-diagonal `L_{i,k}` block for, mirroring the work the
/// diagonal process of `k` also does for its own locally-owned targets
/// (§4.4.2 "SOLVED -> BROADCAST").
fn apply_broadcast(
    state: &ForwardState<'_>,
    msg: &Message,
    transport: &dyn Transport,
) -> SolveResult<()> {
    apply_column_to_local_targets(state, msg.supernode, &msg.body, Some(transport))
}

/// Shared by both the message-delivered path ([`apply_broadcast`]) and the
/// diagonal rank's own post-solve application of its column to local
/// targets, which needs no round trip through the transport at all.
fn apply_column_to_local_targets(
    state: &ForwardState<'_>,
    k: usize,
    xk: &[f64],
    transport: Option<&dyn Transport>,
) -> SolveResult<()> {
    let grid = state.grid;
    let part = state.part;
    let nk = part.super_size(k);
    let targets: Vec<usize> = state
        .fact
        .l_targets_of_col(k)
        .iter()
        .copied()
        .filter(|&i| grid.owns_row_block(i))
        .collect();

    let newly_ready: Mutex<Vec<LBi>> = Mutex::new(Vec::new());
    let apply_one = |i: usize| -> SolveResult<()> {
        let lbi = grid.lbi(i);
        let ni = part.super_size(i);
        let block = state
            .fact
            .l_block(i, k)
            .ok_or_else(|| SolveError::protocol(format!("missing L block ({i},{k})")))?;
        let tid = state.tid();
        {
            let mut lsum = state.lsum.lock().unwrap();
            let body = lsum.thread_body_mut(tid, lbi, part);
            apply_update(block, xk, body, ni, nk, state.nrhs);
        }
        if state.decrement(lbi) {
            newly_ready.lock().unwrap().push(lbi);
        }
        Ok(())
    };

    if state.num_threads > 1 && targets.len() > 1 {
        use rayon::prelude::*;
        targets
            .par_iter()
            .try_for_each(|&i| apply_one(i))?;
    } else {
        for i in targets {
            apply_one(i)?;
        }
    }

    // Reduce thread-local replicas into the canonical slot before any
    // row's reduction/solve reads lsum (§4.4.6).
    {
        let mut lsum = state.lsum.lock().unwrap();
        for &lbi in newly_ready.lock().unwrap().iter() {
            lsum.reduce_threads(lbi, part);
        }
    }
    for lbi in newly_ready.into_inner().unwrap() {
        finalize_row(state, lbi, transport)?;
    }
    Ok(())
}

/// A row-block's combined counter has reached zero: either forward the
/// accumulated partial sum toward the diagonal (non-diagonal rank), or fold
/// it into `x[k]`, run the diagonal `GEMM`, and broadcast (diagonal rank),
/// §4.4.2 "REDUCED -> SOLVED -> BROADCAST".
fn finalize_row(
    state: &ForwardState<'_>,
    lbi: LBi,
    transport: Option<&dyn Transport>,
) -> SolveResult<()> {
    let grid = state.grid;
    let part = state.part;
    let k = {
        let lsum = state.lsum.lock().unwrap();
        lsum.layout.super_at(lbi.0)
    };

    if !grid.owns_diagonal(k) {
        let transport = transport.ok_or_else(|| {
            SolveError::protocol("non-diagonal row forward requires a transport")
        })?;
        let body = {
            let lsum = state.lsum.lock().unwrap();
            lsum.body(lbi, part).to_vec()
        };
        let root = state.fact.l_rtree(k).root();
        trace!(k, root, "forwarding reduction toward diagonal");
        return transport.send(root, Message {
            origin: grid.myrank(),
            tag: Tag::ReduceL,
            supernode: k,
            body,
        });
    }

    // Diagonal process: fold lsum[k] into x[k], then run the GEMM.
    let lbj = grid.lbj(k);
    let nk = part.super_size(k);
    {
        let mut x = state.x.lock().unwrap();
        let lsum = state.lsum.lock().unwrap();
        let lsum_body = lsum.body(lbi, part);
        let x_body = x.body_mut(lbj, part);
        for (xv, lv) in x_body.iter_mut().zip(lsum_body.iter()) {
            *xv += lv;
        }
        let linv = state
            .fact
            .linv(k)
            .ok_or_else(|| SolveError::protocol(format!("missing Linv for supernode {k}")))?;
        apply_square(linv, x.body_mut(lbj, part), nk, state.nrhs);
    }
    debug!(k, "diagonal forward solve complete, broadcasting");

    let xk = {
        let x = state.x.lock().unwrap();
        x.body(lbj, part).to_vec()
    };
    if let Some(transport) = transport {
        let tree = state.fact.l_btree(k);
        for &dest in tree.children_of(grid.myrank()) {
            transport.send(dest, Message {
                origin: grid.myrank(),
                tag: Tag::BcastL,
                supernode: k,
                body: xk.clone(),
            })?;
        }
    }
    apply_column_to_local_targets(state, k, &xk, transport)
}
