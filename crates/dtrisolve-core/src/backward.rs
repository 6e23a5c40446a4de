//! C5: backward solve engine. Solves `U*X = Y` given `Y` already produced
//! by the forward solve engine (§4.5): the symmetric dual of [`crate::forward`].
//!
//! `U` is stored by block row with `u_deps_of_row(i)` naming the
//! column-blocks `k > i` row `i` depends on, and `u_targets_of_col(k)` naming
//! the row-blocks `i < k` that column `k` feeds. Dataflow therefore starts
//! from *roots* — supernodes with no `U` dependents, i.e. the highest-index
//! supernode in each chain — rather than the *leaves* forward solve starts
//! from, but the counter/tree machinery is otherwise identical, so this
//! module reuses [`crate::forward`]'s dense kernels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::{debug, instrument, trace};

use crate::error::{SolveError, SolveResult};
use crate::factor::Factorization;
use crate::forward::{apply_square, apply_update};
use crate::lsum::{LsumBuffer, XBuffer};
use crate::mesh::{LBi, ProcessGrid, SupernodePartition};
use crate::transport::{Message, Transport};
use crate::types::Tag;

struct BackwardState<'a> {
    grid: &'a ProcessGrid,
    part: &'a SupernodePartition,
    fact: &'a Factorization,
    nrhs: usize,
    num_threads: usize,
    remaining: Vec<AtomicUsize>,
    participates: Vec<bool>,
    x: Mutex<&'a mut XBuffer>,
    lsum: Mutex<&'a mut LsumBuffer>,
}

impl<'a> BackwardState<'a> {
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
                .u_deps_of_row(i)
                .iter()
                .filter(|&&k| grid.owns_col_block(k))
                .count();
            let brecv = if grid.owns_diagonal(i) {
                fact.u_rtree(i).dest_count()
            } else {
                0
            };
            participates.push(local_deps > 0 || brecv > 0 || grid.owns_diagonal(i));
            remaining.push(AtomicUsize::new(local_deps + brecv));
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

    fn decrement(&self, lbi: LBi) -> bool {
        let prev = self.remaining[lbi.0].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "bmod underflow on row-block {}", lbi.0);
        prev == 1
    }

    fn tid(&self) -> usize {
        rayon::current_thread_index().unwrap_or(0) % self.num_threads
    }
}

#[cfg(all(test, feature = "test-fixtures"))]
mod tests {
    use super::*;
    use crate::fixtures::factorization_from_dense;
    use crate::lsum::{LsumBuffer, XBuffer};
    use crate::mesh::SupernodePartition;
    use ndarray::array;

    #[test]
    fn single_process_backward_solve_recovers_known_solution() {
        // upper-bidiagonal U with unit-lower L, single process: every row is
        // both a leaf (no local U dependency owed) and diagonal to itself,
        // so the whole solve must finish without ever touching a transport.
        let a = array![
            [2.0, 1.0, 0.0, 0.0],
            [0.0, 2.0, 1.0, 0.0],
            [0.0, 0.0, 2.0, 1.0],
            [0.0, 0.0, 0.0, 2.0],
        ];
        let part = SupernodePartition::scalar(4);
        let grid = ProcessGrid::new(1, 1, 0, 0);
        let fact = factorization_from_dense(&a, &part, 1, 1).unwrap();

        let mut x = XBuffer::new(&grid, &part, 1);
        let mut lsum = LsumBuffer::new(&grid, &part, 1, 1);
        // forward solve for identity L here is a no-op: seed x directly with
        // Y = [1, 2, 3, 4] as if the forward pass had already produced it.
        for (k, y) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            let lbj = grid.lbj(k);
            x.body_mut(lbj, &part)[0] = y;
        }

        solve_backward(&grid, &part, &fact, 1, 1, &mut x, &mut lsum, None).unwrap();

        let expected = {
            // solve U*x = y by hand for this specific bidiagonal system.
            let y = [1.0, 2.0, 3.0, 4.0];
            let x3 = y[3] / 2.0;
            let x2 = (y[2] - x3) / 2.0;
            let x1 = (y[1] - x2) / 2.0;
            let x0 = (y[0] - x1) / 2.0;
            [x0, x1, x2, x3]
        };
        for (k, want) in expected.into_iter().enumerate() {
            let lbj = grid.lbj(k);
            let got = x.body(lbj, &part)[0];
            assert!((got - want).abs() < 1e-9, "row {k}: {got} != {want}");
        }
    }

    #[test]
    fn root_supernode_has_no_local_dependency() {
        // the highest-index supernode of a chain never depends on anything
        // through U, so its combined counter must start at exactly brecv.
        let a = array![
            [2.0, 1.0, 0.0],
            [0.0, 2.0, 1.0],
            [0.0, 0.0, 2.0],
        ];
        let part = SupernodePartition::scalar(3);
        let grid = ProcessGrid::new(1, 1, 0, 0);
        let fact = factorization_from_dense(&a, &part, 1, 1).unwrap();
        let mut x = XBuffer::new(&grid, &part, 1);
        let mut lsum = LsumBuffer::new(&grid, &part, 1, 1);
        let state = BackwardState::new(&grid, &part, &fact, 1, 1, &mut x, &mut lsum);

        let last_lbi = grid.lbi(2);
        assert_eq!(state.remaining[last_lbi.0].load(Ordering::Acquire), 0);
        assert!(state.participates[last_lbi.0]);
    }
}

/// Drives the backward solve to completion for this rank. `lsum` must have
/// been re-zeroed and `x`'s headers re-stamped by the caller before this is
/// invoked (§4.5 "`lsum` is re-zeroed between the two solves, and block
/// headers are re-written"); [`crate::solve::solve`] does this.
#[instrument(level = "debug", skip_all, fields(rank = grid.myrank()))]
pub fn solve_backward(
    grid: &ProcessGrid,
    part: &SupernodePartition,
    fact: &Factorization,
    nrhs: usize,
    num_threads: usize,
    x: &mut XBuffer,
    lsum: &mut LsumBuffer,
    transport: Option<&dyn Transport>,
) -> SolveResult<()> {
    let state = BackwardState::new(grid, part, fact, nrhs, num_threads, x, lsum);

    let mut pending = 0usize;
    for lbi in 0..state.remaining.len() {
        if state.participates[lbi] {
            pending += 1;
        }
    }

    for lbi in 0..state.remaining.len() {
        if state.participates[lbi] && state.remaining[lbi.0].load(Ordering::Acquire) == 0 {
            finalize_row(&state, LBi(lbi), transport)?;
            pending -= 1;
        }
    }

    while pending > 0 {
        let transport = transport.ok_or_else(|| {
            SolveError::protocol("backward solve needs a transport for a multi-process mesh")
        })?;
        let msg = transport.recv_any()?;
        match msg.tag {
            Tag::BcastU => {
                apply_column_to_local_targets(&state, msg.supernode, &msg.body, Some(transport))?;
            }
            Tag::ReduceU => {
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
                    "backward solve received unexpected tag {other:?}"
                )));
            }
        }
    }
    Ok(())
}

fn apply_column_to_local_targets(
    state: &BackwardState<'_>,
    k: usize,
    xk: &[f64],
    transport: Option<&dyn Transport>,
) -> SolveResult<()> {
    let grid = state.grid;
    let part = state.part;
    let nk = part.super_size(k);
    let targets: Vec<usize> = state
        .fact
        .u_targets_of_col(k)
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
            .u_block(i, k)
            .ok_or_else(|| SolveError::protocol(format!("missing U block ({i},{k})")))?;
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
        targets.par_iter().try_for_each(|&i| apply_one(i))?;
    } else {
        for i in targets {
            apply_one(i)?;
        }
    }

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

fn finalize_row(
    state: &BackwardState<'_>,
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
        let transport = transport
            .ok_or_else(|| SolveError::protocol("non-diagonal row forward requires a transport"))?;
        let body = {
            let lsum = state.lsum.lock().unwrap();
            lsum.body(lbi, part).to_vec()
        };
        let root = state.fact.u_rtree(k).root();
        trace!(k, root, "forwarding backward reduction toward diagonal");
        return transport.send(root, Message {
            origin: grid.myrank(),
            tag: Tag::ReduceU,
            supernode: k,
            body,
        });
    }

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
        let uinv = state
            .fact
            .uinv(k)
            .ok_or_else(|| SolveError::protocol(format!("missing Uinv for supernode {k}")))?;
        apply_square(uinv, x.body_mut(lbj, part), nk, state.nrhs);
    }
    debug!(k, "diagonal backward solve complete, broadcasting");

    let xk = {
        let x = state.x.lock().unwrap();
        x.body(lbj, part).to_vec()
    };
    if let Some(transport) = transport {
        let tree = state.fact.u_btree(k);
        for &dest in tree.children_of(grid.myrank()) {
            transport.send(dest, Message {
                origin: grid.myrank(),
                tag: Tag::BcastU,
                supernode: k,
                body: xk.clone(),
            })?;
        }
    }
    apply_column_to_local_targets(state, k, &xk, transport)
}
