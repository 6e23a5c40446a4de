//! Dense-matrix fixture builders.
//!
//! Numeric factorization, supernode amalgamation, tree construction, and
//! communication-plan derivation are all out of scope for this crate (§1) —
//! in production they are produced by other collaborators and handed to the
//! solve entry point as opaque inputs (§6). This module stands in for those
//! collaborators with the simplest correct thing that can produce such
//! inputs from a dense matrix: an unpivoted block LU and a flat star-tree
//! topology. It exists for this crate's own tests and for the CLI's demo
//! scenarios, not as part of the solve core itself.

use std::collections::HashMap;

use ndarray::{Array2, s};

use crate::error::{InversionError, SolveError, SolveResult};
use crate::factor::{CommPlan, Factorization, ScalePerm};
use crate::inverse::invert_diagonal_block;
use crate::mesh::SupernodePartition;
use crate::trees::StarTree;

fn pnum(pr_unused: usize, pc: usize, prow: usize, pcol: usize) -> usize {
    let _ = pr_unused;
    prow * pc + pcol
}

/// Unpivoted Doolittle LU of a dense `n x n` matrix: `a = l * u` with `l`
/// unit lower triangular and `u` upper triangular. Adequate for the
/// well-conditioned fixtures this crate's tests and demos use (§8); not a
/// substitute for a real numeric factorization.
fn dense_lu_no_pivot(a: &Array2<f64>) -> SolveResult<(Array2<f64>, Array2<f64>)> {
    let n = a.nrows();
    debug_assert_eq!(a.ncols(), n);
    let mut u = a.clone();
    let mut l = Array2::<f64>::eye(n);
    for k in 0..n {
        let pivot = u[[k, k]];
        if pivot == 0.0 {
            return Err(SolveError::Inversion(InversionError::SingularPivot {
                supernode: k,
                pivot: k,
            }));
        }
        for i in (k + 1)..n {
            let factor = u[[i, k]] / pivot;
            l[[i, k]] = factor;
            for j in k..n {
                u[[i, j]] -= factor * u[[k, j]];
            }
        }
    }
    Ok((l, u))
}

/// Builds a [`Factorization`] by running [`dense_lu_no_pivot`] on `a` and
/// chopping the result into the supernode-block structure `part` describes,
/// distributing block ownership over a `pr x pc` mesh and building a flat
/// star tree per supernode for both the broadcast and reduction directions.
pub fn factorization_from_dense(
    a: &Array2<f64>,
    part: &SupernodePartition,
    pr: usize,
    pc: usize,
) -> SolveResult<Factorization> {
    let nsupers = part.nsupers();
    let (full_l, full_u) = dense_lu_no_pivot(a)?;

    const ZERO_TOL: f64 = 1e-13;

    let mut l_cols = vec![Vec::new(); nsupers];
    let mut l_rows = vec![Vec::new(); nsupers];
    let mut u_rows = vec![Vec::new(); nsupers];
    let mut u_cols = vec![Vec::new(); nsupers];
    let mut l_blocks = HashMap::new();
    let mut u_blocks = HashMap::new();
    let mut linv = HashMap::new();
    let mut uinv = HashMap::new();
    let mut inversion_failures = Vec::new();

    for k in 0..nsupers {
        let ks = part.fst_block_c(k);
        let ke = ks + part.super_size(k);
        let lkk = full_l.slice(s![ks..ke, ks..ke]).to_owned();
        let ukk = full_u.slice(s![ks..ke, ks..ke]).to_owned();
        let (li, ui, failures) = invert_diagonal_block(&lkk, &ukk, k);
        inversion_failures.extend(failures);
        linv.insert(k, li);
        uinv.insert(k, ui);

        for hi in (k + 1)..nsupers {
            let his = part.fst_block_c(hi);
            let hie = his + part.super_size(hi);
            let l_block = full_l.slice(s![his..hie, ks..ke]).to_owned();
            if l_block.iter().any(|v| v.abs() > ZERO_TOL) {
                l_cols[k].push(hi);
                l_rows[hi].push(k);
                l_blocks.insert((hi, k), l_block);
            }
            let u_block = full_u.slice(s![ks..ke, his..hie]).to_owned();
            if u_block.iter().any(|v| v.abs() > ZERO_TOL) {
                u_rows[k].push(hi);
                u_cols[hi].push(k);
                u_blocks.insert((k, hi), u_block);
            }
        }
    }

    let l_btree = (0..nsupers)
        .map(|k| {
            let root = pnum(pr, pc, k % pr, k % pc);
            let participants = std::iter::once(root)
                .chain(l_cols[k].iter().map(|&i| pnum(pr, pc, i % pr, k % pc)))
                .collect();
            StarTree::new(root, participants)
        })
        .collect();
    let l_rtree = (0..nsupers)
        .map(|i| {
            let root = pnum(pr, pc, i % pr, i % pc);
            let participants = std::iter::once(root)
                .chain(l_rows[i].iter().map(|&j| pnum(pr, pc, i % pr, j % pc)))
                .collect();
            StarTree::new(root, participants)
        })
        .collect();
    let u_btree = (0..nsupers)
        .map(|k| {
            let root = pnum(pr, pc, k % pr, k % pc);
            let participants = std::iter::once(root)
                .chain(u_cols[k].iter().map(|&i| pnum(pr, pc, i % pr, k % pc)))
                .collect();
            StarTree::new(root, participants)
        })
        .collect();
    let u_rtree = (0..nsupers)
        .map(|i| {
            let root = pnum(pr, pc, i % pr, i % pc);
            let participants = std::iter::once(root)
                .chain(u_rows[i].iter().map(|&k| pnum(pr, pc, i % pr, k % pc)))
                .collect();
            StarTree::new(root, participants)
        })
        .collect();

    Ok(Factorization::assemble(
        nsupers, l_cols, l_rows, u_rows, u_cols, l_blocks, u_blocks, linv, uinv, l_btree, l_rtree,
        u_btree, u_rtree, inversion_failures,
    ))
}

/// Trivial identity row-to-process / diagonal-process plan for a `pr x pc`
/// mesh: row `r`'s block is `supno[r]`, owned by `PNUM(supno[r]%pr,
/// supno[r]%pc)`.
pub fn identity_comm_plan(part: &SupernodePartition, pr: usize, pc: usize) -> CommPlan {
    let n = part.n();
    let row_to_proc = (0..n)
        .map(|row| {
            let k = part.block_num(row);
            pnum(pr, pc, k % pr, k % pc)
        })
        .collect();
    let diag_procs = (0..pr.min(pc))
        .map(|d| pnum(pr, pc, d, d))
        .collect::<Vec<_>>();
    CommPlan {
        row_to_proc,
        diag_procs,
    }
}

pub fn identity_scale_perm(n: usize) -> ScalePerm {
    ScalePerm::identity(n)
}
