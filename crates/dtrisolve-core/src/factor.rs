//! Data model for the factorization, permutation, and communication-plan
//! inputs this core consumes but never computes (§1 "Out of scope", §6).
//!
//! Everything in this module is a plain data container: construction of a
//! real instance (running the numeric factorization, deriving the
//! broadcast/reduction trees, computing the row-to-process communication
//! plan) belongs to collaborators outside this crate. The
//! [`crate::fixtures`] module (behind the `test-fixtures` feature) builds
//! concrete instances from a dense matrix for tests and demos; production
//! use is expected to populate a [`Factorization`] directly from whatever
//! the upstream factorization step produced.

use std::collections::HashMap;

use ndarray::Array2;

use crate::error::InversionError;
use crate::trees::StarTree;
use crate::types::ProcessId;

/// Dense off-diagonal blocks and precomputed diagonal inverses for both `L`
/// and `U`, plus the broadcast/reduction trees each supernode needs during
/// the solve. Block indices are global supernode numbers; every rank holds
/// the same `Factorization` value and filters to the blocks it owns via
/// `ProcessGrid::owns_*` (§3 "Local storage").
#[derive(Debug, Clone)]
pub struct Factorization {
    nsupers: usize,
    /// `l_cols[k]`: row-blocks `i > k` with a nonzero `L_{i,k}`.
    l_cols: Vec<Vec<usize>>,
    /// `l_rows[i]`: column-blocks `j < i` with a nonzero `L_{i,j}`.
    l_rows: Vec<Vec<usize>>,
    /// `u_rows[i]`: column-blocks `k > i` with a nonzero `U_{i,k}` (U stored
    /// by block row, §3).
    u_rows: Vec<Vec<usize>>,
    /// `u_cols[k]`: row-blocks `i < k` with a nonzero `U_{i,k}`.
    u_cols: Vec<Vec<usize>>,
    l_blocks: HashMap<(usize, usize), Array2<f64>>,
    u_blocks: HashMap<(usize, usize), Array2<f64>>,
    linv: HashMap<usize, Array2<f64>>,
    uinv: HashMap<usize, Array2<f64>>,
    l_btree: Vec<StarTree>,
    l_rtree: Vec<StarTree>,
    u_btree: Vec<StarTree>,
    u_rtree: Vec<StarTree>,
    /// Singular diagonal blocks recorded by C2 during `Linv`/`Uinv`
    /// construction (§7 item 4: "record in info, continue"). Non-empty here
    /// means at least one supernode's `Uinv` is NaN/Inf-poisoned; the solve
    /// itself still runs to completion rather than aborting.
    inversion_failures: Vec<InversionError>,
}

impl Factorization {
    /// Assembles a `Factorization` from its constituent structure, blocks,
    /// inverses, and trees. All `Vec`s must be indexed `0..nsupers`.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        nsupers: usize,
        l_cols: Vec<Vec<usize>>,
        l_rows: Vec<Vec<usize>>,
        u_rows: Vec<Vec<usize>>,
        u_cols: Vec<Vec<usize>>,
        l_blocks: HashMap<(usize, usize), Array2<f64>>,
        u_blocks: HashMap<(usize, usize), Array2<f64>>,
        linv: HashMap<usize, Array2<f64>>,
        uinv: HashMap<usize, Array2<f64>>,
        l_btree: Vec<StarTree>,
        l_rtree: Vec<StarTree>,
        u_btree: Vec<StarTree>,
        u_rtree: Vec<StarTree>,
        inversion_failures: Vec<InversionError>,
    ) -> Self {
        Self {
            nsupers,
            l_cols,
            l_rows,
            u_rows,
            u_cols,
            l_blocks,
            u_blocks,
            linv,
            uinv,
            l_btree,
            l_rtree,
            u_btree,
            u_rtree,
            inversion_failures,
        }
    }

    pub fn nsupers(&self) -> usize {
        self.nsupers
    }

    /// Singular diagonal blocks C2 recorded while building this
    /// factorization's inverses. Empty on a well-conditioned input.
    pub fn inversion_failures(&self) -> &[InversionError] {
        &self.inversion_failures
    }

    pub fn l_block(&self, i: usize, k: usize) -> Option<&Array2<f64>> {
        self.l_blocks.get(&(i, k))
    }

    pub fn u_block(&self, i: usize, k: usize) -> Option<&Array2<f64>> {
        self.u_blocks.get(&(i, k))
    }

    pub fn linv(&self, k: usize) -> Option<&Array2<f64>> {
        self.linv.get(&k)
    }

    pub fn uinv(&self, k: usize) -> Option<&Array2<f64>> {
        self.uinv.get(&k)
    }

    /// Column-blocks `k` require this row-block `i`'s contribution for
    /// forward solve: `l_rows[i]`.
    pub fn l_deps_of_row(&self, i: usize) -> &[usize] {
        &self.l_rows[i]
    }

    /// Row-blocks that column `k` contributes to during forward solve.
    pub fn l_targets_of_col(&self, k: usize) -> &[usize] {
        &self.l_cols[k]
    }

    pub fn u_deps_of_row(&self, i: usize) -> &[usize] {
        &self.u_rows[i]
    }

    pub fn u_targets_of_col(&self, k: usize) -> &[usize] {
        &self.u_cols[k]
    }

    pub fn l_btree(&self, k: usize) -> &StarTree {
        &self.l_btree[k]
    }

    pub fn l_rtree(&self, i: usize) -> &StarTree {
        &self.l_rtree[i]
    }

    pub fn u_btree(&self, k: usize) -> &StarTree {
        &self.u_btree[k]
    }

    pub fn u_rtree(&self, i: usize) -> &StarTree {
        &self.u_rtree[i]
    }
}

/// Row/column scaling and permutation, applied by the redistributor (§4.3,
/// §6). Identity permutations (`perm[i] == i`) are valid and common in
/// tests that skip the scaling/permutation setup step.
#[derive(Debug, Clone)]
pub struct ScalePerm {
    pub perm_r: Vec<usize>,
    pub perm_c: Vec<usize>,
    inv_r: Vec<usize>,
    inv_c: Vec<usize>,
}

impl ScalePerm {
    pub fn new(perm_r: Vec<usize>, perm_c: Vec<usize>) -> Self {
        let mut inv_r = vec![0usize; perm_r.len()];
        for (i, &p) in perm_r.iter().enumerate() {
            inv_r[p] = i;
        }
        let mut inv_c = vec![0usize; perm_c.len()];
        for (i, &p) in perm_c.iter().enumerate() {
            inv_c[p] = i;
        }
        Self {
            perm_r,
            perm_c,
            inv_r,
            inv_c,
        }
    }

    pub fn identity(n: usize) -> Self {
        Self::new((0..n).collect(), (0..n).collect())
    }

    /// Composed permutation applied to a global row index during B→X (§4.3
    /// "compute `irow = perm_c[perm_r[fst_row+i]]`").
    pub fn compose(&self, global_row: usize) -> usize {
        self.perm_c[self.perm_r[global_row]]
    }

    /// Inverse of [`Self::compose`]: the original global row that maps to
    /// permuted index `irow`. Used by X→B to undo the permutation applied
    /// on the way in.
    pub fn decompose(&self, irow: usize) -> usize {
        self.inv_r[self.inv_c[irow]]
    }
}

/// The all-to-all communication plan the redistributor replays on every
/// `B↔X` exchange (§4.3, §6): which process owns which contiguous range of
/// `B`'s rows, and which processes are diagonal for at least one supernode.
#[derive(Debug, Clone)]
pub struct CommPlan {
    /// `row_to_proc[global_row]`: rank holding that row's slice of `B`.
    pub row_to_proc: Vec<ProcessId>,
    /// Diagonal ranks, i.e. the receivers of `B→X` and senders of `X→B`.
    pub diag_procs: Vec<ProcessId>,
}

impl CommPlan {
    pub fn num_diag_procs(&self) -> usize {
        self.diag_procs.len()
    }
}
