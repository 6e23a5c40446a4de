//! C1: block index algebra.
//!
//! Pure, stateless bijections between global row/supernode coordinates and
//! the local block indices each process mesh rank uses to index its own
//! slice of `x`/`lsum`. Every function here is O(1) table lookup or integer
//! arithmetic, mirroring the `BlockNum`/`FstBlockC`/`PROW`/`PCOL`/`LBi`/`LBj`
//! macros of the historical reference.

use crate::types::ProcessId;

/// The 2-D process mesh, `Pr` rows by `Pc` columns, flattened
/// row-major (`rank = prow * pc + pcol`).
#[derive(Debug, Clone, Copy)]
pub struct ProcessGrid {
    pub pr: usize,
    pub pc: usize,
    pub myrow: usize,
    pub mycol: usize,
}

impl ProcessGrid {
    pub fn new(pr: usize, pc: usize, myrow: usize, mycol: usize) -> Self {
        debug_assert!(myrow < pr && mycol < pc);
        Self {
            pr,
            pc,
            myrow,
            mycol,
        }
    }

    pub fn single_process() -> Self {
        Self {
            pr: 1,
            pc: 1,
            myrow: 0,
            mycol: 0,
        }
    }

    pub fn nprocs(&self) -> usize {
        self.pr * self.pc
    }

    pub fn is_single_process(&self) -> bool {
        self.nprocs() == 1
    }

    /// Flattened rank of the process at mesh coordinate `(prow, pcol)`.
    pub fn pnum(&self, prow: usize, pcol: usize) -> ProcessId {
        prow * self.pc + pcol
    }

    pub fn myrank(&self) -> ProcessId {
        self.pnum(self.myrow, self.mycol)
    }

    /// Process row owning block-row `k` of the supernode mesh.
    pub fn prow_of(&self, k: usize) -> usize {
        k % self.pr
    }

    /// Process column owning block-column `k` of the supernode mesh.
    pub fn pcol_of(&self, k: usize) -> usize {
        k % self.pc
    }

    /// A supernode `k` is diagonal on this rank iff both mesh coordinates
    /// match.
    pub fn owns_diagonal(&self, k: usize) -> bool {
        self.prow_of(k) == self.myrow && self.pcol_of(k) == self.mycol
    }

    pub fn owns_row_block(&self, k: usize) -> bool {
        self.prow_of(k) == self.myrow
    }

    pub fn owns_col_block(&self, k: usize) -> bool {
        self.pcol_of(k) == self.mycol
    }
}

/// Global supernode partition: `xsup[k]` is the first global column of
/// supernode `k`, with a trailing sentinel `xsup[nsupers] == n`. `supno[j]`
/// maps a global column to its supernode.
#[derive(Debug, Clone)]
pub struct SupernodePartition {
    pub xsup: Vec<usize>,
    pub supno: Vec<usize>,
}

impl SupernodePartition {
    pub fn new(xsup: Vec<usize>, supno: Vec<usize>) -> Self {
        debug_assert!(xsup.len() >= 1);
        debug_assert_eq!(supno.len(), *xsup.last().unwrap());
        Self { xsup, supno }
    }

    /// A trivial partition with one column per supernode, i.e. no
    /// supernodal amalgamation. Useful for tests and for matrices where the
    /// factorization did not produce any blocking.
    pub fn scalar(n: usize) -> Self {
        Self {
            xsup: (0..=n).collect(),
            supno: (0..n).collect(),
        }
    }

    pub fn nsupers(&self) -> usize {
        self.xsup.len() - 1
    }

    pub fn n(&self) -> usize {
        *self.xsup.last().unwrap()
    }

    pub fn super_size(&self, k: usize) -> usize {
        self.xsup[k + 1] - self.xsup[k]
    }

    pub fn fst_block_c(&self, k: usize) -> usize {
        self.xsup[k]
    }

    /// Supernode containing global row/column `row`.
    pub fn block_num(&self, row: usize) -> usize {
        self.supno[row]
    }
}

/// Maps global supernode numbers owned by this rank to a dense local block
/// index, for both the block-row and block-column directions. The
/// historical reference computes `LBi`/`LBj` via a division by the mesh
/// extent; we keep the same arithmetic but make both directions explicit
/// types so forward (column-major broadcast) and backward (row-major
/// reduction) code cannot accidentally swap them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LBi(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LBj(pub usize);

impl ProcessGrid {
    /// Local block-row index of global supernode `k` on this rank's row.
    /// Defined only when `owns_row_block(k)` holds.
    pub fn lbi(&self, k: usize) -> LBi {
        LBi(k / self.pr)
    }

    /// Local block-column index of global supernode `k` on this rank's
    /// column. Defined only when `owns_col_block(k)` holds.
    pub fn lbj(&self, k: usize) -> LBj {
        LBj(k / self.pc)
    }

    /// Number of supernodes this rank owns a block-row for, given the
    /// global count.
    pub fn num_local_block_rows(&self, nsupers: usize) -> usize {
        let mut count = 0;
        let mut k = self.myrow;
        while k < nsupers {
            count += 1;
            k += self.pr;
        }
        count
    }

    pub fn num_local_block_cols(&self, nsupers: usize) -> usize {
        let mut count = 0;
        let mut k = self.mycol;
        while k < nsupers {
            count += 1;
            k += self.pc;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_process_owns_everything() {
        let grid = ProcessGrid::single_process();
        for k in 0..16 {
            assert!(grid.owns_diagonal(k));
            assert_eq!(grid.lbi(k).0, k);
            assert_eq!(grid.lbj(k).0, k);
        }
    }

    #[test]
    fn two_by_one_splits_rows_not_columns() {
        let g0 = ProcessGrid::new(2, 1, 0, 0);
        let g1 = ProcessGrid::new(2, 1, 1, 0);
        // supernodes 0,2,4,... on rank 0; 1,3,5,... on rank 1. Every
        // supernode is diagonal because pc == 1.
        for k in 0..6 {
            assert!(g0.owns_col_block(k));
            assert!(g1.owns_col_block(k));
            assert_eq!(g0.owns_row_block(k), k % 2 == 0);
            assert_eq!(g1.owns_row_block(k), k % 2 == 1);
        }
        assert_eq!(g0.lbi(0).0, 0);
        assert_eq!(g0.lbi(2).0, 1);
        assert_eq!(g1.lbi(1).0, 0);
        assert_eq!(g1.lbi(3).0, 1);
    }

    #[test]
    fn pnum_is_row_major() {
        let grid = ProcessGrid::new(2, 3, 0, 0);
        assert_eq!(grid.pnum(0, 0), 0);
        assert_eq!(grid.pnum(0, 2), 2);
        assert_eq!(grid.pnum(1, 0), 3);
        assert_eq!(grid.pnum(1, 2), 5);
    }

    #[test]
    fn supernode_partition_scalar() {
        let part = SupernodePartition::scalar(4);
        assert_eq!(part.nsupers(), 4);
        for k in 0..4 {
            assert_eq!(part.super_size(k), 1);
            assert_eq!(part.fst_block_c(k), k);
            assert_eq!(part.block_num(k), k);
        }
    }
}
