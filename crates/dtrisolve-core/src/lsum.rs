//! Solve-time working buffers: `x` and `lsum`.
//!
//! Both are flat `f64` arrays partitioned per local supernode, each slice
//! prefixed by a one-cell header holding the global supernode number (see
//! spec §3). `x` is addressed by local block-*column* index (`LBj`) because
//! its broadcast travels down a process column and every rank sharing a
//! `pcol` must be able to name the same slot; `lsum` is addressed by local
//! block-*row* index (`LBi`) because it is produced by column-owning ranks
//! and reduced toward the row's diagonal.

use crate::mesh::{LBi, LBj, ProcessGrid, SupernodePartition};

/// Offset of row `local_row`, column `rhs_col` within a block body stored
/// column-major (§3: "`SuperSize(k) × nrhs` values, column-major").
pub fn col_major_index(local_row: usize, rhs_col: usize, super_size: usize) -> usize {
    rhs_col * super_size + local_row
}

/// Per-rank layout: which global supernodes this rank holds a slot for
/// (in a given direction, row or column), and where each slot's header cell
/// sits in the flat backing array.
#[derive(Debug, Clone)]
pub struct BlockLayout {
    /// Global supernode number at each local index.
    pub supers: Vec<usize>,
    /// Offset of the header cell for local index `i` is `header_offsets[i]`;
    /// the body follows immediately and has length `super_size(k) * nrhs`.
    header_offsets: Vec<usize>,
    pub total_len: usize,
    nrhs: usize,
}

impl BlockLayout {
    fn build(supers: Vec<usize>, part: &SupernodePartition, nrhs: usize) -> Self {
        let mut header_offsets = Vec::with_capacity(supers.len());
        let mut offset = 0usize;
        for &k in &supers {
            header_offsets.push(offset);
            offset += 1 + part.super_size(k) * nrhs;
        }
        Self {
            supers,
            header_offsets,
            total_len: offset,
            nrhs,
        }
    }

    pub fn for_columns(grid: &ProcessGrid, part: &SupernodePartition, nrhs: usize) -> Self {
        let supers = (0..part.nsupers())
            .filter(|&k| grid.owns_col_block(k))
            .collect();
        Self::build(supers, part, nrhs)
    }

    pub fn for_rows(grid: &ProcessGrid, part: &SupernodePartition, nrhs: usize) -> Self {
        let supers = (0..part.nsupers())
            .filter(|&k| grid.owns_row_block(k))
            .collect();
        Self::build(supers, part, nrhs)
    }

    pub fn num_local(&self) -> usize {
        self.supers.len()
    }

    pub fn super_at(&self, local: usize) -> usize {
        self.supers[local]
    }

    pub fn header_offset(&self, local: usize) -> usize {
        self.header_offsets[local]
    }

    pub fn body_offset(&self, local: usize) -> usize {
        self.header_offsets[local] + 1
    }

    pub fn body_len(&self, local: usize, part: &SupernodePartition) -> usize {
        part.super_size(self.supers[local]) * self.nrhs
    }
}

/// The `x` working array, addressed by local block-column index.
#[derive(Debug, Clone)]
pub struct XBuffer {
    pub layout: BlockLayout,
    data: Vec<f64>,
    nrhs: usize,
}

impl XBuffer {
    pub fn new(grid: &ProcessGrid, part: &SupernodePartition, nrhs: usize) -> Self {
        let layout = BlockLayout::for_columns(grid, part, nrhs);
        let data = vec![0.0; layout.total_len];
        let mut buf = Self { layout, data, nrhs };
        buf.reset_headers();
        buf
    }

    /// Re-stamp every header cell with its global supernode number.
    /// Called at buffer construction and again before backward solve reuses
    /// the same storage.
    pub fn reset_headers(&mut self) {
        for local in 0..self.layout.num_local() {
            let k = self.layout.super_at(local);
            let off = self.layout.header_offset(local);
            self.data[off] = k as f64;
        }
    }

    pub fn clear_bodies(&mut self) {
        for v in self.data.iter_mut() {
            *v = 0.0;
        }
        self.reset_headers();
    }

    pub fn local_of(&self, grid: &ProcessGrid, k: usize) -> Option<LBj> {
        if grid.owns_col_block(k) {
            Some(grid.lbj(k))
        } else {
            None
        }
    }

    pub fn header(&self, lbj: LBj) -> usize {
        self.data[self.layout.header_offset(lbj.0)] as usize
    }

    pub fn body(&self, lbj: LBj, part: &SupernodePartition) -> &[f64] {
        let off = self.layout.body_offset(lbj.0);
        &self.data[off..off + self.layout.body_len(lbj.0, part)]
    }

    pub fn body_mut(&mut self, lbj: LBj, part: &SupernodePartition) -> &mut [f64] {
        let len = self.layout.body_len(lbj.0, part);
        let off = self.layout.body_offset(lbj.0);
        &mut self.data[off..off + len]
    }

    pub fn nrhs(&self) -> usize {
        self.nrhs
    }
}

/// The `lsum` working array, addressed by local block-row index, with
/// `num_threads` disjoint replicas to avoid write contention in the
/// task-parallel update kernel (§4.4.6).
#[derive(Debug, Clone)]
pub struct LsumBuffer {
    pub layout: BlockLayout,
    data: Vec<f64>,
    num_threads: usize,
    nrhs: usize,
}

impl LsumBuffer {
    pub fn new(
        grid: &ProcessGrid,
        part: &SupernodePartition,
        nrhs: usize,
        num_threads: usize,
    ) -> Self {
        let layout = BlockLayout::for_rows(grid, part, nrhs);
        let num_threads = num_threads.max(1);
        let data = vec![0.0; layout.total_len * num_threads];
        Self {
            layout,
            data,
            num_threads,
            nrhs,
        }
    }

    pub fn reset(&mut self) {
        for v in self.data.iter_mut() {
            *v = 0.0;
        }
    }

    pub fn local_of(&self, grid: &ProcessGrid, i: usize) -> Option<LBi> {
        if grid.owns_row_block(i) {
            Some(grid.lbi(i))
        } else {
            None
        }
    }

    fn thread_base(&self, tid: usize) -> usize {
        debug_assert!(tid < self.num_threads);
        tid * self.layout.total_len
    }

    /// Mutable body slice for thread `tid`'s disjoint replica of row-block
    /// `lbi`. Disjoint across `(tid, lbi)` pairs by construction, so callers
    /// may hold several of these mutably across threads simultaneously.
    pub fn thread_body_mut(
        &mut self,
        tid: usize,
        lbi: LBi,
        part: &SupernodePartition,
    ) -> &mut [f64] {
        let base = self.thread_base(tid);
        let off = base + self.layout.body_offset(lbi.0);
        let len = self.layout.body_len(lbi.0, part);
        &mut self.data[off..off + len]
    }

    /// Canonical (thread 0) body slice, read after [`Self::reduce_threads`].
    pub fn body(&self, lbi: LBi, part: &SupernodePartition) -> &[f64] {
        let off = self.layout.body_offset(lbi.0);
        let len = self.layout.body_len(lbi.0, part);
        &self.data[off..off + len]
    }

    pub fn body_mut(&mut self, lbi: LBi, part: &SupernodePartition) -> &mut [f64] {
        let off = self.layout.body_offset(lbi.0);
        let len = self.layout.body_len(lbi.0, part);
        &mut self.data[off..off + len]
    }

    /// Sum every thread's replica of row-block `lbi` into the canonical
    /// slot 0, single-threaded, immediately before forwarding over the
    /// reduction tree (§4.4.6).
    pub fn reduce_threads(&mut self, lbi: LBi, part: &SupernodePartition) {
        let len = self.layout.body_len(lbi.0, part);
        let off = self.layout.body_offset(lbi.0);
        for tid in 1..self.num_threads {
            let tbase = self.thread_base(tid) + off;
            for j in 0..len {
                self.data[off + j] += self.data[tbase + j];
            }
            for j in 0..len {
                self.data[tbase + j] = 0.0;
            }
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn nrhs(&self) -> usize {
        self.nrhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x_buffer_headers_match_supernode_numbers() {
        let grid = ProcessGrid::single_process();
        let part = SupernodePartition::scalar(4);
        let x = XBuffer::new(&grid, &part, 1);
        for local in 0..x.layout.num_local() {
            let lbj = LBj(local);
            assert_eq!(x.header(lbj), x.layout.super_at(local));
        }
    }

    #[test]
    fn lsum_thread_reduce_sums_replicas() {
        let grid = ProcessGrid::single_process();
        let part = SupernodePartition::scalar(2);
        let mut lsum = LsumBuffer::new(&grid, &part, 1, 3);
        let lbi = LBi(0);
        lsum.thread_body_mut(0, lbi, &part)[0] = 1.0;
        lsum.thread_body_mut(1, lbi, &part)[0] = 2.0;
        lsum.thread_body_mut(2, lbi, &part)[0] = 3.0;
        lsum.reduce_threads(lbi, &part);
        assert_eq!(lsum.body(lbi, &part)[0], 6.0);
    }
}
