//! C3: the redistributor. Moves numerical values between the row-block
//! `B` layout and the supernode-block `x` layout held on diagonal
//! processes, in both directions (§4.3).

use ndarray::{Array2, ArrayView2};

use crate::error::SolveResult;
use crate::factor::{CommPlan, ScalePerm};
use crate::lsum::{XBuffer, col_major_index};
use crate::mesh::{ProcessGrid, SupernodePartition};
use crate::transport::collective::CollectiveWorld;

/// `B → X`: scatters `b` (this rank's contiguous local row range
/// `[fst_row, fst_row + m_loc)`, row-major, `nrhs` columns) into `x`'s
/// supernode-block layout on whichever ranks are diagonal for the
/// supernodes those rows belong to.
///
/// On a single-process mesh this bypasses the collective entirely (§4.3
/// "single-process fast path").
pub fn b_to_x(
    grid: &ProcessGrid,
    part: &SupernodePartition,
    scale_perm: &ScalePerm,
    collective: Option<&CollectiveWorld>,
    b: ArrayView2<f64>,
    fst_row: usize,
    nrhs: usize,
    x: &mut XBuffer,
) -> SolveResult<()> {
    let m_loc = b.nrows();
    debug_assert_eq!(b.ncols(), nrhs);

    if grid.is_single_process() {
        for i in 0..m_loc {
            let irow = scale_perm.compose(fst_row + i);
            let k = part.block_num(irow);
            let lbj = x.local_of(grid, k).expect("single process owns every block");
            let local_row = irow - part.fst_block_c(k);
            let super_size = part.super_size(k);
            let body = x.body_mut(lbj, part);
            for r in 0..nrhs {
                body[col_major_index(local_row, r, super_size)] = b[[i, r]];
            }
        }
        return Ok(());
    }

    let collective = collective.expect("multi-process mesh requires a collective world");
    let nprocs = grid.nprocs();
    let mut send_idx = vec![Vec::new(); nprocs];
    let mut send_val = vec![Vec::new(); nprocs];
    for i in 0..m_loc {
        let irow = scale_perm.compose(fst_row + i);
        let k = part.block_num(irow);
        let dest = grid.pnum(grid.prow_of(k), grid.pcol_of(k));
        send_idx[dest].push(irow as i64);
        send_val[dest].extend(b.row(i).iter().copied());
    }

    let recv_idx = collective.exchange_indices(grid.myrank(), send_idx)?;
    let recv_val = collective.exchange_values(grid.myrank(), send_val)?;

    for (irows, vals) in recv_idx.iter().zip(recv_val.iter()) {
        for (pos, &irow) in irows.iter().enumerate() {
            let irow = irow as usize;
            let k = part.block_num(irow);
            let lbj = x
                .local_of(grid, k)
                .expect("redistributor only routes rows to their block's diagonal rank");
            let local_row = irow - part.fst_block_c(k);
            let super_size = part.super_size(k);
            let body = x.body_mut(lbj, part);
            for r in 0..nrhs {
                body[col_major_index(local_row, r, super_size)] = vals[pos * nrhs + r];
            }
        }
    }
    Ok(())
}

/// `X → B`: inverse of [`b_to_x`]. Each diagonal process iterates its owned
/// supernodes and routes values back to the rank holding each original row
/// of `B`, undoing the permutation `b_to_x` applied.
pub fn x_to_b(
    grid: &ProcessGrid,
    part: &SupernodePartition,
    scale_perm: &ScalePerm,
    comm: &CommPlan,
    collective: Option<&CollectiveWorld>,
    x: &XBuffer,
    fst_row: usize,
    nrhs: usize,
    b: &mut Array2<f64>,
) -> SolveResult<()> {
    if grid.is_single_process() {
        for k in 0..part.nsupers() {
            let lbj = match x.local_of(grid, k) {
                Some(lbj) => lbj,
                None => continue,
            };
            let super_size = part.super_size(k);
            let body = x.body(lbj, part);
            for local_row in 0..super_size {
                let irow = part.fst_block_c(k) + local_row;
                let orig_row = scale_perm.decompose(irow);
                for r in 0..nrhs {
                    b[[orig_row - fst_row, r]] = body[col_major_index(local_row, r, super_size)];
                }
            }
        }
        return Ok(());
    }

    let collective = collective.expect("multi-process mesh requires a collective world");
    let nprocs = grid.nprocs();
    let mut send_idx = vec![Vec::new(); nprocs];
    let mut send_val = vec![Vec::new(); nprocs];
    for k in 0..part.nsupers() {
        let lbj = match x.local_of(grid, k) {
            Some(lbj) => lbj,
            None => continue,
        };
        let super_size = part.super_size(k);
        let body = x.body(lbj, part);
        for local_row in 0..super_size {
            let irow = part.fst_block_c(k) + local_row;
            let orig_row = scale_perm.decompose(irow);
            let dest = comm.row_to_proc[orig_row];
            send_idx[dest].push(orig_row as i64);
            for r in 0..nrhs {
                send_val[dest].push(body[col_major_index(local_row, r, super_size)]);
            }
        }
    }

    let recv_idx = collective.exchange_indices(grid.myrank(), send_idx)?;
    let recv_val = collective.exchange_values(grid.myrank(), send_val)?;

    for (irows, vals) in recv_idx.iter().zip(recv_val.iter()) {
        for (pos, &orig_row) in irows.iter().enumerate() {
            let orig_row = orig_row as usize;
            for r in 0..nrhs {
                b[[orig_row - fst_row, r]] = vals[pos * nrhs + r];
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::SupernodePartition;

    #[test]
    fn single_process_round_trip_is_identity() {
        let grid = ProcessGrid::single_process();
        let part = SupernodePartition::scalar(4);
        let scale_perm = ScalePerm::identity(4);
        let b_in = Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();

        let mut x = XBuffer::new(&grid, &part, 1);
        b_to_x(
            &grid,
            &part,
            &scale_perm,
            None,
            b_in.view(),
            0,
            1,
            &mut x,
        )
        .unwrap();

        let mut b_out = Array2::<f64>::zeros((4, 1));
        let comm = CommPlan {
            row_to_proc: vec![0; 4],
            diag_procs: vec![0],
        };
        x_to_b(&grid, &part, &scale_perm, &comm, None, &x, 0, 1, &mut b_out).unwrap();

        assert_eq!(b_out, b_in);
    }
}
