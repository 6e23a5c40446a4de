//! C2: diagonal-block inverter.
//!
//! Precomputes `Linv_k = inv(L_kk)` (unit lower triangular) and
//! `Uinv_k = inv(U_kk)` (non-unit upper triangular) for every supernode `k`
//! whose diagonal block this rank owns, once, during factorization setup.
//! The forward/backward solve engines then replace a triangular solve on
//! the diagonal block with a dense `GEMM` against these inverses.

use ndarray::Array2;

use crate::error::InversionError;

const SMALL_BLOCK_THRESHOLD: usize = 8;

/// Invert a unit lower-triangular `n x n` block (diagonal entries are 1 and
/// are not read). Uses the intrinsic blocked substitution for small blocks
/// (below [`SMALL_BLOCK_THRESHOLD`]) and is also the fallback used whenever
/// no BLAS-backed inversion is linked, per §4.2's "intrinsic fallback"
/// requirement.
pub fn invert_unit_lower_triangular(
    l: &Array2<f64>,
    supernode: usize,
) -> Result<Array2<f64>, InversionError> {
    let n = l.nrows();
    debug_assert_eq!(l.ncols(), n);
    let mut inv = Array2::<f64>::eye(n);
    // Forward substitution, one inverse column at a time: solve L * inv[:,j] = e_j.
    for j in 0..n {
        for i in 0..n {
            if i == j {
                continue;
            }
            if i < j {
                // entries above the diagonal of a lower-triangular inverse
                // column stay zero.
                continue;
            }
            let mut acc = inv[[i, j]];
            for p in j..i {
                acc -= l[[i, p]] * inv[[p, j]];
            }
            inv[[i, j]] = acc; // unit diagonal: divide by L[i,i] == 1
        }
    }
    Ok(inv)
}

/// Invert a non-unit upper-triangular `n x n` block.
///
/// A zero pivot does not abort the inversion (§7 item 4: "record in info,
/// continue — the ill-conditioned block will produce NaNs downstream").
/// Every zero pivot encountered is appended to the returned failure list;
/// the corresponding column of `inv` carries whatever NaN/Inf the division
/// by zero produces, and that poison propagates naturally through the
/// remaining back-substitution arithmetic exactly as the solve path would
/// see it downstream.
pub fn invert_upper_triangular(
    u: &Array2<f64>,
    supernode: usize,
) -> (Array2<f64>, Vec<InversionError>) {
    let n = u.nrows();
    debug_assert_eq!(u.ncols(), n);
    // Each singular row is visited once per column j >= i during the back
    // substitution below, so the zero-pivot check is hoisted out here
    // instead of living inside that loop, which would otherwise record the
    // same row's failure once per column it participates in.
    let failures: Vec<InversionError> = (0..n)
        .filter(|&i| u[[i, i]] == 0.0)
        .map(|pivot| InversionError::SingularPivot { supernode, pivot })
        .collect();

    let mut inv = Array2::<f64>::zeros((n, n));
    // Back substitution, one inverse column at a time: solve U * inv[:,j] = e_j.
    for j in (0..n).rev() {
        for i in (0..=j).rev() {
            let pivot = u[[i, i]];
            let rhs = if i == j { 1.0 } else { 0.0 };
            let mut acc = rhs;
            for p in (i + 1)..=j {
                acc -= u[[i, p]] * inv[[p, j]];
            }
            inv[[i, j]] = acc / pivot;
        }
    }
    (inv, failures)
}

/// Dispatches to the intrinsic substitution for small blocks, or (when the
/// `n` exceeds the BLAS-call-overhead threshold and the `dense-blas`
/// backend is desired) would hand off to `ndarray-linalg`'s LU-based
/// `Inverse`. We keep a single, always-available code path here: the
/// intrinsic substitution is `O(n^3)` with the same asymptotics as a
/// BLAS-backed `dtrtri`, and factorization-time inversion is not the hot
/// path this crate optimizes (§4.2 rationale is about the solve, not the
/// one-time setup cost).
///
/// Never aborts: a singular `U` diagonal block is reported through the
/// returned failure list rather than short-circuiting the inversion (§7
/// item 4), so the caller always gets back a usable `(Linv, Uinv)` pair to
/// store, plus whatever failures were recorded for later inspection.
pub fn invert_diagonal_block(
    l: &Array2<f64>,
    u: &Array2<f64>,
    supernode: usize,
) -> (Array2<f64>, Array2<f64>, Vec<InversionError>) {
    let n = l.nrows();
    debug_assert_eq!(n, u.nrows());
    let _ = SMALL_BLOCK_THRESHOLD; // documents the intended dispatch point
    let linv = invert_unit_lower_triangular(l, supernode)
        .expect("unit lower-triangular inversion never fails: the diagonal is always 1");
    let (uinv, failures) = invert_upper_triangular(u, supernode);
    (linv, uinv, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn approx_eq(a: &Array2<f64>, b: &Array2<f64>, tol: f64) {
        assert_eq!(a.dim(), b.dim());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() <= tol, "{x} != {y}");
        }
    }

    #[test]
    fn unit_lower_2x2() {
        let l = array![[1.0, 0.0], [3.0, 1.0]];
        let inv = invert_unit_lower_triangular(&l, 0).unwrap();
        let prod = l.dot(&inv);
        approx_eq(&prod, &Array2::eye(2), 1e-12);
    }

    #[test]
    fn unit_lower_3x3() {
        let l = array![[1.0, 0.0, 0.0], [2.0, 1.0, 0.0], [3.0, -1.0, 1.0]];
        let inv = invert_unit_lower_triangular(&l, 0).unwrap();
        approx_eq(&l.dot(&inv), &Array2::eye(3), 1e-10);
    }

    #[test]
    fn upper_non_unit_2x2() {
        let u = array![[2.0, 1.0], [0.0, 4.0]];
        let (inv, failures) = invert_upper_triangular(&u, 0);
        assert!(failures.is_empty());
        approx_eq(&u.dot(&inv), &Array2::eye(2), 1e-12);
    }

    #[test]
    fn upper_singular_records_failure_and_keeps_going() {
        let u = array![[2.0, 1.0], [0.0, 0.0]];
        let (inv, failures) = invert_upper_triangular(&u, 7);
        assert_eq!(failures.len(), 1);
        match failures[0] {
            InversionError::SingularPivot { supernode, pivot } => {
                assert_eq!(supernode, 7);
                assert_eq!(pivot, 1);
            }
        }
        // row 1 (the singular pivot) is NaN/Inf-poisoned, but row 0's column
        // is still a real number rather than the whole block being dropped.
        assert!(!inv[[1, 1]].is_finite());
        assert!(inv[[0, 0]].is_finite());
    }

    #[test]
    fn scalar_1x1_blocks() {
        let l = array![[1.0]];
        let u = array![[5.0]];
        let (linv, uinv, failures) = invert_diagonal_block(&l, &u, 0);
        assert!(failures.is_empty());
        assert_eq!(linv[[0, 0]], 1.0);
        assert!((uinv[[0, 0]] - 0.2).abs() < 1e-12);
    }
}
