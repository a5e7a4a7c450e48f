//! Cholesky factorization of a block-diagonal matrix in packed storage.
//!
//! The sparse-constraint Schur complement `Cw` is block diagonal with
//! `nwcon / nwblock` symmetric positive-definite blocks of uniform size
//! `nwblock`. Each block is stored as its upper triangle in packed
//! column-major order, and factored in place. For `nwblock = 1` the matrix
//! is a plain diagonal and the "factorization" stores reciprocals instead.

use faer::Col;
use snafu::ensure;

use crate::linalg::{CholeskyFactorizationSnafu, SolverError, UninitializedSnafu};
use crate::E;

/// Offset of entry `(i, j)`, `i <= j`, inside one packed upper-triangular
/// block.
#[inline]
fn packed(i: usize, j: usize) -> usize {
    j * (j + 1) / 2 + i
}

/// Number of packed entries in one block of dimension `nblock`.
#[inline]
pub fn packed_len(nblock: usize) -> usize {
    nblock * (nblock + 1) / 2
}

/// In-place Cholesky factorization of a packed block-diagonal matrix.
#[derive(Clone, Debug)]
pub struct BlockDiagCholesky {
    nrows: usize,
    nblock: usize,
    vals: Vec<E>,
    factored: bool,
}

impl BlockDiagCholesky {
    pub fn new(nrows: usize, nblock: usize) -> Self {
        let storage = if nblock == 1 {
            nrows
        } else {
            (nrows / nblock) * packed_len(nblock)
        };
        Self {
            nrows,
            nblock,
            vals: vec![0.0; storage],
            factored: false,
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Packed storage for assembly. Writing into this invalidates any
    /// previous factorization.
    pub fn vals_mut(&mut self) -> &mut [E] {
        self.factored = false;
        &mut self.vals
    }

    /// Zeroes the packed storage in preparation for assembly.
    pub fn zero(&mut self) {
        self.factored = false;
        self.vals.fill(0.0);
    }

    /// Factors every block in place. For `nwblock = 1` the entries are
    /// replaced by their reciprocals. On failure, reports the global row of
    /// the offending pivot.
    pub fn factor(&mut self) -> Result<(), SolverError> {
        if self.nblock == 1 {
            for i in 0..self.nrows {
                ensure!(self.vals[i] != 0.0, CholeskyFactorizationSnafu { index: i });
                self.vals[i] = 1.0 / self.vals[i];
            }
        } else {
            let nb = self.nblock;
            let incr = packed_len(nb);
            for (block, row0) in (0..self.nrows).step_by(nb).enumerate() {
                let a = &mut self.vals[block * incr..(block + 1) * incr];

                // Packed upper-triangular Cholesky of one block: A = U^T U
                for j in 0..nb {
                    for i in 0..j {
                        let mut sum = a[packed(i, j)];
                        for k in 0..i {
                            sum -= a[packed(k, i)] * a[packed(k, j)];
                        }
                        a[packed(i, j)] = sum / a[packed(i, i)];
                    }
                    let mut diag = a[packed(j, j)];
                    for k in 0..j {
                        diag -= a[packed(k, j)] * a[packed(k, j)];
                    }
                    ensure!(
                        diag > 0.0,
                        CholeskyFactorizationSnafu { index: row0 + j }
                    );
                    a[packed(j, j)] = diag.sqrt();
                }
            }
        }

        self.factored = true;
        Ok(())
    }

    /// Applies the inverse to `rhs` in place, one block at a time.
    pub fn apply(&self, rhs: &mut Col<E>) -> Result<(), SolverError> {
        ensure!(self.factored, UninitializedSnafu);
        ensure!(
            rhs.nrows() == self.nrows,
            crate::linalg::DimensionMismatchSnafu {
                expected: self.nrows,
                found: rhs.nrows(),
            }
        );

        if self.nblock == 1 {
            for i in 0..self.nrows {
                rhs[i] *= self.vals[i];
            }
        } else {
            let nb = self.nblock;
            let incr = packed_len(nb);
            for (block, row0) in (0..self.nrows).step_by(nb).enumerate() {
                let a = &self.vals[block * incr..(block + 1) * incr];

                // Forward solve U^T y = b
                for i in 0..nb {
                    let mut sum = rhs[row0 + i];
                    for k in 0..i {
                        sum -= a[packed(k, i)] * rhs[row0 + k];
                    }
                    rhs[row0 + i] = sum / a[packed(i, i)];
                }
                // Back solve U x = y
                for i in (0..nb).rev() {
                    let mut sum = rhs[row0 + i];
                    for k in (i + 1)..nb {
                        sum -= a[packed(i, k)] * rhs[row0 + k];
                    }
                    rhs[row0 + i] = sum / a[packed(i, i)];
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagonal_blocks() {
        let mut chol = BlockDiagCholesky::new(4, 1);
        chol.vals_mut().copy_from_slice(&[2.0, 4.0, 0.5, 8.0]);
        chol.factor().unwrap();

        let mut rhs = Col::from_fn(4, |i| (i + 1) as E);
        chol.apply(&mut rhs).unwrap();
        assert_eq!(rhs, Col::from_fn(4, |i| [0.5, 0.5, 6.0, 0.5][i]));
    }

    #[test]
    fn test_zero_diagonal_pivot() {
        let mut chol = BlockDiagCholesky::new(2, 1);
        chol.vals_mut().copy_from_slice(&[1.0, 0.0]);
        assert_eq!(
            chol.factor(),
            Err(SolverError::CholeskyFactorization { index: 1 })
        );
    }

    #[test]
    fn test_packed_blocks() {
        // Two 2x2 SPD blocks: [[4, 1], [1, 3]] and [[2, -1], [-1, 2]]
        let mut chol = BlockDiagCholesky::new(4, 2);
        chol.vals_mut()
            .copy_from_slice(&[4.0, 1.0, 3.0, 2.0, -1.0, 2.0]);
        chol.factor().unwrap();

        let b = [1.0, 2.0, -1.0, 0.5];
        let mut rhs = Col::from_fn(4, |i| b[i]);
        chol.apply(&mut rhs).unwrap();

        // Check block-wise A x = b
        let a = [[4.0, 1.0], [1.0, 3.0]];
        for i in 0..2 {
            let ax = a[i][0] * rhs[0] + a[i][1] * rhs[1];
            assert!((ax - b[i]).abs() < 1e-14);
        }
        let a = [[2.0, -1.0], [-1.0, 2.0]];
        for i in 0..2 {
            let ax = a[i][0] * rhs[2] + a[i][1] * rhs[3];
            assert!((ax - b[i + 2]).abs() < 1e-14);
        }
    }

    #[test]
    fn test_indefinite_block_rejected() {
        let mut chol = BlockDiagCholesky::new(2, 2);
        // [[1, 2], [2, 1]] has a negative eigenvalue
        chol.vals_mut().copy_from_slice(&[1.0, 2.0, 1.0]);
        assert_eq!(
            chol.factor(),
            Err(SolverError::CholeskyFactorization { index: 1 })
        );
    }
}
