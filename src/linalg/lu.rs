//! Dense LU factorization with partial pivoting.
//!
//! Used for the replicated `ncon x ncon` Schur complement matrix and the
//! `m x m` quasi-Newton correction matrix. The factors and pivot indices
//! live in flat buffers: the optimization root factors the matrix once and
//! broadcasts `factors`/`pivots`, so every rank applies the same
//! factorization bit-for-bit.

use snafu::ensure;

use crate::linalg::{LuFactorizationSnafu, SolverError, UninitializedSnafu};
use crate::E;

/// LU factorization of a dense column-major matrix.
///
/// The storage is reused across factorizations of the same dimension; the
/// buffers are allocated once when the solver instance is created.
#[derive(Clone, Debug, Default)]
pub struct DenseLu {
    n: usize,
    factors: Vec<E>,
    pivots: Vec<usize>,
    factored: bool,
}

impl DenseLu {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            factors: vec![0.0; n * n],
            pivots: vec![0; n],
            factored: false,
        }
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    /// Factors the column-major matrix `a` in place of the stored factors.
    ///
    /// A zero pivot reports the offending row, matching the `info` value of
    /// a LAPACK `getrf` call.
    pub fn factorize(&mut self, a: &[E]) -> Result<(), SolverError> {
        let n = self.n;
        ensure!(
            a.len() == n * n,
            crate::linalg::DimensionMismatchSnafu {
                expected: n * n,
                found: a.len(),
            }
        );

        self.factors.copy_from_slice(a);
        self.factored = false;
        let lu = &mut self.factors;

        for k in 0..n {
            // Partial pivoting: select the largest magnitude in column k
            let mut p = k;
            let mut pmax = lu[k + k * n].abs();
            for i in (k + 1)..n {
                if lu[i + k * n].abs() > pmax {
                    pmax = lu[i + k * n].abs();
                    p = i;
                }
            }
            self.pivots[k] = p;

            ensure!(lu[p + k * n] != 0.0, LuFactorizationSnafu { index: k });

            if p != k {
                for j in 0..n {
                    lu.swap(k + j * n, p + j * n);
                }
            }

            let pivot = lu[k + k * n];
            for i in (k + 1)..n {
                lu[i + k * n] /= pivot;
            }
            for j in (k + 1)..n {
                let ukj = lu[k + j * n];
                if ukj != 0.0 {
                    for i in (k + 1)..n {
                        lu[i + j * n] -= lu[i + k * n] * ukj;
                    }
                }
            }
        }

        self.factored = true;
        Ok(())
    }

    /// Solves `A x = rhs` in place using the stored factors.
    pub fn solve(&self, rhs: &mut [E]) -> Result<(), SolverError> {
        ensure!(self.factored, UninitializedSnafu);
        let n = self.n;
        ensure!(
            rhs.len() == n,
            crate::linalg::DimensionMismatchSnafu {
                expected: n,
                found: rhs.len(),
            }
        );
        let lu = &self.factors;

        // Apply the row interchanges, then the unit-lower and upper solves
        for k in 0..n {
            rhs.swap(k, self.pivots[k]);
        }
        for k in 0..n {
            for i in (k + 1)..n {
                rhs[i] -= lu[i + k * n] * rhs[k];
            }
        }
        for k in (0..n).rev() {
            rhs[k] /= lu[k + k * n];
            for i in 0..k {
                rhs[i] -= lu[i + k * n] * rhs[k];
            }
        }

        Ok(())
    }

    /// Mutable access to the factors and pivots, used to broadcast the
    /// root rank's factorization to the other ranks.
    pub fn factors_mut(&mut self) -> (&mut [E], &mut [usize]) {
        (&mut self.factors, &mut self.pivots)
    }

    /// Marks the stored factors as valid after they were overwritten by a
    /// broadcast from the root rank.
    pub fn set_factored(&mut self) {
        self.factored = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solve_and_check(n: usize, a: &[E], b: &[E]) {
        let mut lu = DenseLu::new(n);
        lu.factorize(a).unwrap();

        let mut x = b.to_vec();
        lu.solve(&mut x).unwrap();

        // Check A x = b
        for i in 0..n {
            let mut ax = 0.0;
            for j in 0..n {
                ax += a[i + j * n] * x[j];
            }
            assert!((ax - b[i]).abs() < 1e-12, "row {}: {} vs {}", i, ax, b[i]);
        }
    }

    #[test]
    fn test_lu_small() {
        // Column-major 3x3 with a row swap required on the first pivot
        let a = [0.0, 2.0, 1.0, 1.0, -1.0, 0.5, 3.0, 1.0, -2.0];
        solve_and_check(3, &a, &[1.0, -2.0, 0.5]);
    }

    #[test]
    fn test_lu_diagonally_dominant() {
        let n = 6;
        let mut a = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                a[i + j * n] = if i == j {
                    4.0 + i as E
                } else {
                    1.0 / (1.0 + (i as E - j as E).abs())
                };
            }
        }
        let b: Vec<E> = (0..n).map(|i| (i as E) - 2.5).collect();
        solve_and_check(n, &a, &b);
    }

    #[test]
    fn test_lu_singular() {
        // Second column is a multiple of the first
        let a = [1.0, 2.0, 2.0, 4.0];
        let mut lu = DenseLu::new(2);
        assert_eq!(
            lu.factorize(&a),
            Err(SolverError::LuFactorization { index: 1 })
        );
        let mut rhs = [1.0, 1.0];
        assert_eq!(lu.solve(&mut rhs), Err(SolverError::Uninitialized));
    }
}
