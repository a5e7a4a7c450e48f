//! Dense factorization kernels and componentwise vector helpers.
//!
//! The interior-point engine factors two kinds of small matrices: the dense
//! `ncon x ncon` Schur complement (and the `m x m` quasi-Newton Schur
//! complement), handled by [`lu::DenseLu`], and the block-diagonal sparse
//! constraint matrix `Cw`, handled by [`cholesky::BlockDiagCholesky`]. Both
//! keep their factors in flat buffers so a root rank can factor once and
//! broadcast the result, guaranteeing that every rank applies an identical
//! factorization.

pub mod cholesky;
pub mod lu;
pub mod vector_ops;

use snafu::Snafu;

/// Failures raised by the factorization kernels.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum SolverError {
    #[snafu(display("zero pivot in row {index} during LU factorization"))]
    LuFactorization { index: usize },

    #[snafu(display("non-positive pivot in row {index} during Cholesky factorization"))]
    CholeskyFactorization { index: usize },

    #[snafu(display("factorization has not been computed"))]
    Uninitialized,

    #[snafu(display("dimension mismatch: expected {expected}, found {found}"))]
    DimensionMismatch { expected: usize, found: usize },
}
