//! The problem adapter consumed by the interior-point engine.
//!
//! A [`Problem`] supplies the objective, the dense and sparse constraints,
//! their derivatives, and the variable bounds. The engine never materializes
//! the sparse constraint Jacobian `Aw`; it only applies it through
//! [`Problem::add_sparse_jacobian`], its transpose, and the weighted inner
//! product used to assemble the block-diagonal `Cw` matrix.

use faer::{Col, ColRef};
use snafu::Snafu;

use crate::E;

/// Evaluation failures reported by a [`Problem`].
///
/// The line search responds to an evaluation failure by halving the step
/// and retrying; everywhere else the failure aborts the optimization.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum EvalError {
    #[snafu(display("objective/constraint evaluation failed"))]
    ObjConEval,

    #[snafu(display("gradient evaluation failed"))]
    GradientEval,

    #[snafu(display("Hessian-vector product evaluation failed"))]
    HvecEval,

    #[snafu(display("Hessian diagonal evaluation failed"))]
    HessianDiagEval,

    #[snafu(display("Hessian-vector products are not provided by this problem"))]
    HvecUnsupported,

    #[snafu(display("the Hessian diagonal is not provided by this problem"))]
    HessianDiagUnsupported,
}

/// Problem dimensions, fixed for the lifetime of a solver instance.
///
/// `nvars` and `nwcon` are the *local* counts on this rank; the sparse
/// constraint rows partition into `nwcon / nwblock` contiguous blocks of
/// uniform size `nwblock`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProblemSizes {
    pub nvars: usize,
    pub ncon: usize,
    pub nwcon: usize,
    pub nwblock: usize,
}

/// Adapter supplying the optimization problem to the engine.
///
/// Design-variable-shaped vectors (`x`, `g`, the rows of the dense
/// constraint Jacobian) and sparse-constraint-shaped vectors are distributed;
/// the dense constraint values `c` and their multipliers are replicated.
pub trait Problem {
    /// Returns the local problem dimensions.
    fn problem_sizes(&self) -> ProblemSizes;

    /// Writes the initial design point and the variable bounds.
    fn vars_and_bounds(&self, x: &mut Col<E>, lb: &mut Col<E>, ub: &mut Col<E>);

    /// Evaluates the objective and the dense constraints at `x`.
    fn eval_obj_con(&self, x: ColRef<E>, c: &mut Col<E>) -> Result<E, EvalError>;

    /// Evaluates the objective gradient and the dense constraint gradients
    /// at `x`.
    fn eval_obj_con_gradient(
        &self,
        x: ColRef<E>,
        g: &mut Col<E>,
        ac: &mut [Col<E>],
    ) -> Result<(), EvalError>;

    /// Evaluates the sparse constraints `cw(x)` into `out`.
    fn eval_sparse_con(&self, x: ColRef<E>, out: &mut Col<E>);

    /// Computes `out += alpha * Aw(x) * px`.
    fn add_sparse_jacobian(&self, alpha: E, x: ColRef<E>, px: ColRef<E>, out: &mut Col<E>);

    /// Computes `out += alpha * Aw(x)^T * pzw`.
    fn add_sparse_jacobian_transpose(
        &self,
        alpha: E,
        x: ColRef<E>,
        pzw: ColRef<E>,
        out: &mut Col<E>,
    );

    /// Adds `alpha * Aw(x) * diag(cvec) * Aw(x)^T` into the packed
    /// block-diagonal storage `out`.
    ///
    /// `out` holds `nwcon / nwblock` symmetric blocks; each block is stored
    /// as its upper triangle in packed column-major order
    /// (`(nwblock + 1) * nwblock / 2` entries per block).
    fn add_sparse_inner_product(&self, alpha: E, x: ColRef<E>, cvec: ColRef<E>, out: &mut [E]);

    /// Evaluates the product of the exact Hessian of the Lagrangian with
    /// `p`. Only called when `use_hvec_product` is enabled.
    fn eval_hvec_product(
        &self,
        _x: ColRef<E>,
        _z: ColRef<E>,
        _zw: ColRef<E>,
        _p: ColRef<E>,
        _out: &mut Col<E>,
    ) -> Result<(), EvalError> {
        Err(EvalError::HvecUnsupported)
    }

    /// Evaluates the diagonal of the Hessian of the Lagrangian. Only called
    /// when `use_diag_hessian` is enabled.
    fn eval_hessian_diag(
        &self,
        _x: ColRef<E>,
        _z: ColRef<E>,
        _zw: ColRef<E>,
        _out: &mut Col<E>,
    ) -> Result<(), EvalError> {
        Err(EvalError::HessianDiagUnsupported)
    }

    /// Hook invoked on the `(s, y)` pair before each quasi-Newton update.
    fn quasi_newton_update_correction(&self, _s: &mut Col<E>, _y: &mut Col<E>) {}

    /// Hook invoked when the solver writes its periodic output.
    fn write_output(&self, _iteration: usize, _x: ColRef<E>) {}

    /// Whether the sparse constraints are inequalities `cw(x) >= 0`.
    fn is_sparse_inequality(&self) -> bool {
        true
    }

    /// Whether the dense constraints are inequalities `c(x) >= 0`.
    fn is_dense_inequality(&self) -> bool {
        true
    }

    fn use_lower_bounds(&self) -> bool {
        true
    }

    fn use_upper_bounds(&self) -> bool {
        true
    }
}
