//! Test problems shared by the end-to-end scenarios.

use faer::{Col, ColRef};

use crate::linalg::cholesky::packed_len;
use crate::problem::{EvalError, Problem, ProblemSizes};
use crate::E;

/// A bound above `max_bound_value`, treated as no bound at all.
pub const FREE: E = 1e30;

/// Evaluates the objective, constraints and gradients into the solver's
/// buffers, the way the optimization prologue does.
pub fn prime_gradients(solver: &mut crate::InteriorPoint, prob: &dyn Problem) {
    solver.grad.fobj = prob
        .eval_obj_con(solver.vars.x.as_ref(), &mut solver.grad.c)
        .unwrap();
    prob.eval_obj_con_gradient(
        solver.vars.x.as_ref(),
        &mut solver.grad.g,
        &mut solver.grad.ac,
    )
    .unwrap();
}

/// A box-constrained quadratic program with linear dense constraints and
/// optional sparse block constraints:
///
/// ```text
///   min  1/2 x^T diag(h) x - b^T x
///   s.t. a_k . x - crhs_k  >= 0  (or = 0)
///        w_i . x - wrhs_i  >= 0  (or = 0, block structured)
///        lb <= x <= ub
/// ```
pub struct BoxQp {
    pub h: Vec<E>,
    pub b: Vec<E>,
    pub acon: Vec<Vec<E>>,
    pub crhs: Vec<E>,
    pub dense_ineq: bool,
    pub lb: Vec<E>,
    pub ub: Vec<E>,
    pub x0: Vec<E>,
    /// Sparse constraint rows as `(variable, coefficient)` pairs.
    pub wrows: Vec<Vec<(usize, E)>>,
    pub wrhs: Vec<E>,
    pub nwblock: usize,
    pub sparse_ineq: bool,
}

impl BoxQp {
    /// An unconstrained-in-x QP with only bounds.
    pub fn bounds_only(h: Vec<E>, b: Vec<E>, lb: Vec<E>, ub: Vec<E>, x0: Vec<E>) -> Self {
        Self {
            h,
            b,
            acon: Vec::new(),
            crhs: Vec::new(),
            dense_ineq: true,
            lb,
            ub,
            x0,
            wrows: Vec::new(),
            wrhs: Vec::new(),
            nwblock: 1,
            sparse_ineq: true,
        }
    }
}

impl Problem for BoxQp {
    fn problem_sizes(&self) -> ProblemSizes {
        ProblemSizes {
            nvars: self.h.len(),
            ncon: self.acon.len(),
            nwcon: self.wrows.len(),
            nwblock: self.nwblock,
        }
    }

    fn vars_and_bounds(&self, x: &mut Col<E>, lb: &mut Col<E>, ub: &mut Col<E>) {
        for i in 0..self.h.len() {
            x[i] = self.x0[i];
            lb[i] = self.lb[i];
            ub[i] = self.ub[i];
        }
    }

    fn eval_obj_con(&self, x: ColRef<E>, c: &mut Col<E>) -> Result<E, EvalError> {
        let mut fobj = 0.0;
        for i in 0..self.h.len() {
            fobj += 0.5 * self.h[i] * x[i] * x[i] - self.b[i] * x[i];
        }
        for (k, a) in self.acon.iter().enumerate() {
            let mut val = -self.crhs[k];
            for i in 0..self.h.len() {
                val += a[i] * x[i];
            }
            c[k] = val;
        }
        Ok(fobj)
    }

    fn eval_obj_con_gradient(
        &self,
        x: ColRef<E>,
        g: &mut Col<E>,
        ac: &mut [Col<E>],
    ) -> Result<(), EvalError> {
        for i in 0..self.h.len() {
            g[i] = self.h[i] * x[i] - self.b[i];
        }
        for (k, a) in self.acon.iter().enumerate() {
            for i in 0..self.h.len() {
                ac[k][i] = a[i];
            }
        }
        Ok(())
    }

    fn eval_sparse_con(&self, x: ColRef<E>, out: &mut Col<E>) {
        for (i, row) in self.wrows.iter().enumerate() {
            let mut val = -self.wrhs[i];
            for &(j, coeff) in row {
                val += coeff * x[j];
            }
            out[i] = val;
        }
    }

    fn add_sparse_jacobian(&self, alpha: E, _x: ColRef<E>, px: ColRef<E>, out: &mut Col<E>) {
        for (i, row) in self.wrows.iter().enumerate() {
            let mut val = 0.0;
            for &(j, coeff) in row {
                val += coeff * px[j];
            }
            out[i] += alpha * val;
        }
    }

    fn add_sparse_jacobian_transpose(
        &self,
        alpha: E,
        _x: ColRef<E>,
        pzw: ColRef<E>,
        out: &mut Col<E>,
    ) {
        for (i, row) in self.wrows.iter().enumerate() {
            for &(j, coeff) in row {
                out[j] += alpha * coeff * pzw[i];
            }
        }
    }

    fn add_sparse_inner_product(&self, alpha: E, _x: ColRef<E>, cvec: ColRef<E>, out: &mut [E]) {
        let nb = self.nwblock;
        if nb == 1 {
            for (i, row) in self.wrows.iter().enumerate() {
                let mut val = 0.0;
                for &(j, coeff) in row {
                    val += coeff * coeff * cvec[j];
                }
                out[i] += alpha * val;
            }
        } else {
            let incr = packed_len(nb);
            for block in 0..self.wrows.len() / nb {
                let vals = &mut out[block * incr..(block + 1) * incr];
                for jj in 0..nb {
                    for ii in 0..=jj {
                        let row_i = &self.wrows[block * nb + ii];
                        let row_j = &self.wrows[block * nb + jj];
                        let mut val = 0.0;
                        for &(vi, ci) in row_i {
                            for &(vj, cj) in row_j {
                                if vi == vj {
                                    val += ci * cj * cvec[vi];
                                }
                            }
                        }
                        vals[jj * (jj + 1) / 2 + ii] += alpha * val;
                    }
                }
            }
        }
    }

    fn eval_hvec_product(
        &self,
        _x: ColRef<E>,
        _z: ColRef<E>,
        _zw: ColRef<E>,
        p: ColRef<E>,
        out: &mut Col<E>,
    ) -> Result<(), EvalError> {
        for i in 0..self.h.len() {
            out[i] = self.h[i] * p[i];
        }
        Ok(())
    }

    fn eval_hessian_diag(
        &self,
        _x: ColRef<E>,
        _z: ColRef<E>,
        _zw: ColRef<E>,
        out: &mut Col<E>,
    ) -> Result<(), EvalError> {
        for i in 0..self.h.len() {
            out[i] = self.h[i];
        }
        Ok(())
    }

    fn is_dense_inequality(&self) -> bool {
        self.dense_ineq
    }

    fn is_sparse_inequality(&self) -> bool {
        self.sparse_ineq
    }
}

/// The convex QP of the standard benchmark set: `min 1/2 x^T H x - b^T x`
/// with `H = diag(4, 3, 2, 1)`, `b = e`, one equality `sum(x) = 1` and the
/// box `0 <= x <= 1`. The optimum is `x_i = 0.48 / h_i` with equality
/// multiplier `-0.52`.
pub fn equality_qp() -> BoxQp {
    BoxQp {
        h: vec![4.0, 3.0, 2.0, 1.0],
        b: vec![1.0, 1.0, 1.0, 1.0],
        acon: vec![vec![1.0, 1.0, 1.0, 1.0]],
        crhs: vec![1.0],
        dense_ineq: false,
        lb: vec![0.0; 4],
        ub: vec![1.0; 4],
        x0: vec![0.25, 0.25, 0.25, 0.25],
        wrows: Vec::new(),
        wrhs: Vec::new(),
        nwblock: 1,
        sparse_ineq: true,
    }
}

/// A strictly convex QP with two dense inequality constraints, used by the
/// adaptive-barrier scenarios.
pub fn inequality_qp() -> BoxQp {
    BoxQp {
        h: vec![2.0, 3.0, 4.0],
        b: vec![4.0, 3.0, 8.0],
        acon: vec![vec![1.0, 1.0, 0.0], vec![0.0, 1.0, 1.0]],
        // x1 + x2 >= 4, x2 + x3 >= 3.5; both active at the optimum
        crhs: vec![4.0, 3.5],
        dense_ineq: true,
        lb: vec![0.0; 3],
        ub: vec![10.0; 3],
        x0: vec![1.0, 1.0, 1.0],
        wrows: Vec::new(),
        wrhs: Vec::new(),
        nwblock: 1,
        sparse_ineq: true,
    }
}

/// Hock-Schittkowski problem 71:
///
/// ```text
///   min  x1 x4 (x1 + x2 + x3) + x3
///   s.t. x1 x2 x3 x4 >= 25
///        x1^2 + x2^2 + x3^2 + x4^2 = 40
///        1 <= x <= 5
/// ```
///
/// The equality is posed as the inequality pair `(c, -c)` so every dense
/// constraint has the same sign convention. The optimum is
/// `x = (1, 4.7429994, 3.8211503, 1.3794082)` with `f = 17.0140173`.
pub struct Hs71;

impl Problem for Hs71 {
    fn problem_sizes(&self) -> ProblemSizes {
        ProblemSizes {
            nvars: 4,
            ncon: 3,
            nwcon: 0,
            nwblock: 1,
        }
    }

    fn vars_and_bounds(&self, x: &mut Col<E>, lb: &mut Col<E>, ub: &mut Col<E>) {
        let x0 = [1.0, 5.0, 5.0, 1.0];
        for i in 0..4 {
            x[i] = x0[i];
            lb[i] = 1.0;
            ub[i] = 5.0;
        }
    }

    fn eval_obj_con(&self, x: ColRef<E>, c: &mut Col<E>) -> Result<E, EvalError> {
        let fobj = x[0] * x[3] * (x[0] + x[1] + x[2]) + x[2];
        let prod = x[0] * x[1] * x[2] * x[3];
        let sq = x[0] * x[0] + x[1] * x[1] + x[2] * x[2] + x[3] * x[3];
        c[0] = prod - 25.0;
        c[1] = sq - 40.0;
        c[2] = 40.0 - sq;
        Ok(fobj)
    }

    fn eval_obj_con_gradient(
        &self,
        x: ColRef<E>,
        g: &mut Col<E>,
        ac: &mut [Col<E>],
    ) -> Result<(), EvalError> {
        g[0] = x[3] * (2.0 * x[0] + x[1] + x[2]);
        g[1] = x[0] * x[3];
        g[2] = x[0] * x[3] + 1.0;
        g[3] = x[0] * (x[0] + x[1] + x[2]);

        ac[0][0] = x[1] * x[2] * x[3];
        ac[0][1] = x[0] * x[2] * x[3];
        ac[0][2] = x[0] * x[1] * x[3];
        ac[0][3] = x[0] * x[1] * x[2];

        for i in 0..4 {
            ac[1][i] = 2.0 * x[i];
            ac[2][i] = -2.0 * x[i];
        }
        Ok(())
    }

    fn eval_sparse_con(&self, _x: ColRef<E>, _out: &mut Col<E>) {}

    fn add_sparse_jacobian(&self, _alpha: E, _x: ColRef<E>, _px: ColRef<E>, _out: &mut Col<E>) {}

    fn add_sparse_jacobian_transpose(
        &self,
        _alpha: E,
        _x: ColRef<E>,
        _pzw: ColRef<E>,
        _out: &mut Col<E>,
    ) {
    }

    fn add_sparse_inner_product(
        &self,
        _alpha: E,
        _x: ColRef<E>,
        _cvec: ColRef<E>,
        _out: &mut [E],
    ) {
    }
}
