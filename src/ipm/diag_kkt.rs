//! The "diagonal" approximate KKT system and its bordered solver.
//!
//! The approximate KKT matrix `K_D` replaces the compact quasi-Newton term
//! with its diagonal `b0` (or a user-supplied Hessian diagonal). Setting up
//! the system computes
//!
//! ```text
//!   C  = diag( bhat + zl/(x - lb) + zu/(ub - x) )      bhat = b0 + qn_sigma
//!   Cw = Zw^{-1} Sw + Aw C^{-1} Aw^T                    (block diagonal)
//!   Ew[k] = Aw C^{-1} Ac[k]                             k = 0..ncon
//!   D  = Z^{-1} S + Zt^{-1} T + Ac C^{-1} Ac^T - Ew^T Cw^{-1} Ew
//! ```
//!
//! `C^{-1}` is stored componentwise in `cvec`, `Cw` is factored in place
//! block by block, and `D` is reduced to the optimization root, factored
//! there, and its factors broadcast so every rank applies the identical
//! factorization.
//!
//! The solver applies `K_D^{-1}` by successive bordered elimination. One
//! routine covers all right-hand-side shapes the engine uses through
//! [`DiagRhs`]: the full residual RHS, an x-only RHS (all other blocks
//! implicitly zero, used inside the low-rank correction), and the
//! alpha-scaled RHS used by the Krylov solver.

use faer::Col;

use crate::comm::{Communicator, OPT_ROOT};
use crate::linalg::cholesky::{packed_len, BlockDiagCholesky};
use crate::linalg::lu::DenseLu;
use crate::linalg::vector_ops::{axpy, copy_vals, cwise_multiply, dot, set_zero};
use crate::problem::Problem;
use crate::E;

use super::{GradInfo, InteriorPoint, IpVars, ProblemFlags, Residuals, Step};

/// The diagonal part of the Hessian approximation entering `C`.
pub(crate) enum DiagHessian<'h> {
    /// The scalar `b0` from the compact quasi-Newton form (zero for a
    /// sequential linear step).
    Scalar(E),
    /// A user-supplied Hessian diagonal.
    Diag(&'h Col<E>),
}

/// Right-hand side bundle for [`DiagKkt::solve`].
///
/// `bx` is always present. When `rest` is `None` every other block is
/// implicitly zero; otherwise the non-x blocks are taken from the residual
/// bundle and scaled by `alpha` (the Krylov solver passes `alpha != 1`).
pub(crate) struct DiagRhs<'r> {
    pub bx: &'r Col<E>,
    pub rest: Option<&'r Residuals>,
    pub alpha: E,
}

impl<'r> DiagRhs<'r> {
    pub(crate) fn full(res: &'r Residuals) -> Self {
        Self {
            bx: &res.rx,
            rest: Some(res),
            alpha: 1.0,
        }
    }

    pub(crate) fn x_only(bx: &'r Col<E>) -> Self {
        Self {
            bx,
            rest: None,
            alpha: 1.0,
        }
    }
}

/// Factored diagonal KKT system. All buffers are sized once at
/// construction.
pub(crate) struct DiagKkt {
    /// Componentwise `C^{-1}`.
    pub(crate) cvec: Col<E>,
    /// Factored block-diagonal `Cw`.
    pub(crate) cw: BlockDiagCholesky,
    /// `Ew[k] = Aw C^{-1} Ac[k]`, one sparse-constraint-shaped vector per
    /// dense constraint.
    pub(crate) ew: Vec<Col<E>>,
    /// LU factors of the dense Schur complement `D`.
    pub(crate) dmat: DenseLu,
    /// Assembly scratch for `D`, column-major `ncon x ncon`.
    dvals: Vec<E>,
}

impl DiagKkt {
    pub(crate) fn new(nvars: usize, ncon: usize, nwcon: usize, nwblock: usize) -> Self {
        Self {
            cvec: Col::zeros(nvars),
            cw: BlockDiagCholesky::new(nwcon, nwblock),
            ew: (0..ncon).map(|_| Col::zeros(nwcon)).collect(),
            dmat: DenseLu::new(ncon),
            dvals: vec![0.0; ncon * ncon],
        }
    }

    /// Assembles and factors the bordered system at the current iterate.
    pub(crate) fn factor(
        &mut self,
        prob: &dyn Problem,
        comm: &dyn Communicator,
        flags: &ProblemFlags,
        vars: &IpVars,
        grad: &GradInfo,
        hess: DiagHessian,
        qn_sigma: E,
        xtmp: &mut Col<E>,
        wtmp: &mut Col<E>,
    ) -> Result<(), crate::linalg::SolverError> {
        let ncon = flags.ncon;
        let nwcon = flags.nwcon;

        // The diagonal matrix C, stored inverted
        for i in 0..flags.nvars {
            let b0 = match &hess {
                DiagHessian::Scalar(b0) => *b0,
                DiagHessian::Diag(h) => h[i],
            };
            let mut diag = b0 + qn_sigma;
            if flags.use_lower && vars.lb[i] > -flags.max_bound_val {
                diag += vars.zl[i] / (vars.x[i] - vars.lb[i]);
            }
            if flags.use_upper && vars.ub[i] < flags.max_bound_val {
                diag += vars.zu[i] / (vars.ub[i] - vars.x[i]);
            }
            self.cvec[i] = 1.0 / diag;
        }

        if nwcon > 0 {
            // Cw = Zw^{-1} Sw + Aw C^{-1} Aw^T, factored in place
            self.cw.zero();
            if flags.sparse_inequality {
                let nb = flags.nwblock;
                let vals = self.cw.vals_mut();
                if nb == 1 {
                    for i in 0..nwcon {
                        vals[i] = vars.sw[i] / vars.zw[i];
                    }
                } else {
                    let incr = packed_len(nb);
                    for (block, row0) in (0..nwcon).step_by(nb).enumerate() {
                        let mut k = 0;
                        for j in 0..nb {
                            vals[block * incr + k] = vars.sw[row0 + j] / vars.zw[row0 + j];
                            k += j + 2;
                        }
                    }
                }
            }
            prob.add_sparse_inner_product(
                1.0,
                vars.x.as_ref(),
                self.cvec.as_ref(),
                self.cw.vals_mut(),
            );
            self.cw.factor()?;

            // Ew[k] = Aw C^{-1} Ac[k]
            for k in 0..ncon {
                copy_vals(xtmp, cwise_multiply(self.cvec.as_ref(), grad.ac[k].as_ref()).as_ref());
                set_zero(&mut self.ew[k]);
                prob.add_sparse_jacobian(1.0, vars.x.as_ref(), xtmp.as_ref(), &mut self.ew[k]);
            }
        }

        // Local contributions to the dense Schur complement
        self.dvals.fill(0.0);

        if nwcon > 0 {
            // D -= Ew^T Cw^{-1} Ew
            for j in 0..ncon {
                copy_vals(wtmp, self.ew[j].as_ref());
                self.cw.apply(wtmp)?;
                for i in j..ncon {
                    self.dvals[i + ncon * j] -= dot(self.ew[i].as_ref(), wtmp.as_ref());
                }
            }
        }

        // D += Ac C^{-1} Ac^T (on-processor part)
        for j in 0..ncon {
            for i in j..ncon {
                let mut dmat = 0.0;
                for k in 0..flags.nvars {
                    dmat += grad.ac[i][k] * grad.ac[j][k] * self.cvec[k];
                }
                self.dvals[i + ncon * j] += dmat;
            }
        }

        // Mirror the lower triangle
        for j in 0..ncon {
            for i in (j + 1)..ncon {
                self.dvals[j + ncon * i] = self.dvals[i + ncon * j];
            }
        }

        if ncon > 0 {
            comm.reduce_sum_root(&mut self.dvals);

            // The slack diagonal is replicated, so it is added on the root
            // only; the factorization is broadcast from there
            let mut status = [1.0, 0.0];
            if comm.rank() == OPT_ROOT {
                if flags.dense_inequality {
                    for i in 0..ncon {
                        self.dvals[i * (ncon + 1)] +=
                            vars.s[i] / vars.z[i] + vars.t[i] / vars.zt[i];
                    }
                }
                if let Err(err) = self.dmat.factorize(&self.dvals) {
                    status[0] = 0.0;
                    if let crate::linalg::SolverError::LuFactorization { index } = err {
                        status[1] = index as E;
                    }
                }
            }
            comm.broadcast(&mut status);
            if status[0] == 0.0 {
                return Err(crate::linalg::SolverError::LuFactorization {
                    index: status[1] as usize,
                });
            }

            let (factors, pivots) = self.dmat.factors_mut();
            comm.broadcast(factors);
            comm.broadcast_index(pivots);
            self.dmat.set_factored();
        }

        Ok(())
    }

    /// Applies `K_D^{-1}` to the given right-hand side by bordered
    /// elimination, writing the full solution into `out`.
    ///
    /// The only collective points are the reduce+broadcast pair around the
    /// dense `ncon`-vector solve on the optimization root.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn solve(
        &self,
        prob: &dyn Problem,
        comm: &dyn Communicator,
        flags: &ProblemFlags,
        vars: &IpVars,
        grad: &GradInfo,
        rhs: DiagRhs,
        out: &mut Step,
        xtmp: &mut Col<E>,
        wtmp: &mut Col<E>,
    ) {
        let ncon = flags.ncon;
        let nwcon = flags.nwcon;
        let alpha = rhs.alpha;

        // d = C^{-1} (bx + (X - Lb)^{-1} bzl - (Ub - X)^{-1} bzu)
        for i in 0..flags.nvars {
            xtmp[i] = self.cvec[i] * rhs.bx[i];
        }
        if let Some(res) = rhs.rest {
            if flags.use_lower {
                for i in 0..flags.nvars {
                    if vars.lb[i] > -flags.max_bound_val {
                        xtmp[i] +=
                            alpha * self.cvec[i] * (res.rzl[i] / (vars.x[i] - vars.lb[i]));
                    }
                }
            }
            if flags.use_upper {
                for i in 0..flags.nvars {
                    if vars.ub[i] < flags.max_bound_val {
                        xtmp[i] -=
                            alpha * self.cvec[i] * (res.rzu[i] / (vars.ub[i] - vars.x[i]));
                    }
                }
            }
        }

        // wtmp = Cw^{-1} (bcw + Zw^{-1} bsw - Aw C^{-1} d)
        if nwcon > 0 {
            match rhs.rest {
                Some(res) => {
                    for i in 0..nwcon {
                        wtmp[i] = alpha * res.rcw[i];
                    }
                    if flags.sparse_inequality {
                        for i in 0..nwcon {
                            wtmp[i] += alpha * res.rsw[i] / vars.zw[i];
                        }
                    }
                }
                None => set_zero(wtmp),
            }
            prob.add_sparse_jacobian(-1.0, vars.x.as_ref(), xtmp.as_ref(), wtmp);
            self.cw.apply(wtmp).expect("Cw is factored");
        }

        // Local part of the bordered right-hand side for yz
        for i in 0..ncon {
            let mut val = dot(grad.ac[i].as_ref(), xtmp.as_ref());
            if nwcon > 0 {
                val += dot(self.ew[i].as_ref(), wtmp.as_ref());
            }
            out.pz[i] = val;
        }

        if ncon > 0 {
            // One reduce+broadcast pair: assemble on the root, apply the
            // broadcast factorization of D there, and share the result
            {
                let pz = &mut out.pz;
                let mut buf: Vec<E> = (0..ncon).map(|i| pz[i]).collect();
                comm.reduce_sum_root(&mut buf);

                if comm.rank() == OPT_ROOT {
                    match rhs.rest {
                        Some(res) if flags.dense_inequality => {
                            for i in 0..ncon {
                                buf[i] = alpha
                                    * (res.rc[i] + res.rs[i] / vars.z[i]
                                        - (res.rzt[i] + vars.t[i] * res.rt[i]) / vars.zt[i])
                                    - buf[i];
                            }
                        }
                        Some(res) => {
                            for i in 0..ncon {
                                buf[i] = alpha * res.rc[i] - buf[i];
                            }
                        }
                        None => {
                            for i in 0..ncon {
                                buf[i] = -buf[i];
                            }
                        }
                    }
                    self.dmat.solve(&mut buf).expect("D is factored");
                }
                comm.broadcast(&mut buf);
                for i in 0..ncon {
                    pz[i] = buf[i];
                }
            }

            // Steps in the dense slack variables and their multipliers
            if flags.dense_inequality {
                let (bs, bt, bzt) = match rhs.rest {
                    Some(res) => (Some(&res.rs), Some(&res.rt), Some(&res.rzt)),
                    None => (None, None, None),
                };
                for i in 0..ncon {
                    let bs_i = alpha * bs.map_or(0.0, |b| b[i]);
                    let bt_i = alpha * bt.map_or(0.0, |b| b[i]);
                    let bzt_i = alpha * bzt.map_or(0.0, |b| b[i]);
                    out.ps[i] = (bs_i - vars.s[i] * out.pz[i]) / vars.z[i];
                    out.pzt[i] = -bt_i - out.pz[i];
                    out.pt[i] = (bzt_i - vars.t[i] * out.pzt[i]) / vars.zt[i];
                }
            }
        }

        // yzw = Cw^{-1} (bcw + Zw^{-1} bsw - Ew yz - Aw C^{-1} d)
        if nwcon > 0 {
            match rhs.rest {
                Some(res) => {
                    for i in 0..nwcon {
                        out.pzw[i] = alpha * res.rcw[i];
                    }
                    if flags.sparse_inequality {
                        for i in 0..nwcon {
                            out.pzw[i] += alpha * res.rsw[i] / vars.zw[i];
                        }
                    }
                }
                None => set_zero(&mut out.pzw),
            }
            for i in 0..ncon {
                axpy(-out.pz[i], self.ew[i].as_ref(), &mut out.pzw);
            }
            prob.add_sparse_jacobian(-1.0, vars.x.as_ref(), xtmp.as_ref(), &mut out.pzw);
            self.cw.apply(&mut out.pzw).expect("Cw is factored");

            // ysw = Zw^{-1} (bsw - Sw yzw)
            if flags.sparse_inequality {
                for i in 0..nwcon {
                    let bsw_i = alpha * rhs.rest.map_or(0.0, |res| res.rsw[i]);
                    out.psw[i] = (bsw_i - vars.sw[i] * out.pzw[i]) / vars.zw[i];
                }
            }
        }

        // yx = C^{-1} (d + Ac^T yz + Aw^T yzw)
        set_zero(&mut out.px);
        for i in 0..ncon {
            axpy(out.pz[i], grad.ac[i].as_ref(), &mut out.px);
        }
        if nwcon > 0 {
            prob.add_sparse_jacobian_transpose(
                1.0,
                vars.x.as_ref(),
                out.pzw.as_ref(),
                &mut out.px,
            );
        }
        for i in 0..flags.nvars {
            out.px[i] = self.cvec[i] * out.px[i] + xtmp[i];
        }

        // Bound multiplier steps on live bounds
        if flags.use_lower {
            for i in 0..flags.nvars {
                out.pzl[i] = if vars.lb[i] > -flags.max_bound_val {
                    let bzl_i = alpha * rhs.rest.map_or(0.0, |res| res.rzl[i]);
                    (bzl_i - vars.zl[i] * out.px[i]) / (vars.x[i] - vars.lb[i])
                } else {
                    0.0
                };
            }
        }
        if flags.use_upper {
            for i in 0..flags.nvars {
                out.pzu[i] = if vars.ub[i] < flags.max_bound_val {
                    let bzu_i = alpha * rhs.rest.map_or(0.0, |res| res.rzu[i]);
                    (bzu_i + vars.zu[i] * out.px[i]) / (vars.ub[i] - vars.x[i])
                } else {
                    0.0
                };
            }
        }
    }
}

impl<'a> InteriorPoint<'a> {
    /// Assembles and factors the diagonal KKT system at the current
    /// iterate. With `use_qn` the quasi-Newton diagonal `b0` enters `C`;
    /// otherwise only `qn_sigma` (plus the optional Hessian diagonal) does.
    pub(crate) fn setup_kkt_diag_system(
        &mut self,
        use_qn: bool,
    ) -> Result<(), crate::linalg::SolverError> {
        let hess = if self.opts.use_diag_hessian && self.hdiag.is_some() {
            DiagHessian::Diag(self.hdiag.as_ref().unwrap())
        } else if use_qn {
            match &self.qn {
                Some(qn) => DiagHessian::Scalar(qn.compact_mat().b0),
                None => DiagHessian::Scalar(0.0),
            }
        } else {
            DiagHessian::Scalar(0.0)
        };

        self.kkt.factor(
            self.prob,
            &*self.comm,
            &self.flags,
            &self.vars,
            &self.grad,
            hess,
            self.opts.qn_sigma,
            &mut self.xtmp,
            &mut self.wtmp,
        )
    }

    /// Solves the diagonal system with the full residual right-hand side,
    /// writing the step into `self.step`.
    pub(crate) fn solve_kkt_diag_full(&mut self) {
        self.kkt.solve(
            self.prob,
            &*self.comm,
            &self.flags,
            &self.vars,
            &self.grad,
            DiagRhs::full(&self.res),
            &mut self.step,
            &mut self.xtmp,
            &mut self.wtmp,
        );
    }
}
