//! Assembly of the perturbed KKT residuals.
//!
//! For a barrier parameter `mu`, the negated residuals of the first-order
//! conditions are
//!
//! ```text
//!   rx  = -(g(x) - Ac^T z - Aw^T zw - zl + zu)
//!   rc  = -(c(x) - s + t)
//!   rs  = -(S z - mu e)
//!   rt  = -(gamma - zt - z)
//!   rzt = -(T zt - mu e)
//!   rcw = -(cw(x) - sw)
//!   rsw = -(Sw zw - mu e)
//!   rzl = -((x - lb) zl - beta mu e)     on live lower bounds
//!   rzu = -((ub - x) zu - beta mu e)     on live upper bounds
//! ```
//!
//! with `beta = rel_bound_barrier`. Equality rows zero the corresponding
//! slack and complementarity residuals.

use faer::ColRef;

use crate::comm::Communicator;
use crate::linalg::vector_ops::{abs_max, abs_sum, axpy, copy_vals, set_zero, sq_sum};
use crate::{NormType, E};

use super::{InteriorPoint, ResNorms};

/// Local accumulator for one residual group under the configured norm.
#[derive(Clone, Copy, Default)]
struct NormAcc {
    val: E,
}

impl NormAcc {
    fn add_vec(&mut self, norm_type: NormType, v: ColRef<E>) {
        match norm_type {
            NormType::Linfty => self.val = self.val.max(abs_max(v)),
            NormType::L1 => self.val += abs_sum(v),
            NormType::L2 => self.val += sq_sum(v),
        }
    }

    fn add_scalar(&mut self, norm_type: NormType, v: E) {
        match norm_type {
            NormType::Linfty => self.val = self.val.max(v.abs()),
            NormType::L1 => self.val += v.abs(),
            NormType::L2 => self.val += v * v,
        }
    }
}

impl<'a> InteriorPoint<'a> {
    /// Computes the KKT residuals at the current iterate for the given
    /// barrier parameter, and returns the residual norms for the
    /// convergence test.
    ///
    /// The distributed contributions are accumulated locally and combined
    /// in a single reduction of three scalars; the replicated contributions
    /// are then added identically on every rank.
    pub(crate) fn compute_kkt_res(&mut self, barrier: E) -> ResNorms {
        let prob = self.prob;
        let comm = &*self.comm;
        let flags = &self.flags;
        let vars = &self.vars;
        let grad = &self.grad;
        let res = &mut self.res;
        let norm_type = self.opts.norm_type;
        let beta = self.opts.rel_bound_barrier;

        // rx = -(g - Ac^T z - Aw^T zw - zl + zu)
        if flags.use_lower {
            copy_vals(&mut res.rx, vars.zl.as_ref());
        } else {
            set_zero(&mut res.rx);
        }
        if flags.use_upper {
            axpy(-1.0, vars.zu.as_ref(), &mut res.rx);
        }
        axpy(-1.0, grad.g.as_ref(), &mut res.rx);
        for i in 0..flags.ncon {
            axpy(vars.z[i], grad.ac[i].as_ref(), &mut res.rx);
        }

        if flags.nwcon > 0 {
            prob.add_sparse_jacobian_transpose(
                1.0,
                vars.x.as_ref(),
                vars.zw.as_ref(),
                &mut res.rx,
            );

            // rcw = -(cw(x) - sw)
            prob.eval_sparse_con(vars.x.as_ref(), &mut res.rcw);
            if flags.sparse_inequality {
                axpy(-1.0, vars.sw.as_ref(), &mut res.rcw);
            }
            for i in 0..flags.nwcon {
                res.rcw[i] = -res.rcw[i];
            }
        }

        let mut prime = NormAcc::default();
        let mut dual = NormAcc::default();
        let mut infeas = NormAcc::default();
        prime.add_vec(norm_type, res.rx.as_ref());
        infeas.add_vec(norm_type, res.rcw.as_ref());

        // Bound multiplier complementarity on live bounds only
        if flags.use_lower {
            for i in 0..flags.nvars {
                res.rzl[i] = if vars.lb[i] > -flags.max_bound_val {
                    -((vars.x[i] - vars.lb[i]) * vars.zl[i] - beta * barrier)
                } else {
                    0.0
                };
            }
            dual.add_vec(norm_type, res.rzl.as_ref());
        }
        if flags.use_upper {
            for i in 0..flags.nvars {
                res.rzu[i] = if vars.ub[i] < flags.max_bound_val {
                    -((vars.ub[i] - vars.x[i]) * vars.zu[i] - beta * barrier)
                } else {
                    0.0
                };
            }
            dual.add_vec(norm_type, res.rzu.as_ref());
        }

        if flags.nwcon > 0 && flags.sparse_inequality {
            for i in 0..flags.nwcon {
                res.rsw[i] = -(vars.sw[i] * vars.zw[i] - barrier);
            }
            dual.add_vec(norm_type, res.rsw.as_ref());
        }

        // One reduction over the distributed contributions
        let mut acc = [prime.val, dual.val, infeas.val];
        match norm_type {
            NormType::Linfty => comm.allreduce_max(&mut acc),
            NormType::L1 | NormType::L2 => comm.allreduce_sum(&mut acc),
        }
        prime.val = acc[0];
        dual.val = acc[1];
        infeas.val = acc[2];

        // Replicated dense-constraint residuals, identical on every rank
        if flags.dense_inequality {
            for i in 0..flags.ncon {
                res.rc[i] = -(grad.c[i] - vars.s[i] + vars.t[i]);
                res.rs[i] = -(vars.s[i] * vars.z[i] - barrier);
                res.rt[i] = -(self.penalty_gamma[i] - vars.zt[i] - vars.z[i]);
                res.rzt[i] = -(vars.t[i] * vars.zt[i] - barrier);
            }
        } else {
            for i in 0..flags.ncon {
                res.rc[i] = -grad.c[i];
                res.rs[i] = 0.0;
                res.rt[i] = 0.0;
                res.rzt[i] = 0.0;
            }
        }
        for i in 0..flags.ncon {
            prime.add_scalar(norm_type, res.rt[i]);
            infeas.add_scalar(norm_type, res.rc[i]);
            dual.add_scalar(norm_type, res.rs[i]);
            dual.add_scalar(norm_type, res.rzt[i]);
        }

        let (max_prime, max_dual, max_infeas) = if norm_type == NormType::L2 {
            (prime.val.sqrt(), dual.val.sqrt(), infeas.val.sqrt())
        } else {
            (prime.val, dual.val, infeas.val)
        };

        ResNorms {
            max_prime,
            max_dual,
            max_infeas,
            res_norm: max_prime.max(max_dual).max(max_infeas),
        }
    }

    /// Norm of the design-variable step, under the configured norm type.
    pub(crate) fn compute_step_norm(&self) -> E {
        let comm = &*self.comm;
        match self.opts.norm_type {
            NormType::Linfty => {
                let mut acc = [abs_max(self.step.px.as_ref())];
                comm.allreduce_max(&mut acc);
                acc[0]
            }
            NormType::L1 => {
                let mut acc = [abs_sum(self.step.px.as_ref())];
                comm.allreduce_sum(&mut acc);
                acc[0]
            }
            NormType::L2 => {
                let mut acc = [sq_sum(self.step.px.as_ref())];
                comm.allreduce_sum(&mut acc);
                acc[0].sqrt()
            }
        }
    }
}
