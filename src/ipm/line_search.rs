//! The l1-penalty barrier merit function and its line search.
//!
//! The merit function is
//!
//! ```text
//!   phi(alpha) = f(x + alpha px)
//!              - mu * ( B(x, s, t, sw) )
//!              + rho * ( ||c(x) - s + t||_2 + ||cw(x) - sw||_2 )
//!              + gamma^T (t + alpha pt)
//! ```
//!
//! where `B` sums the logs over live bounds (weighted by
//! `rel_bound_barrier`) and over the inequality slacks. The penalty `rho`
//! is tuned at `alpha = 0` so the direction is a descent direction for the
//! merit function, then an Armijo backtracking (or quadratic interpolation)
//! search picks the step.
//!
//! The positive and negative log contributions are accumulated separately
//! to limit cancellation, as are the derivative terms.

use faer::Col;

use crate::comm::{Communicator, OPT_ROOT};
use crate::linalg::vector_ops::{dot, set_zero, sq_sum};
use crate::problem::EvalError;
use crate::E;

use super::{apply_step, InteriorPoint};

pub(crate) const LINE_SEARCH_SUCCESS: u32 = 1;
pub(crate) const LINE_SEARCH_FAILURE: u32 = 2;
pub(crate) const LINE_SEARCH_MIN_STEP: u32 = 4;
pub(crate) const LINE_SEARCH_MAX_ITERS: u32 = 8;
pub(crate) const LINE_SEARCH_NO_IMPROVEMENT: u32 = 16;

/// Which point the merit function is evaluated at: the current iterate, or
/// the trial point staged in the residual buffers by the line search.
#[derive(Clone, Copy)]
pub(crate) enum MeritAt {
    Current,
    Trial,
}

impl<'a> InteriorPoint<'a> {
    /// Evaluates the merit function, assuming the objective and constraint
    /// values for the chosen point are already stored in `grad`.
    pub(crate) fn eval_merit_func(&mut self, at: MeritAt) -> E {
        let flags = &self.flags;
        let vars = &self.vars;
        let res = &self.res;
        let grad = &self.grad;

        let (xk, sk, tk, swk) = match at {
            MeritAt::Current => (&vars.x, &vars.s, &vars.t, &vars.sw),
            MeritAt::Trial => (&res.rx, &res.rs, &res.rt, &res.rsw),
        };

        // Positive and negative log contributions are tracked separately;
        // the difference is only taken at the end
        let mut pos_result = 0.0;
        let mut neg_result = 0.0;

        if flags.use_lower {
            for i in 0..flags.nvars {
                if vars.lb[i] > -flags.max_bound_val {
                    let d = xk[i] - vars.lb[i];
                    if d > 1.0 {
                        pos_result += d.ln();
                    } else {
                        neg_result += d.ln();
                    }
                }
            }
        }
        if flags.use_upper {
            for i in 0..flags.nvars {
                if vars.ub[i] < flags.max_bound_val {
                    let d = vars.ub[i] - xk[i];
                    if d > 1.0 {
                        pos_result += d.ln();
                    } else {
                        neg_result += d.ln();
                    }
                }
            }
        }
        pos_result *= self.opts.rel_bound_barrier;
        neg_result *= self.opts.rel_bound_barrier;

        if flags.nwcon > 0 && flags.sparse_inequality {
            for i in 0..flags.nwcon {
                if swk[i] > 1.0 {
                    pos_result += swk[i].ln();
                } else {
                    neg_result += swk[i].ln();
                }
            }
        }

        // Sparse-constraint infeasibility norm
        let mut weight_infeas = 0.0;
        if flags.nwcon > 0 {
            self.prob.eval_sparse_con(xk.as_ref(), &mut self.wtmp);
            for i in 0..flags.nwcon {
                if flags.sparse_inequality {
                    self.wtmp[i] -= swk[i];
                }
            }
            let mut acc = [sq_sum(self.wtmp.as_ref())];
            self.comm.allreduce_sum(&mut acc);
            weight_infeas = acc[0].sqrt();
        }

        let mut acc = [pos_result, neg_result];
        self.comm.reduce_sum_root(&mut acc);
        pos_result = acc[0];
        neg_result = acc[1];

        // Replicated slack contributions
        if flags.dense_inequality {
            for i in 0..flags.ncon {
                if sk[i] > 1.0 {
                    pos_result += sk[i].ln();
                } else {
                    neg_result += sk[i].ln();
                }
                if tk[i] > 1.0 {
                    pos_result += tk[i].ln();
                } else {
                    neg_result += tk[i].ln();
                }
            }
        }

        let mut merit = [0.0];
        if self.comm.rank() == OPT_ROOT {
            let mut dense_infeas = 0.0;
            for i in 0..flags.ncon {
                let r = if flags.dense_inequality {
                    grad.c[i] - sk[i] + tk[i]
                } else {
                    grad.c[i]
                };
                dense_infeas += r * r;
            }
            let infeas = dense_infeas.sqrt() + weight_infeas;

            merit[0] = grad.fobj - self.barrier_param * (pos_result + neg_result)
                + self.rho_penalty_search * infeas;

            if flags.dense_inequality {
                for i in 0..flags.ncon {
                    merit[0] += self.penalty_gamma[i] * tk[i];
                }
            }
        }
        self.comm.broadcast(&mut merit);

        merit[0]
    }

    /// Tunes the penalty parameter so the current step is a descent
    /// direction, then evaluates the merit function and its projected
    /// derivative at `alpha = 0`.
    pub(crate) fn eval_merit_init_deriv(&mut self, max_x: E) -> (E, E) {
        let flags = &self.flags;
        let vars = &self.vars;
        let step = &self.step;

        let mut pos_result = 0.0;
        let mut neg_result = 0.0;
        let mut pos_presult = 0.0;
        let mut neg_presult = 0.0;

        if flags.use_lower {
            for i in 0..flags.nvars {
                if vars.lb[i] > -flags.max_bound_val {
                    let d = vars.x[i] - vars.lb[i];
                    if d > 1.0 {
                        pos_result += d.ln();
                    } else {
                        neg_result += d.ln();
                    }
                    if step.px[i] > 0.0 {
                        pos_presult += step.px[i] / d;
                    } else {
                        neg_presult += step.px[i] / d;
                    }
                }
            }
        }
        if flags.use_upper {
            for i in 0..flags.nvars {
                if vars.ub[i] < flags.max_bound_val {
                    let d = vars.ub[i] - vars.x[i];
                    if d > 1.0 {
                        pos_result += d.ln();
                    } else {
                        neg_result += d.ln();
                    }
                    if step.px[i] > 0.0 {
                        neg_presult -= step.px[i] / d;
                    } else {
                        pos_presult -= step.px[i] / d;
                    }
                }
            }
        }
        pos_result *= self.opts.rel_bound_barrier;
        neg_result *= self.opts.rel_bound_barrier;
        pos_presult *= self.opts.rel_bound_barrier;
        neg_presult *= self.opts.rel_bound_barrier;

        if flags.nwcon > 0 && flags.sparse_inequality {
            for i in 0..flags.nwcon {
                if vars.sw[i] > 1.0 {
                    pos_result += vars.sw[i].ln();
                } else {
                    neg_result += vars.sw[i].ln();
                }
                if step.psw[i] > 0.0 {
                    pos_presult += step.psw[i] / vars.sw[i];
                } else {
                    neg_presult += step.psw[i] / vars.sw[i];
                }
            }
        }

        // Sparse infeasibility and its directional derivative
        // (cw - sw)^T (Aw px - psw) / ||cw - sw||
        let mut weight_infeas = 0.0;
        let mut weight_proj = 0.0;
        if flags.nwcon > 0 {
            self.prob.eval_sparse_con(vars.x.as_ref(), &mut self.wtmp);
            if flags.sparse_inequality {
                for i in 0..flags.nwcon {
                    self.wtmp[i] -= vars.sw[i];
                }
            }
            set_zero(&mut self.wtmp2);
            self.prob.add_sparse_jacobian(
                1.0,
                vars.x.as_ref(),
                step.px.as_ref(),
                &mut self.wtmp2,
            );

            let mut proj = dot(self.wtmp.as_ref(), self.wtmp2.as_ref());
            if flags.sparse_inequality {
                proj -= dot(self.wtmp.as_ref(), step.psw.as_ref());
            }
            let mut acc = [sq_sum(self.wtmp.as_ref()), proj];
            self.comm.allreduce_sum(&mut acc);
            weight_infeas = acc[0].sqrt();
            weight_proj = acc[1];
            if weight_infeas > 0.0 {
                weight_proj /= weight_infeas;
            }
        }

        let mut acc = [pos_result, neg_result, pos_presult, neg_presult];
        self.comm.reduce_sum_root(&mut acc);
        pos_result = acc[0];
        neg_result = acc[1];
        pos_presult = acc[2];
        neg_presult = acc[3];

        if flags.dense_inequality {
            for i in 0..flags.ncon {
                if vars.s[i] > 1.0 {
                    pos_result += vars.s[i].ln();
                } else {
                    neg_result += vars.s[i].ln();
                }
                if step.ps[i] > 0.0 {
                    pos_presult += step.ps[i] / vars.s[i];
                } else {
                    neg_presult += step.ps[i] / vars.s[i];
                }

                if vars.t[i] > 1.0 {
                    pos_result += vars.t[i].ln();
                } else {
                    neg_result += vars.t[i].ln();
                }
                if step.pt[i] > 0.0 {
                    pos_presult += step.pt[i] / vars.t[i];
                } else {
                    neg_presult += step.pt[i] / vars.t[i];
                }
            }
        }

        // Objective projection g^T px + gamma^T pt, and the dense
        // constraint projections, batched into one reduction
        let mut dots = vec![0.0; flags.ncon + 1];
        dots[0] = dot(self.grad.g.as_ref(), step.px.as_ref());
        for i in 0..flags.ncon {
            dots[1 + i] = dot(self.grad.ac[i].as_ref(), step.px.as_ref());
        }
        self.comm.allreduce_sum(&mut dots);

        let mut proj = dots[0];
        if flags.dense_inequality {
            for i in 0..flags.ncon {
                proj += self.penalty_gamma[i] * step.pt[i];
            }
        }

        let mut dense_infeas = 0.0;
        let mut dense_proj = 0.0;
        for i in 0..flags.ncon {
            if flags.dense_inequality {
                let r = self.grad.c[i] - vars.s[i] + vars.t[i];
                dense_infeas += r * r;
                dense_proj += r * (dots[1 + i] - step.ps[i] + step.pt[i]);
            } else {
                dense_infeas += self.grad.c[i] * self.grad.c[i];
                dense_proj += self.grad.c[i] * dots[1 + i];
            }
        }
        dense_infeas = dense_infeas.sqrt();
        if dense_infeas > 0.0 {
            dense_proj /= dense_infeas;
        }

        // p^T B p through the quasi-Newton approximation or the Hessian
        // diagonal
        let mut ptbp = 0.0;
        if self.opts.use_diag_hessian {
            if let Some(hdiag) = &self.hdiag {
                let mut local = 0.0;
                for i in 0..flags.nvars {
                    local += step.px[i] * step.px[i] * hdiag[i];
                }
                let mut acc = [local];
                self.comm.allreduce_sum(&mut acc);
                ptbp = acc[0];
            }
        } else if let Some(qn) = &self.qn {
            qn.mult(step.px.as_ref(), &mut self.xtmp);
            let mut acc = [dot(self.xtmp.as_ref(), step.px.as_ref())];
            self.comm.allreduce_sum(&mut acc);
            ptbp = acc[0];
        }

        let mut out = [0.0, 0.0, self.rho_penalty_search];
        if self.comm.rank() == OPT_ROOT {
            let infeas = dense_infeas + weight_infeas;
            let infeas_proj = dense_proj + weight_proj;

            let mut numer = proj - self.barrier_param * (pos_presult + neg_presult);
            if ptbp > 0.0 {
                numer += 0.5 * ptbp;
            }

            // Smallest rho with
            //   numer + rho * infeas_proj <= -frac * rho * max_x * infeas
            let mut rho_hat = 0.0;
            if infeas > 0.01 * self.opts.abs_res_tol {
                rho_hat = -numer
                    / (infeas_proj + self.opts.penalty_descent_fraction * max_x * infeas);
            }

            let mut rho = self.rho_penalty_search;
            if rho_hat > rho {
                rho = rho_hat;
            } else {
                // Damp the penalty parameter when a smaller value suffices
                rho = (0.5 * rho).max(rho_hat);
            }
            if rho < self.opts.min_rho_penalty_search {
                rho = self.opts.min_rho_penalty_search;
            }

            let mut merit =
                self.grad.fobj - self.barrier_param * (pos_result + neg_result) + rho * infeas;
            if flags.dense_inequality {
                for i in 0..flags.ncon {
                    merit += self.penalty_gamma[i] * vars.t[i];
                }
            }
            let pmerit =
                proj - self.barrier_param * (pos_presult + neg_presult) + rho * infeas_proj;

            out = [merit, pmerit, rho];
        }
        self.comm.broadcast(&mut out);
        self.rho_penalty_search = out[2];

        (out[0], out[1])
    }

    /// Projected derivative of the objective-barrier part of the merit
    /// function along the current step (no penalty term). Used by the
    /// Krylov solver to test candidate directions for descent.
    pub(crate) fn eval_obj_barrier_deriv(&self) -> E {
        let flags = &self.flags;
        let vars = &self.vars;
        let step = &self.step;
        let beta = self.opts.rel_bound_barrier;

        let mut pos_presult = 0.0;
        let mut neg_presult = 0.0;

        if flags.use_lower {
            for i in 0..flags.nvars {
                if vars.lb[i] > -flags.max_bound_val {
                    let term = beta * step.px[i] / (vars.x[i] - vars.lb[i]);
                    if step.px[i] > 0.0 {
                        pos_presult += term;
                    } else {
                        neg_presult += term;
                    }
                }
            }
        }
        if flags.use_upper {
            for i in 0..flags.nvars {
                if vars.ub[i] < flags.max_bound_val {
                    let term = beta * step.px[i] / (vars.ub[i] - vars.x[i]);
                    if step.px[i] > 0.0 {
                        neg_presult -= term;
                    } else {
                        pos_presult -= term;
                    }
                }
            }
        }

        if flags.nwcon > 0 && flags.sparse_inequality {
            for i in 0..flags.nwcon {
                if step.psw[i] > 0.0 {
                    pos_presult += step.psw[i] / vars.sw[i];
                } else {
                    neg_presult += step.psw[i] / vars.sw[i];
                }
            }
        }

        let mut acc = [
            pos_presult,
            neg_presult,
            dot(self.grad.g.as_ref(), step.px.as_ref()),
        ];
        self.comm.allreduce_sum(&mut acc);
        pos_presult = acc[0];
        neg_presult = acc[1];
        let g_dot_px = acc[2];

        if flags.dense_inequality {
            for i in 0..flags.ncon {
                if step.ps[i] > 0.0 {
                    pos_presult += step.ps[i] / vars.s[i];
                } else {
                    neg_presult += step.ps[i] / vars.s[i];
                }
                if step.pt[i] > 0.0 {
                    pos_presult += step.pt[i] / vars.t[i];
                } else {
                    neg_presult += step.pt[i] / vars.t[i];
                }
            }
        }

        let mut pmerit = g_dot_px - self.barrier_param * (pos_presult + neg_presult);
        if flags.dense_inequality {
            for i in 0..flags.ncon {
                pmerit += self.penalty_gamma[i] * step.pt[i];
            }
        }

        pmerit
    }

    /// Stages the trial point `x + alpha p` into the residual buffers and
    /// evaluates the objective and constraints there.
    fn eval_trial_point(&mut self, alpha: E) -> Result<(), EvalError> {
        let dp = self.opts.design_precision;

        {
            let vars = &self.vars;
            let step = &self.step;
            let res = &mut self.res;

            copy_into(&mut res.rx, &vars.x);
            apply_step(
                &mut res.rx,
                alpha,
                step.px.as_ref(),
                Some(&vars.lb),
                None,
                Some(&vars.ub),
                None,
                dp,
            );

            if self.flags.nwcon > 0 && self.flags.sparse_inequality {
                copy_into(&mut res.rsw, &vars.sw);
                apply_step(
                    &mut res.rsw,
                    alpha,
                    step.psw.as_ref(),
                    None,
                    Some(0.0),
                    None,
                    None,
                    dp,
                );
            }
            if self.flags.dense_inequality {
                copy_into(&mut res.rs, &vars.s);
                apply_step(
                    &mut res.rs,
                    alpha,
                    step.ps.as_ref(),
                    None,
                    Some(0.0),
                    None,
                    None,
                    dp,
                );
                copy_into(&mut res.rt, &vars.t);
                apply_step(
                    &mut res.rt,
                    alpha,
                    step.pt.as_ref(),
                    None,
                    Some(0.0),
                    None,
                    None,
                    dp,
                );
            }
        }

        self.grad.fobj = self
            .prob
            .eval_obj_con(self.res.rx.as_ref(), &mut self.grad.c)?;
        self.neval += 1;
        Ok(())
    }

    /// Backtracking line search along the scaled step.
    ///
    /// Returns the bit flags describing the outcome and the accepted step
    /// length. On success the trial point staged in the residual buffers
    /// has already been evaluated.
    pub(crate) fn line_search(&mut self, alpha_min: E, mut alpha: E, m0: E, dm0: E) -> (u32, E) {
        let mut fail = LINE_SEARCH_FAILURE;

        // Track the best point seen in case the sufficient decrease test
        // never passes
        let mut best_merit = 0.0;
        let mut best_alpha = -1.0;

        let mut merit = 0.0;
        let mut j = 0;
        while j < self.opts.max_line_iters {
            if self.eval_trial_point(alpha).is_err() {
                // Try a shorter step to back away from the undefined region
                eprintln!("kestrel: evaluation failed during line search, trying new point");
                alpha *= 0.1;
                j += 1;
                continue;
            }

            merit = self.eval_merit_func(MeritAt::Trial);

            if best_alpha < 0.0 || merit < best_merit {
                best_alpha = alpha;
                best_merit = merit;
            }

            // Armijo test, relaxed by the function precision
            if merit - self.opts.armijo_constant * alpha * dm0
                < m0 + self.opts.function_precision
            {
                if fail & LINE_SEARCH_MIN_STEP != 0 {
                    fail = LINE_SEARCH_SUCCESS | LINE_SEARCH_MIN_STEP;
                } else {
                    fail = LINE_SEARCH_SUCCESS;
                }
                break;
            } else if fail & LINE_SEARCH_MIN_STEP != 0 {
                // Reached the smallest allowable step without acceptance
                break;
            }

            if j < self.opts.max_line_iters - 1 {
                if self.opts.use_backtracking_alpha {
                    alpha *= 0.5;
                    if alpha <= alpha_min {
                        alpha = alpha_min;
                        fail |= LINE_SEARCH_MIN_STEP;
                    }
                } else {
                    // Quadratic interpolation, clipped into [0.01 alpha,
                    // 0.5 alpha]
                    let alpha_new = -0.5 * dm0 * (alpha * alpha) / (merit - m0 - dm0 * alpha);
                    if alpha_new <= alpha_min {
                        alpha = alpha_min;
                        fail |= LINE_SEARCH_MIN_STEP;
                    } else if alpha_new < 0.01 * alpha {
                        alpha = 0.01 * alpha;
                    } else {
                        alpha = alpha_new;
                    }
                }
            }
            j += 1;
        }

        if j == self.opts.max_line_iters {
            fail |= LINE_SEARCH_MAX_ITERS;
        }

        if fail & LINE_SEARCH_SUCCESS == 0 {
            // A simple decrease within the function precision is enough to
            // accept the best point seen
            if best_merit <= m0 + self.opts.function_precision {
                fail |= LINE_SEARCH_SUCCESS;
                fail &= !LINE_SEARCH_FAILURE;
            } else if merit <= m0 + self.opts.function_precision
                && m0 <= merit + self.opts.function_precision
            {
                fail |= LINE_SEARCH_NO_IMPROVEMENT;
            }

            if best_alpha >= 0.0 && alpha != best_alpha {
                // Re-evaluate at the best point so the following gradient
                // evaluation is consistent with the stored objective
                alpha = best_alpha;
                if self.eval_trial_point(alpha).is_err() {
                    eprintln!("kestrel: evaluation failed during line search");
                    fail = LINE_SEARCH_FAILURE;
                }
            } else if best_alpha >= 0.0 {
                alpha = best_alpha;
            }
        }

        (fail, alpha)
    }
}

fn copy_into(dst: &mut Col<E>, src: &Col<E>) {
    crate::linalg::vector_ops::copy_vals(dst, src.as_ref());
}
