//! Inexact Newton step through right-preconditioned GMRES.
//!
//! The operator is the exact-Hessian KKT matrix applied through the
//! Problem's Hessian-vector products; the preconditioner is the factored
//! diagonal system plus the low-rank quasi-Newton correction. Because the
//! preconditioner eliminates every block except the design variables, the
//! Krylov iteration runs on vectors of the form `(w, alpha)` with the
//! augmented inner product
//!
//! ```text
//!   <(w1, a1), (w2, a2)> = w1^T w2 + beta * a1 * a2,
//!   beta = ||rest of r||^2 / ||r||^2
//! ```
//!
//! A packed Hessenberg matrix is maintained with modified Gram-Schmidt and
//! updated by Givens rotations; at every inner iteration the projected
//! derivative tests decide whether the candidate step is a descent
//! direction for the merit function before convergence is declared.

use faer::Col;

use crate::comm::Communicator;
use crate::linalg::vector_ops::{axpy, copy_vals, dot, scale, set_zero, sq_sum};
use crate::problem::EvalError;
use crate::E;

use super::diag_kkt::DiagRhs;
use super::InteriorPoint;

/// Workspace for the GMRES subspace; allocated when a nonzero subspace
/// size is configured.
pub(crate) struct GmresWorkspace {
    pub(crate) subspace_size: usize,
    /// Packed upper Hessenberg matrix: column `i` starts at
    /// `(i + 1) * (i + 2) / 2 - 1` and holds `i + 2` entries.
    h: Vec<E>,
    /// Scalar component accompanying each basis vector.
    alpha: Vec<E>,
    /// Givens-rotated residual vector.
    res: Vec<E>,
    /// Current least-squares coefficients for the descent tests.
    y: Vec<E>,
    fproj: Vec<E>,
    aproj: Vec<E>,
    awproj: Vec<E>,
    qcos: Vec<E>,
    qsin: Vec<E>,
    /// Basis vectors, design-variable shaped.
    w: Vec<Col<E>>,
}

impl GmresWorkspace {
    pub(crate) fn new(subspace_size: usize, nvars: usize) -> Self {
        let m = subspace_size;
        Self {
            subspace_size: m,
            h: vec![0.0; (m + 1) * (m + 2) / 2],
            alpha: vec![0.0; m + 1],
            res: vec![0.0; m + 1],
            y: vec![0.0; m + 1],
            fproj: vec![0.0; m + 1],
            aproj: vec![0.0; m + 1],
            awproj: vec![0.0; m + 1],
            qcos: vec![0.0; m],
            qsin: vec![0.0; m],
            w: (0..m + 1).map(|_| Col::zeros(nvars)).collect(),
        }
    }
}

#[inline]
fn hptr(i: usize) -> usize {
    (i + 1) * (i + 2) / 2 - 1
}

impl<'a> InteriorPoint<'a> {
    /// Computes an inexact Newton step with right-preconditioned GMRES.
    ///
    /// Returns the number of inner iterations on success; a negative count
    /// signals that no descent direction was found and the caller should
    /// fall back to the quasi-Newton step. The residual buffers are
    /// consumed by the final preconditioner application.
    pub(crate) fn compute_kkt_gmres_step(
        &mut self,
        rtol: E,
        atol: E,
        use_qn: bool,
    ) -> Result<isize, EvalError> {
        let Some(mut ws) = self.gmres.take() else {
            eprintln!("kestrel: gmres_subspace_size not set");
            return Ok(0);
        };
        let result = self.gmres_inner(&mut ws, rtol, atol, use_qn);
        self.gmres = Some(ws);
        result
    }

    fn gmres_inner(
        &mut self,
        ws: &mut GmresWorkspace,
        rtol: E,
        atol: E,
        use_qn: bool,
    ) -> Result<isize, EvalError> {
        let ncon = self.flags.ncon;
        let nwcon = self.flags.nwcon;

        // beta: the squared norm of every residual block except rx,
        // normalized below by the full residual norm
        let mut rest_local = 0.0;
        if self.flags.use_lower {
            rest_local += sq_sum(self.res.rzl.as_ref());
        }
        if self.flags.use_upper {
            rest_local += sq_sum(self.res.rzu.as_ref());
        }
        if nwcon > 0 {
            rest_local += sq_sum(self.res.rcw.as_ref());
            if self.flags.sparse_inequality {
                rest_local += sq_sum(self.res.rsw.as_ref());
            }
        }
        let mut acc = [
            sq_sum(self.res.rx.as_ref()),
            rest_local,
            sq_sum(self.res.rcw.as_ref()),
        ];
        self.comm.allreduce_sum(&mut acc);

        let mut beta = acc[1];
        for i in 0..ncon {
            beta += self.res.rc[i] * self.res.rc[i];
            if self.flags.dense_inequality {
                beta += self.res.rs[i] * self.res.rs[i];
                beta += self.res.rt[i] * self.res.rt[i];
                beta += self.res.rzt[i] * self.res.rzt[i];
            }
        }

        let bnorm = (acc[0] + beta).sqrt();
        beta *= 1.0 / (bnorm * bnorm);

        // Scales for the infeasibility reduction tests
        let mut cinfeas = 0.0;
        for i in 0..ncon {
            let r = if self.flags.dense_inequality {
                self.grad.c[i] - self.vars.s[i] + self.vars.t[i]
            } else {
                self.grad.c[i]
            };
            cinfeas += r * r;
        }
        let mut cscale = 0.0;
        if cinfeas != 0.0 {
            cinfeas = cinfeas.sqrt();
            cscale = 1.0 / cinfeas;
        }

        let mut cwinfeas = 0.0;
        let mut cwscale = 0.0;
        if nwcon > 0 {
            cwinfeas = acc[2].sqrt();
            if cwinfeas != 0.0 {
                cwscale = 1.0 / cwinfeas;
            }
        }

        ws.res[0] = bnorm;
        copy_vals(&mut ws.w[0], self.res.rx.as_ref());
        scale(1.0 / ws.res[0], &mut ws.w[0]);
        ws.alpha[0] = 1.0;

        let mut niters: usize = 0;

        for i in 0..ws.subspace_size {
            // Apply the preconditioner to (W[i], alpha[i])
            self.kkt.solve(
                self.prob,
                &*self.comm,
                &self.flags,
                &self.vars,
                &self.grad,
                DiagRhs {
                    bx: &ws.w[i],
                    rest: Some(&self.res),
                    alpha: ws.alpha[i] / bnorm,
                },
                &mut self.step,
                &mut self.xtmp,
                &mut self.wtmp,
            );
            if use_qn {
                self.apply_smw_px_correction();
            }

            // Projected derivative of the barrier objective along the
            // candidate direction
            ws.fproj[i] = self.eval_obj_barrier_deriv();

            // Directional derivative of the dense infeasibility
            let mut dots = vec![0.0; ncon];
            for j in 0..ncon {
                dots[j] = dot(self.grad.ac[j].as_ref(), self.step.px.as_ref());
            }
            self.comm.allreduce_sum(&mut dots);

            ws.aproj[i] = 0.0;
            for j in 0..ncon {
                let cj_deriv = if self.flags.dense_inequality {
                    dots[j] - self.step.ps[j] + self.step.pt[j]
                } else {
                    dots[j]
                };
                ws.aproj[i] -= cscale * self.res.rc[j] * cj_deriv;
            }

            // Directional derivative of the sparse infeasibility
            ws.awproj[i] = 0.0;
            if nwcon > 0 {
                set_zero(&mut self.xtmp);
                self.prob.add_sparse_jacobian_transpose(
                    1.0,
                    self.vars.x.as_ref(),
                    self.res.rcw.as_ref(),
                    &mut self.xtmp,
                );
                let mut acc = [dot(self.step.px.as_ref(), self.xtmp.as_ref()), 0.0];
                if self.flags.sparse_inequality {
                    acc[1] = dot(self.res.rcw.as_ref(), self.step.psw.as_ref());
                }
                self.comm.allreduce_sum(&mut acc);
                ws.awproj[i] = -cwscale * acc[0];
                if self.flags.sparse_inequality {
                    ws.awproj[i] += cwscale * acc[1];
                }
            }

            // Operator application: exact Hessian product minus the
            // quasi-Newton approximation, plus the identity block
            {
                let (head, tail) = ws.w.split_at_mut(i + 1);
                let w_next = &mut tail[0];
                self.prob.eval_hvec_product(
                    self.vars.x.as_ref(),
                    self.vars.z.as_ref(),
                    self.vars.zw.as_ref(),
                    self.step.px.as_ref(),
                    w_next,
                )?;
                self.nhvec += 1;

                if use_qn {
                    if let Some(qn) = &self.qn {
                        qn.mult_add(-1.0, self.step.px.as_ref(), w_next);
                    }
                }
                axpy(1.0, head[i].as_ref(), w_next);
            }
            ws.alpha[i + 1] = ws.alpha[i];

            // Modified Gram-Schmidt in the augmented inner product
            let hp = hptr(i);
            for j in (0..=i).rev() {
                let mut acc = [dot(ws.w[i + 1].as_ref(), ws.w[j].as_ref())];
                self.comm.allreduce_sum(&mut acc);
                let h_j = acc[0] + beta * ws.alpha[i + 1] * ws.alpha[j];
                ws.h[j + hp] = h_j;

                let (head, tail) = ws.w.split_at_mut(i + 1);
                axpy(-h_j, head[j].as_ref(), &mut tail[0]);
                ws.alpha[i + 1] -= h_j * ws.alpha[j];
            }

            let mut acc = [sq_sum(ws.w[i + 1].as_ref())];
            self.comm.allreduce_sum(&mut acc);
            let h_next = (acc[0] + beta * ws.alpha[i + 1] * ws.alpha[i + 1]).sqrt();
            ws.h[i + 1 + hp] = h_next;
            scale(1.0 / h_next, &mut ws.w[i + 1]);
            ws.alpha[i + 1] *= 1.0 / h_next;

            // Apply the accumulated rotations to the new column, then
            // compute the rotation that annihilates its subdiagonal
            for k in 0..i {
                let h1 = ws.h[k + hp];
                let h2 = ws.h[k + 1 + hp];
                ws.h[k + hp] = h1 * ws.qcos[k] + h2 * ws.qsin[k];
                ws.h[k + 1 + hp] = -h1 * ws.qsin[k] + h2 * ws.qcos[k];
            }
            let h1 = ws.h[i + hp];
            let h2 = ws.h[i + 1 + hp];
            let sq = (h1 * h1 + h2 * h2).sqrt();
            ws.qcos[i] = h1 / sq;
            ws.qsin[i] = h2 / sq;
            ws.h[i + hp] = h1 * ws.qcos[i] + h2 * ws.qsin[i];
            ws.h[i + 1 + hp] = -h1 * ws.qsin[i] + h2 * ws.qcos[i];

            let r1 = ws.res[i];
            ws.res[i] = r1 * ws.qcos[i];
            ws.res[i + 1] = -r1 * ws.qsin[i];

            niters += 1;

            // Current least-squares coefficients (without destroying the
            // rotated residual)
            for j in (0..niters).rev() {
                ws.y[j] = ws.res[j];
                for k in (j + 1)..niters {
                    ws.y[j] -= ws.h[j + hptr(k)] * ws.y[k];
                }
                ws.y[j] /= ws.h[j + hptr(j)];
            }

            let mut fpr = 0.0;
            let mut cpr = 0.0;
            for j in 0..niters {
                fpr += ws.y[j] * ws.fproj[j];
                cpr += ws.y[j] * (ws.aproj[j] + ws.awproj[j]);
            }

            // The step must be a candidate descent direction before the
            // residual tolerances can stop the iteration
            let constraint_descent = cpr <= -0.01 * (cinfeas + cwinfeas);
            if (fpr < 0.0 || constraint_descent)
                && (ws.res[i + 1].abs() < atol || ws.res[i + 1].abs() < rtol * bnorm)
            {
                break;
            }
        }

        // Solve the triangular system for the combination coefficients
        for i in (0..niters).rev() {
            for j in (i + 1)..niters {
                ws.res[i] -= ws.h[i + hptr(j)] * ws.res[j];
            }
            ws.res[i] /= ws.h[i + hptr(i)];
        }

        // Assemble the solution in the W/alpha coordinates
        let mut gamma = ws.res[0] * ws.alpha[0];
        scale(ws.res[0], &mut ws.w[0]);
        for i in 1..niters {
            gamma += ws.res[i] * ws.alpha[i];
            let (head, tail) = ws.w.split_at_mut(i);
            axpy(ws.res[i], tail[0].as_ref(), &mut head[0]);
        }
        gamma /= bnorm;

        // Scale the non-x residual blocks by gamma and recover the step in
        // the original coordinates with one more preconditioner pass
        for i in 0..ncon {
            self.res.rc[i] *= gamma;
            self.res.rs[i] *= gamma;
            self.res.rt[i] *= gamma;
            self.res.rzt[i] *= gamma;
        }
        scale(gamma, &mut self.res.rzl);
        scale(gamma, &mut self.res.rzu);
        if nwcon > 0 {
            scale(gamma, &mut self.res.rcw);
            scale(gamma, &mut self.res.rsw);
        }

        self.kkt.solve(
            self.prob,
            &*self.comm,
            &self.flags,
            &self.vars,
            &self.grad,
            DiagRhs {
                bx: &ws.w[0],
                rest: Some(&self.res),
                alpha: 1.0,
            },
            &mut self.step,
            &mut self.xtmp,
            &mut self.wtmp,
        );
        if use_qn {
            self.apply_smw_step_correction();
        }

        // Final projected derivative tests on the recovered step
        let fpr = self.eval_obj_barrier_deriv();

        let mut dots = vec![0.0; ncon];
        for j in 0..ncon {
            dots[j] = dot(self.grad.ac[j].as_ref(), self.step.px.as_ref());
        }
        self.comm.allreduce_sum(&mut dots);

        let mut cpr = 0.0;
        for i in 0..ncon {
            if self.flags.dense_inequality {
                let deriv = dots[i] - self.step.ps[i] + self.step.pt[i];
                cpr += cscale * (self.grad.c[i] - self.vars.s[i] + self.vars.t[i]) * deriv;
            } else {
                cpr += cscale * self.grad.c[i] * dots[i];
            }
        }

        if nwcon > 0 {
            // rcw now holds the raw infeasibility cw - sw
            self.prob
                .eval_sparse_con(self.vars.x.as_ref(), &mut self.res.rcw);
            if self.flags.sparse_inequality {
                axpy(-1.0, self.vars.sw.as_ref(), &mut self.res.rcw);
            }
            set_zero(&mut self.xtmp);
            self.prob.add_sparse_jacobian_transpose(
                1.0,
                self.vars.x.as_ref(),
                self.res.rcw.as_ref(),
                &mut self.xtmp,
            );
            let mut acc = [dot(self.step.px.as_ref(), self.xtmp.as_ref()), 0.0];
            if self.flags.sparse_inequality {
                acc[1] = dot(self.step.psw.as_ref(), self.res.rcw.as_ref());
            }
            self.comm.allreduce_sum(&mut acc);
            cpr += cwscale * acc[0];
            if self.flags.sparse_inequality {
                cpr += cwscale * acc[1];
            }
        }

        if fpr < 0.0 || cpr < -0.01 * (cinfeas + cwinfeas) {
            Ok(niters as isize)
        } else {
            Ok(-(niters as isize))
        }
    }
}
