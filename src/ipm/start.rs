//! Starting-point strategies for the multipliers and slack variables.
//!
//! Two strategies beyond keeping the initial values: a least-squares
//! estimate of the dense-constraint multipliers from the stationarity
//! conditions, and an affine-scaling step with `mu = 0` whose result seeds
//! every multiplier (floored away from zero) and the initial barrier
//! parameter.

use crate::comm::Communicator;
use crate::linalg::lu::DenseLu;
use crate::linalg::vector_ops::{axpy, copy_vals, dot};

use super::InteriorPoint;

impl<'a> InteriorPoint<'a> {
    /// Least-squares estimate of the dense-constraint multipliers:
    /// solve `(Ac Ac^T) z = Ac (g - zl + zu)` and keep the result only
    /// when it lands in a reasonable range.
    pub(crate) fn init_least_squares_multipliers(&mut self) {
        let ncon = self.flags.ncon;

        // Reset every multiplier and slack to one
        for i in 0..self.flags.nvars {
            self.vars.zl[i] = 1.0;
            self.vars.zu[i] = 1.0;
        }
        for i in 0..self.flags.nwcon {
            self.vars.zw[i] = 1.0;
            self.vars.sw[i] = 1.0;
        }
        for i in 0..ncon {
            self.vars.z[i] = 1.0;
            self.vars.s[i] = 1.0;
            self.vars.zt[i] = 1.0;
            self.vars.t[i] = 1.0;
        }
        self.zero_dead_bound_multipliers();

        if ncon == 0 {
            return;
        }

        // Right-hand side of the least-squares problem
        copy_vals(&mut self.xtmp, self.grad.g.as_ref());
        axpy(-1.0, self.vars.zl.as_ref(), &mut self.xtmp);
        axpy(1.0, self.vars.zu.as_ref(), &mut self.xtmp);

        // Batch the local inner products: Ac (g - zl + zu) and Ac Ac^T
        let mut dots = vec![0.0; ncon + ncon * ncon];
        for i in 0..ncon {
            dots[i] = dot(self.grad.ac[i].as_ref(), self.xtmp.as_ref());
            for j in 0..ncon {
                dots[ncon + i + j * ncon] =
                    dot(self.grad.ac[i].as_ref(), self.grad.ac[j].as_ref());
            }
        }
        self.comm.allreduce_sum(&mut dots);

        let mut rhs: Vec<_> = dots[..ncon].to_vec();
        let mut lu = DenseLu::new(ncon);
        let solved = lu.factorize(&dots[ncon..]).is_ok() && lu.solve(&mut rhs).is_ok();

        if solved {
            // Keep the multipliers only when they are within a reasonable
            // range (and positive for inequalities)
            if self.flags.dense_inequality {
                for i in 0..ncon {
                    self.vars.z[i] = if rhs[i] < 0.01 || rhs[i] > self.penalty_gamma[i] {
                        1.0
                    } else {
                        rhs[i]
                    };
                }
            } else {
                for i in 0..ncon {
                    self.vars.z[i] = if rhs[i] < -self.penalty_gamma[i]
                        || rhs[i] > self.penalty_gamma[i]
                    {
                        1.0
                    } else {
                        rhs[i]
                    };
                }
            }
        }
    }

    /// Affine-scaling start: solve the KKT system with `mu = 0`, floor the
    /// stepped multipliers at `start_affine_multiplier_min`, and set the
    /// initial barrier parameter to the resulting complementarity.
    pub(crate) fn init_affine_step_multipliers(
        &mut self,
    ) -> Result<(), crate::linalg::SolverError> {
        self.zero_dead_bound_multipliers();

        self.compute_kkt_res(0.0);

        let use_qn = self.qn.is_some()
            && !self.opts.sequential_linear_method
            && self.opts.use_qn_gmres_precon;

        self.setup_kkt_diag_system(use_qn)?;
        self.setup_kkt_system(use_qn)?;
        self.compute_kkt_step();

        let floor = self.opts.start_affine_multiplier_min;
        let ncon = self.flags.ncon;

        if self.flags.dense_inequality {
            for i in 0..ncon {
                self.vars.z[i] = floor.max((self.vars.z[i] + self.step.pz[i]).abs());
                self.vars.s[i] = floor.max((self.vars.s[i] + self.step.ps[i]).abs());
                self.vars.t[i] = floor.max((self.vars.t[i] + self.step.pt[i]).abs());
                self.vars.zt[i] = floor.max((self.vars.zt[i] + self.step.pzt[i]).abs());
            }
        } else {
            for i in 0..ncon {
                self.vars.z[i] = floor.max((self.vars.z[i] + self.step.pz[i]).abs());
            }
        }

        if self.flags.nwcon > 0 {
            for i in 0..self.flags.nwcon {
                self.vars.zw[i] = floor.max((self.vars.zw[i] + self.step.pzw[i]).abs());
            }
            if self.flags.sparse_inequality {
                for i in 0..self.flags.nwcon {
                    self.vars.sw[i] = floor.max((self.vars.sw[i] + self.step.psw[i]).abs());
                }
            }
        }

        if self.flags.use_lower {
            for i in 0..self.flags.nvars {
                if self.vars.lb[i] > -self.flags.max_bound_val {
                    self.vars.zl[i] = floor.max((self.vars.zl[i] + self.step.pzl[i]).abs());
                }
            }
        }
        if self.flags.use_upper {
            for i in 0..self.flags.nvars {
                if self.vars.ub[i] < self.flags.max_bound_val {
                    self.vars.zu[i] = floor.max((self.vars.zu[i] + self.step.pzu[i]).abs());
                }
            }
        }

        self.barrier_param = self.compute_comp();

        Ok(())
    }

    /// Multipliers attached to out-of-range bounds are pinned to zero so
    /// they never enter the residuals or steps.
    pub(crate) fn zero_dead_bound_multipliers(&mut self) {
        for i in 0..self.flags.nvars {
            if self.vars.lb[i] <= -self.flags.max_bound_val {
                self.vars.zl[i] = 0.0;
            }
            if self.vars.ub[i] >= self.flags.max_bound_val {
                self.vars.zu[i] = 0.0;
            }
        }
    }
}
