//! Barrier parameter strategies and the convergence gates.
//!
//! Three reduction rules are supported (see [`crate::BarrierStrategy`]):
//! the monotone Fiacco-McCormick sequence of barrier subproblems, the
//! Mehrotra probing update driven by an affine step, and the
//! complementarity-fraction rule. All of them floor the barrier parameter
//! slightly below `0.1 * abs_res_tol` so the final barrier subproblem can
//! meet the absolute residual tolerance.

use crate::E;

use super::InteriorPoint;

impl<'a> InteriorPoint<'a> {
    /// The monotone update: a fraction of the current barrier parameter,
    /// or `mu^power` once that is smaller (which restores superlinear
    /// convergence near the solution).
    pub(crate) fn monotone_barrier_update(&self) -> E {
        let mu_frac = self.opts.monotone_barrier_fraction * self.barrier_param;
        let mu_pow = self.barrier_param.powf(self.opts.monotone_barrier_power);

        let mut new_barrier = mu_frac;
        if mu_pow < mu_frac {
            new_barrier = mu_pow;
        }
        // Truncate just below the final barrier value so the last
        // subproblem can converge to the absolute tolerance
        if new_barrier < 0.1 * self.opts.abs_res_tol {
            new_barrier = 0.09999 * self.opts.abs_res_tol;
        }
        new_barrier
    }

    /// Mehrotra's rule given the affine-step and current complementarity.
    pub(crate) fn mehrotra_barrier_update(&self, comp: E, comp_affine: E) -> E {
        let s1 = comp_affine / comp;
        let sigma = s1 * s1 * s1;

        let mut new_barrier = sigma * comp;
        if new_barrier < 0.09999 * self.opts.abs_res_tol {
            new_barrier = 0.09999 * self.opts.abs_res_tol;
        }
        new_barrier
    }

    /// The complementarity-fraction rule.
    pub(crate) fn comp_fraction_barrier_update(&self, comp: E) -> E {
        let mut new_barrier = self.opts.monotone_barrier_fraction * comp;
        if new_barrier < 0.1 * self.opts.abs_res_tol {
            new_barrier = 0.1 * self.opts.abs_res_tol;
        }
        new_barrier
    }

    /// Whether the current barrier subproblem is converged and the barrier
    /// parameter should be reduced (monotone strategy only).
    pub(crate) fn barrier_converged(
        &self,
        iteration: usize,
        res_norm: E,
        rel_function_test: bool,
        line_search_test: usize,
    ) -> bool {
        iteration > 0
            && (res_norm < 10.0 * self.barrier_param
                || rel_function_test
                || line_search_test >= 2)
    }

    /// The global convergence gate: the barrier parameter has reached its
    /// floor and the residuals (or the relative function / line search
    /// tests) are satisfied.
    pub(crate) fn global_converged(
        &self,
        iteration: usize,
        res_norm: E,
        step_norm: E,
        rel_function_test: bool,
        line_search_test: usize,
    ) -> bool {
        let step_test = self.opts.abs_step_tol > 0.0 && step_norm < self.opts.abs_step_tol;
        iteration > 0
            && self.barrier_param <= 0.1 * self.opts.abs_res_tol
            && (res_norm < self.opts.abs_res_tol
                || rel_function_test
                || step_test
                || line_search_test >= 2)
    }
}
