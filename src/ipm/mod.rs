//! The primal-dual interior-point driver.
//!
//! [`InteriorPoint`] owns every residual, step, working and matrix buffer,
//! allocated once at construction and sized by the Problem's dimensions.
//! Each major iteration computes the KKT residuals, a Newton or
//! quasi-Newton step through the bordered KKT solver (or the Krylov solver
//! on the exact-Hessian branch), scales the step by the
//! fraction-to-boundary rule, runs the merit line search, and applies the
//! accepted step to every primal and dual variable.

pub mod barrier;
pub mod diag_kkt;
pub mod gmres;
pub mod line_search;
pub mod residual;
pub mod smw;
pub mod start;

use std::path::Path;
use std::sync::Arc;

use faer::{Col, ColRef};
use snafu::Snafu;

use crate::callback::ProgressInfo;
use crate::comm::{ownership_ranges, Communicator, SelfComm, OPT_ROOT};
use crate::linalg::vector_ops::{abs_max, axpy, copy_vals, scale};
use crate::problem::{EvalError, Problem, ProblemSizes};
use crate::qn::{CompactQuasiNewton, Lbfgs, Lsr1, QnUpdate};
use crate::{
    BarrierStrategy, NormType, QuasiNewtonType, SolverHooks, SolverOptions,
    StartingPointStrategy, Status, E,
};

use diag_kkt::DiagKkt;
use gmres::GmresWorkspace;
use line_search::{
    LINE_SEARCH_FAILURE, LINE_SEARCH_MAX_ITERS, LINE_SEARCH_MIN_STEP,
    LINE_SEARCH_NO_IMPROVEMENT,
};
use smw::SmwCorrector;

/// Failure modes surfaced by [`InteriorPoint::optimize`].
#[derive(Debug, Snafu)]
pub enum OptimizeError {
    #[snafu(display("problem evaluation failed: {source}"), context(false))]
    Evaluation { source: EvalError },

    #[snafu(display("KKT factorization failed: {source}"), context(false))]
    Factorization {
        source: crate::linalg::SolverError,
    },

    #[snafu(display("problem sizes are incompatible with this solver instance"))]
    SizeMismatch,
}

/// Typed snapshot of the solver options, resolved once per instance.
pub(crate) struct IpOptions {
    pub(crate) norm_type: NormType,
    pub(crate) barrier_strategy: BarrierStrategy,
    pub(crate) starting_point_strategy: StartingPointStrategy,
    pub(crate) max_major_iters: usize,
    pub(crate) abs_res_tol: E,
    pub(crate) rel_func_tol: E,
    pub(crate) abs_step_tol: E,
    pub(crate) use_line_search: bool,
    pub(crate) use_backtracking_alpha: bool,
    pub(crate) max_line_iters: usize,
    pub(crate) armijo_constant: E,
    pub(crate) penalty_descent_fraction: E,
    pub(crate) min_rho_penalty_search: E,
    pub(crate) monotone_barrier_fraction: E,
    pub(crate) monotone_barrier_power: E,
    pub(crate) rel_bound_barrier: E,
    pub(crate) min_fraction_to_boundary: E,
    pub(crate) function_precision: E,
    pub(crate) design_precision: E,
    pub(crate) start_affine_multiplier_min: E,
    pub(crate) write_output_frequency: usize,
    pub(crate) sequential_linear_method: bool,
    pub(crate) hessian_reset_freq: usize,
    pub(crate) use_quasi_newton_update: bool,
    pub(crate) qn_sigma: E,
    pub(crate) use_hvec_product: bool,
    pub(crate) use_diag_hessian: bool,
    pub(crate) use_qn_gmres_precon: bool,
    pub(crate) nk_switch_tol: E,
    pub(crate) eisenstat_walker_alpha: E,
    pub(crate) eisenstat_walker_gamma: E,
    pub(crate) max_gmres_rtol: E,
    pub(crate) gmres_atol: E,
}

impl From<&SolverOptions> for IpOptions {
    fn from(options: &SolverOptions) -> Self {
        // Every option is present in the default registry, so the lookups
        // cannot fail
        Self {
            norm_type: options.get_option("norm_type").unwrap(),
            barrier_strategy: options.get_option("barrier_strategy").unwrap(),
            starting_point_strategy: options.get_option("starting_point_strategy").unwrap(),
            max_major_iters: options.get_option("max_major_iters").unwrap(),
            abs_res_tol: options.get_option("abs_res_tol").unwrap(),
            rel_func_tol: options.get_option("rel_func_tol").unwrap(),
            abs_step_tol: options.get_option("abs_step_tol").unwrap(),
            use_line_search: options.get_option("use_line_search").unwrap(),
            use_backtracking_alpha: options.get_option("use_backtracking_alpha").unwrap(),
            max_line_iters: options.get_option("max_line_iters").unwrap(),
            armijo_constant: options.get_option("armijo_constant").unwrap(),
            penalty_descent_fraction: options.get_option("penalty_descent_fraction").unwrap(),
            min_rho_penalty_search: options.get_option("min_rho_penalty_search").unwrap(),
            monotone_barrier_fraction: options.get_option("monotone_barrier_fraction").unwrap(),
            monotone_barrier_power: options.get_option("monotone_barrier_power").unwrap(),
            rel_bound_barrier: options.get_option("rel_bound_barrier").unwrap(),
            min_fraction_to_boundary: options.get_option("min_fraction_to_boundary").unwrap(),
            function_precision: options.get_option("function_precision").unwrap(),
            design_precision: options.get_option("design_precision").unwrap(),
            start_affine_multiplier_min: options
                .get_option("start_affine_multiplier_min")
                .unwrap(),
            write_output_frequency: options.get_option("write_output_frequency").unwrap(),
            sequential_linear_method: options.get_option("sequential_linear_method").unwrap(),
            hessian_reset_freq: options.get_option("hessian_reset_freq").unwrap(),
            use_quasi_newton_update: options.get_option("use_quasi_newton_update").unwrap(),
            qn_sigma: options.get_option("qn_sigma").unwrap(),
            use_hvec_product: options.get_option("use_hvec_product").unwrap(),
            use_diag_hessian: options.get_option("use_diag_hessian").unwrap(),
            use_qn_gmres_precon: options.get_option("use_qn_gmres_precon").unwrap(),
            nk_switch_tol: options.get_option("nk_switch_tol").unwrap(),
            eisenstat_walker_alpha: options.get_option("eisenstat_walker_alpha").unwrap(),
            eisenstat_walker_gamma: options.get_option("eisenstat_walker_gamma").unwrap(),
            max_gmres_rtol: options.get_option("max_gmres_rtol").unwrap(),
            gmres_atol: options.get_option("gmres_atol").unwrap(),
        }
    }
}

/// Problem structure flags, fixed at construction.
pub(crate) struct ProblemFlags {
    pub(crate) nvars: usize,
    pub(crate) ncon: usize,
    pub(crate) nwcon: usize,
    pub(crate) nwblock: usize,
    pub(crate) dense_inequality: bool,
    pub(crate) sparse_inequality: bool,
    pub(crate) use_lower: bool,
    pub(crate) use_upper: bool,
    pub(crate) max_bound_val: E,
}

/// The primal-dual iterate and the variable bounds.
pub(crate) struct IpVars {
    pub(crate) x: Col<E>,
    pub(crate) lb: Col<E>,
    pub(crate) ub: Col<E>,
    pub(crate) zl: Col<E>,
    pub(crate) zu: Col<E>,
    pub(crate) z: Col<E>,
    pub(crate) s: Col<E>,
    pub(crate) t: Col<E>,
    pub(crate) zt: Col<E>,
    pub(crate) zw: Col<E>,
    pub(crate) sw: Col<E>,
}

/// Objective, constraint values and gradients at the current iterate.
pub(crate) struct GradInfo {
    pub(crate) fobj: E,
    pub(crate) c: Col<E>,
    pub(crate) g: Col<E>,
    pub(crate) ac: Vec<Col<E>>,
}

/// The negated KKT residuals; also reused by the line search to stage
/// trial points once the residuals have been consumed by the step
/// computation.
pub(crate) struct Residuals {
    pub(crate) rx: Col<E>,
    pub(crate) rc: Col<E>,
    pub(crate) rs: Col<E>,
    pub(crate) rt: Col<E>,
    pub(crate) rzt: Col<E>,
    pub(crate) rcw: Col<E>,
    pub(crate) rsw: Col<E>,
    pub(crate) rzl: Col<E>,
    pub(crate) rzu: Col<E>,
}

impl Residuals {
    fn new(nvars: usize, ncon: usize, nwcon: usize) -> Self {
        Self {
            rx: Col::zeros(nvars),
            rc: Col::zeros(ncon),
            rs: Col::zeros(ncon),
            rt: Col::zeros(ncon),
            rzt: Col::zeros(ncon),
            rcw: Col::zeros(nwcon),
            rsw: Col::zeros(nwcon),
            rzl: Col::zeros(nvars),
            rzu: Col::zeros(nvars),
        }
    }
}

/// A primal-dual step (or the solution of one bordered solve).
pub(crate) struct Step {
    pub(crate) px: Col<E>,
    pub(crate) pz: Col<E>,
    pub(crate) ps: Col<E>,
    pub(crate) pt: Col<E>,
    pub(crate) pzt: Col<E>,
    pub(crate) pzw: Col<E>,
    pub(crate) psw: Col<E>,
    pub(crate) pzl: Col<E>,
    pub(crate) pzu: Col<E>,
}

impl Step {
    fn new(nvars: usize, ncon: usize, nwcon: usize) -> Self {
        Self {
            px: Col::zeros(nvars),
            pz: Col::zeros(ncon),
            ps: Col::zeros(ncon),
            pt: Col::zeros(ncon),
            pzt: Col::zeros(ncon),
            pzw: Col::zeros(nwcon),
            psw: Col::zeros(nwcon),
            pzl: Col::zeros(nvars),
            pzu: Col::zeros(nvars),
        }
    }
}

/// Residual norms for the convergence test.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ResNorms {
    pub(crate) max_prime: E,
    pub(crate) max_dual: E,
    pub(crate) max_infeas: E,
    pub(crate) res_norm: E,
}

/// Applies `x += alpha * p` and clamps the result strictly inside the
/// given bounds by `design_precision`.
pub(crate) fn apply_step(
    x: &mut Col<E>,
    alpha: E,
    p: ColRef<E>,
    lb: Option<&Col<E>>,
    lower_value: Option<E>,
    ub: Option<&Col<E>>,
    upper_value: Option<E>,
    design_precision: E,
) {
    axpy(alpha, p, x);

    if let Some(lb) = lb {
        for i in 0..x.nrows() {
            if x[i] <= lb[i] + design_precision {
                x[i] = lb[i] + design_precision;
            }
        }
    } else if let Some(lower) = lower_value {
        for i in 0..x.nrows() {
            if x[i] <= lower + design_precision {
                x[i] = lower + design_precision;
            }
        }
    }

    if let Some(ub) = ub {
        for i in 0..x.nrows() {
            if x[i] + design_precision >= ub[i] {
                x[i] = ub[i] - design_precision;
            }
        }
    } else if let Some(upper) = upper_value {
        for i in 0..x.nrows() {
            if x[i] + design_precision >= upper {
                x[i] = upper - design_precision;
            }
        }
    }
}

/// The interior-point solver instance.
///
/// Bound to one [`Problem`] of fixed sizes; the instance may be reseated to
/// a congruent Problem without reallocation. All buffers are allocated at
/// construction.
pub struct InteriorPoint<'a> {
    prob: &'a dyn Problem,
    pub(crate) comm: Arc<dyn Communicator>,
    pub(crate) flags: ProblemFlags,
    pub(crate) opts: IpOptions,

    pub(crate) barrier_param: E,
    pub(crate) rho_penalty_search: E,
    pub(crate) penalty_gamma: Col<E>,

    pub(crate) vars: IpVars,
    pub(crate) grad: GradInfo,
    pub(crate) res: Residuals,
    pub(crate) step: Step,
    pub(crate) work: Step,

    pub(crate) kkt: DiagKkt,
    pub(crate) smw: SmwCorrector,
    pub(crate) gmres: Option<GmresWorkspace>,
    pub(crate) qn: Option<Box<dyn CompactQuasiNewton>>,
    pub(crate) hdiag: Option<Col<E>>,

    // Temporaries: design-, sparse-constraint- and quasi-Newton-shaped
    pub(crate) xtmp: Col<E>,
    pub(crate) xtmp2: Col<E>,
    pub(crate) wtmp: Col<E>,
    pub(crate) wtmp2: Col<E>,
    s_qn: Col<E>,
    y_qn: Col<E>,

    // Ownership ranges by rank, for the checkpoint file layout
    pub(crate) var_range: Vec<usize>,
    pub(crate) wcon_range: Vec<usize>,

    // Evaluation counters
    pub(crate) neval: usize,
    pub(crate) ngeval: usize,
    pub(crate) nhvec: usize,
    niter: usize,
}

impl<'a> InteriorPoint<'a> {
    /// Creates a solver bound to `prob` on the single-process group.
    pub fn new(prob: &'a dyn Problem, options: &SolverOptions) -> Self {
        Self::new_with_comm(prob, options, Arc::new(SelfComm))
    }

    /// Creates a solver bound to `prob` over the given process group.
    pub fn new_with_comm(
        prob: &'a dyn Problem,
        options: &SolverOptions,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        let sizes = prob.problem_sizes();
        let ProblemSizes {
            nvars,
            ncon,
            nwcon,
            nwblock,
        } = sizes;

        if nwcon > 0 && nwcon % nwblock != 0 {
            eprintln!("kestrel: sparse constraint block size inconsistent");
        }

        let var_range = ownership_ranges(&comm.allgather_count(nvars));
        let wcon_range = ownership_ranges(&comm.allgather_count(nwcon));

        let opts = IpOptions::from(options);
        let flags = ProblemFlags {
            nvars,
            ncon,
            nwcon,
            nwblock,
            dense_inequality: prob.is_dense_inequality(),
            sparse_inequality: prob.is_sparse_inequality(),
            use_lower: prob.use_lower_bounds(),
            use_upper: prob.use_upper_bounds(),
            max_bound_val: options.get_option("max_bound_value").unwrap(),
        };

        let max_qn_size: usize = options.get_option("max_qn_size").unwrap();
        let qn: Option<Box<dyn CompactQuasiNewton>> =
            match options.get_option::<QuasiNewtonType>("qn_type").unwrap() {
                QuasiNewtonType::Bfgs if max_qn_size > 0 => {
                    Some(Box::new(Lbfgs::with_comm(nvars, max_qn_size, comm.clone())))
                }
                QuasiNewtonType::Sr1 if max_qn_size > 0 => {
                    Some(Box::new(Lsr1::with_comm(nvars, max_qn_size, comm.clone())))
                }
                _ => None,
            };

        let gamma: E = options.get_option("penalty_gamma").unwrap();
        let gmres_subspace_size: usize = options.get_option("gmres_subspace_size").unwrap();

        let mut solver = Self {
            prob,
            comm,
            barrier_param: options.get_option("barrier_param").unwrap(),
            rho_penalty_search: 0.0,
            penalty_gamma: Col::from_fn(ncon, |_| gamma),
            vars: IpVars {
                x: Col::zeros(nvars),
                lb: Col::zeros(nvars),
                ub: Col::zeros(nvars),
                zl: Col::from_fn(nvars, |_| 1.0),
                zu: Col::from_fn(nvars, |_| 1.0),
                z: Col::from_fn(ncon, |_| 1.0),
                s: Col::from_fn(ncon, |_| 1.0),
                t: Col::from_fn(ncon, |_| 1.0),
                zt: Col::from_fn(ncon, |_| 1.0),
                zw: Col::from_fn(nwcon, |_| 1.0),
                sw: Col::from_fn(nwcon, |_| 1.0),
            },
            grad: GradInfo {
                fobj: 0.0,
                c: Col::zeros(ncon),
                g: Col::zeros(nvars),
                ac: (0..ncon).map(|_| Col::zeros(nvars)).collect(),
            },
            res: Residuals::new(nvars, ncon, nwcon),
            step: Step::new(nvars, ncon, nwcon),
            work: Step::new(nvars, ncon, nwcon),
            kkt: DiagKkt::new(nvars, ncon, nwcon, nwblock),
            smw: SmwCorrector::new(),
            gmres: (gmres_subspace_size > 0)
                .then(|| GmresWorkspace::new(gmres_subspace_size, nvars)),
            hdiag: opts.use_diag_hessian.then(|| Col::zeros(nvars)),
            qn,
            xtmp: Col::zeros(nvars),
            xtmp2: Col::zeros(nvars),
            wtmp: Col::zeros(nwcon),
            wtmp2: Col::zeros(nwcon),
            s_qn: Col::zeros(nvars),
            y_qn: Col::zeros(nvars),
            var_range,
            wcon_range,
            neval: 0,
            ngeval: 0,
            nhvec: 0,
            niter: 0,
            flags,
            opts,
        };

        solver.init_and_check_design_and_bounds();
        solver
    }

    /// The sizes of the bound Problem.
    pub fn problem_sizes(&self) -> ProblemSizes {
        ProblemSizes {
            nvars: self.flags.nvars,
            ncon: self.flags.ncon,
            nwcon: self.flags.nwcon,
            nwblock: self.flags.nwblock,
        }
    }

    /// The optimized point `(x, z, zw, zl, zu)`.
    pub fn optimized_point(
        &self,
    ) -> (ColRef<E>, ColRef<E>, ColRef<E>, ColRef<E>, ColRef<E>) {
        (
            self.vars.x.as_ref(),
            self.vars.z.as_ref(),
            self.vars.zw.as_ref(),
            self.vars.zl.as_ref(),
            self.vars.zu.as_ref(),
        )
    }

    /// The slack variables `(s, t, sw)`.
    pub fn optimized_slacks(&self) -> (ColRef<E>, ColRef<E>, ColRef<E>) {
        (
            self.vars.s.as_ref(),
            self.vars.t.as_ref(),
            self.vars.sw.as_ref(),
        )
    }

    /// The objective value at the current iterate.
    pub fn objective(&self) -> E {
        self.grad.fobj
    }

    /// The current barrier parameter.
    pub fn barrier_parameter(&self) -> E {
        self.barrier_param
    }

    /// Sets a uniform l1 penalty for the dense-constraint slacks.
    pub fn set_penalty_gamma(&mut self, gamma: E) {
        for i in 0..self.flags.ncon {
            self.penalty_gamma[i] = gamma;
        }
    }

    /// Replaces the quasi-Newton approximation; the correction buffers are
    /// re-sized on the next setup.
    pub fn set_quasi_newton(&mut self, qn: Option<Box<dyn CompactQuasiNewton>>) {
        self.qn = qn;
        self.smw = SmwCorrector::new();
    }

    /// Discards the stored quasi-Newton curvature information.
    pub fn reset_quasi_newton_hessian(&mut self) {
        if let Some(qn) = &mut self.qn {
            qn.reset();
        }
    }

    /// Sets the GMRES subspace size, reallocating only the Krylov buffers.
    pub fn set_gmres_subspace_size(&mut self, subspace_size: usize) {
        self.gmres = (subspace_size > 0)
            .then(|| GmresWorkspace::new(subspace_size, self.flags.nvars));
    }

    /// Reseats the solver on a congruent Problem. The new Problem must
    /// report identical sizes; otherwise the original Problem is kept.
    pub fn reset_problem_instance(
        &mut self,
        prob: &'a dyn Problem,
    ) -> Result<(), OptimizeError> {
        if prob.problem_sizes() != self.problem_sizes() {
            return Err(OptimizeError::SizeMismatch);
        }
        self.prob = prob;
        Ok(())
    }

    /// Re-reads the design point and bounds from the Problem.
    pub fn reset_design_and_bounds(&mut self) {
        self.init_and_check_design_and_bounds();
    }

    /// Average complementarity over all inequality pairs and live bounds.
    pub fn complementarity(&self) -> E {
        self.compute_comp()
    }

    /// Reads the design point and bounds from the Problem, repairs
    /// inconsistent bounds and points too close to a live bound, and zeroes
    /// the multipliers of out-of-range bounds.
    pub(crate) fn init_and_check_design_and_bounds(&mut self) {
        {
            let vars = &mut self.vars;
            self.prob
                .vars_and_bounds(&mut vars.x, &mut vars.lb, &mut vars.ub);
        }

        let rel_bound = 0.001 * self.barrier_param;
        let mut check_flag: u32 = 0;

        if self.flags.use_lower && self.flags.use_upper {
            let vars = &mut self.vars;
            for i in 0..self.flags.nvars {
                let lb_live = vars.lb[i] > -self.flags.max_bound_val;
                let ub_live = vars.ub[i] < self.flags.max_bound_val;

                let mut delta = 1.0;
                if lb_live && ub_live {
                    if vars.lb[i] >= vars.ub[i] {
                        // Fixed or crossed bounds are replaced by a narrow
                        // valid window
                        check_flag |= 1;
                        vars.lb[i] = 0.5 * (vars.lb[i] + vars.ub[i]) - 0.5 * rel_bound;
                        vars.ub[i] = vars.lb[i] + rel_bound;
                    }
                    delta = vars.ub[i] - vars.lb[i];
                }

                if lb_live && vars.x[i] < vars.lb[i] + rel_bound * delta {
                    check_flag |= 2;
                    vars.x[i] = vars.lb[i] + rel_bound * delta;
                }
                if ub_live && vars.x[i] > vars.ub[i] - rel_bound * delta {
                    check_flag |= 4;
                    vars.x[i] = vars.ub[i] - rel_bound * delta;
                }
            }
        }

        self.comm.allreduce_bor(&mut check_flag);

        if self.comm.rank() == OPT_ROOT {
            if check_flag & 1 != 0 {
                eprintln!("kestrel: variable bounds are inconsistent");
            }
            if check_flag & 2 != 0 {
                eprintln!("kestrel: variables may be too close to lower bound");
            }
            if check_flag & 4 != 0 {
                eprintln!("kestrel: variables may be too close to upper bound");
            }
        }

        self.zero_dead_bound_multipliers();
    }

    /// Average complementarity `(bound pairs + slack pairs) / count`.
    pub(crate) fn compute_comp(&self) -> E {
        let flags = &self.flags;
        let vars = &self.vars;

        let mut product = 0.0;
        let mut count = 0.0;
        if flags.use_lower {
            for i in 0..flags.nvars {
                if vars.lb[i] > -flags.max_bound_val {
                    product += vars.zl[i] * (vars.x[i] - vars.lb[i]);
                    count += 1.0;
                }
            }
        }
        if flags.use_upper {
            for i in 0..flags.nvars {
                if vars.ub[i] < flags.max_bound_val {
                    product += vars.zu[i] * (vars.ub[i] - vars.x[i]);
                    count += 1.0;
                }
            }
        }
        product /= self.opts.rel_bound_barrier;

        if flags.nwcon > 0 && flags.sparse_inequality {
            for i in 0..flags.nwcon {
                product += vars.sw[i] * vars.zw[i];
                count += 1.0;
            }
        }

        let mut acc = [product, count];
        self.comm.reduce_sum_root(&mut acc);

        let mut comp = [0.0];
        if self.comm.rank() == OPT_ROOT {
            let mut product = acc[0];
            let mut count = acc[1];
            if flags.dense_inequality {
                for i in 0..flags.ncon {
                    product += vars.s[i] * vars.z[i] + vars.t[i] * vars.zt[i];
                    count += 2.0;
                }
            }
            if count != 0.0 {
                comp[0] = product / count;
            }
        }
        self.comm.broadcast(&mut comp);

        comp[0]
    }

    /// Average complementarity after steps of `alpha_x` / `alpha_z`.
    pub(crate) fn compute_comp_step(&self, alpha_x: E, alpha_z: E) -> E {
        let flags = &self.flags;
        let vars = &self.vars;
        let step = &self.step;

        let mut product = 0.0;
        let mut count = 0.0;
        if flags.use_lower {
            for i in 0..flags.nvars {
                if vars.lb[i] > -flags.max_bound_val {
                    let xnew = vars.x[i] + alpha_x * step.px[i];
                    product += (vars.zl[i] + alpha_z * step.pzl[i]) * (xnew - vars.lb[i]);
                    count += 1.0;
                }
            }
        }
        if flags.use_upper {
            for i in 0..flags.nvars {
                if vars.ub[i] < flags.max_bound_val {
                    let xnew = vars.x[i] + alpha_x * step.px[i];
                    product += (vars.zu[i] + alpha_z * step.pzu[i]) * (vars.ub[i] - xnew);
                    count += 1.0;
                }
            }
        }
        product /= self.opts.rel_bound_barrier;

        if flags.nwcon > 0 && flags.sparse_inequality {
            for i in 0..flags.nwcon {
                product += (vars.sw[i] + alpha_x * step.psw[i])
                    * (vars.zw[i] + alpha_z * step.pzw[i]);
                count += 1.0;
            }
        }

        let mut acc = [product, count];
        self.comm.reduce_sum_root(&mut acc);

        let mut comp = [0.0];
        if self.comm.rank() == OPT_ROOT {
            let mut product = acc[0];
            let mut count = acc[1];
            if flags.dense_inequality {
                for i in 0..flags.ncon {
                    product += (vars.s[i] + alpha_x * step.ps[i])
                        * (vars.z[i] + alpha_z * step.pz[i])
                        + (vars.t[i] + alpha_x * step.pt[i])
                            * (vars.zt[i] + alpha_z * step.pzt[i]);
                    count += 2.0;
                }
            }
            if count != 0.0 {
                comp[0] = product / count;
            }
        }
        self.comm.broadcast(&mut comp);

        comp[0]
    }

    /// Maximum fraction-to-boundary step lengths along the current
    /// direction, reduced over all ranks as real step lengths.
    pub(crate) fn compute_max_step(&self, tau: E) -> (E, E) {
        let flags = &self.flags;
        let vars = &self.vars;
        let step = &self.step;

        let mut max_x: f64 = 1.0;
        let mut max_z: f64 = 1.0;

        if flags.use_lower {
            for i in 0..flags.nvars {
                if step.px[i] < 0.0 {
                    let alpha = -tau * (vars.x[i] - vars.lb[i]) / step.px[i];
                    max_x = max_x.min(alpha);
                }
            }
        }
        if flags.use_upper {
            for i in 0..flags.nvars {
                if step.px[i] > 0.0 {
                    let alpha = tau * (vars.ub[i] - vars.x[i]) / step.px[i];
                    max_x = max_x.min(alpha);
                }
            }
        }

        if flags.dense_inequality {
            for i in 0..flags.ncon {
                if step.ps[i] < 0.0 {
                    max_x = max_x.min(-tau * vars.s[i] / step.ps[i]);
                }
                if step.pt[i] < 0.0 {
                    max_x = max_x.min(-tau * vars.t[i] / step.pt[i]);
                }
                if step.pz[i] < 0.0 {
                    max_z = max_z.min(-tau * vars.z[i] / step.pz[i]);
                }
                if step.pzt[i] < 0.0 {
                    max_z = max_z.min(-tau * vars.zt[i] / step.pzt[i]);
                }
            }
        }

        if flags.nwcon > 0 && flags.sparse_inequality {
            for i in 0..flags.nwcon {
                if step.pzw[i] < 0.0 {
                    max_z = max_z.min(-tau * vars.zw[i] / step.pzw[i]);
                }
                if step.psw[i] < 0.0 {
                    max_x = max_x.min(-tau * vars.sw[i] / step.psw[i]);
                }
            }
        }

        if flags.use_lower {
            for i in 0..flags.nvars {
                if step.pzl[i] < 0.0 {
                    max_z = max_z.min(-tau * vars.zl[i] / step.pzl[i]);
                }
            }
        }
        if flags.use_upper {
            for i in 0..flags.nvars {
                if step.pzu[i] < 0.0 {
                    max_z = max_z.min(-tau * vars.zu[i] / step.pzu[i]);
                }
            }
        }

        let mut acc = [max_x, max_z];
        self.comm.allreduce_min(&mut acc);
        (acc[0], acc[1])
    }

    /// Scales the step by the fraction-to-boundary rule, clips the
    /// primal/dual step ratio, and falls back to equal step lengths when
    /// the complementarity would grow by more than a factor of ten.
    ///
    /// Returns `(ceq_step, alpha_x, alpha_z)`.
    pub(crate) fn scale_kkt_step(
        &mut self,
        tau: E,
        comp: E,
        inexact_newton_step: bool,
    ) -> (bool, E, E) {
        let (mut alpha_x, mut alpha_z) = self.compute_max_step(tau);

        let mut ceq_step = false;
        if !inexact_newton_step {
            // Bound the mismatch between the two step lengths
            let max_bnd = 100.0;
            if alpha_x > alpha_z {
                if alpha_x > max_bnd * alpha_z {
                    alpha_x = max_bnd * alpha_z;
                } else if alpha_x < alpha_z / max_bnd {
                    alpha_x = alpha_z / max_bnd;
                }
            } else if alpha_z > max_bnd * alpha_x {
                alpha_z = max_bnd * alpha_x;
            } else if alpha_z < alpha_x / max_bnd {
                alpha_z = alpha_x / max_bnd;
            }

            // If the complementarity grows too much at the scaled step,
            // use equal step lengths
            let comp_new = self.compute_comp_step(alpha_x, alpha_z);
            if comp_new > 10.0 * comp {
                ceq_step = true;
                if alpha_x > alpha_z {
                    alpha_x = alpha_z;
                } else {
                    alpha_z = alpha_x;
                }
            }
        } else {
            // A Newton step uses one step length for everything
            if alpha_x > alpha_z {
                alpha_x = alpha_z;
            } else {
                alpha_z = alpha_x;
            }
        }

        let flags = &self.flags;
        let step = &mut self.step;
        scale(alpha_x, &mut step.px);
        if flags.nwcon > 0 {
            scale(alpha_z, &mut step.pzw);
            if flags.sparse_inequality {
                scale(alpha_x, &mut step.psw);
            }
        }
        if flags.use_lower {
            scale(alpha_z, &mut step.pzl);
        }
        if flags.use_upper {
            scale(alpha_z, &mut step.pzu);
        }
        scale(alpha_z, &mut step.pz);
        if flags.dense_inequality {
            scale(alpha_x, &mut step.ps);
            scale(alpha_x, &mut step.pt);
            scale(alpha_z, &mut step.pzt);
        }

        (ceq_step, alpha_x, alpha_z)
    }

    /// Applies the step to every primal and dual variable, evaluates the
    /// objective/constraints and gradients at the new point, and performs
    /// the quasi-Newton update.
    pub(crate) fn compute_step_and_update(
        &mut self,
        alpha: E,
        eval_obj_con: bool,
        perform_qn_update: bool,
    ) -> Result<Option<QnUpdate>, EvalError> {
        let dp = self.opts.design_precision;

        {
            let flags = &self.flags;
            let vars = &mut self.vars;
            let step = &self.step;

            if flags.nwcon > 0 {
                if flags.sparse_inequality {
                    apply_step(&mut vars.zw, alpha, step.pzw.as_ref(), None, Some(0.0), None, None, dp);
                    apply_step(&mut vars.sw, alpha, step.psw.as_ref(), None, Some(0.0), None, None, dp);
                } else {
                    axpy(alpha, step.pzw.as_ref(), &mut vars.zw);
                }
            }
            if flags.use_lower {
                apply_step(&mut vars.zl, alpha, step.pzl.as_ref(), None, Some(0.0), None, None, dp);
            }
            if flags.use_upper {
                apply_step(&mut vars.zu, alpha, step.pzu.as_ref(), None, Some(0.0), None, None, dp);
            }

            if flags.dense_inequality {
                apply_step(&mut vars.z, alpha, step.pz.as_ref(), None, Some(0.0), None, None, dp);
                apply_step(&mut vars.s, alpha, step.ps.as_ref(), None, Some(0.0), None, None, dp);
                apply_step(&mut vars.t, alpha, step.pt.as_ref(), None, Some(0.0), None, None, dp);
                apply_step(&mut vars.zt, alpha, step.pzt.as_ref(), None, Some(0.0), None, None, dp);
            } else {
                // Equality multipliers are free to change sign
                axpy(alpha, step.pz.as_ref(), &mut vars.z);
            }
        }

        // Start the gradient difference for the quasi-Newton update from
        // the old gradient with the new multiplier estimates
        let update_qn =
            self.qn.is_some() && perform_qn_update && self.opts.use_quasi_newton_update;
        if update_qn {
            copy_vals(&mut self.y_qn, self.grad.g.as_ref());
            scale(-1.0, &mut self.y_qn);
            for i in 0..self.flags.ncon {
                axpy(self.vars.z[i], self.grad.ac[i].as_ref(), &mut self.y_qn);
            }
            if self.flags.nwcon > 0 {
                self.prob.add_sparse_jacobian_transpose(
                    1.0,
                    self.vars.x.as_ref(),
                    self.vars.zw.as_ref(),
                    &mut self.y_qn,
                );
            }
        }

        // Apply the design step only after the old-gradient contribution
        // has been captured
        {
            let vars = &mut self.vars;
            apply_step(
                &mut vars.x,
                alpha,
                self.step.px.as_ref(),
                Some(&vars.lb),
                None,
                Some(&vars.ub),
                None,
                dp,
            );
        }

        if eval_obj_con {
            self.grad.fobj = self
                .prob
                .eval_obj_con(self.vars.x.as_ref(), &mut self.grad.c)?;
            self.neval += 1;
        }

        self.prob
            .eval_obj_con_gradient(self.vars.x.as_ref(), &mut self.grad.g, &mut self.grad.ac)
            .map_err(|err| {
                eprintln!("kestrel: gradient evaluation failed after the line search");
                err
            })?;
        self.ngeval += 1;

        let mut update_type = None;
        if self.qn.is_some() && perform_qn_update {
            if self.opts.use_quasi_newton_update {
                copy_vals(&mut self.s_qn, self.step.px.as_ref());
                scale(alpha, &mut self.s_qn);

                axpy(1.0, self.grad.g.as_ref(), &mut self.y_qn);
                for i in 0..self.flags.ncon {
                    axpy(-self.vars.z[i], self.grad.ac[i].as_ref(), &mut self.y_qn);
                }
                if self.flags.nwcon > 0 {
                    self.prob.add_sparse_jacobian_transpose(
                        -1.0,
                        self.vars.x.as_ref(),
                        self.vars.zw.as_ref(),
                        &mut self.y_qn,
                    );
                }

                self.prob
                    .quasi_newton_update_correction(&mut self.s_qn, &mut self.y_qn);

                let qn = self.qn.as_mut().unwrap();
                update_type = Some(qn.update(
                    self.vars.x.as_ref(),
                    self.vars.z.as_ref(),
                    self.vars.zw.as_ref(),
                    Some((self.s_qn.as_ref(), self.y_qn.as_ref())),
                ));
            } else {
                let qn = self.qn.as_mut().unwrap();
                update_type = Some(qn.update(
                    self.vars.x.as_ref(),
                    self.vars.z.as_ref(),
                    self.vars.zw.as_ref(),
                    None,
                ));
            }
        }

        Ok(update_type)
    }

    /// Runs the optimization until convergence, an iteration/time limit, or
    /// an unrecoverable failure.
    ///
    /// When `checkpoint` is given, the primal-dual state is written there
    /// every `write_output_frequency` iterations.
    pub fn optimize(
        &mut self,
        hooks: &mut SolverHooks,
        checkpoint: Option<&Path>,
    ) -> Result<Status, OptimizeError> {
        let mut checkpoint = checkpoint;

        self.niter = 0;
        self.neval = 0;
        self.ngeval = 0;
        self.nhvec = 0;

        // Without a quasi-Newton approximation this is a sequential linear
        // method
        if self.qn.is_none() {
            self.opts.sequential_linear_method = true;
        }

        self.init_and_check_design_and_bounds();

        self.grad.fobj = self
            .prob
            .eval_obj_con(self.vars.x.as_ref(), &mut self.grad.c)
            .map_err(|err| {
                eprintln!("kestrel: initial function and constraint evaluation failed");
                err
            })?;
        self.neval += 1;
        self.prob
            .eval_obj_con_gradient(self.vars.x.as_ref(), &mut self.grad.g, &mut self.grad.ac)
            .map_err(|err| {
                eprintln!("kestrel: initial gradient evaluation failed");
                err
            })?;
        self.ngeval += 1;

        match self.opts.starting_point_strategy {
            StartingPointStrategy::AffineStep => self.init_affine_step_multipliers()?,
            StartingPointStrategy::LeastSquaresMultipliers => {
                self.init_least_squares_multipliers()
            }
            StartingPointStrategy::None => {}
        }

        // Some quasi-Newton methods only need the multiplier estimates
        if self.qn.is_some() && !self.opts.use_quasi_newton_update {
            let qn = self.qn.as_mut().unwrap();
            qn.update(
                self.vars.x.as_ref(),
                self.vars.z.as_ref(),
                self.vars.zw.as_ref(),
                None,
            );
        }

        let mut fobj_prev = 0.0;
        let mut alpha_prev = 0.0;
        let mut alpha_xprev = 0.0;
        let mut alpha_zprev = 0.0;
        let mut dm0_prev = 0.0;
        let mut res_norm_prev = 0.0;
        let mut step_norm_prev = 0.0;

        // Two consecutive iterations without merit improvement declare the
        // barrier subproblem converged
        let mut no_merit_function_improvement = false;
        let mut line_search_test = 0usize;
        let mut line_search_failed = false;

        // Event codes from the previous iteration, shown in the output row
        let mut info = String::new();

        hooks.terminator.initialize();

        for k in 0..self.opts.max_major_iters {
            self.niter = k;

            if self.qn.is_some()
                && !self.opts.sequential_linear_method
                && k > 0
                && k % self.opts.hessian_reset_freq == 0
                && self.opts.use_quasi_newton_update
            {
                self.reset_quasi_newton_hessian();
                info.push_str("resetH ");
            }

            if self.opts.write_output_frequency > 0 && k % self.opts.write_output_frequency == 0
            {
                if let Some(path) = checkpoint {
                    if self.write_solution_file(path).is_err() {
                        eprintln!("kestrel: checkpoint file creation failed");
                        checkpoint = None;
                    }
                }
                self.prob.write_output(k, self.vars.x.as_ref());
            }

            let rel_function_test = alpha_xprev == 1.0
                && alpha_zprev == 1.0
                && (self.grad.fobj - fobj_prev).abs()
                    < self.opts.rel_func_tol * fobj_prev.abs();

            if no_merit_function_improvement {
                line_search_test += 1;
            } else {
                line_search_test = 0;
            }

            let comp = self.compute_comp();

            let mut norms = match self.opts.barrier_strategy {
                BarrierStrategy::Monotone => {
                    let mut norms = self.compute_kkt_res(self.barrier_param);
                    if k == 0 {
                        res_norm_prev = norms.res_norm;
                    }

                    if self.barrier_converged(
                        k,
                        norms.res_norm,
                        rel_function_test,
                        line_search_test,
                    ) {
                        let new_barrier = self.monotone_barrier_update();

                        // Recompute the residuals with the new barrier
                        // parameter and reset the penalty
                        norms = self.compute_kkt_res(new_barrier);
                        self.rho_penalty_search = self.opts.min_rho_penalty_search;
                        self.barrier_param = new_barrier;
                    }
                    norms
                }
                BarrierStrategy::Mehrotra => {
                    let norms = self.compute_kkt_res(self.barrier_param);
                    if k == 0 {
                        res_norm_prev = norms.res_norm;
                    }
                    norms
                }
                BarrierStrategy::ComplementarityFraction => {
                    self.barrier_param = self.comp_fraction_barrier_update(comp);
                    let norms = self.compute_kkt_res(self.barrier_param);
                    if k == 0 {
                        res_norm_prev = norms.res_norm;
                    }
                    norms
                }
            };

            let progress = ProgressInfo {
                iteration: k,
                neval: self.neval,
                ngeval: self.ngeval,
                nhvec: self.nhvec,
                fobj: self.grad.fobj,
                max_prime: norms.max_prime,
                max_dual: norms.max_dual,
                max_infeas: norms.max_infeas,
                barrier_param: self.barrier_param,
                comp,
                alpha: alpha_prev,
                alpha_x: alpha_xprev,
                alpha_z: alpha_zprev,
                dmerit: dm0_prev,
                rho: self.rho_penalty_search,
                events: info.clone(),
            };
            hooks.callback.call(&progress);

            if let Some(status) = hooks.terminator.terminate(&progress) {
                return Ok(status);
            }

            if self.global_converged(
                k,
                norms.res_norm,
                step_norm_prev,
                rel_function_test,
                line_search_test,
            ) {
                if self.comm.rank() == OPT_ROOT {
                    if rel_function_test {
                        println!("kestrel: converged on the relative function test");
                    } else if line_search_test >= 2 {
                        println!(
                            "kestrel: current point could not be improved; no merit \
                             decrease in the previous two iterations"
                        );
                    } else {
                        println!("kestrel: converged to the requested tolerance");
                    }
                }
                return Ok(Status::Optimal);
            }

            // Try an inexact Newton step when Hessian-vector products are
            // available and the residuals are small enough
            let mut gmres_iters: isize = 0;
            let mut inexact_newton_step = false;

            if self.opts.use_hvec_product {
                let gmres_rtol = self.opts.eisenstat_walker_gamma
                    * (norms.res_norm / res_norm_prev).powf(self.opts.eisenstat_walker_alpha);

                if norms.max_prime < self.opts.nk_switch_tol
                    && norms.max_dual < self.opts.nk_switch_tol
                    && norms.max_infeas < self.opts.nk_switch_tol
                    && gmres_rtol < self.opts.max_gmres_rtol
                {
                    let use_qn_precon = self.qn.is_some()
                        && !self.opts.sequential_linear_method
                        && self.opts.use_qn_gmres_precon;

                    self.setup_kkt_diag_system(use_qn_precon)?;
                    self.setup_kkt_system(use_qn_precon)?;

                    gmres_iters = self.compute_kkt_gmres_step(
                        gmres_rtol,
                        self.opts.gmres_atol,
                        use_qn_precon,
                    )?;

                    if self.opts.abs_step_tol > 0.0 {
                        step_norm_prev = self.compute_step_norm();
                    }

                    if gmres_iters > 0 {
                        inexact_newton_step = true;
                    } else if gmres_iters < 0 {
                        // No descent direction was found; the residuals
                        // were consumed by the Krylov iteration
                        norms = self.compute_kkt_res(self.barrier_param);
                    }
                }
            }

            fobj_prev = self.grad.fobj;
            res_norm_prev = norms.res_norm;

            // Quasi-Newton (or sequential linear) step
            let mut seq_linear_step = false;
            if !inexact_newton_step {
                let mut use_qn = true;
                if self.opts.sequential_linear_method
                    || (line_search_failed && !self.opts.use_quasi_newton_update)
                {
                    use_qn = false;
                    seq_linear_step = true;
                } else if self.opts.use_diag_hessian {
                    use_qn = false;
                    if let Some(hdiag) = &mut self.hdiag {
                        self.prob
                            .eval_hessian_diag(
                                self.vars.x.as_ref(),
                                self.vars.z.as_ref(),
                                self.vars.zw.as_ref(),
                                hdiag,
                            )
                            .map_err(|err| {
                                eprintln!("kestrel: Hessian diagonal evaluation failed");
                                err
                            })?;
                    }
                }

                // The Mehrotra strategy probes with the affine residuals
                if self.opts.barrier_strategy == BarrierStrategy::Mehrotra {
                    self.compute_kkt_res(0.0);
                }

                if let Err(err) = self
                    .setup_kkt_diag_system(use_qn)
                    .and_then(|()| self.setup_kkt_system(use_qn))
                {
                    // A singular factorization: retry as a sequential
                    // linear step with a fresh quasi-Newton store
                    if use_qn {
                        self.reset_quasi_newton_hessian();
                        seq_linear_step = true;
                        self.setup_kkt_diag_system(false)?;
                        self.setup_kkt_system(false)?;
                    } else {
                        return Err(err.into());
                    }
                }
                self.compute_kkt_step();

                if self.opts.abs_step_tol > 0.0 {
                    step_norm_prev = self.compute_step_norm();
                }

                if self.opts.barrier_strategy == BarrierStrategy::Mehrotra {
                    // Probe the full affine step to the boundary
                    let (max_x, max_z) = self.compute_max_step(1.0);
                    let comp_affine = self.compute_comp_step(max_x, max_z);

                    self.barrier_param = self.mehrotra_barrier_update(comp, comp_affine);
                    self.compute_kkt_res(self.barrier_param);
                    self.compute_kkt_step();
                }
            }

            // Fraction-to-boundary scaling
            let tau = self.opts.min_fraction_to_boundary.max(1.0 - self.barrier_param);
            let (mut ceq_step, mut alpha_x, mut alpha_z) =
                self.scale_kkt_step(tau, comp, inexact_newton_step);

            let mut alpha = 1.0;
            let mut line_fail = LINE_SEARCH_FAILURE;
            let mut update_type = None;
            let mut line_search_skipped = false;

            no_merit_function_improvement = false;

            if self.opts.use_line_search {
                let (mut m0, mut dm0) = self.eval_merit_init_deriv(alpha_x);
                dm0_prev = dm0;

                if dm0 >= 0.0 && dm0 <= self.opts.function_precision {
                    // The derivative is zero to within the function
                    // precision: take the full step without a search
                    line_search_skipped = true;
                    update_type = self.compute_step_and_update(alpha, true, true)?;

                    if (self.grad.fobj - fobj_prev).abs() <= self.opts.function_precision {
                        line_fail = LINE_SEARCH_NO_IMPROVEMENT;
                    }
                } else {
                    if dm0 >= 0.0 {
                        // Not a descent direction: discard the quasi-Newton
                        // term and recompute a sequential linear step
                        seq_linear_step = true;
                        inexact_newton_step = false;

                        self.compute_kkt_res(self.barrier_param);
                        self.setup_kkt_diag_system(false)?;
                        self.setup_kkt_system(false)?;
                        self.compute_kkt_step();

                        let (c, ax, az) = self.scale_kkt_step(tau, comp, inexact_newton_step);
                        ceq_step = c;
                        alpha_x = ax;
                        alpha_z = az;

                        let (m, dm) = self.eval_merit_init_deriv(alpha_x);
                        m0 = m;
                        dm0 = dm;
                        dm0_prev = dm0;
                    }

                    if dm0 >= 0.0 {
                        line_fail = LINE_SEARCH_FAILURE;
                    } else {
                        // Minimum step length below which the objective
                        // cannot change to function precision
                        let mut acc = [abs_max(self.step.px.as_ref())];
                        self.comm.allreduce_max(&mut acc);
                        let px_norm = acc[0];
                        let mut alpha_min = 1.0;
                        if px_norm != 0.0 {
                            alpha_min = self.opts.function_precision / px_norm;
                        }
                        if alpha_min > 0.5 {
                            alpha_min = 0.5;
                        }

                        let (fail, accepted) = self.line_search(alpha_min, alpha, m0, dm0);
                        line_fail = fail;
                        alpha = accepted;

                        if line_fail & LINE_SEARCH_FAILURE == 0 {
                            // The objective was already evaluated at the
                            // accepted point during the search
                            update_type = self.compute_step_and_update(alpha, false, true)?;
                        }
                    }
                }
            } else {
                update_type = self.compute_step_and_update(alpha, true, true)?;
            }

            no_merit_function_improvement = line_fail
                & (LINE_SEARCH_NO_IMPROVEMENT | LINE_SEARCH_MIN_STEP | LINE_SEARCH_FAILURE)
                != 0;
            line_search_failed = line_fail & LINE_SEARCH_FAILURE != 0;

            alpha_prev = alpha;
            alpha_xprev = alpha_x;
            alpha_zprev = alpha_z;

            // A line search failure invalidates the curvature information
            if self.opts.use_quasi_newton_update && line_search_failed {
                self.reset_quasi_newton_hessian();
            }

            info.clear();
            if gmres_iters != 0 {
                info.push_str(&format!("iNK{} ", gmres_iters));
            }
            match update_type {
                Some(QnUpdate::Damped) => info.push_str("dampH "),
                Some(QnUpdate::Skipped) => info.push_str("skipH "),
                _ => {}
            }
            if line_fail & LINE_SEARCH_FAILURE != 0 {
                info.push_str("LFail ");
            }
            if line_fail & LINE_SEARCH_MIN_STEP != 0 {
                info.push_str("LMnStp ");
            }
            if line_fail & LINE_SEARCH_MAX_ITERS != 0 {
                info.push_str("LMxItr ");
            }
            if line_fail & LINE_SEARCH_NO_IMPROVEMENT != 0 {
                info.push_str("LNoImprv ");
            }
            if seq_linear_step {
                info.push_str("SLP ");
            }
            if line_search_skipped {
                info.push_str("LSkip ");
            }
            if ceq_step {
                info.push_str("cmpEq ");
            }
        }

        if self.comm.rank() == OPT_ROOT {
            println!("kestrel: reached the maximum number of major iterations");
        }
        Ok(Status::IterationLimit)
    }
}
