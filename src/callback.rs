//! Per-iteration hooks for logging and monitoring.

use crate::{SolverOptions, E};

/// Snapshot of the optimizer state handed to callbacks and terminators at
/// the end of each major iteration.
#[derive(Clone, Debug, Default)]
pub struct ProgressInfo {
    /// Major iteration counter.
    pub iteration: usize,
    /// Number of objective/constraint evaluations so far.
    pub neval: usize,
    /// Number of gradient evaluations so far.
    pub ngeval: usize,
    /// Number of Hessian-vector products so far.
    pub nhvec: usize,
    /// Objective value at the current iterate.
    pub fobj: E,
    /// Norm of the stationarity residual.
    pub max_prime: E,
    /// Norm of the complementarity residual.
    pub max_dual: E,
    /// Norm of the infeasibility residual.
    pub max_infeas: E,
    /// Current barrier parameter.
    pub barrier_param: E,
    /// Average complementarity.
    pub comp: E,
    /// Line-search step length from the previous iteration.
    pub alpha: E,
    /// Fraction-to-boundary scaling applied to the primal step.
    pub alpha_x: E,
    /// Fraction-to-boundary scaling applied to the dual step.
    pub alpha_z: E,
    /// Projected merit-function derivative from the previous iteration.
    pub dmerit: E,
    /// Current l1-penalty parameter.
    pub rho: E,
    /// Short codes for events on the previous iteration (damped or skipped
    /// quasi-Newton updates, line search outcomes, SLP fallbacks, ...).
    pub events: String,
}

/// Hook invoked once per major iteration.
pub trait Callback {
    /// Creates a new callback from solver options.
    fn new(options: &SolverOptions) -> Self
    where
        Self: Sized;

    /// Called at the end of each major iteration.
    fn call(&mut self, info: &ProgressInfo);
}

/// A callback that does nothing. Use when no per-iteration output is needed.
pub struct NoOpCallback {}

impl Callback for NoOpCallback {
    fn new(_options: &SolverOptions) -> Self {
        Self {}
    }

    fn call(&mut self, _info: &ProgressInfo) {}
}

/// Prints the convergence table to stdout, one row per major iteration.
pub struct IterationOutput {}

impl Callback for IterationOutput {
    fn new(_options: &SolverOptions) -> Self {
        Self {}
    }

    fn call(&mut self, info: &ProgressInfo) {
        if info.iteration % 10 == 0 {
            println!(
                "{:>4} {:>4} {:>4} {:>4} {:>8} {:>8} {:>8} {:>12} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} info",
                "iter", "nobj", "ngrd", "nhvc", "alpha", "alphx", "alphz",
                "fobj", "|opt|", "|infes|", "|dual|", "mu", "comp", "rho",
            );
        }
        if info.iteration == 0 {
            println!(
                "{:>4} {:>4} {:>4} {:>4} {:>8} {:>8} {:>8} {:>12.5e} {:>8.1e} {:>8.1e} {:>8.1e} {:>8.1e} {:>8.1e} {:>8} {}",
                info.iteration, info.neval, info.ngeval, info.nhvec,
                "--", "--", "--",
                info.fobj, info.max_prime, info.max_infeas, info.max_dual,
                info.barrier_param, info.comp, "--", info.events,
            );
        } else {
            println!(
                "{:>4} {:>4} {:>4} {:>4} {:>8.1e} {:>8.1e} {:>8.1e} {:>12.5e} {:>8.1e} {:>8.1e} {:>8.1e} {:>8.1e} {:>8.1e} {:>8.1e} {}",
                info.iteration, info.neval, info.ngeval, info.nhvec,
                info.alpha, info.alpha_x, info.alpha_z,
                info.fobj, info.max_prime, info.max_infeas, info.max_dual,
                info.barrier_param, info.comp, info.rho, info.events,
            );
        }
    }
}
