//! # kestrel
//!
//! A primal-dual interior-point optimizer for smooth, large-scale nonlinear
//! programs of the form
//!
//! ```text
//!   min  f(x) + gamma^T t
//!   s.t. c(x) = s - t,    s, t >= 0     (dense constraints)
//!        cw(x) = sw,      sw >= 0       (sparse, block-structured)
//!        lb <= x <= ub
//! ```
//!
//! The engine drives the perturbed KKT residuals to zero while reducing a
//! log-barrier parameter, using a bordered elimination of the structured KKT
//! matrix, a Sherman-Morrison-Woodbury correction for the compact
//! limited-memory quasi-Newton term, and an optional inexact Newton-Krylov
//! step built on right-preconditioned GMRES.
//!
//! Problems are supplied through the [`problem::Problem`] adapter; the design
//! vector and the sparse-constraint multipliers may be distributed across a
//! process group (see [`comm`]), while the dense-constraint data is
//! replicated on every rank.

use std::any::Any;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use dyn_clone::DynClone;

/// The scalar element type used throughout the solver.
pub type E = f64;
/// The index type used throughout the solver.
pub type I = usize;

pub mod callback;
pub mod checkpoint;
pub mod comm;
pub mod ipm;
pub mod linalg;
pub mod problem;
pub mod qn;
pub mod terminators;

#[cfg(test)]
mod tests;

pub use callback::{Callback, ProgressInfo};
pub use ipm::InteriorPoint;
pub use terminators::Terminator;

/// Marker trait for values that can be stored in the option registry.
pub trait OptionTrait: Any + Sync + Send + DynClone {}
impl OptionTrait for String {}
impl OptionTrait for bool {}
impl OptionTrait for usize {}
impl OptionTrait for u64 {}
impl OptionTrait for i32 {}
impl OptionTrait for i64 {}
impl OptionTrait for f32 {}
impl OptionTrait for f64 {}

impl Clone for Box<dyn OptionTrait> {
    fn clone(&self) -> Self {
        dyn_clone::clone_box(&**self)
    }
}

/// Norm used for the residual convergence test.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NormType {
    /// Maximum absolute component.
    #[default]
    Linfty,
    /// Sum of absolute components.
    L1,
    /// Euclidean norm.
    L2,
}

impl OptionTrait for NormType {}

impl FromStr for NormType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linfty" | "infinity" => Ok(NormType::Linfty),
            "l1" => Ok(NormType::L1),
            "l2" => Ok(NormType::L2),
            _ => Err(format!("Invalid norm type: {}", s)),
        }
    }
}

/// Strategy used to drive the barrier parameter to zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BarrierStrategy {
    /// Solve a sequence of barrier subproblems with monotonically
    /// decreasing barrier parameter.
    #[default]
    Monotone,
    /// Mehrotra-style adaptive update based on an affine probing step.
    Mehrotra,
    /// Set the barrier parameter to a fraction of the complementarity.
    ComplementarityFraction,
}

impl OptionTrait for BarrierStrategy {}

impl FromStr for BarrierStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "monotone" => Ok(BarrierStrategy::Monotone),
            "mehrotra" => Ok(BarrierStrategy::Mehrotra),
            "complementarity_fraction" => Ok(BarrierStrategy::ComplementarityFraction),
            _ => Err(format!("Invalid barrier strategy: {}", s)),
        }
    }
}

/// Strategy used to initialize the Lagrange multipliers and slack variables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StartingPointStrategy {
    /// Keep the multipliers at their initial values.
    None,
    /// Estimate the dense-constraint multipliers from a least-squares
    /// solution of the stationarity conditions.
    #[default]
    LeastSquaresMultipliers,
    /// Take an affine-scaling step and initialize the multipliers from it.
    AffineStep,
}

impl OptionTrait for StartingPointStrategy {}

impl FromStr for StartingPointStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(StartingPointStrategy::None),
            "least_squares_multipliers" => Ok(StartingPointStrategy::LeastSquaresMultipliers),
            "affine_step" => Ok(StartingPointStrategy::AffineStep),
            _ => Err(format!("Invalid starting point strategy: {}", s)),
        }
    }
}

/// Type of limited-memory quasi-Newton approximation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QuasiNewtonType {
    /// Damped limited-memory BFGS.
    #[default]
    Bfgs,
    /// Limited-memory SR1.
    Sr1,
    /// No quasi-Newton approximation (sequential linear method).
    None,
}

impl OptionTrait for QuasiNewtonType {}

impl FromStr for QuasiNewtonType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bfgs" | "lbfgs" => Ok(QuasiNewtonType::Bfgs),
            "sr1" | "lsr1" => Ok(QuasiNewtonType::Sr1),
            "none" => Ok(QuasiNewtonType::None),
            _ => Err(format!("Invalid quasi-Newton type: {}", s)),
        }
    }
}

macro_rules! registry_entry {
    ($map:ident, $name:expr, $value:expr) => {
        $map.insert($name.to_string(), Box::new($value) as Box<dyn OptionTrait>)
    };
}

/// Default values for every registered solver option.
static OPTION_REGISTRY: LazyLock<HashMap<String, Box<dyn OptionTrait>>> = LazyLock::new(|| {
    let mut map: HashMap<String, Box<dyn OptionTrait>> = HashMap::new();
    registry_entry!(map, "norm_type", NormType::Linfty);
    registry_entry!(map, "barrier_strategy", BarrierStrategy::Monotone);
    registry_entry!(
        map,
        "starting_point_strategy",
        StartingPointStrategy::LeastSquaresMultipliers
    );
    registry_entry!(map, "qn_type", QuasiNewtonType::Bfgs);
    registry_entry!(map, "max_qn_size", 10usize);
    registry_entry!(map, "max_major_iters", 1000usize);
    registry_entry!(map, "barrier_param", 0.1f64);
    registry_entry!(map, "penalty_gamma", 1000.0f64);
    registry_entry!(map, "abs_res_tol", 1e-5f64);
    registry_entry!(map, "rel_func_tol", 0.0f64);
    registry_entry!(map, "abs_step_tol", 0.0f64);
    registry_entry!(map, "max_bound_value", 1e20f64);
    registry_entry!(map, "use_line_search", true);
    registry_entry!(map, "use_backtracking_alpha", false);
    registry_entry!(map, "max_line_iters", 10usize);
    registry_entry!(map, "armijo_constant", 1e-5f64);
    registry_entry!(map, "penalty_descent_fraction", 0.3f64);
    registry_entry!(map, "min_rho_penalty_search", 0.0f64);
    registry_entry!(map, "monotone_barrier_fraction", 0.25f64);
    registry_entry!(map, "monotone_barrier_power", 1.1f64);
    registry_entry!(map, "rel_bound_barrier", 1.0f64);
    registry_entry!(map, "min_fraction_to_boundary", 0.95f64);
    registry_entry!(map, "function_precision", 1e-10f64);
    registry_entry!(map, "design_precision", 1e-15f64);
    registry_entry!(map, "merit_func_check_epsilon", 5e-8f64);
    registry_entry!(map, "start_affine_multiplier_min", 1e-3f64);
    registry_entry!(map, "write_output_frequency", 10usize);
    registry_entry!(map, "sequential_linear_method", false);
    registry_entry!(map, "hessian_reset_freq", 100000000usize);
    registry_entry!(map, "use_quasi_newton_update", true);
    registry_entry!(map, "qn_sigma", 0.0f64);
    registry_entry!(map, "use_hvec_product", false);
    registry_entry!(map, "use_diag_hessian", false);
    registry_entry!(map, "use_qn_gmres_precon", true);
    registry_entry!(map, "nk_switch_tol", 1e-3f64);
    registry_entry!(map, "eisenstat_walker_alpha", 1.5f64);
    registry_entry!(map, "eisenstat_walker_gamma", 1.0f64);
    registry_entry!(map, "gmres_subspace_size", 0usize);
    registry_entry!(map, "max_gmres_rtol", 0.1f64);
    registry_entry!(map, "gmres_atol", 1e-30f64);
    registry_entry!(map, "max_time", 3600u64);
    map
});

/// A string-keyed, typed registry of solver options.
///
/// Every option is registered with a default value; [`set_option`] rejects
/// unknown names and type mismatches so a typo cannot silently change the
/// solver configuration.
///
/// [`set_option`]: SolverOptions::set_option
#[derive(Clone)]
pub struct SolverOptions {
    map: HashMap<String, Box<dyn OptionTrait>>,
}

impl SolverOptions {
    pub fn new() -> Self {
        let map = OPTION_REGISTRY.clone();
        Self { map }
    }

    pub fn get_option<T: OptionTrait + Clone>(&self, name: &str) -> Option<T> {
        self.map
            .get(name)
            .and_then(|v| (v.as_ref() as &dyn Any).downcast_ref::<T>())
            .cloned()
    }

    pub fn set_option<T: OptionTrait>(&mut self, name: &str, value: T) -> Result<(), String> {
        match self.map.get(name) {
            None => Err(format!("Option '{}' is not registered.", name)),
            Some(current) => {
                if (current.as_ref() as &dyn Any).downcast_ref::<T>().is_some() {
                    self.map.insert(name.to_string(), Box::new(value));
                    Ok(())
                } else {
                    Err(format!(
                        "Type mismatch for option '{}': found {}.",
                        name,
                        std::any::type_name::<T>(),
                    ))
                }
            }
        }
    }
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Status codes for the optimization.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Status {
    /// The solver is still running.
    InProgress,
    /// An optimal solution was found.
    Optimal,
    /// The status is unknown or not determined.
    Unknown,
    /// The solver stopped due to a time limit.
    TimeLimit,
    /// The solver stopped due to an iteration limit.
    IterationLimit,
    /// The solver was interrupted (e.g., by user or signal).
    Interrupted,
}

/// Per-iteration hooks consulted by the optimization loop.
pub struct SolverHooks {
    pub callback: Box<dyn Callback>,
    pub terminator: Box<dyn Terminator>,
}

impl SolverHooks {
    /// Hooks that do nothing: no output, no early termination.
    pub fn silent() -> Self {
        Self {
            callback: Box::new(callback::NoOpCallback::new(&SolverOptions::new())),
            terminator: Box::new(terminators::NullTerminator::new(&SolverOptions::new())),
        }
    }
}

#[cfg(test)]
mod option_tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let options = SolverOptions::new();
        assert_eq!(options.get_option::<f64>("barrier_param"), Some(0.1));
        assert_eq!(options.get_option::<usize>("max_line_iters"), Some(10));
        assert_eq!(
            options.get_option::<NormType>("norm_type"),
            Some(NormType::Linfty)
        );
        assert_eq!(options.get_option::<f64>("no_such_option"), None);
    }

    #[test]
    fn test_set_option() {
        let mut options = SolverOptions::new();
        options.set_option("abs_res_tol", 1e-8).unwrap();
        assert_eq!(options.get_option::<f64>("abs_res_tol"), Some(1e-8));

        // Unknown names and mismatched types are rejected
        assert!(options.set_option("no_such_option", 1.0).is_err());
        assert!(options.set_option("abs_res_tol", true).is_err());
        assert_eq!(options.get_option::<f64>("abs_res_tol"), Some(1e-8));
    }

    #[test]
    fn test_enum_options() {
        let mut options = SolverOptions::new();
        options
            .set_option("barrier_strategy", BarrierStrategy::Mehrotra)
            .unwrap();
        assert_eq!(
            options.get_option::<BarrierStrategy>("barrier_strategy"),
            Some(BarrierStrategy::Mehrotra)
        );
        assert_eq!(
            "complementarity_fraction"
                .parse::<BarrierStrategy>()
                .unwrap(),
            BarrierStrategy::ComplementarityFraction
        );
    }
}
