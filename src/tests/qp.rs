//! End-to-end quadratic-program scenarios.

use rstest::rstest;
use rstest_reuse::{apply, template};

use crate::callback::{Callback, ProgressInfo};
use crate::tests::problems::{equality_qp, inequality_qp};
use crate::{
    BarrierStrategy, InteriorPoint, NormType, SolverHooks, SolverOptions, Status, E,
};

/// Callback that records the barrier parameter and iteration count.
pub struct RecordingCallback {
    pub barriers: std::rc::Rc<std::cell::RefCell<Vec<E>>>,
}

impl Callback for RecordingCallback {
    fn new(_options: &SolverOptions) -> Self {
        Self {
            barriers: Default::default(),
        }
    }

    fn call(&mut self, info: &ProgressInfo) {
        self.barriers.borrow_mut().push(info.barrier_param);
    }
}

#[template]
#[rstest]
pub fn norm_types(
    #[values(NormType::Linfty, NormType::L1, NormType::L2)] norm_type: NormType,
) {
}

#[apply(norm_types)]
fn test_equality_qp_monotone(norm_type: NormType) {
    let qp = equality_qp();

    let mut options = SolverOptions::new();
    options.set_option("norm_type", norm_type).unwrap();
    options.set_option("abs_res_tol", 1e-7).unwrap();

    let mut solver = InteriorPoint::new(&qp, &options);
    let mut hooks = SolverHooks::silent();
    let status = solver.optimize(&mut hooks, None).unwrap();
    assert_eq!(status, Status::Optimal);

    // The optimum is x_i = 0.48 / h_i with multiplier z = -0.52
    let (x, z, _, zl, zu) = solver.optimized_point();
    let expected = [0.12, 0.16, 0.24, 0.48];
    for i in 0..4 {
        assert!(
            (x[i] - expected[i]).abs() < 1e-4,
            "x[{}] = {} != {}",
            i,
            x[i],
            expected[i]
        );
        // Interior bounds carry vanishing multipliers
        assert!(zl[i] >= 0.0 && zl[i] < 1e-3);
        assert!(zu[i] >= 0.0 && zu[i] < 1e-3);
    }
    assert!((z[0] + 0.52).abs() < 1e-3, "z = {}", z[0]);
    assert!((solver.objective() + 0.76).abs() < 1e-4);

    // Stationarity: h_i x_i - 1 - z = 0 away from the bounds
    for i in 0..4 {
        let stat = qp.h[i] * x[i] - 1.0 - z[0] - zl[i] + zu[i];
        assert!(stat.abs() < 1e-3, "stationarity[{}] = {}", i, stat);
    }
}

#[test]
fn test_equality_qp_converges_quickly() {
    let qp = equality_qp();

    let mut options = SolverOptions::new();
    options.set_option("abs_res_tol", 1e-5).unwrap();

    let counter = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut hooks = SolverHooks::silent();
    hooks.callback = Box::new(RecordingCallback {
        barriers: counter.clone(),
    });

    let mut solver = InteriorPoint::new(&qp, &options);
    let status = solver.optimize(&mut hooks, None).unwrap();
    assert_eq!(status, Status::Optimal);
    assert!(
        counter.borrow().len() <= 50,
        "took {} iterations",
        counter.borrow().len()
    );
}

#[template]
#[rstest]
pub fn barrier_strategies(
    #[values(
        BarrierStrategy::Monotone,
        BarrierStrategy::Mehrotra,
        BarrierStrategy::ComplementarityFraction
    )]
    strategy: BarrierStrategy,
) {
}

#[apply(barrier_strategies)]
fn test_inequality_qp_strategies(strategy: BarrierStrategy) {
    let qp = inequality_qp();

    let mut options = SolverOptions::new();
    options.set_option("barrier_strategy", strategy).unwrap();
    options.set_option("abs_res_tol", 1e-6).unwrap();

    let mut solver = InteriorPoint::new(&qp, &options);
    let mut hooks = SolverHooks::silent();
    let status = solver.optimize(&mut hooks, None).unwrap();
    assert_eq!(status, Status::Optimal);

    // Feasibility and positive multipliers at the solution
    let (x, z, _, _, _) = solver.optimized_point();
    assert!(x[0] + x[1] >= 4.0 - 1e-5);
    assert!(x[1] + x[2] >= 3.5 - 1e-5);
    for i in 0..2 {
        assert!(z[i] > 0.0, "z[{}] = {}", i, z[i]);
    }

    let (s, t, _) = solver.optimized_slacks();
    for i in 0..2 {
        assert!(s[i] > 0.0 && t[i] > 0.0);
    }
}

#[test]
fn test_monotone_barrier_decreases() {
    let qp = inequality_qp();

    let options = SolverOptions::new();
    let barriers = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut hooks = SolverHooks::silent();
    hooks.callback = Box::new(RecordingCallback {
        barriers: barriers.clone(),
    });

    let mut solver = InteriorPoint::new(&qp, &options);
    let status = solver.optimize(&mut hooks, None).unwrap();
    assert_eq!(status, Status::Optimal);

    let barriers = barriers.borrow();
    assert!(barriers.windows(2).all(|w| w[1] <= w[0] + 1e-15));
    assert!(*barriers.last().unwrap() <= 0.1 * 1e-5);
}

#[test]
fn test_mehrotra_sigma_rule() {
    let qp = inequality_qp();
    let options = SolverOptions::new();
    let solver = InteriorPoint::new(&qp, &options);

    // sigma = (comp_affine / comp)^3 lies in [0, 1] whenever the affine
    // step reduces the complementarity
    let comp = 0.8;
    for &comp_affine in &[0.0, 0.1, 0.4, 0.8] {
        let mu = solver.mehrotra_barrier_update(comp, comp_affine);
        let sigma = (comp_affine / comp).powi(3);
        assert!((0.0..=1.0).contains(&sigma));
        let expected = (sigma * comp).max(0.09999 * 1e-5);
        assert!((mu - expected).abs() < 1e-15);
    }
}

#[test]
fn test_newton_krylov_qp() {
    let qp = inequality_qp();

    let mut options = SolverOptions::new();
    options.set_option("use_hvec_product", true).unwrap();
    options.set_option("gmres_subspace_size", 25usize).unwrap();
    options.set_option("nk_switch_tol", 1e3).unwrap();
    options.set_option("max_gmres_rtol", 0.99).unwrap();
    options.set_option("abs_res_tol", 1e-6).unwrap();

    let mut solver = InteriorPoint::new(&qp, &options);
    let mut hooks = SolverHooks::silent();
    let status = solver.optimize(&mut hooks, None).unwrap();
    assert_eq!(status, Status::Optimal);

    // The exact-Hessian branch was exercised
    assert!(solver.nhvec > 0);
}

#[test]
fn test_penalty_rises_to_restore_descent() {
    // Constructed state with projected derivative +1, infeasibility 1 and
    // infeasibility projection -2: the smallest penalty restoring descent
    // is 1 / (2 - penalty_descent_fraction) = 1 / 1.7
    let qp = crate::tests::problems::BoxQp {
        h: vec![1.0],
        b: vec![0.0],
        acon: vec![vec![-2.0]],
        crhs: vec![0.0],
        dense_ineq: true,
        lb: vec![-crate::tests::problems::FREE],
        ub: vec![crate::tests::problems::FREE],
        x0: vec![0.0],
        wrows: Vec::new(),
        wrhs: Vec::new(),
        nwblock: 1,
        sparse_ineq: true,
    };

    let options = SolverOptions::new();
    let mut solver = InteriorPoint::new(&qp, &options);
    solver.set_quasi_newton(None);

    solver.barrier_param = 0.0;
    solver.rho_penalty_search = 0.0;
    solver.grad.fobj = 0.0;
    solver.grad.c[0] = 1.0;
    solver.grad.g[0] = 1.0;
    solver.grad.ac[0][0] = -2.0;
    solver.vars.s[0] = 1.0;
    solver.vars.t[0] = 1.0;
    solver.step.px[0] = 1.0;
    solver.step.ps[0] = 0.0;
    solver.step.pt[0] = 0.0;

    let (_, dm0) = solver.eval_merit_init_deriv(1.0);
    let expected = 1.0 / (2.0 - 0.3);
    assert!(
        (solver.rho_penalty_search - expected).abs() < 1e-12,
        "rho = {}",
        solver.rho_penalty_search
    );
    // With the tuned penalty the direction is a descent direction
    assert!(dm0 < 0.0);
}

#[test]
fn test_sequential_linear_boundary() {
    // With no quasi-Newton store the corrector collapses to the identity
    // and the step is the pure diagonal step
    let qp = inequality_qp();

    let mut options = SolverOptions::new();
    options
        .set_option("qn_type", crate::QuasiNewtonType::None)
        .unwrap();

    let mut solver = InteriorPoint::new(&qp, &options);
    crate::tests::problems::prime_gradients(&mut solver, &qp);

    solver.compute_kkt_res(0.1);
    solver.setup_kkt_diag_system(true).unwrap();
    solver.setup_kkt_system(true).unwrap();
    assert_eq!(solver.smw.size, 0);
    solver.compute_kkt_step();
}
