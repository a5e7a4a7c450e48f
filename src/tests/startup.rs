//! Starting-point strategy tests.

use crate::tests::problems::{prime_gradients, BoxQp};
use crate::{InteriorPoint, SolverOptions, StartingPointStrategy, E};

/// A positive-definite QP with three equality constraints and an interior
/// starting point.
fn equality_constrained_qp() -> BoxQp {
    let n = 10;
    let h: Vec<E> = (0..n).map(|i| 2.0 + 0.3 * i as E).collect();
    let b: Vec<E> = (0..n).map(|i| 1.0 - 0.1 * i as E).collect();

    let mut acon = vec![vec![0.0; n]; 3];
    for i in 0..n {
        acon[0][i] = 1.0;
        acon[1][i] = if i % 2 == 0 { 1.0 } else { -1.0 };
        acon[2][i] = 0.1 * i as E;
    }

    BoxQp {
        h,
        b,
        acon,
        crhs: vec![2.0, 0.0, 1.0],
        dense_ineq: false,
        lb: vec![-5.0; n],
        ub: vec![5.0; n],
        x0: vec![0.2; n],
        wrows: Vec::new(),
        wrhs: Vec::new(),
        nwblock: 1,
        sparse_ineq: true,
    }
}

#[test]
fn test_affine_step_multiplier_floor() {
    let qp = equality_constrained_qp();

    let mut options = SolverOptions::new();
    options
        .set_option("starting_point_strategy", StartingPointStrategy::AffineStep)
        .unwrap();

    let mut solver = InteriorPoint::new(&qp, &options);
    prime_gradients(&mut solver, &qp);
    solver.init_affine_step_multipliers().unwrap();

    let floor: E = options.get_option("start_affine_multiplier_min").unwrap();
    for i in 0..3 {
        assert!(solver.vars.z[i] >= floor, "z[{}] = {}", i, solver.vars.z[i]);
    }
    for i in 0..10 {
        assert!(solver.vars.zl[i] >= floor);
        assert!(solver.vars.zu[i] >= floor);
    }

    // The initial barrier parameter is the measured complementarity
    assert!(solver.barrier_param.is_finite());
    assert!(solver.barrier_param > 0.0);
    let comp = solver.complementarity();
    assert!((solver.barrier_param - comp).abs() < 1e-12);
}

#[test]
fn test_least_squares_multipliers_in_range() {
    let qp = equality_constrained_qp();

    let options = SolverOptions::new();
    let mut solver = InteriorPoint::new(&qp, &options);
    prime_gradients(&mut solver, &qp);

    // Perturb the multipliers so the reset is observable
    for i in 0..3 {
        solver.vars.z[i] = -7.0;
    }
    solver.init_least_squares_multipliers();

    let gamma: E = options.get_option("penalty_gamma").unwrap();
    for i in 0..3 {
        assert!(solver.vars.z[i].abs() <= gamma);
        assert!(solver.vars.z[i].is_finite());
    }
    // Slacks and bound multipliers are reset to one
    for i in 0..10 {
        assert_eq!(solver.vars.zl[i], 1.0);
        assert_eq!(solver.vars.zu[i], 1.0);
    }
    for i in 0..3 {
        assert_eq!(solver.vars.s[i], 1.0);
        assert_eq!(solver.vars.t[i], 1.0);
    }
}

#[test]
fn test_bound_repair() {
    // Crossed bounds and a start outside the box are repaired with a
    // warning rather than a failure
    let qp = BoxQp {
        h: vec![1.0, 1.0],
        b: vec![0.0, 0.0],
        acon: Vec::new(),
        crhs: Vec::new(),
        dense_ineq: true,
        lb: vec![1.0, 0.0],
        ub: vec![0.0, 1.0], // first pair crossed
        x0: vec![0.5, 2.0], // second variable outside its bounds
        wrows: Vec::new(),
        wrhs: Vec::new(),
        nwblock: 1,
        sparse_ineq: true,
    };

    let options = SolverOptions::new();
    let solver = InteriorPoint::new(&qp, &options);

    for i in 0..2 {
        assert!(solver.vars.lb[i] < solver.vars.ub[i]);
        assert!(solver.vars.x[i] > solver.vars.lb[i]);
        assert!(solver.vars.x[i] < solver.vars.ub[i]);
    }
}

#[test]
fn test_dead_bounds_drop_out() {
    // With bounds beyond max_bound_value the bound multipliers are pinned
    // to zero and the barrier terms vanish from the residuals
    let qp = BoxQp::bounds_only(
        vec![1.0, 1.0],
        vec![0.5, -0.5],
        vec![-crate::tests::problems::FREE; 2],
        vec![crate::tests::problems::FREE; 2],
        vec![0.0; 2],
    );

    let options = SolverOptions::new();
    let mut solver = InteriorPoint::new(&qp, &options);
    prime_gradients(&mut solver, &qp);

    assert_eq!(solver.vars.zl[0], 0.0);
    assert_eq!(solver.vars.zu[0], 0.0);

    let norms = solver.compute_kkt_res(0.1);
    // rzl / rzu are identically zero for dead bounds
    for i in 0..2 {
        assert_eq!(solver.res.rzl[i], 0.0);
        assert_eq!(solver.res.rzu[i], 0.0);
    }
    // The stationarity residual reduces to the plain gradient
    for i in 0..2 {
        assert!((solver.res.rx[i] + solver.grad.g[i]).abs() < 1e-15);
    }
    assert!(norms.max_prime > 0.0);
}
