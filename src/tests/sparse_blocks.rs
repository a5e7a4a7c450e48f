//! End-to-end scenarios with block-structured sparse constraints.

use rstest::rstest;

use crate::linalg::vector_ops::is_col_positive;
use crate::tests::problems::BoxQp;
use crate::{InteriorPoint, SolverHooks, SolverOptions, Status, E};

/// Pull every variable toward 2 while sparse rows cap pair sums at 3:
/// `3 - x_i - x_j >= 0`. Half the pairs end up active.
fn sparse_qp(nwblock: usize) -> BoxQp {
    let n = 8;
    let (wrows, wrhs) = if nwblock == 1 {
        (
            vec![
                vec![(0, -1.0), (1, -1.0)],
                vec![(2, -1.0), (3, -1.0)],
                vec![(4, -1.0), (5, -1.0)],
                vec![(6, -1.0), (7, -1.0)],
            ],
            vec![-3.0; 4],
        )
    } else {
        // Rows within a block share a variable, giving Cw genuine 2x2
        // blocks; the second row of each block stays inactive
        (
            vec![
                vec![(0, -1.0), (1, -1.0)],
                vec![(0, -0.5), (2, -1.0)],
                vec![(4, -1.0), (5, -1.0)],
                vec![(4, -0.5), (6, -1.0)],
            ],
            vec![-3.0, -3.5, -3.0, -3.5],
        )
    };

    BoxQp {
        h: vec![1.0; n],
        b: vec![2.0; n],
        acon: Vec::new(),
        crhs: Vec::new(),
        dense_ineq: true,
        lb: vec![0.0; n],
        ub: vec![5.0; n],
        x0: vec![1.0; n],
        wrows,
        wrhs,
        nwblock,
        sparse_ineq: true,
    }
}

#[rstest]
fn test_sparse_inequality_blocks(#[values(1, 2)] nwblock: usize) {
    let qp = sparse_qp(nwblock);

    let mut options = SolverOptions::new();
    options.set_option("abs_res_tol", 1e-6).unwrap();

    let mut solver = InteriorPoint::new(&qp, &options);
    let mut hooks = SolverHooks::silent();
    let status = solver.optimize(&mut hooks, None).unwrap();
    assert_eq!(status, Status::Optimal);

    // Feasible with positive slacks and multipliers
    let (x, _, zw, _, _) = solver.optimized_point();
    let (_, _, sw) = solver.optimized_slacks();
    assert!(is_col_positive(sw));
    assert!(is_col_positive(zw));

    for (i, row) in qp.wrows.iter().enumerate() {
        let mut cw = -qp.wrhs[i];
        for &(j, coeff) in row {
            cw += coeff * x[j];
        }
        assert!(cw >= -1e-6, "sparse row {} infeasible: {}", i, cw);
    }

    // Rows with both variables pulled to 2 are active: x_i + x_j = 3
    if nwblock == 1 {
        for pair in [(0, 1), (2, 3), (4, 5), (6, 7)] {
            let sum: E = x[pair.0] + x[pair.1];
            assert!((sum - 3.0).abs() < 1e-4, "pair sum = {}", sum);
        }
    }
}

#[test]
fn test_complementarity_matches_definition() {
    let qp = sparse_qp(1);
    let options = SolverOptions::new();
    let solver = InteriorPoint::new(&qp, &options);

    // At the initial point every multiplier is one, so the average is
    // (8 * (x - lb) + 8 * (ub - x) + 4 * sw) / 20 = (8 + 32 + 4) / 20
    let comp = solver.complementarity();
    assert!((comp - 2.2).abs() < 1e-14, "comp = {}", comp);
}
