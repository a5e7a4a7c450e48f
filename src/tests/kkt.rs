//! Round-trip tests for the bordered KKT solver and the low-rank
//! correction: after a factorization, the solution of `K_D y = b` (or
//! `K y = b`) must satisfy every block equation of the KKT system.

use faer::Col;

use crate::problem::Problem;
use crate::qn::CompactQuasiNewton;
use crate::tests::problems::{prime_gradients, BoxQp};
use crate::{InteriorPoint, SolverOptions, E};

/// A bound-constrained QP with four sparse constraint rows.
fn block_qp(nwblock: usize) -> BoxQp {
    // nwblock = 1: orthogonal rows; nwblock = 2: rows within a block
    // share a variable so Cw has off-diagonal entries
    let wrows = if nwblock == 1 {
        vec![
            vec![(0, 1.0), (1, 1.0)],
            vec![(2, 1.0), (3, 1.0)],
            vec![(4, 1.0), (5, 1.0)],
            vec![(6, 1.0), (7, 1.0)],
        ]
    } else {
        vec![
            vec![(0, 1.0), (1, 1.0)],
            vec![(0, 0.5), (2, 1.0)],
            vec![(4, 1.0), (5, 1.0)],
            vec![(4, 0.5), (6, 1.0)],
        ]
    };

    BoxQp {
        h: vec![2.0; 8],
        b: vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0],
        acon: vec![
            vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
            vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0],
        ],
        crhs: vec![2.0, 0.5],
        dense_ineq: true,
        lb: vec![0.0; 8],
        ub: vec![3.0; 8],
        x0: vec![1.0; 8],
        wrows,
        wrhs: vec![3.0; 4],
        nwblock,
        sparse_ineq: true,
    }
}

/// Deterministic, non-trivial right-hand side staged into the residual
/// buffers.
fn stage_rhs(solver: &mut InteriorPoint) {
    let fill = |col: &mut Col<E>, seed: E| {
        for i in 0..col.nrows() {
            col[i] = (seed + i as E * 0.7).sin();
        }
    };
    fill(&mut solver.res.rx, 0.3);
    fill(&mut solver.res.rc, 1.1);
    fill(&mut solver.res.rs, 2.3);
    fill(&mut solver.res.rt, 3.1);
    fill(&mut solver.res.rzt, 4.7);
    fill(&mut solver.res.rcw, 5.9);
    fill(&mut solver.res.rsw, 6.1);
    fill(&mut solver.res.rzl, 7.3);
    fill(&mut solver.res.rzu, 8.9);
}

/// Checks every block equation of the (quasi-Newton) KKT system for the
/// step stored in the solver, where the x-row Hessian term is applied by
/// `hess` on the design step.
fn verify_kkt_equations(solver: &InteriorPoint, prob: &BoxQp, hess: &Col<E>, tol: E) {
    let vars = &solver.vars;
    let res = &solver.res;
    let step = &solver.step;
    let nvars = solver.flags.nvars;
    let ncon = solver.flags.ncon;
    let nwcon = solver.flags.nwcon;

    // Row x: H px + bound terms - Ac^T pz - Aw^T pzw - pzl + pzu = bx
    let mut row_x = hess.clone();
    for i in 0..nvars {
        row_x[i] += solver.opts.qn_sigma * step.px[i];
    }
    for k in 0..ncon {
        for i in 0..nvars {
            row_x[i] -= step.pz[k] * solver.grad.ac[k][i];
        }
    }
    let mut aw_t = Col::<E>::zeros(nvars);
    prob.add_sparse_jacobian_transpose(1.0, vars.x.as_ref(), step.pzw.as_ref(), &mut aw_t);
    for i in 0..nvars {
        row_x[i] -= aw_t[i];
        row_x[i] -= step.pzl[i];
        row_x[i] += step.pzu[i];
        assert!((row_x[i] - res.rx[i]).abs() < tol, "row x[{}]", i);
    }

    // Row c: Ac px - ps + pt = bc
    for k in 0..ncon {
        let mut val = 0.0;
        for i in 0..nvars {
            val += solver.grad.ac[k][i] * step.px[i];
        }
        val += -step.ps[k] + step.pt[k];
        assert!((val - res.rc[k]).abs() < tol, "row c[{}]", k);
    }

    // Rows s, t, zt
    for k in 0..ncon {
        let row_s = vars.s[k] * step.pz[k] + vars.z[k] * step.ps[k];
        assert!((row_s - res.rs[k]).abs() < tol, "row s[{}]", k);

        let row_t = -step.pzt[k] - step.pz[k];
        assert!((row_t - res.rt[k]).abs() < tol, "row t[{}]", k);

        let row_zt = vars.t[k] * step.pzt[k] + vars.zt[k] * step.pt[k];
        assert!((row_zt - res.rzt[k]).abs() < tol, "row zt[{}]", k);
    }

    // Rows cw, sw
    let mut aw_px = Col::<E>::zeros(nwcon);
    prob.add_sparse_jacobian(1.0, vars.x.as_ref(), step.px.as_ref(), &mut aw_px);
    for i in 0..nwcon {
        let row_cw = aw_px[i] - step.psw[i];
        assert!((row_cw - res.rcw[i]).abs() < tol, "row cw[{}]", i);

        let row_sw = vars.sw[i] * step.pzw[i] + vars.zw[i] * step.psw[i];
        assert!((row_sw - res.rsw[i]).abs() < tol, "row sw[{}]", i);
    }

    // Rows zl, zu on the (live) bounds
    for i in 0..nvars {
        let row_zl = vars.zl[i] * step.px[i] + (vars.x[i] - vars.lb[i]) * step.pzl[i];
        assert!((row_zl - res.rzl[i]).abs() < tol, "row zl[{}]", i);

        let row_zu = -vars.zu[i] * step.px[i] + (vars.ub[i] - vars.x[i]) * step.pzu[i];
        assert!((row_zu - res.rzu[i]).abs() < tol, "row zu[{}]", i);
    }
}

#[test]
fn test_diag_kkt_round_trip_single_blocks() {
    diag_kkt_round_trip(1);
}

#[test]
fn test_diag_kkt_round_trip_packed_blocks() {
    diag_kkt_round_trip(2);
}

fn diag_kkt_round_trip(nwblock: usize) {
    let qp = block_qp(nwblock);
    let options = SolverOptions::new();
    let mut solver = InteriorPoint::new(&qp, &options);
    prime_gradients(&mut solver, &qp);

    // Factor with the empty quasi-Newton store: the diagonal is b0 = 1
    solver.setup_kkt_diag_system(true).unwrap();
    stage_rhs(&mut solver);
    solver.solve_kkt_diag_full();

    // b0 * px is the whole Hessian contribution for the diagonal system
    let b0 = solver.qn.as_ref().unwrap().compact_mat().b0;
    let mut hess = solver.step.px.clone();
    for i in 0..solver.flags.nvars {
        hess[i] *= b0;
    }
    verify_kkt_equations(&solver, &qp, &hess, 1e-9);
}

#[test]
fn test_smw_corrected_round_trip() {
    let qp = block_qp(2);
    let options = SolverOptions::new();
    let mut solver = InteriorPoint::new(&qp, &options);
    prime_gradients(&mut solver, &qp);

    // Feed a curvature pair so the compact store is nonempty
    {
        let n = solver.flags.nvars;
        let s = Col::from_fn(n, |i| 0.1 + 0.05 * i as E);
        let y = Col::from_fn(n, |i| 0.3 + 0.02 * (i as E) * (i as E));
        let zdum = Col::<E>::zeros(0);
        let qn = solver.qn.as_mut().unwrap();
        qn.update(
            zdum.as_ref(),
            zdum.as_ref(),
            zdum.as_ref(),
            Some((s.as_ref(), y.as_ref())),
        );
        assert!(qn.compact_mat().size() > 0);
    }

    solver.setup_kkt_diag_system(true).unwrap();
    solver.setup_kkt_system(true).unwrap();
    assert!(solver.smw.size > 0);

    stage_rhs(&mut solver);
    solver.compute_kkt_step();

    // The x-row Hessian term is now the full quasi-Newton product B px
    let mut hess = Col::<E>::zeros(solver.flags.nvars);
    solver
        .qn
        .as_ref()
        .unwrap()
        .mult(solver.step.px.as_ref(), &mut hess);
    verify_kkt_equations(&solver, &qp, &hess, 1e-8);
}
