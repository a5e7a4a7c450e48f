//! Checkpoint round-trip and strict-size tests.

use crate::tests::problems::{inequality_qp, BoxQp};
use crate::{InteriorPoint, SolverOptions, E};

fn perturb(solver: &mut InteriorPoint) {
    solver.barrier_param = 0.0375;
    for i in 0..solver.flags.nvars {
        solver.vars.x[i] = 0.1 + 0.2 * i as E;
        solver.vars.zl[i] = 1.0 + 0.01 * i as E;
        solver.vars.zu[i] = 2.0 - 0.01 * i as E;
    }
    for i in 0..solver.flags.ncon {
        solver.vars.z[i] = 0.5 + i as E;
        solver.vars.s[i] = 0.25 + i as E;
    }
    for i in 0..solver.flags.nwcon {
        solver.vars.zw[i] = 0.75 + 0.1 * i as E;
        solver.vars.sw[i] = 1.25 + 0.1 * i as E;
    }
}

#[test]
fn test_checkpoint_round_trip() {
    let qp = inequality_qp();
    let options = SolverOptions::new();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.chk");

    let mut writer = InteriorPoint::new(&qp, &options);
    perturb(&mut writer);
    writer.write_solution_file(&path).unwrap();

    let mut reader = InteriorPoint::new(&qp, &options);
    reader.read_solution_file(&path).unwrap();

    // Bit-identical primal and dual state
    assert_eq!(reader.barrier_param, writer.barrier_param);
    for i in 0..writer.flags.nvars {
        assert_eq!(reader.vars.x[i], writer.vars.x[i]);
        assert_eq!(reader.vars.zl[i], writer.vars.zl[i]);
        assert_eq!(reader.vars.zu[i], writer.vars.zu[i]);
    }
    for i in 0..writer.flags.ncon {
        assert_eq!(reader.vars.z[i], writer.vars.z[i]);
        assert_eq!(reader.vars.s[i], writer.vars.s[i]);
    }
}

#[test]
fn test_checkpoint_with_sparse_constraints() {
    let qp = BoxQp {
        h: vec![1.0; 4],
        b: vec![1.0; 4],
        acon: vec![vec![1.0; 4]],
        crhs: vec![1.0],
        dense_ineq: true,
        lb: vec![0.0; 4],
        ub: vec![2.0; 4],
        x0: vec![0.5; 4],
        wrows: vec![vec![(0, -1.0), (1, -1.0)], vec![(2, -1.0), (3, -1.0)]],
        wrhs: vec![-3.0; 2],
        nwblock: 1,
        sparse_ineq: true,
    };
    let options = SolverOptions::new();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.chk");

    let mut writer = InteriorPoint::new(&qp, &options);
    perturb(&mut writer);
    writer.write_solution_file(&path).unwrap();

    let mut reader = InteriorPoint::new(&qp, &options);
    reader.read_solution_file(&path).unwrap();

    for i in 0..writer.flags.nwcon {
        assert_eq!(reader.vars.zw[i], writer.vars.zw[i]);
        assert_eq!(reader.vars.sw[i], writer.vars.sw[i]);
    }
}

#[test]
fn test_checkpoint_size_mismatch_rejected() {
    let qp = inequality_qp();
    let options = SolverOptions::new();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.chk");

    let mut writer = InteriorPoint::new(&qp, &options);
    perturb(&mut writer);
    writer.write_solution_file(&path).unwrap();

    // A congruent problem of a different size must reject the file and
    // leave its own state untouched
    let small = BoxQp::bounds_only(
        vec![1.0, 1.0],
        vec![0.0, 0.0],
        vec![0.0, 0.0],
        vec![1.0, 1.0],
        vec![0.5, 0.5],
    );
    let mut reader = InteriorPoint::new(&small, &options);
    let mu_before = reader.barrier_param;
    let x_before: Vec<E> = (0..2).map(|i| reader.vars.x[i]).collect();

    assert!(reader.read_solution_file(&path).is_err());
    assert_eq!(reader.barrier_param, mu_before);
    for i in 0..2 {
        assert_eq!(reader.vars.x[i], x_before[i]);
    }
}
