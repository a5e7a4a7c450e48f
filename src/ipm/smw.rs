//! Sherman-Morrison-Woodbury correction for the compact quasi-Newton term.
//!
//! The full KKT matrix is `K = K_D - Z diag(d) M^{-1} diag(d) Z^T` where
//! `(b0, d, M, Z)` is the compact quasi-Newton form. Its inverse is applied
//! through the Schur complement
//!
//! ```text
//!   Ce = Z^T K_D^{-1} Z - diag(d)^{-1} M diag(d)^{-1}
//! ```
//!
//! Setting up the correction solves one diagonal system per compact column
//! and fills `Ce` from the reduced inner products; applying it solves the
//! diagonal system with the full residual, forms the low-rank correction
//! right-hand side, and subtracts a second diagonal solve from the step.
//! When the quasi-Newton store is empty the correction collapses to the
//! identity and the step is the pure diagonal step.

use crate::comm::Communicator;
use crate::linalg::lu::DenseLu;
use crate::linalg::vector_ops::{axpy, dot, set_zero};
use crate::E;

use super::diag_kkt::DiagRhs;
use super::InteriorPoint;

/// Factored Schur complement of the low-rank quasi-Newton correction.
pub(crate) struct SmwCorrector {
    /// Current compact subspace size; zero disables the correction.
    pub(crate) size: usize,
    ce_vals: Vec<E>,
    ce: DenseLu,
}

impl SmwCorrector {
    pub(crate) fn new() -> Self {
        Self {
            size: 0,
            ce_vals: Vec::new(),
            ce: DenseLu::new(0),
        }
    }
}

impl<'a> InteriorPoint<'a> {
    /// Sets up the low-rank correction for the current diagonal
    /// factorization. With `use_qn = false`, or with an empty quasi-Newton
    /// store, the correction is disabled and the KKT step reduces to the
    /// diagonal step.
    pub(crate) fn setup_kkt_system(
        &mut self,
        use_qn: bool,
    ) -> Result<(), crate::linalg::SolverError> {
        self.smw.size = 0;
        if !use_qn {
            return Ok(());
        }
        let Some(qn) = &self.qn else {
            return Ok(());
        };

        let compact = qn.compact_mat();
        let size = compact.size();
        if size == 0 {
            return Ok(());
        }

        self.smw.ce_vals.clear();
        self.smw.ce_vals.resize(size * size, 0.0);

        // Ce[:, i] = Z^T K_D^{-1} Z[i]
        for i in 0..size {
            self.kkt.solve(
                self.prob,
                &*self.comm,
                &self.flags,
                &self.vars,
                &self.grad,
                DiagRhs::x_only(&compact.z[i]),
                &mut self.work,
                &mut self.xtmp,
                &mut self.wtmp,
            );

            let mut col: Vec<E> = (0..size)
                .map(|j| dot(self.work.px.as_ref(), compact.z[j].as_ref()))
                .collect();
            self.comm.allreduce_sum(&mut col);
            for (j, val) in col.into_iter().enumerate() {
                self.smw.ce_vals[j + i * size] = val;
            }
        }

        // Subtract diag(d)^{-1} M diag(d)^{-1}
        for j in 0..size {
            for i in 0..size {
                self.smw.ce_vals[i + j * size] -=
                    compact.m_mat[i + j * size] / (compact.d[i] * compact.d[j]);
            }
        }

        self.smw.ce = DenseLu::new(size);
        self.smw.ce.factorize(&self.smw.ce_vals)?;
        self.smw.size = size;

        Ok(())
    }

    /// Computes the KKT step into `self.step`: the diagonal solve with the
    /// full residual right-hand side, followed by the low-rank correction
    /// when the quasi-Newton subspace is nonempty.
    pub(crate) fn compute_kkt_step(&mut self) {
        self.solve_kkt_diag_full();
        self.apply_smw_step_correction();
    }

    /// Applies the low-rank correction to the design-variable component of
    /// the step only. The Krylov inner loop uses this cheaper form: its
    /// descent tests only need the corrected `px`.
    pub(crate) fn apply_smw_px_correction(&mut self) {
        let size = self.smw.size;
        if size == 0 {
            return;
        }
        let Some(qn) = &self.qn else {
            return;
        };
        let compact = qn.compact_mat();

        let mut r: Vec<E> = (0..size)
            .map(|i| dot(self.step.px.as_ref(), compact.z[i].as_ref()))
            .collect();
        self.comm.allreduce_sum(&mut r);
        self.smw.ce.solve(&mut r).expect("Ce is factored");

        set_zero(&mut self.xtmp2);
        for i in 0..size {
            axpy(r[i], compact.z[i].as_ref(), &mut self.xtmp2);
        }
        self.kkt.solve(
            self.prob,
            &*self.comm,
            &self.flags,
            &self.vars,
            &self.grad,
            DiagRhs::x_only(&self.xtmp2),
            &mut self.work,
            &mut self.xtmp,
            &mut self.wtmp,
        );

        axpy(-1.0, self.work.px.as_ref(), &mut self.step.px);
    }

    /// Subtracts the Sherman-Morrison-Woodbury correction from the step in
    /// `self.step`.
    pub(crate) fn apply_smw_step_correction(&mut self) {
        let size = self.smw.size;
        if size == 0 {
            return;
        }
        let Some(qn) = &self.qn else {
            return;
        };
        let compact = qn.compact_mat();

        // r = Ce^{-1} Z^T px
        let mut r: Vec<E> = (0..size)
            .map(|i| dot(self.step.px.as_ref(), compact.z[i].as_ref()))
            .collect();
        self.comm.allreduce_sum(&mut r);
        self.smw.ce.solve(&mut r).expect("Ce is factored");

        // Correction right-hand side sum(r_i Z[i]), solved through the
        // diagonal system with an x-only right-hand side
        set_zero(&mut self.xtmp2);
        for i in 0..size {
            axpy(r[i], compact.z[i].as_ref(), &mut self.xtmp2);
        }
        self.kkt.solve(
            self.prob,
            &*self.comm,
            &self.flags,
            &self.vars,
            &self.grad,
            DiagRhs::x_only(&self.xtmp2),
            &mut self.work,
            &mut self.xtmp,
            &mut self.wtmp,
        );

        let step = &mut self.step;
        let corr = &self.work;
        axpy(-1.0, corr.px.as_ref(), &mut step.px);
        axpy(-1.0, corr.pzw.as_ref(), &mut step.pzw);
        axpy(-1.0, corr.psw.as_ref(), &mut step.psw);
        axpy(-1.0, corr.pzl.as_ref(), &mut step.pzl);
        axpy(-1.0, corr.pzu.as_ref(), &mut step.pzu);
        for i in 0..self.flags.ncon {
            step.pz[i] -= corr.pz[i];
            step.ps[i] -= corr.ps[i];
            step.pt[i] -= corr.pt[i];
            step.pzt[i] -= corr.pzt[i];
        }
    }
}
