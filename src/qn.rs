//! Compact limited-memory quasi-Newton approximations.
//!
//! The KKT engine treats the Hessian approximation as an opaque capability
//! exposing the compact form
//!
//! ```text
//!   B = b0 * I - Z * diag(d) * M^{-1} * diag(d) * Z^T
//! ```
//!
//! where `Z` holds `m` design-shaped vectors, `d` has length `m` and `M` is
//! an `m x m` symmetric matrix. The diagonal `b0` enters the diagonal KKT
//! matrix; the low-rank term is folded in by the Sherman-Morrison-Woodbury
//! corrector. Two interchangeable implementations are provided: damped
//! L-BFGS ([`Lbfgs`]) and L-SR1 ([`Lsr1`]); neither leaks its choice into
//! the engine.

use std::sync::Arc;

use faer::{Col, ColRef};

use crate::comm::Communicator;
use crate::linalg::lu::DenseLu;
use crate::linalg::vector_ops::{axpy, dot, set_zero};
use crate::E;

/// Outcome of a quasi-Newton update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QnUpdate {
    /// The pair was absorbed unmodified.
    Full,
    /// The gradient difference was damped to preserve positive curvature.
    Damped,
    /// The pair was rejected and the approximation left unchanged.
    Skipped,
}

/// Borrowed view of the compact representation.
pub struct CompactMat<'a> {
    pub b0: E,
    /// Column scaling, length `m`.
    pub d: &'a [E],
    /// Symmetric middle matrix, column-major `m x m`.
    pub m_mat: &'a [E],
    /// The `m` design-shaped columns of `Z`.
    pub z: &'a [Col<E>],
}

impl<'a> CompactMat<'a> {
    pub fn size(&self) -> usize {
        self.d.len()
    }
}

/// Limited-memory quasi-Newton approximation in compact form.
pub trait CompactQuasiNewton {
    /// The largest number of compact columns this approximation can hold.
    fn max_compact_size(&self) -> usize;

    /// Absorbs a new `(s, y)` pair. The multiplier estimates are provided
    /// for approximations that depend on them; `sy = None` signals a
    /// multiplier-only notification without new curvature information.
    fn update(
        &mut self,
        x: ColRef<E>,
        z: ColRef<E>,
        zw: ColRef<E>,
        sy: Option<(ColRef<E>, ColRef<E>)>,
    ) -> QnUpdate;

    /// Computes `out = B * v`.
    fn mult(&self, v: ColRef<E>, out: &mut Col<E>);

    /// Computes `out += alpha * B * v`.
    fn mult_add(&self, alpha: E, v: ColRef<E>, out: &mut Col<E>);

    /// Borrows the current compact representation. The size may be zero
    /// when no pairs have been stored.
    fn compact_mat(&self) -> CompactMat<'_>;

    /// Discards all stored curvature information.
    fn reset(&mut self);
}

/// Shared pair storage and compact-form buffers for the limited-memory
/// implementations.
struct PairStore {
    nvars: usize,
    max_pairs: usize,
    comm: Arc<dyn Communicator>,
    s_list: Vec<Col<E>>,
    y_list: Vec<Col<E>>,
    b0: E,
}

impl PairStore {
    fn new(nvars: usize, max_pairs: usize, comm: Arc<dyn Communicator>) -> Self {
        Self {
            nvars,
            max_pairs,
            comm,
            s_list: Vec::with_capacity(max_pairs),
            y_list: Vec::with_capacity(max_pairs),
            b0: 1.0,
        }
    }

    fn len(&self) -> usize {
        self.s_list.len()
    }

    fn push(&mut self, s: Col<E>, y: Col<E>) {
        if self.s_list.len() >= self.max_pairs {
            self.s_list.remove(0);
            self.y_list.remove(0);
        }
        self.s_list.push(s);
        self.y_list.push(y);
    }

    fn clear(&mut self) {
        self.s_list.clear();
        self.y_list.clear();
        self.b0 = 1.0;
    }

    /// Dot product reduced over the process group.
    fn gdot(&self, a: ColRef<E>, b: ColRef<E>) -> E {
        let mut vals = [dot(a, b)];
        self.comm.allreduce_sum(&mut vals);
        vals[0]
    }
}

/// Applies the compact low-rank term: `out (+)= alpha * (b0 * v - Z d
/// M^{-1} d Z^T v)` given the factored middle matrix.
fn compact_mult_add(
    store: &PairStore,
    z: &[Col<E>],
    d: &[E],
    mlu: &DenseLu,
    alpha: E,
    v: ColRef<E>,
    out: &mut Col<E>,
) {
    axpy(alpha * store.b0, v, out);

    let size = z.len();
    if size > 0 {
        let mut t: Vec<E> = (0..size).map(|i| dot(z[i].as_ref(), v)).collect();
        store.comm.allreduce_sum(&mut t);
        for i in 0..size {
            t[i] *= d[i];
        }
        mlu.solve(&mut t).expect("compact middle matrix is factored");
        for i in 0..size {
            axpy(-alpha * d[i] * t[i], z[i].as_ref(), out);
        }
    }
}

/// Damped limited-memory BFGS approximation.
///
/// Uses the compact representation of Byrd, Nocedal and Schnabel with
/// `Z = [S, Y]`, `d = [b0, ..., b0, 1, ..., 1]` and
///
/// ```text
///   M = [ b0 S^T S   L  ]      L_ij = s_i^T y_j  (i > j)
///       [ L^T       -D  ]      D    = diag(s_i^T y_i)
/// ```
pub struct Lbfgs {
    store: PairStore,
    // Compact form, rebuilt after each accepted update
    z: Vec<Col<E>>,
    d: Vec<E>,
    m_mat: Vec<E>,
    mlu: DenseLu,
}

impl Lbfgs {
    pub fn new(nvars: usize, max_pairs: usize) -> Self {
        Self::with_comm(nvars, max_pairs, Arc::new(crate::comm::SelfComm))
    }

    pub fn with_comm(nvars: usize, max_pairs: usize, comm: Arc<dyn Communicator>) -> Self {
        Self {
            store: PairStore::new(nvars, max_pairs, comm),
            z: Vec::new(),
            d: Vec::new(),
            m_mat: Vec::new(),
            mlu: DenseLu::new(0),
        }
    }

    fn rebuild_compact(&mut self) {
        let m = self.store.len();
        let size = 2 * m;
        let b0 = self.store.b0;

        self.z.clear();
        self.z.extend(self.store.s_list.iter().cloned());
        self.z.extend(self.store.y_list.iter().cloned());

        self.d.clear();
        self.d.extend(std::iter::repeat(b0).take(m));
        self.d.extend(std::iter::repeat(1.0).take(m));

        self.m_mat = vec![0.0; size * size];

        // All pairwise inner products in a single reduction
        let mut dots = vec![0.0; m * m * 3];
        for i in 0..m {
            for j in 0..m {
                dots[i + j * m] =
                    dot(self.store.s_list[i].as_ref(), self.store.s_list[j].as_ref());
                dots[m * m + i + j * m] =
                    dot(self.store.s_list[i].as_ref(), self.store.y_list[j].as_ref());
                dots[2 * m * m + i + j * m] =
                    dot(self.store.y_list[i].as_ref(), self.store.y_list[j].as_ref());
            }
        }
        self.store.comm.allreduce_sum(&mut dots);

        let sts = |i: usize, j: usize| dots[i + j * m];
        let sty = |i: usize, j: usize| dots[m * m + i + j * m];

        for j in 0..m {
            for i in 0..m {
                // Top-left: b0 * S^T S
                self.m_mat[i + j * size] = b0 * sts(i, j);
                // Top-right L and bottom-left L^T
                let l_ij = if i > j { sty(i, j) } else { 0.0 };
                self.m_mat[i + (m + j) * size] = l_ij;
                self.m_mat[(m + j) + i * size] = l_ij;
            }
            // Bottom-right: -D
            self.m_mat[(m + j) + (m + j) * size] = -sty(j, j);
        }

        self.mlu = DenseLu::new(size);
        self.mlu
            .factorize(&self.m_mat)
            .expect("L-BFGS middle matrix must be nonsingular for positive-curvature pairs");
    }
}

impl CompactQuasiNewton for Lbfgs {
    fn max_compact_size(&self) -> usize {
        2 * self.store.max_pairs
    }

    fn update(
        &mut self,
        _x: ColRef<E>,
        _z: ColRef<E>,
        _zw: ColRef<E>,
        sy: Option<(ColRef<E>, ColRef<E>)>,
    ) -> QnUpdate {
        let Some((s, y)) = sy else {
            return QnUpdate::Skipped;
        };
        if self.store.max_pairs == 0 {
            return QnUpdate::Skipped;
        }

        let mut y = y.to_owned();
        let s_dot_y = self.store.gdot(s, y.as_ref());

        // Damping in the style of Powell: if the curvature along s is too
        // weak relative to the current approximation, blend y with B*s
        let mut bs = Col::<E>::zeros(self.store.nvars);
        self.mult(s, &mut bs);
        let s_dot_bs = self.store.gdot(s, bs.as_ref());

        let mut result = QnUpdate::Full;
        let mut sy_final = s_dot_y;
        if s_dot_y < 0.2 * s_dot_bs {
            let theta = 0.8 * s_dot_bs / (s_dot_bs - s_dot_y);
            let mut damped = Col::<E>::zeros(self.store.nvars);
            axpy(theta, y.as_ref(), &mut damped);
            axpy(1.0 - theta, bs.as_ref(), &mut damped);
            y = damped;
            sy_final = self.store.gdot(s, y.as_ref());
            result = QnUpdate::Damped;
        }

        if sy_final <= 0.0 {
            return QnUpdate::Skipped;
        }

        let y_dot_y = self.store.gdot(y.as_ref(), y.as_ref());
        self.store.b0 = y_dot_y / sy_final;
        self.store.push(s.to_owned(), y);
        self.rebuild_compact();

        result
    }

    fn mult(&self, v: ColRef<E>, out: &mut Col<E>) {
        set_zero(out);
        if self.store.len() == 0 {
            axpy(self.store.b0, v, out);
        } else {
            compact_mult_add(&self.store, &self.z, &self.d, &self.mlu, 1.0, v, out);
        }
    }

    fn mult_add(&self, alpha: E, v: ColRef<E>, out: &mut Col<E>) {
        if self.store.len() == 0 {
            axpy(alpha * self.store.b0, v, out);
        } else {
            compact_mult_add(&self.store, &self.z, &self.d, &self.mlu, alpha, v, out);
        }
    }

    fn compact_mat(&self) -> CompactMat<'_> {
        CompactMat {
            b0: self.store.b0,
            d: &self.d,
            m_mat: &self.m_mat,
            z: &self.z,
        }
    }

    fn reset(&mut self) {
        self.store.clear();
        self.z.clear();
        self.d.clear();
        self.m_mat.clear();
        self.mlu = DenseLu::new(0);
    }
}

/// Limited-memory SR1 approximation.
///
/// Compact form with `Z_i = y_i - b0 * s_i`, unit scaling, and the middle
/// matrix `M = -(D + L + L^T - b0 S^T S)` so that it plugs into the same
/// `B = b0 I - Z d M^{-1} d Z^T` convention as [`Lbfgs`].
pub struct Lsr1 {
    store: PairStore,
    z: Vec<Col<E>>,
    d: Vec<E>,
    m_mat: Vec<E>,
    mlu: DenseLu,
}

impl Lsr1 {
    const SKIP_TOL: E = 1e-8;

    pub fn new(nvars: usize, max_pairs: usize) -> Self {
        Self::with_comm(nvars, max_pairs, Arc::new(crate::comm::SelfComm))
    }

    pub fn with_comm(nvars: usize, max_pairs: usize, comm: Arc<dyn Communicator>) -> Self {
        Self {
            store: PairStore::new(nvars, max_pairs, comm),
            z: Vec::new(),
            d: Vec::new(),
            m_mat: Vec::new(),
            mlu: DenseLu::new(0),
        }
    }

    fn rebuild_compact(&mut self) -> Result<(), crate::linalg::SolverError> {
        let m = self.store.len();
        let b0 = self.store.b0;

        self.z.clear();
        for i in 0..m {
            let mut zi = self.store.y_list[i].clone();
            axpy(-b0, self.store.s_list[i].as_ref(), &mut zi);
            self.z.push(zi);
        }

        self.d.clear();
        self.d.extend(std::iter::repeat(1.0).take(m));

        let mut dots = vec![0.0; 2 * m * m];
        for i in 0..m {
            for j in 0..m {
                dots[i + j * m] =
                    dot(self.store.s_list[i].as_ref(), self.store.s_list[j].as_ref());
                dots[m * m + i + j * m] =
                    dot(self.store.s_list[i].as_ref(), self.store.y_list[j].as_ref());
            }
        }
        self.store.comm.allreduce_sum(&mut dots);

        let sts = |i: usize, j: usize| dots[i + j * m];
        let sty = |i: usize, j: usize| dots[m * m + i + j * m];

        self.m_mat = vec![0.0; m * m];
        for j in 0..m {
            for i in 0..m {
                // D + L + L^T: s_i^T y_j on and below the diagonal, its
                // transpose above
                let val = if i >= j { sty(i, j) } else { sty(j, i) };
                self.m_mat[i + j * m] = -(val - b0 * sts(i, j));
            }
        }

        self.mlu = DenseLu::new(m);
        self.mlu.factorize(&self.m_mat)
    }
}

impl CompactQuasiNewton for Lsr1 {
    fn max_compact_size(&self) -> usize {
        self.store.max_pairs
    }

    fn update(
        &mut self,
        _x: ColRef<E>,
        _z: ColRef<E>,
        _zw: ColRef<E>,
        sy: Option<(ColRef<E>, ColRef<E>)>,
    ) -> QnUpdate {
        let Some((s, y)) = sy else {
            return QnUpdate::Skipped;
        };
        if self.store.max_pairs == 0 {
            return QnUpdate::Skipped;
        }

        // SR1 skipping rule: reject the pair when s is nearly orthogonal
        // to (y - B s), which would make the update unbounded
        let mut res = y.to_owned();
        let mut bs = Col::<E>::zeros(self.store.nvars);
        self.mult(s, &mut bs);
        axpy(-1.0, bs.as_ref(), &mut res);

        let s_dot_r = self.store.gdot(s, res.as_ref()).abs();
        let s_norm = self.store.gdot(s, s).sqrt();
        let r_norm = self.store.gdot(res.as_ref(), res.as_ref()).sqrt();
        if s_dot_r <= Self::SKIP_TOL * s_norm * r_norm {
            return QnUpdate::Skipped;
        }

        let s_dot_y = self.store.gdot(s, y);
        if s_dot_y > 0.0 {
            self.store.b0 = self.store.gdot(y, y) / s_dot_y;
        }
        self.store.push(s.to_owned(), y.to_owned());

        if self.rebuild_compact().is_err() {
            // A singular middle matrix means the newest pair is linearly
            // dependent on the store; drop it and keep the previous state
            self.store.s_list.pop();
            self.store.y_list.pop();
            let _ = self.rebuild_compact();
            return QnUpdate::Skipped;
        }

        QnUpdate::Full
    }

    fn mult(&self, v: ColRef<E>, out: &mut Col<E>) {
        set_zero(out);
        if self.store.len() == 0 {
            axpy(self.store.b0, v, out);
        } else {
            compact_mult_add(&self.store, &self.z, &self.d, &self.mlu, 1.0, v, out);
        }
    }

    fn mult_add(&self, alpha: E, v: ColRef<E>, out: &mut Col<E>) {
        if self.store.len() == 0 {
            axpy(alpha * self.store.b0, v, out);
        } else {
            compact_mult_add(&self.store, &self.z, &self.d, &self.mlu, alpha, v, out);
        }
    }

    fn compact_mat(&self) -> CompactMat<'_> {
        CompactMat {
            b0: self.store.b0,
            d: &self.d,
            m_mat: &self.m_mat,
            z: &self.z,
        }
    }

    fn reset(&mut self) {
        self.store.clear();
        self.z.clear();
        self.d.clear();
        self.m_mat.clear();
        self.mlu = DenseLu::new(0);
    }
}
