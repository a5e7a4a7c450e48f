use faer::{unzip, zip, Col, ColRef};

use crate::E;

pub(crate) fn cwise_multiply<'a>(x1: ColRef<'a, E>, x2: ColRef<'a, E>) -> Col<E> {
    let mut out = Col::<E>::zeros(x1.nrows());

    zip!(x1, x2, out.as_mut()).for_each(|unzip!(x1, x2, out)| *out = *x1 * *x2);

    out
}

/// Computes `y += alpha * x`.
pub(crate) fn axpy(alpha: E, x: ColRef<E>, y: &mut Col<E>) {
    zip!(y.as_mut(), x).for_each(|unzip!(y, x)| *y += alpha * *x);
}

pub(crate) fn set_zero(x: &mut Col<E>) {
    zip!(x.as_mut()).for_each(|unzip!(x)| *x = 0.0);
}

pub(crate) fn scale(alpha: E, x: &mut Col<E>) {
    zip!(x.as_mut()).for_each(|unzip!(x)| *x *= alpha);
}

pub(crate) fn copy_vals(dst: &mut Col<E>, src: ColRef<E>) {
    zip!(dst.as_mut(), src).for_each(|unzip!(dst, src)| *dst = *src);
}

/// Computes `x^T y`. On a distributed vector this is the *local* part of
/// the dot product; the caller reduces across ranks.
pub(crate) fn dot(x: ColRef<E>, y: ColRef<E>) -> E {
    let mut result = 0.0;
    zip!(x, y).for_each(|unzip!(x, y)| result += *x * *y);
    result
}

/// Maximum absolute component of `x` (local part).
pub(crate) fn abs_max(x: ColRef<E>) -> E {
    let mut result = 0.0;
    zip!(x).for_each(|unzip!(x)| {
        if x.abs() > result {
            result = x.abs();
        }
    });
    result
}

/// Sum of absolute components of `x` (local part).
pub(crate) fn abs_sum(x: ColRef<E>) -> E {
    let mut result = 0.0;
    zip!(x).for_each(|unzip!(x)| result += x.abs());
    result
}

/// Sum of squared components of `x` (local part). The L2 residual norms
/// accumulate squares locally, reduce the sums, then take square roots.
pub(crate) fn sq_sum(x: ColRef<E>) -> E {
    let mut result = 0.0;
    zip!(x).for_each(|unzip!(x)| result += *x * *x);
    result
}

pub(crate) fn is_col_positive<'a>(x: ColRef<'a, E>) -> bool {
    let mut res = true;
    zip!(x).for_each(|unzip!(x)| {
        if *x <= 0.0 {
            res = false
        }
    });
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(vals: &[E]) -> Col<E> {
        Col::from_fn(vals.len(), |i| vals[i])
    }

    #[test]
    fn test_cwise_multiply() {
        let x1 = col(&[1.0, 2.0, 3.0]);
        let x2 = col(&[4.0, 5.0, 6.0]);
        assert_eq!(cwise_multiply(x1.as_ref(), x2.as_ref()), col(&[4.0, 10.0, 18.0]));
    }

    #[test]
    fn test_axpy_dot() {
        let x = col(&[1.0, -2.0, 3.0]);
        let mut y = col(&[1.0, 1.0, 1.0]);
        axpy(2.0, x.as_ref(), &mut y);
        assert_eq!(y, col(&[3.0, -3.0, 7.0]));
        assert_eq!(dot(x.as_ref(), y.as_ref()), 3.0 + 6.0 + 21.0);
    }

    #[test]
    fn test_norm_accumulators() {
        let x = col(&[3.0, -4.0, 0.5]);
        assert_eq!(abs_max(x.as_ref()), 4.0);
        assert_eq!(abs_sum(x.as_ref()), 7.5);
        assert_eq!(sq_sum(x.as_ref()), 9.0 + 16.0 + 0.25);
    }

    #[test]
    fn test_is_col_positive() {
        assert!(is_col_positive(col(&[1.0, 2.0, 3.0]).as_ref()));
        assert!(!is_col_positive(col(&[1.0, -2.0, 3.0]).as_ref()));
    }
}
