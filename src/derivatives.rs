//! Finite difference approximation of partial derivatives.

use std::ops::Deref;

use getset::{CopyGetters, Getters};
use nalgebra::{DMatrix, DVector};

/// Square root of double precision machine epsilon. This value is a standard
/// constant for epsilons in approximating first-order derivate-based concepts.
pub const EPSILON_SQRT: f64 = 0.000000014901161193847656;

/// Jacobian matrix of a vector function approximated by forward differences.
#[derive(Debug, Clone)]
pub struct Jacobian {
    jac: DMatrix<f64>,
}

impl Jacobian {
    /// Computes the Jacobian matrix of `f` in `x` with given scale of
    /// variables, where `fx` is the value of `f` in `x`. The number of rows is
    /// given by the length of `fx`.
    ///
    /// The parameter `x` is mutable to allow temporary mutations avoiding
    /// unnecessary allocations, but after this function ends, the content of
    /// the vector is exactly the same as before.
    ///
    /// Information about variable scale is useful for problematic cases of
    /// finite differentiation (e.g., when the value is near zero).
    pub fn new<F, E>(
        x: &mut DVector<f64>,
        scale: &DVector<f64>,
        fx: &DVector<f64>,
        mut f: F,
    ) -> Result<Self, E>
    where
        F: FnMut(&DVector<f64>) -> Result<DVector<f64>, E>,
    {
        let mut jac = DMatrix::zeros(fx.len(), x.len());

        for j in 0..x.len() {
            let xj = x[j];

            // Compute the step size. We would like to have the step as small as
            // possible (to be as close to the real derivative as possible). But
            // at the same time, very small step could cause
            // F(x + e_j * step_j) ~= F(x) with very small number of good
            // digits.
            //
            // A reasonable way to balance these competing needs is to scale
            // each component by x_j itself. To avoid problems when x_j is close
            // to zero, it is modified to take the typical magnitude instead.
            let magnitude = 1.0 / scale[j];
            let step = EPSILON_SQRT * xj.abs().max(magnitude) * 1f64.copysign(xj);
            let step = if step == 0.0 { EPSILON_SQRT } else { step };

            x[j] = xj + step;
            let result = f(x);
            x[j] = xj;

            // J[i, j] = (F(x + e_j * step_j) - F(x)) / step_j.
            let col = (result? - fx) / step;
            jac.set_column(j, &col);
        }

        Ok(Self { jac })
    }

    /// The approximated matrix.
    pub fn into_inner(self) -> DMatrix<f64> {
        self.jac
    }
}

impl Deref for Jacobian {
    type Target = DMatrix<f64>;

    fn deref(&self) -> &Self::Target {
        &self.jac
    }
}

/// Comparison of one block of analytic partial derivatives with its finite
/// difference approximation.
#[derive(Debug, Clone, Getters, CopyGetters)]
pub struct PartialCheck {
    /// Absolute path of the component.
    #[getset(get = "pub")]
    component: String,
    /// Local name of the differentiated variable.
    #[getset(get = "pub")]
    of: String,
    /// Local name of the variable the derivative is taken with respect to.
    #[getset(get = "pub")]
    wrt: String,
    /// Derivatives provided by the component.
    #[getset(get = "pub")]
    analytic: DMatrix<f64>,
    /// Finite difference approximation.
    #[getset(get = "pub")]
    fd: DMatrix<f64>,
    /// Frobenius norm of the difference.
    #[getset(get_copy = "pub")]
    abs_error: f64,
    /// Difference relative to the norm of the approximation.
    #[getset(get_copy = "pub")]
    rel_error: f64,
}

impl PartialCheck {
    pub(crate) fn new(
        component: &str,
        of: &str,
        wrt: &str,
        analytic: DMatrix<f64>,
        fd: DMatrix<f64>,
    ) -> Self {
        let abs_error = (&analytic - &fd).norm();
        let fd_norm = fd.norm();
        let rel_error = if fd_norm > 0.0 {
            abs_error / fd_norm
        } else {
            abs_error
        };

        Self {
            component: component.to_string(),
            of: of.to_string(),
            wrt: wrt.to_string(),
            analytic,
            fd,
            abs_error,
            rel_error,
        }
    }

    /// Returns `true` if both errors are within given tolerances.
    pub fn is_within(&self, atol: f64, rtol: f64) -> bool {
        self.abs_error <= atol || self.rel_error <= rtol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::{dmatrix, dvector};

    fn rosenbrock(x: &DVector<f64>) -> Result<DVector<f64>, ()> {
        Ok(dvector![10.0 * (x[1] - x[0] * x[0]), 1.0 - x[0]])
    }

    #[test]
    fn rosenbrock_jacobian() {
        let mut x = dvector![2.0, 2.0];
        let scale = dvector![1.0, 1.0];
        let fx = rosenbrock(&x).unwrap();

        let jac = Jacobian::new(&mut x, &scale, &fx, rosenbrock).unwrap();

        let expected = dmatrix![-40.0, 10.0; -1.0, 0.0];
        assert_abs_diff_eq!(&*jac, &expected, epsilon = 10e-6);
        assert_eq!(x, dvector![2.0, 2.0]);
    }

    #[test]
    fn rectangular_jacobian_in_zero() {
        let f = |x: &DVector<f64>| -> Result<DVector<f64>, ()> {
            Ok(dvector![x[0] * x[1] + 3.0 * x[2], 2.0 * x[0] - x[2], x[1]])
        };

        let mut x = dvector![0.0, 0.0, 0.0];
        let scale = dvector![1.0, 1.0, 1.0];
        let fx = f(&x).unwrap();

        let jac = Jacobian::new(&mut x, &scale, &fx, f).unwrap();

        let expected = dmatrix![
            0.0, 0.0, 3.0;
            2.0, 0.0, -1.0;
            0.0, 1.0, 0.0
        ];
        assert_abs_diff_eq!(&*jac, &expected, epsilon = 10e-6);
    }

    #[test]
    fn point_is_restored_on_error() {
        let mut x = dvector![1.0, 2.0];
        let scale = dvector![1.0, 1.0];
        let fx = dvector![0.0];

        let result = Jacobian::new(&mut x, &scale, &fx, |_| Err::<DVector<f64>, _>("bad"));

        assert_eq!(result.unwrap_err(), "bad");
        assert_eq!(x, dvector![1.0, 2.0]);
    }

    #[test]
    fn check_errors() {
        let check = PartialCheck::new(
            "comp",
            "y",
            "x",
            dmatrix![3.0, 4.0],
            dmatrix![3.0, 4.0 + 1e-7],
        );
        assert_abs_diff_eq!(check.abs_error(), 1e-7, epsilon = 1e-12);
        assert!(check.is_within(1e-6, 1e-6));
        assert!(!check.is_within(1e-9, 1e-9));
    }
}
