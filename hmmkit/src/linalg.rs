//! Dense linear algebra needed by the Gaussian emission.
//!
//! Only symmetric positive-definite matrices are factorised here, so a plain
//! Cholesky decomposition is enough: log-densities use the factor's diagonal
//! for the log-determinant and a forward substitution for the Mahalanobis
//! term, and never form an explicit inverse.

use hmmkit_core::{HmmError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Relative tolerance used by [`is_symmetric`].
const SYMMETRY_TOL: f64 = 1e-8;

/// Lower-triangular Cholesky factor `L` of `a = L Lᵀ`.
///
/// # Errors
///
/// Returns [`HmmError::Numerical`] if `a` is not square or not
/// positive-definite.
pub fn cholesky(a: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
    let (n, m) = a.dim();
    if n != m {
        return Err(HmmError::Numerical(format!(
            "cholesky: matrix is {n}x{m}, expected square"
        )));
    }

    let mut l = Array2::<f64>::zeros((n, n));
    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if !(diag > 0.0) || !diag.is_finite() {
            return Err(HmmError::Numerical(format!(
                "cholesky: matrix is not positive-definite (pivot {j} = {diag})"
            )));
        }
        let ljj = diag.sqrt();
        l[[j, j]] = ljj;

        for i in (j + 1)..n {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / ljj;
        }
    }
    Ok(l)
}

/// Solve `L x = b` for lower-triangular `L` by forward substitution.
pub fn solve_lower(l: ArrayView2<'_, f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut s = b[i];
        for k in 0..i {
            s -= l[[i, k]] * x[k];
        }
        x[i] = s / l[[i, i]];
    }
    x
}

/// `ln det(a)` given the Cholesky factor of `a`.
pub fn log_det_from_cholesky(l: ArrayView2<'_, f64>) -> f64 {
    2.0 * l.diag().iter().map(|v| v.ln()).sum::<f64>()
}

/// Whether `a` is square and symmetric within a relative tolerance.
pub fn is_symmetric(a: ArrayView2<'_, f64>) -> bool {
    let (n, m) = a.dim();
    if n != m {
        return false;
    }
    for i in 0..n {
        for j in (i + 1)..n {
            let (x, y) = (a[[i, j]], a[[j, i]]);
            let scale = x.abs().max(y.abs()).max(1.0);
            if (x - y).abs() > SYMMETRY_TOL * scale {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    const TOL: f64 = 1e-12;

    #[test]
    fn cholesky_known_factor() {
        let a = arr2(&[[4.0, 12.0, -16.0], [12.0, 37.0, -43.0], [-16.0, -43.0, 98.0]]);
        let l = cholesky(a.view()).unwrap();
        let expected = arr2(&[[2.0, 0.0, 0.0], [6.0, 1.0, 0.0], [-8.0, 5.0, 3.0]]);
        for (x, y) in l.iter().zip(expected.iter()) {
            assert!((x - y).abs() < TOL);
        }
        // ln det = ln(36^2) since det = (2*1*3)^2
        assert!((log_det_from_cholesky(l.view()) - 36.0_f64.ln()).abs() < 1e-10);
    }

    #[test]
    fn cholesky_rejects_indefinite() {
        let a = arr2(&[[1.0, 2.0], [2.0, 1.0]]);
        assert!(cholesky(a.view()).is_err());
        let zero = Array2::<f64>::zeros((2, 2));
        assert!(cholesky(zero.view()).is_err());
        let rect = Array2::<f64>::zeros((2, 3));
        assert!(cholesky(rect.view()).is_err());
    }

    #[test]
    fn forward_substitution() {
        let l = arr2(&[[2.0, 0.0], [1.0, 3.0]]);
        let x = solve_lower(l.view(), arr1(&[4.0, 11.0]).view());
        assert!((x[0] - 2.0).abs() < TOL);
        assert!((x[1] - 3.0).abs() < TOL);
    }

    #[test]
    fn symmetry_check() {
        assert!(is_symmetric(arr2(&[[1.0, 0.5], [0.5, 2.0]]).view()));
        assert!(!is_symmetric(arr2(&[[1.0, 0.5], [0.4, 2.0]]).view()));
        assert!(!is_symmetric(Array2::<f64>::zeros((2, 3)).view()));
    }
}
