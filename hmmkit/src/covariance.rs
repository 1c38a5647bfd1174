//! Covariance structures for Gaussian emissions.
//!
//! Four parameterisations are supported, mirroring the usual mixture-model
//! conventions:
//!
//! | kind        | storage                        |
//! |-------------|--------------------------------|
//! | `spherical` | one variance per state         |
//! | `diag`      | one variance vector per state  |
//! | `tied`      | one `dim x dim` matrix, shared |
//! | `full`      | one `dim x dim` matrix per state |

use std::fmt;
use std::str::FromStr;

use hmmkit_core::{HmmError, Result, ValidationError};
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};

use crate::linalg::{cholesky, is_symmetric};

// ---------------------------------------------------------------------------
// CovarianceKind
// ---------------------------------------------------------------------------

/// Structural constraint on emission covariances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CovarianceKind {
    Spherical,
    #[default]
    Diagonal,
    Tied,
    Full,
}

impl CovarianceKind {
    /// All supported kinds, in a stable order.
    pub const ALL: [CovarianceKind; 4] = [
        CovarianceKind::Spherical,
        CovarianceKind::Diagonal,
        CovarianceKind::Tied,
        CovarianceKind::Full,
    ];

    /// Short string identifier (`"spherical"`, `"diag"`, `"tied"`, `"full"`).
    pub fn as_str(self) -> &'static str {
        match self {
            CovarianceKind::Spherical => "spherical",
            CovarianceKind::Diagonal => "diag",
            CovarianceKind::Tied => "tied",
            CovarianceKind::Full => "full",
        }
    }
}

impl fmt::Display for CovarianceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CovarianceKind {
    type Err = HmmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spherical" => Ok(CovarianceKind::Spherical),
            "diag" | "diagonal" => Ok(CovarianceKind::Diagonal),
            "tied" => Ok(CovarianceKind::Tied),
            "full" => Ok(CovarianceKind::Full),
            other => Err(HmmError::Unsupported(format!(
                "unknown covariance kind '{other}' (expected spherical, diag, tied or full)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Covariances
// ---------------------------------------------------------------------------

/// Covariance parameters of all states, shaped according to their kind.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Covariances {
    /// Shape `(n_states,)`.
    Spherical(Array1<f64>),
    /// Shape `(n_states, dim)`.
    Diagonal(Array2<f64>),
    /// Shape `(dim, dim)`.
    Tied(Array2<f64>),
    /// Shape `(n_states, dim, dim)`.
    Full(Array3<f64>),
}

impl Covariances {
    /// The kind this value is shaped for.
    pub fn kind(&self) -> CovarianceKind {
        match self {
            Covariances::Spherical(_) => CovarianceKind::Spherical,
            Covariances::Diagonal(_) => CovarianceKind::Diagonal,
            Covariances::Tied(_) => CovarianceKind::Tied,
            Covariances::Full(_) => CovarianceKind::Full,
        }
    }

    /// Shape of the underlying array.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Covariances::Spherical(v) => v.shape().to_vec(),
            Covariances::Diagonal(m) | Covariances::Tied(m) => m.shape().to_vec(),
            Covariances::Full(t) => t.shape().to_vec(),
        }
    }

    /// The dense `dim x dim` covariance matrix of one state.
    pub fn state_matrix(&self, state: usize, dim: usize) -> Array2<f64> {
        match self {
            Covariances::Spherical(v) => Array2::eye(dim) * v[state],
            Covariances::Diagonal(m) => Array2::from_diag(&m.row(state)),
            Covariances::Tied(m) => m.clone(),
            Covariances::Full(t) => t.index_axis(Axis(0), state).to_owned(),
        }
    }
}

/// Distribute a single `dim x dim` covariance template to every state, in
/// the storage layout of `kind`.
///
/// Spherical models take the mean of the template's diagonal; diagonal
/// models take its diagonal; tied models use the template itself; full
/// models give every state a copy.
///
/// # Errors
///
/// Returns an error if the template is not square or `n_states` is zero.
pub fn expand_template(
    template: ArrayView2<'_, f64>,
    kind: CovarianceKind,
    n_states: usize,
) -> Result<Covariances> {
    let (rows, cols) = template.dim();
    if rows != cols || rows == 0 {
        return Err(HmmError::InvalidInput(format!(
            "covariance template must be square and non-empty, got {rows}x{cols}"
        )));
    }
    if n_states == 0 {
        return Err(HmmError::InvalidInput("n_states must be > 0".into()));
    }

    let diag = template.diag();
    let covars = match kind {
        CovarianceKind::Spherical => {
            let mean = diag.sum() / rows as f64;
            Covariances::Spherical(Array1::from_elem(n_states, mean))
        }
        CovarianceKind::Diagonal => {
            let mut m = Array2::zeros((n_states, rows));
            for mut row in m.rows_mut() {
                row.assign(&diag);
            }
            Covariances::Diagonal(m)
        }
        CovarianceKind::Tied => Covariances::Tied(template.to_owned()),
        CovarianceKind::Full => {
            let mut t = Array3::zeros((n_states, rows, rows));
            for mut slab in t.outer_iter_mut() {
                slab.assign(&template);
            }
            Covariances::Full(t)
        }
    };
    Ok(covars)
}

/// Check that `covars` has the shape required by `kind`, `n_states` and
/// `dim`, and that every variance is positive / every matrix is symmetric
/// positive-definite.
pub fn validate_covariances(
    covars: &Covariances,
    kind: CovarianceKind,
    n_states: usize,
    dim: usize,
) -> std::result::Result<(), ValidationError> {
    if covars.kind() != kind {
        return Err(ValidationError::InvalidCovariance(format!(
            "expected '{kind}' covariances, got '{}'",
            covars.kind()
        )));
    }

    let expected: Vec<usize> = match kind {
        CovarianceKind::Spherical => vec![n_states],
        CovarianceKind::Diagonal => vec![n_states, dim],
        CovarianceKind::Tied => vec![dim, dim],
        CovarianceKind::Full => vec![n_states, dim, dim],
    };
    let actual = covars.shape();
    if actual != expected {
        return Err(ValidationError::ShapeMismatch {
            field: "covars",
            expected,
            actual,
        });
    }

    match covars {
        Covariances::Spherical(v) => check_positive(v.iter()),
        Covariances::Diagonal(m) => check_positive(m.iter()),
        Covariances::Tied(m) => check_spd(m.view(), None),
        Covariances::Full(t) => t
            .outer_iter()
            .enumerate()
            .try_for_each(|(s, m)| check_spd(m, Some(s))),
    }
}

fn check_positive<'a>(
    values: impl Iterator<Item = &'a f64>,
) -> std::result::Result<(), ValidationError> {
    for &v in values {
        if !v.is_finite() || v <= 0.0 {
            return Err(ValidationError::InvalidCovariance(format!(
                "variances must be finite and positive, found {v}"
            )));
        }
    }
    Ok(())
}

fn check_spd(
    m: ArrayView2<'_, f64>,
    state: Option<usize>,
) -> std::result::Result<(), ValidationError> {
    let which = match state {
        Some(s) => format!("covariance of state {s}"),
        None => "tied covariance".to_string(),
    };
    if m.iter().any(|v| !v.is_finite()) {
        return Err(ValidationError::InvalidCovariance(format!(
            "{which} contains non-finite values"
        )));
    }
    if !is_symmetric(m) {
        return Err(ValidationError::InvalidCovariance(format!(
            "{which} must be symmetric"
        )));
    }
    if cholesky(m).is_err() {
        return Err(ValidationError::InvalidCovariance(format!(
            "{which} must be positive-definite"
        )));
    }
    Ok(())
}

/// Unbiased sample covariance of the rows of `data` (observations in rows).
///
/// A single observation yields a zero matrix.
pub fn sample_covariance(data: ArrayView2<'_, f64>) -> Array2<f64> {
    let (n, dim) = data.dim();
    let mut cov = Array2::zeros((dim, dim));
    if n == 0 {
        return cov;
    }
    let mean = data.sum_axis(Axis(0)) / n as f64;
    for row in data.rows() {
        let diff = &row - &mean;
        for i in 0..dim {
            for j in 0..dim {
                cov[[i, j]] += diff[i] * diff[j];
            }
        }
    }
    let denom = if n > 1 { (n - 1) as f64 } else { 1.0 };
    cov / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    const TOL: f64 = 1e-12;

    fn template() -> Array2<f64> {
        arr2(&[[2.0, 0.5], [0.5, 4.0]])
    }

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in CovarianceKind::ALL {
            assert_eq!(kind.as_str().parse::<CovarianceKind>().unwrap(), kind);
        }
        assert_eq!("diagonal".parse::<CovarianceKind>().unwrap(), CovarianceKind::Diagonal);
    }

    #[test]
    fn unknown_kind_is_unsupported() {
        let err = "badcvtype".parse::<CovarianceKind>().unwrap_err();
        assert!(matches!(err, HmmError::Unsupported(_)));
    }

    #[test]
    fn expand_template_shapes() {
        let t = template();
        let sph = expand_template(t.view(), CovarianceKind::Spherical, 3).unwrap();
        assert_eq!(sph, Covariances::Spherical(arr1(&[3.0, 3.0, 3.0])));

        let diag = expand_template(t.view(), CovarianceKind::Diagonal, 3).unwrap();
        assert_eq!(diag.shape(), vec![3, 2]);
        assert_eq!(diag.state_matrix(1, 2), arr2(&[[2.0, 0.0], [0.0, 4.0]]));

        let tied = expand_template(t.view(), CovarianceKind::Tied, 3).unwrap();
        assert_eq!(tied, Covariances::Tied(t.clone()));

        let full = expand_template(t.view(), CovarianceKind::Full, 3).unwrap();
        assert_eq!(full.shape(), vec![3, 2, 2]);
        assert_eq!(full.state_matrix(2, 2), t);
    }

    #[test]
    fn expand_template_rejects_non_square() {
        let bad = Array2::<f64>::zeros((2, 3));
        assert!(expand_template(bad.view(), CovarianceKind::Full, 2).is_err());
        assert!(expand_template(template().view(), CovarianceKind::Full, 0).is_err());
    }

    #[test]
    fn every_expanded_template_validates() {
        let t = template();
        for kind in CovarianceKind::ALL {
            let cv = expand_template(t.view(), kind, 4).unwrap();
            validate_covariances(&cv, kind, 4, 2).unwrap();
        }
    }

    #[test]
    fn validate_rejects_wrong_shape_and_kind() {
        let cv = Covariances::Diagonal(Array2::ones((3, 2)));
        assert!(matches!(
            validate_covariances(&cv, CovarianceKind::Diagonal, 5, 2),
            Err(ValidationError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            validate_covariances(&cv, CovarianceKind::Full, 3, 2),
            Err(ValidationError::InvalidCovariance(_))
        ));
    }

    #[test]
    fn validate_rejects_non_positive() {
        let sph = Covariances::Spherical(arr1(&[1.0, 0.0]));
        assert!(validate_covariances(&sph, CovarianceKind::Spherical, 2, 3).is_err());

        let asym = Covariances::Tied(arr2(&[[1.0, 0.2], [0.3, 1.0]]));
        assert!(validate_covariances(&asym, CovarianceKind::Tied, 2, 2).is_err());

        let indefinite = Covariances::Tied(arr2(&[[1.0, 2.0], [2.0, 1.0]]));
        assert!(validate_covariances(&indefinite, CovarianceKind::Tied, 2, 2).is_err());
    }

    #[test]
    fn sample_covariance_matches_hand_computation() {
        let data = arr2(&[[1.0, 2.0], [3.0, 6.0], [5.0, 10.0]]);
        let cov = sample_covariance(data.view());
        // var(x) = 4, var(y) = 16, cov(x, y) = 8
        assert!((cov[[0, 0]] - 4.0).abs() < TOL);
        assert!((cov[[1, 1]] - 16.0).abs() < TOL);
        assert!((cov[[0, 1]] - 8.0).abs() < TOL);
        assert!((cov[[1, 0]] - 8.0).abs() < TOL);
    }
}
