//! Multivariate Gaussian emissions.
//!
//! Every state owns a mean vector; covariances are shared or per-state
//! according to the model's [`CovarianceKind`]. Full and tied covariances
//! are scored through their Cholesky factor, so no inverse or determinant is
//! ever formed explicitly.

use std::f64::consts::PI;

use hmmkit_core::{HmmError, Result, ValidationError};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use tracing::warn;

use super::Emission;
use crate::cluster::Clusterer;
use crate::covariance::{
    expand_template, sample_covariance, validate_covariances, CovarianceKind, Covariances,
};
use crate::linalg::{cholesky, log_det_from_cholesky, solve_lower};
use crate::params::ParamSet;

/// Registry tag of [`GaussianEmission`].
pub const TAG: &str = "gaussian";

/// Posterior mass below which a state is treated as unvisited by the M-step.
const MIN_STATE_MASS: f64 = 1e-10;

/// Lower bound on covariance denominators in the M-step.
const MIN_DENOMINATOR: f64 = 1e-5;

/// Variance floor for covariances seeded from pooled data.
const INIT_MIN_COVAR: f64 = 1e-3;

/// Conjugate priors for MAP re-estimation.
///
/// Means get a normal prior centred on `means_prior` with strength
/// `means_weight`; covariances get an inverse-Wishart style prior with scale
/// `covars_prior` (times the identity for matrix kinds) and strength
/// `covars_weight`. The defaults reduce the M-step to maximum likelihood.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussianPriors {
    pub means_prior: f64,
    pub means_weight: f64,
    pub covars_prior: f64,
    pub covars_weight: f64,
}

impl Default for GaussianPriors {
    fn default() -> Self {
        Self {
            means_prior: 0.0,
            means_weight: 0.0,
            covars_prior: 0.0,
            covars_weight: 1.0,
        }
    }
}

/// Gaussian emission parameters for every state.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussianEmission {
    kind: CovarianceKind,
    n_states: usize,
    dim: usize,
    /// Shape `(n_states, dim)`.
    means: Array2<f64>,
    covars: Covariances,
    priors: GaussianPriors,
}

/// Posterior-weighted moments of the observations, per state.
#[derive(Debug, Clone)]
pub struct GaussianStats {
    /// Total posterior mass, shape `(n_states,)`.
    pub post: Array1<f64>,
    /// `sum_t gamma[t, s] * x_t`, shape `(n_states, dim)`.
    pub obs: Array2<f64>,
    /// `sum_t gamma[t, s] * x_t^2` elementwise, shape `(n_states, dim)`.
    pub obs_sq: Array2<f64>,
    /// `sum_t gamma[t, s] * x_t x_t^T`, shape `(n_states, dim, dim)`; only
    /// collected for tied and full covariances.
    pub obs_outer: Option<Array3<f64>>,
}

impl GaussianEmission {
    /// Zero means and identity covariances laid out for `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if `n_states` or `dim` is zero.
    pub fn new(n_states: usize, dim: usize, kind: CovarianceKind) -> Result<Self> {
        if n_states == 0 {
            return Err(HmmError::InvalidInput("n_states must be > 0".into()));
        }
        if dim == 0 {
            return Err(HmmError::InvalidInput("dim must be > 0".into()));
        }
        let covars = expand_template(Array2::<f64>::eye(dim).view(), kind, n_states)?;
        Ok(Self {
            kind,
            n_states,
            dim,
            means: Array2::zeros((n_states, dim)),
            covars,
            priors: GaussianPriors::default(),
        })
    }

    pub fn with_priors(mut self, priors: GaussianPriors) -> Self {
        self.priors = priors;
        self
    }

    pub fn covariance_kind(&self) -> CovarianceKind {
        self.kind
    }

    pub fn means(&self) -> &Array2<f64> {
        &self.means
    }

    pub fn covars(&self) -> &Covariances {
        &self.covars
    }

    pub fn priors(&self) -> &GaussianPriors {
        &self.priors
    }

    pub fn set_priors(&mut self, priors: GaussianPriors) {
        self.priors = priors;
    }

    /// Replace the means.
    ///
    /// # Errors
    ///
    /// Fails if `means` is not `(n_states, dim)` or holds a non-finite
    /// value. The previous means are kept on failure.
    pub fn set_means(&mut self, means: Array2<f64>) -> Result<()> {
        self.check_means(&means)?;
        self.means = means;
        Ok(())
    }

    fn check_means(&self, means: &Array2<f64>) -> Result<()> {
        let expected = [self.n_states, self.dim];
        if means.shape() != expected {
            return Err(ValidationError::ShapeMismatch {
                field: "means",
                expected: expected.to_vec(),
                actual: means.shape().to_vec(),
            }
            .into());
        }
        if means.iter().any(|v| !v.is_finite()) {
            return Err(ValidationError::NonFinite { field: "means" }.into());
        }
        Ok(())
    }

    /// Replace the covariances.
    ///
    /// # Errors
    ///
    /// Fails if `covars` is laid out for another kind, has the wrong shape,
    /// or is not positive-definite. The previous covariances are kept on
    /// failure.
    pub fn set_covars(&mut self, covars: Covariances) -> Result<()> {
        validate_covariances(&covars, self.kind, self.n_states, self.dim)?;
        self.covars = covars;
        Ok(())
    }

    fn check_obs(&self, obs: ArrayView2<'_, f64>) -> Result<()> {
        if obs.ncols() != self.dim {
            return Err(HmmError::InvalidInput(format!(
                "observations have {} columns, model dimension is {}",
                obs.ncols(),
                self.dim
            )));
        }
        Ok(())
    }

    fn mstep_means(&self, stats: &GaussianStats) -> Array2<f64> {
        let GaussianPriors {
            means_prior,
            means_weight,
            ..
        } = self.priors;
        let mut means = self.means.clone();
        for s in 0..self.n_states {
            let mass = stats.post[s];
            if mass < MIN_STATE_MASS {
                warn!(state = s, "state received no posterior mass; keeping its mean");
                continue;
            }
            let denom = means_weight + mass;
            for k in 0..self.dim {
                means[[s, k]] = (means_weight * means_prior + stats.obs[[s, k]]) / denom;
            }
        }
        means
    }

    fn mstep_covars(
        &self,
        stats: &GaussianStats,
        means: &Array2<f64>,
        min_covar: f64,
    ) -> Covariances {
        match self.kind {
            CovarianceKind::Spherical | CovarianceKind::Diagonal => {
                let variances = self.diagonal_variances(stats, means);
                match &self.covars {
                    Covariances::Spherical(old) => {
                        let mut v = old.clone();
                        for s in 0..self.n_states {
                            if let Some(row) = &variances[s] {
                                let mean = row.sum() / self.dim as f64;
                                v[s] = mean.max(min_covar);
                            }
                        }
                        Covariances::Spherical(v)
                    }
                    Covariances::Diagonal(old) => {
                        let mut v = old.clone();
                        for s in 0..self.n_states {
                            if let Some(row) = &variances[s] {
                                v.row_mut(s).assign(&row.mapv(|x| x.max(min_covar)));
                            }
                        }
                        Covariances::Diagonal(v)
                    }
                    other => other.clone(),
                }
            }
            CovarianceKind::Tied => {
                let total: f64 = stats.post.sum();
                let Covariances::Tied(old) = &self.covars else {
                    return self.covars.clone();
                };
                if total < MIN_STATE_MASS {
                    warn!("no posterior mass at all; keeping the tied covariance");
                    return self.covars.clone();
                }
                let mut num = Array2::<f64>::eye(self.dim) * self.priors.covars_prior;
                for s in 0..self.n_states {
                    num += &self.scatter(stats, means, s);
                }
                let cv_weight = (self.priors.covars_weight - self.dim as f64).max(0.0);
                let denom = (cv_weight + total).max(MIN_DENOMINATOR);
                let cov = floor_matrix(num / denom, min_covar);
                if cov.iter().any(|v| !v.is_finite()) {
                    return Covariances::Tied(old.clone());
                }
                Covariances::Tied(cov)
            }
            CovarianceKind::Full => {
                let Covariances::Full(old) = &self.covars else {
                    return self.covars.clone();
                };
                let mut covs = old.clone();
                let cv_weight = (self.priors.covars_weight - self.dim as f64).max(0.0);
                for s in 0..self.n_states {
                    let mass = stats.post[s];
                    if mass < MIN_STATE_MASS {
                        warn!(state = s, "state received no posterior mass; keeping its covariance");
                        continue;
                    }
                    let num = Array2::<f64>::eye(self.dim) * self.priors.covars_prior
                        + self.scatter(stats, means, s);
                    let denom = (cv_weight + mass).max(MIN_DENOMINATOR);
                    covs.index_axis_mut(Axis(0), s)
                        .assign(&floor_matrix(num / denom, min_covar));
                }
                Covariances::Full(covs)
            }
        }
    }

    /// Per-state re-estimated variances along each dimension, before the
    /// floor. `None` for states without posterior mass.
    fn diagonal_variances(
        &self,
        stats: &GaussianStats,
        means: &Array2<f64>,
    ) -> Vec<Option<Array1<f64>>> {
        let p = &self.priors;
        let cv_weight = (p.covars_weight - 1.0).max(0.0);
        (0..self.n_states)
            .map(|s| {
                let mass = stats.post[s];
                if mass < MIN_STATE_MASS {
                    warn!(state = s, "state received no posterior mass; keeping its variances");
                    return None;
                }
                let denom = (cv_weight + mass).max(MIN_DENOMINATOR);
                let row = Array1::from_shape_fn(self.dim, |k| {
                    let mu = means[[s, k]];
                    let diff = mu - p.means_prior;
                    let num = p.covars_prior
                        + p.means_weight * diff * diff
                        + stats.obs_sq[[s, k]]
                        - 2.0 * mu * stats.obs[[s, k]]
                        + mu * mu * mass;
                    num / denom
                });
                Some(row)
            })
            .collect()
    }

    /// Posterior-weighted scatter of state `s` around `means[s]`, including
    /// the mean-prior term.
    fn scatter(&self, stats: &GaussianStats, means: &Array2<f64>, s: usize) -> Array2<f64> {
        let p = &self.priors;
        let mass = stats.post[s];
        let mu = means.row(s);
        let d = self.dim;
        let mut out = Array2::<f64>::zeros((d, d));
        let Some(outer) = stats.obs_outer.as_ref() else {
            return out;
        };
        for i in 0..d {
            for j in 0..d {
                let di = mu[i] - p.means_prior;
                let dj = mu[j] - p.means_prior;
                out[[i, j]] = p.means_weight * di * dj + outer[[s, i, j]]
                    - stats.obs[[s, i]] * mu[j]
                    - mu[i] * stats.obs[[s, j]]
                    + mass * mu[i] * mu[j];
            }
        }
        out
    }
}

/// Symmetrise, floor the diagonal at `min_covar`, and add `min_covar * I`
/// if the result is still not positive-definite.
fn floor_matrix(m: Array2<f64>, min_covar: f64) -> Array2<f64> {
    let mut m = (&m + &m.t()) * 0.5;
    for v in m.diag_mut() {
        *v = v.max(min_covar);
    }
    if cholesky(m.view()).is_err() {
        m += &(Array2::<f64>::eye(m.nrows()) * min_covar);
    }
    m
}

fn gaussian_log_density(mahalanobis_sq: f64, log_det: f64, dim: usize) -> f64 {
    -0.5 * (dim as f64 * (2.0 * PI).ln() + log_det + mahalanobis_sq)
}

fn cholesky_log_density(
    obs: ArrayView2<'_, f64>,
    mean: ArrayView1<'_, f64>,
    l: ArrayView2<'_, f64>,
    mut out: ArrayViewMut1<'_, f64>,
) {
    let log_det = log_det_from_cholesky(l);
    for (t, x) in obs.rows().into_iter().enumerate() {
        let diff = &x - &mean;
        let z = solve_lower(l, diff.view());
        out[t] = gaussian_log_density(z.dot(&z), log_det, mean.len());
    }
}

impl Emission for GaussianEmission {
    type Stats = GaussianStats;

    fn emission_type(&self) -> &'static str {
        TAG
    }

    fn n_states(&self) -> usize {
        self.n_states
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn compute_log_likelihood(&self, obs: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.check_obs(obs)?;
        let d = self.dim;
        let mut ll = Array2::<f64>::zeros((obs.nrows(), self.n_states));

        match &self.covars {
            Covariances::Spherical(v) => {
                for s in 0..self.n_states {
                    let mean = self.means.row(s);
                    let log_det = d as f64 * v[s].ln();
                    for (t, x) in obs.rows().into_iter().enumerate() {
                        let sq: f64 = x.iter().zip(mean).map(|(a, m)| (a - m) * (a - m)).sum();
                        ll[[t, s]] = gaussian_log_density(sq / v[s], log_det, d);
                    }
                }
            }
            Covariances::Diagonal(v) => {
                for s in 0..self.n_states {
                    let mean = self.means.row(s);
                    let var = v.row(s);
                    let log_det: f64 = var.iter().map(|x| x.ln()).sum();
                    for (t, x) in obs.rows().into_iter().enumerate() {
                        let maha: f64 = (0..d)
                            .map(|k| (x[k] - mean[k]).powi(2) / var[k])
                            .sum();
                        ll[[t, s]] = gaussian_log_density(maha, log_det, d);
                    }
                }
            }
            Covariances::Tied(cov) => {
                let l = cholesky(cov.view())?;
                for s in 0..self.n_states {
                    cholesky_log_density(obs, self.means.row(s), l.view(), ll.column_mut(s));
                }
            }
            Covariances::Full(covs) => {
                for (s, cov) in covs.outer_iter().enumerate() {
                    let l = cholesky(cov)?;
                    cholesky_log_density(obs, self.means.row(s), l.view(), ll.column_mut(s));
                }
            }
        }
        Ok(ll)
    }

    fn sample_from_state(&self, state: usize, rng: &mut dyn RngCore) -> Result<Array1<f64>> {
        if state >= self.n_states {
            return Err(HmmError::InvalidInput(format!(
                "state {state} out of range for {} states",
                self.n_states
            )));
        }
        let l = cholesky(self.covars.state_matrix(state, self.dim).view())?;
        let z: Array1<f64> = Array1::from_shape_fn(self.dim, |_| rng.sample(StandardNormal));
        Ok(&self.means.row(state) + &l.dot(&z))
    }

    fn initialize(
        &mut self,
        obs: ArrayView2<'_, f64>,
        params: ParamSet,
        clusterer: &dyn Clusterer,
    ) -> Result<()> {
        self.check_obs(obs)?;
        let means = if params.means {
            let centroids = clusterer.cluster(obs, self.n_states)?.centroids;
            self.check_means(&centroids)?;
            Some(centroids)
        } else {
            None
        };
        let covars = if params.covars {
            if obs.nrows() < 2 {
                return Err(HmmError::InvalidInput(
                    "at least two observations are needed to estimate covariances".into(),
                ));
            }
            // A constant feature has zero sample variance.
            let cv = floor_matrix(sample_covariance(obs), INIT_MIN_COVAR);
            let covars = expand_template(cv.view(), self.kind, self.n_states)?;
            validate_covariances(&covars, self.kind, self.n_states, self.dim)?;
            Some(covars)
        } else {
            None
        };

        if let Some(means) = means {
            self.means = means;
        }
        if let Some(covars) = covars {
            self.covars = covars;
        }
        Ok(())
    }

    fn new_stats(&self) -> GaussianStats {
        let (n, d) = (self.n_states, self.dim);
        let obs_outer = match self.kind {
            CovarianceKind::Tied | CovarianceKind::Full => Some(Array3::zeros((n, d, d))),
            CovarianceKind::Spherical | CovarianceKind::Diagonal => None,
        };
        GaussianStats {
            post: Array1::zeros(n),
            obs: Array2::zeros((n, d)),
            obs_sq: Array2::zeros((n, d)),
            obs_outer,
        }
    }

    fn accumulate(
        &self,
        stats: &mut GaussianStats,
        obs: ArrayView2<'_, f64>,
        posteriors: ArrayView2<'_, f64>,
    ) {
        stats.post += &posteriors.sum_axis(Axis(0));
        stats.obs += &posteriors.t().dot(&obs);
        stats.obs_sq += &posteriors.t().dot(&obs.mapv(|x| x * x));

        if let Some(outer) = stats.obs_outer.as_mut() {
            for (x, gamma) in obs.rows().into_iter().zip(posteriors.rows()) {
                for (s, &w) in gamma.iter().enumerate() {
                    if w == 0.0 {
                        continue;
                    }
                    for i in 0..self.dim {
                        for j in 0..self.dim {
                            outer[[s, i, j]] += w * x[i] * x[j];
                        }
                    }
                }
            }
        }
    }

    fn merge_stats(&self, into: &mut GaussianStats, other: GaussianStats) {
        into.post += &other.post;
        into.obs += &other.obs;
        into.obs_sq += &other.obs_sq;
        if let (Some(a), Some(b)) = (into.obs_outer.as_mut(), other.obs_outer.as_ref()) {
            *a += b;
        }
    }

    fn maximization_step(
        &mut self,
        stats: &GaussianStats,
        params: ParamSet,
        min_covar: f64,
    ) -> Result<()> {
        let means = if params.means {
            self.mstep_means(stats)
        } else {
            self.means.clone()
        };
        let covars = if params.covars {
            Some(self.mstep_covars(stats, &means, min_covar))
        } else {
            None
        };

        if params.means {
            self.set_means(means)?;
        }
        if let Some(covars) = covars {
            self.set_covars(covars)?;
        }
        Ok(())
    }
}
