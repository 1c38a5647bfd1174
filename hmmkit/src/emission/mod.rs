//! Emission distributions attached to hidden states.
//!
//! An [`Emission`] knows how to score observations against every state, draw
//! an observation from one state, and re-estimate itself from posterior
//! weighted sufficient statistics. Emission types are chosen at runtime by
//! tag through [`build_emission`], which looks the tag up in a fixed
//! registry of constructors.

pub mod gaussian;

pub use gaussian::{GaussianEmission, GaussianPriors, GaussianStats};

use hmmkit_core::{HmmError, Result};
use ndarray::{Array1, Array2, ArrayView2};
use rand::RngCore;

use crate::cluster::Clusterer;
use crate::covariance::CovarianceKind;
use crate::params::ParamSet;

/// Capability set every emission type provides.
///
/// Sufficient statistics are accumulated per sequence into a
/// [`Emission::Stats`] value, merged across sequences in order, and handed
/// to [`Emission::maximization_step`].
pub trait Emission: Send + Sync {
    /// Posterior-weighted sufficient statistics.
    type Stats: Send;

    /// Registry tag of this emission type.
    fn emission_type(&self) -> &'static str;

    fn n_states(&self) -> usize;

    /// Dimensionality of one observation.
    fn dim(&self) -> usize;

    /// Log-likelihood of every observation (row of `obs`) under every state,
    /// shape `(n_obs, n_states)`.
    fn compute_log_likelihood(&self, obs: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// Draw one observation from the emission of `state`.
    fn sample_from_state(&self, state: usize, rng: &mut dyn RngCore) -> Result<Array1<f64>>;

    /// Seed the selected emission parameters from pooled observations.
    fn initialize(
        &mut self,
        obs: ArrayView2<'_, f64>,
        params: ParamSet,
        clusterer: &dyn Clusterer,
    ) -> Result<()>;

    /// Empty statistics ready for [`Emission::accumulate`].
    fn new_stats(&self) -> Self::Stats;

    /// Add one sequence's contribution, given its state posteriors.
    fn accumulate(
        &self,
        stats: &mut Self::Stats,
        obs: ArrayView2<'_, f64>,
        posteriors: ArrayView2<'_, f64>,
    );

    /// Fold `other` into `into`.
    fn merge_stats(&self, into: &mut Self::Stats, other: Self::Stats);

    /// Re-estimate the selected parameters. Variances are floored at
    /// `min_covar`.
    fn maximization_step(
        &mut self,
        stats: &Self::Stats,
        params: ParamSet,
        min_covar: f64,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shape of the emission to build from a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmissionSpec {
    pub n_states: usize,
    pub dim: usize,
    pub covariance_kind: CovarianceKind,
}

type Constructor = fn(&EmissionSpec) -> Result<EmissionModel>;

const REGISTRY: &[(&str, Constructor)] = &[(gaussian::TAG, build_gaussian)];

fn build_gaussian(spec: &EmissionSpec) -> Result<EmissionModel> {
    GaussianEmission::new(spec.n_states, spec.dim, spec.covariance_kind)
        .map(EmissionModel::Gaussian)
}

/// Tags accepted by [`build_emission`].
pub fn registered_tags() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(tag, _)| *tag)
}

/// Build the emission registered under `tag`.
///
/// # Errors
///
/// Returns [`HmmError::Unsupported`] for an unknown tag, or whatever the
/// constructor reports for an unusable shape.
pub fn build_emission(tag: &str, spec: &EmissionSpec) -> Result<EmissionModel> {
    let (_, build) = REGISTRY
        .iter()
        .find(|(name, _)| *name == tag)
        .ok_or_else(|| {
            let known: Vec<&str> = registered_tags().collect();
            HmmError::Unsupported(format!(
                "unknown emission type '{tag}' (known: {})",
                known.join(", ")
            ))
        })?;
    build(spec)
}

/// An emission chosen at runtime.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EmissionModel {
    Gaussian(GaussianEmission),
}

/// Statistics matching an [`EmissionModel`] variant.
#[derive(Debug, Clone)]
pub enum EmissionStats {
    Gaussian(GaussianStats),
}

impl Emission for EmissionModel {
    type Stats = EmissionStats;

    fn emission_type(&self) -> &'static str {
        match self {
            EmissionModel::Gaussian(e) => e.emission_type(),
        }
    }

    fn n_states(&self) -> usize {
        match self {
            EmissionModel::Gaussian(e) => e.n_states(),
        }
    }

    fn dim(&self) -> usize {
        match self {
            EmissionModel::Gaussian(e) => e.dim(),
        }
    }

    fn compute_log_likelihood(&self, obs: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        match self {
            EmissionModel::Gaussian(e) => e.compute_log_likelihood(obs),
        }
    }

    fn sample_from_state(&self, state: usize, rng: &mut dyn RngCore) -> Result<Array1<f64>> {
        match self {
            EmissionModel::Gaussian(e) => e.sample_from_state(state, rng),
        }
    }

    fn initialize(
        &mut self,
        obs: ArrayView2<'_, f64>,
        params: ParamSet,
        clusterer: &dyn Clusterer,
    ) -> Result<()> {
        match self {
            EmissionModel::Gaussian(e) => e.initialize(obs, params, clusterer),
        }
    }

    fn new_stats(&self) -> EmissionStats {
        match self {
            EmissionModel::Gaussian(e) => EmissionStats::Gaussian(e.new_stats()),
        }
    }

    fn accumulate(
        &self,
        stats: &mut EmissionStats,
        obs: ArrayView2<'_, f64>,
        posteriors: ArrayView2<'_, f64>,
    ) {
        match (self, stats) {
            (EmissionModel::Gaussian(e), EmissionStats::Gaussian(s)) => {
                e.accumulate(s, obs, posteriors)
            }
        }
    }

    fn merge_stats(&self, into: &mut EmissionStats, other: EmissionStats) {
        match (self, into, other) {
            (EmissionModel::Gaussian(e), EmissionStats::Gaussian(a), EmissionStats::Gaussian(b)) => {
                e.merge_stats(a, b)
            }
        }
    }

    fn maximization_step(
        &mut self,
        stats: &EmissionStats,
        params: ParamSet,
        min_covar: f64,
    ) -> Result<()> {
        match (self, stats) {
            (EmissionModel::Gaussian(e), EmissionStats::Gaussian(s)) => {
                e.maximization_step(s, params, min_covar)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> EmissionSpec {
        EmissionSpec {
            n_states: 3,
            dim: 2,
            covariance_kind: CovarianceKind::Full,
        }
    }

    #[test]
    fn gaussian_is_registered() {
        let model = build_emission("gaussian", &spec()).unwrap();
        assert_eq!(model.emission_type(), "gaussian");
        assert_eq!(model.n_states(), 3);
        assert_eq!(model.dim(), 2);
        assert_eq!(registered_tags().collect::<Vec<_>>(), vec!["gaussian"]);
    }

    #[test]
    fn unknown_tags_are_unsupported() {
        for tag in ["gmm", "multinomial", ""] {
            let err = build_emission(tag, &spec()).unwrap_err();
            assert!(matches!(err, HmmError::Unsupported(_)), "{tag}: {err}");
        }
    }

    #[test]
    fn dispatch_matches_the_concrete_type() {
        let model = build_emission("gaussian", &spec()).unwrap();
        let EmissionModel::Gaussian(concrete) = &model;
        let obs = ndarray::arr2(&[[0.0, 1.0], [2.0, -1.0]]);
        assert_eq!(
            model.compute_log_likelihood(obs.view()).unwrap(),
            concrete.compute_log_likelihood(obs.view()).unwrap()
        );
    }
}
