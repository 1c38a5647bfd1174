//! The hidden Markov model: chain parameters plus an emission.
//!
//! Start and transition probabilities are stored as natural logarithms and
//! converted on access. Every setter validates the complete value before
//! replacing the stored one, so a rejected value leaves the model untouched.
//!
//! # Quick start
//!
//! ```
//! use hmmkit::{CovarianceKind, GaussianHmm};
//! use ndarray::arr2;
//!
//! let model = GaussianHmm::gaussian(2, 1, CovarianceKind::Diagonal)
//!     .unwrap()
//!     .with_transmat(&arr2(&[[0.9, 0.1], [0.2, 0.8]]))
//!     .unwrap()
//!     .with_means(arr2(&[[0.0], [5.0]]))
//!     .unwrap();
//!
//! let obs = arr2(&[[0.1], [-0.3], [5.2], [4.9]]);
//! let decoded = model.decode(&obs).unwrap();
//! assert_eq!(decoded.states, vec![0, 0, 1, 1]);
//! assert!(model.evaluate(&obs).unwrap().log_likelihood < 0.0);
//! ```

use hmmkit_core::{HmmError, Result, Summarizable, ValidationError};
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Data, Ix1, Ix2};
use rand::{Rng, RngCore};

use crate::cluster::Clusterer;
use crate::covariance::{CovarianceKind, Covariances};
use crate::emission::{build_emission, Emission, EmissionModel, EmissionSpec, GaussianEmission};
use crate::lattice::{self, Combine};
use crate::params::ParamSet;
use crate::prune::PruneConfig;

/// Tolerance on probability sums accepted by the setters.
const SUM_TOL: f64 = 1e-6;

/// Hidden Markov model over an emission type `E`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Hmm<E> {
    n_states: usize,
    log_startprob: Array1<f64>,
    log_transmat: Array2<f64>,
    emission: E,
    /// Dirichlet concentration for start probabilities (1.0: no prior).
    startprob_prior: f64,
    /// Dirichlet concentration for each transition row (1.0: no prior).
    transmat_prior: f64,
}

/// HMM with Gaussian emissions.
pub type GaussianHmm = Hmm<GaussianEmission>;

/// Result of [`Hmm::evaluate`].
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Total log-likelihood of the sequence.
    pub log_likelihood: f64,
    /// State posteriors, shape `(n_obs, n_states)`; rows sum to one.
    pub posteriors: Array2<f64>,
}

/// Result of [`Hmm::decode`].
#[derive(Debug, Clone)]
pub struct Decoding {
    /// Log-sum-exp of the final Viterbi lattice frame.
    pub log_prob: f64,
    /// Joint log-probability of `states` and the observations.
    pub best_path_log_prob: f64,
    /// Most probable state for each observation.
    pub states: Vec<usize>,
}

/// Forward and backward lattices of one sequence, with the quantities the
/// E-step derives from them.
#[derive(Debug, Clone)]
pub(crate) struct ForwardBackward {
    pub frame_log_lik: Array2<f64>,
    pub forward: Array2<f64>,
    pub backward: Array2<f64>,
    pub log_likelihood: f64,
}

impl GaussianHmm {
    /// Gaussian HMM with uniform start and transition probabilities, zero
    /// means and identity covariances.
    pub fn gaussian(n_states: usize, dim: usize, kind: CovarianceKind) -> Result<Self> {
        Ok(Self::new(GaussianEmission::new(n_states, dim, kind)?))
    }

    /// Builder form of [`GaussianEmission::set_means`].
    pub fn with_means(mut self, means: Array2<f64>) -> Result<Self> {
        self.emission.set_means(means)?;
        Ok(self)
    }

    /// Builder form of [`GaussianEmission::set_covars`].
    pub fn with_covars(mut self, covars: Covariances) -> Result<Self> {
        self.emission.set_covars(covars)?;
        Ok(self)
    }

    pub fn means(&self) -> &Array2<f64> {
        self.emission.means()
    }

    pub fn set_means(&mut self, means: Array2<f64>) -> Result<()> {
        self.emission.set_means(means)
    }

    pub fn covars(&self) -> &Covariances {
        self.emission.covars()
    }

    pub fn set_covars(&mut self, covars: Covariances) -> Result<()> {
        self.emission.set_covars(covars)
    }
}

impl Hmm<EmissionModel> {
    /// Build a model whose emission type is chosen by registry tag.
    ///
    /// # Errors
    ///
    /// Returns [`HmmError::Unsupported`] for an unknown emission tag or
    /// covariance kind.
    pub fn from_tag(tag: &str, n_states: usize, dim: usize, covariance_kind: &str) -> Result<Self> {
        let spec = EmissionSpec {
            n_states,
            dim,
            covariance_kind: covariance_kind.parse()?,
        };
        Ok(Self::new(build_emission(tag, &spec)?))
    }
}

impl<E: Emission> Hmm<E> {
    /// Wrap `emission` with uniform start and transition probabilities.
    pub fn new(emission: E) -> Self {
        let n = emission.n_states();
        let log_uniform = -(n as f64).ln();
        Self {
            n_states: n,
            log_startprob: Array1::from_elem(n, log_uniform),
            log_transmat: Array2::from_elem((n, n), log_uniform),
            emission,
            startprob_prior: 1.0,
            transmat_prior: 1.0,
        }
    }

    /// Builder form of [`Hmm::set_startprob`].
    pub fn with_startprob<S: Data<Elem = f64>>(mut self, startprob: &ArrayBase<S, Ix1>) -> Result<Self> {
        self.set_startprob(startprob)?;
        Ok(self)
    }

    /// Builder form of [`Hmm::set_transmat`].
    pub fn with_transmat<S: Data<Elem = f64>>(mut self, transmat: &ArrayBase<S, Ix2>) -> Result<Self> {
        self.set_transmat(transmat)?;
        Ok(self)
    }

    /// Dirichlet priors on start and transition probabilities for MAP
    /// training. A concentration of 1.0 means no prior.
    pub fn with_chain_priors(mut self, startprob_prior: f64, transmat_prior: f64) -> Self {
        self.startprob_prior = startprob_prior;
        self.transmat_prior = transmat_prior;
        self
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn emission(&self) -> &E {
        &self.emission
    }

    pub fn emission_mut(&mut self) -> &mut E {
        &mut self.emission
    }

    /// Start probabilities in linear space.
    pub fn startprob(&self) -> Array1<f64> {
        self.log_startprob.mapv(f64::exp)
    }

    /// Transition matrix in linear space; row `i` holds `P(next | i)`.
    pub fn transmat(&self) -> Array2<f64> {
        self.log_transmat.mapv(f64::exp)
    }

    pub fn log_startprob(&self) -> &Array1<f64> {
        &self.log_startprob
    }

    pub fn log_transmat(&self) -> &Array2<f64> {
        &self.log_transmat
    }

    pub(crate) fn startprob_prior(&self) -> f64 {
        self.startprob_prior
    }

    pub(crate) fn transmat_prior(&self) -> f64 {
        self.transmat_prior
    }

    /// Replace the start probabilities.
    ///
    /// Checks, in order: length, finiteness, sign, sum. The value is
    /// renormalised before its logarithm is stored.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] naming the first broken invariant; the
    /// previous start probabilities are kept.
    pub fn set_startprob<S: Data<Elem = f64>>(&mut self, startprob: &ArrayBase<S, Ix1>) -> Result<()> {
        if startprob.len() != self.n_states {
            return Err(ValidationError::LengthMismatch {
                field: "startprob",
                expected: self.n_states,
                actual: startprob.len(),
            }
            .into());
        }
        let normalized = check_distribution("startprob", None, startprob.iter().copied())?;
        self.log_startprob = normalized.mapv(f64::ln);
        Ok(())
    }

    /// Replace the transition matrix.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the matrix is not
    /// `n_states x n_states` or any row is not a probability distribution;
    /// the previous matrix is kept.
    pub fn set_transmat<S: Data<Elem = f64>>(&mut self, transmat: &ArrayBase<S, Ix2>) -> Result<()> {
        let expected = [self.n_states, self.n_states];
        if transmat.shape() != expected {
            return Err(ValidationError::ShapeMismatch {
                field: "transmat",
                expected: expected.to_vec(),
                actual: transmat.shape().to_vec(),
            }
            .into());
        }
        let mut log_transmat = Array2::<f64>::zeros((self.n_states, self.n_states));
        for (i, row) in transmat.rows().into_iter().enumerate() {
            let normalized = check_distribution("transmat", Some(i), row.iter().copied())?;
            log_transmat.row_mut(i).assign(&normalized.mapv(f64::ln));
        }
        self.log_transmat = log_transmat;
        Ok(())
    }

    /// Emission log-likelihood of every observation under every state.
    pub fn frame_log_likelihood<S: Data<Elem = f64>>(&self, obs: &ArrayBase<S, Ix2>) -> Result<Array2<f64>> {
        if obs.nrows() == 0 {
            return Err(HmmError::InvalidInput("empty observation sequence".into()));
        }
        self.emission.compute_log_likelihood(obs.view())
    }

    /// Total log-likelihood and state posteriors, without pruning in the
    /// forward pass.
    pub fn evaluate<S: Data<Elem = f64>>(&self, obs: &ArrayBase<S, Ix2>) -> Result<Evaluation> {
        self.evaluate_with(obs, &PruneConfig::default())
    }

    /// [`Hmm::evaluate`] with explicit pruning limits.
    pub fn evaluate_with<S: Data<Elem = f64>>(
        &self,
        obs: &ArrayBase<S, Ix2>,
        prune: &PruneConfig,
    ) -> Result<Evaluation> {
        prune.validate()?;
        let frame = self.frame_log_likelihood(obs)?;
        Ok(self.evaluate_frames(frame, prune))
    }

    /// Evaluate a precomputed frame log-likelihood matrix.
    pub fn evaluate_frames(&self, frame_log_lik: Array2<f64>, prune: &PruneConfig) -> Evaluation {
        let fb = self.forward_backward(frame_log_lik, prune);
        let posteriors = lattice::posteriors(fb.forward.view(), fb.backward.view(), fb.log_likelihood);
        Evaluation {
            log_likelihood: fb.log_likelihood,
            posteriors,
        }
    }

    /// Total log-likelihood only (forward pass, no posteriors).
    pub fn log_density<S: Data<Elem = f64>>(&self, obs: &ArrayBase<S, Ix2>) -> Result<f64> {
        self.log_density_with(obs, &PruneConfig::default())
    }

    pub fn log_density_with<S: Data<Elem = f64>>(
        &self,
        obs: &ArrayBase<S, Ix2>,
        prune: &PruneConfig,
    ) -> Result<f64> {
        prune.validate()?;
        let frame = self.frame_log_likelihood(obs)?;
        let fwd = lattice::forward(
            frame.view(),
            self.log_startprob.view(),
            self.log_transmat.view(),
            prune.max_rank,
            prune.beam_log_prob,
            Combine::LogSumExp,
        );
        Ok(fwd.log_prob)
    }

    /// Most probable state sequence (Viterbi).
    pub fn decode<S: Data<Elem = f64>>(&self, obs: &ArrayBase<S, Ix2>) -> Result<Decoding> {
        self.decode_with(obs, &PruneConfig::default())
    }

    pub fn decode_with<S: Data<Elem = f64>>(
        &self,
        obs: &ArrayBase<S, Ix2>,
        prune: &PruneConfig,
    ) -> Result<Decoding> {
        prune.validate()?;
        let frame = self.frame_log_likelihood(obs)?;
        Ok(self.decode_frames(frame.view(), prune))
    }

    /// Viterbi decoding of a precomputed frame log-likelihood matrix.
    pub fn decode_frames(&self, frame_log_lik: ArrayView2<'_, f64>, prune: &PruneConfig) -> Decoding {
        let path = lattice::viterbi(
            frame_log_lik,
            self.log_startprob.view(),
            self.log_transmat.view(),
            prune.max_rank,
            prune.beam_log_prob,
        );
        Decoding {
            log_prob: path.log_prob,
            best_path_log_prob: path.best_path_log_prob,
            states: path.states,
        }
    }

    /// Simulate `n` steps of the chain, drawing one observation per step.
    ///
    /// Returns the observations, shape `(n, dim)`, and the hidden states
    /// that produced them.
    pub fn sample(&self, n: usize, rng: &mut dyn RngCore) -> Result<(Array2<f64>, Vec<usize>)> {
        let startprob = self.startprob();
        let transmat = self.transmat();
        let mut obs = Array2::<f64>::zeros((n, self.emission.dim()));
        let mut states = Vec::with_capacity(n);

        let mut state = 0;
        for t in 0..n {
            let u: f64 = rng.gen();
            state = if t == 0 {
                draw_index(startprob.iter().copied(), u)
            } else {
                draw_index(transmat.row(state).iter().copied(), u)
            };
            obs.row_mut(t).assign(&self.emission.sample_from_state(state, rng)?);
            states.push(state);
        }
        Ok((obs, states))
    }

    /// Seed the selected parameters from data.
    ///
    /// Start and transition probabilities are reset to uniform; emission
    /// parameters are seeded from the pooled observations of all
    /// `sequences` through `clusterer`.
    ///
    /// # Errors
    ///
    /// Fails on mismatched or too few observations, or if clustering
    /// fails. Nothing is changed on failure.
    pub fn initialize<S: Data<Elem = f64>>(
        &mut self,
        sequences: &[ArrayBase<S, Ix2>],
        params: ParamSet,
        clusterer: &dyn Clusterer,
    ) -> Result<()> {
        let pooled = pool(sequences, self.emission.dim())?;
        // Emission seeding is the only step that can fail; it leaves the
        // emission untouched on error.
        self.emission.initialize(pooled.view(), params, clusterer)?;
        let log_uniform = -(self.n_states as f64).ln();
        if params.startprob {
            self.log_startprob.fill(log_uniform);
        }
        if params.transmat {
            self.log_transmat.fill(log_uniform);
        }
        Ok(())
    }

    pub(crate) fn forward_backward(&self, frame_log_lik: Array2<f64>, prune: &PruneConfig) -> ForwardBackward {
        let fwd = lattice::forward(
            frame_log_lik.view(),
            self.log_startprob.view(),
            self.log_transmat.view(),
            prune.max_rank,
            prune.beam_log_prob,
            Combine::LogSumExp,
        );
        let backward = lattice::backward(
            frame_log_lik.view(),
            self.log_transmat.view(),
            fwd.lattice.view(),
            prune.backward_beam_log_prob,
        );
        ForwardBackward {
            frame_log_lik,
            forward: fwd.lattice,
            backward,
            log_likelihood: fwd.log_prob,
        }
    }
}

impl<E: Emission> Summarizable for Hmm<E> {
    fn summary(&self) -> String {
        format!(
            "HMM: {} states, {} emissions of dimension {}",
            self.n_states,
            self.emission.emission_type(),
            self.emission.dim(),
        )
    }
}

/// Check that `values` form a probability distribution and return them
/// rescaled to sum to exactly one.
fn check_distribution(
    field: &'static str,
    row: Option<usize>,
    values: impl Iterator<Item = f64>,
) -> std::result::Result<Array1<f64>, ValidationError> {
    let values: Array1<f64> = values.collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ValidationError::NonFinite { field });
    }
    if let Some(&value) = values.iter().find(|&&v| v < 0.0) {
        return Err(ValidationError::NegativeProbability { field, value });
    }
    let sum = values.sum();
    if (sum - 1.0).abs() > SUM_TOL {
        return Err(ValidationError::NotNormalized { field, row, sum });
    }
    Ok(values / sum)
}

/// Index drawn from a discrete distribution given a uniform draw `u`.
fn draw_index(probs: impl Iterator<Item = f64>, u: f64) -> usize {
    let mut cumulative = 0.0;
    let mut last = 0;
    for (i, p) in probs.enumerate() {
        cumulative += p;
        if p > 0.0 {
            last = i;
        }
        if u < cumulative {
            return i;
        }
    }
    last
}

/// Stack the rows of every sequence into one matrix.
pub(crate) fn pool<S: Data<Elem = f64>>(sequences: &[ArrayBase<S, Ix2>], dim: usize) -> Result<Array2<f64>> {
    if sequences.is_empty() {
        return Err(HmmError::InvalidInput("no observation sequences".into()));
    }
    let total: usize = sequences.iter().map(|s| s.nrows()).sum();
    let mut pooled = Array2::<f64>::zeros((total, dim));
    let mut offset = 0;
    for seq in sequences {
        if seq.nrows() == 0 {
            return Err(HmmError::InvalidInput("empty observation sequence".into()));
        }
        if seq.ncols() != dim {
            return Err(HmmError::InvalidInput(format!(
                "observations have {} columns, model dimension is {dim}",
                seq.ncols()
            )));
        }
        pooled
            .slice_mut(ndarray::s![offset..offset + seq.nrows(), ..])
            .assign(seq);
        offset += seq.nrows();
    }
    Ok(pooled)
}
