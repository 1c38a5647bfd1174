//! Baum-Welch (expectation-maximisation) training.
//!
//! Each iteration runs forward-backward on every training sequence (in
//! parallel with the `parallel` feature), sums the per-sequence statistics
//! in sequence order, and re-estimates the selected parameter groups.
//! Training stops when the total log-likelihood improves by less than the
//! configured threshold or the iteration budget runs out. A decrease in
//! log-likelihood is never an error.

use hmmkit_core::{HmmError, Result, Summarizable};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use tracing::{debug, info, warn};

use crate::emission::Emission;
use crate::lattice;
use crate::model::Hmm;
use crate::params::ParamSet;
use crate::prune::PruneConfig;

/// Configuration for [`Hmm::train`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrainConfig {
    /// Maximum number of EM iterations.
    pub n_iter: usize,
    /// Floor applied to every variance (or covariance diagonal) after
    /// re-estimation.
    pub min_covar: f64,
    /// Stop once the log-likelihood changes by less than this between
    /// iterations.
    pub threshold: f64,
    /// Parameter groups to re-estimate.
    pub params: ParamSet,
    /// Pruning used by the E-step.
    pub prune: PruneConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            n_iter: 10,
            min_covar: 1.0,
            threshold: 1e-2,
            params: ParamSet::all(),
            prune: PruneConfig::default(),
        }
    }
}

impl TrainConfig {
    /// # Errors
    ///
    /// Returns an error if `n_iter` is zero, `min_covar` is not a positive
    /// finite number, `threshold` is negative or NaN, or the pruning limits
    /// are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.n_iter == 0 {
            return Err(HmmError::InvalidInput("n_iter must be > 0".into()));
        }
        if !(self.min_covar > 0.0) || !self.min_covar.is_finite() {
            return Err(HmmError::InvalidInput(format!(
                "min_covar must be positive and finite, got {}",
                self.min_covar
            )));
        }
        if !(self.threshold >= 0.0) {
            return Err(HmmError::InvalidInput(format!(
                "threshold must be non-negative, got {}",
                self.threshold
            )));
        }
        self.prune.validate()
    }
}

/// Outcome of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    /// Total log-likelihood of the training data at the start of each
    /// iteration.
    pub log_likelihoods: Vec<f64>,
    /// Whether the improvement fell below the threshold before the budget
    /// ran out.
    pub converged: bool,
}

impl TrainReport {
    pub fn n_iter(&self) -> usize {
        self.log_likelihoods.len()
    }

    pub fn final_log_likelihood(&self) -> Option<f64> {
        self.log_likelihoods.last().copied()
    }
}

impl Summarizable for TrainReport {
    fn summary(&self) -> String {
        format!(
            "Baum-Welch: {} iterations, converged={}, log-likelihood={:.4}",
            self.n_iter(),
            self.converged,
            self.final_log_likelihood().unwrap_or(f64::NEG_INFINITY),
        )
    }
}

/// E-step statistics of one or more sequences.
struct Accumulator<St> {
    log_likelihood: f64,
    start: Array1<f64>,
    trans: Array2<f64>,
    emission: St,
}

impl<E: Emission> Hmm<E> {
    /// Fit the model to `sequences` with Baum-Welch.
    ///
    /// Returns the total log-likelihood recorded at every iteration.
    /// Sequences with zero probability under the current model are skipped
    /// for that iteration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, `sequences` is
    /// empty or holds an empty or wrongly shaped sequence, every sequence
    /// has zero probability, or a re-estimated parameter cannot be stored.
    pub fn train<S>(&mut self, sequences: &[ArrayBase<S, Ix2>], config: &TrainConfig) -> Result<TrainReport>
    where
        S: Data<Elem = f64> + Sync,
    {
        config.validate()?;
        if sequences.is_empty() {
            return Err(HmmError::InvalidInput("no observation sequences".into()));
        }

        let mut log_likelihoods: Vec<f64> = Vec::with_capacity(config.n_iter);
        let mut converged = false;

        for iter in 0..config.n_iter {
            let stats = self.expectation(sequences, &config.prune)?;
            let current = stats.log_likelihood;
            let improvement = log_likelihoods.last().map(|prev| current - prev);
            log_likelihoods.push(current);
            debug!(iter, log_likelihood = current, ?improvement, "EM iteration");

            if let Some(delta) = improvement {
                if delta.abs() < config.threshold {
                    converged = true;
                    break;
                }
            }

            self.maximization(&stats, config.params, config.min_covar)?;
        }

        let report = TrainReport {
            log_likelihoods,
            converged,
        };
        info!(
            iterations = report.n_iter(),
            converged = report.converged,
            log_likelihood = report.final_log_likelihood().unwrap_or(f64::NEG_INFINITY),
            "training finished"
        );
        Ok(report)
    }

    /// Run forward-backward on every sequence and sum the statistics in
    /// sequence order.
    fn expectation<S>(&self, sequences: &[ArrayBase<S, Ix2>], prune: &PruneConfig) -> Result<Accumulator<E::Stats>>
    where
        S: Data<Elem = f64> + Sync,
    {
        #[cfg(feature = "parallel")]
        let per_sequence: Vec<Result<Option<Accumulator<E::Stats>>>> = {
            use rayon::prelude::*;
            sequences
                .par_iter()
                .map(|obs| self.sequence_stats(obs, prune))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let per_sequence: Vec<Result<Option<Accumulator<E::Stats>>>> = sequences
            .iter()
            .map(|obs| self.sequence_stats(obs, prune))
            .collect();

        let n = self.n_states();
        let mut total = Accumulator {
            log_likelihood: 0.0,
            start: Array1::zeros(n),
            trans: Array2::zeros((n, n)),
            emission: self.emission().new_stats(),
        };
        let mut used = 0usize;
        for (i, result) in per_sequence.into_iter().enumerate() {
            match result? {
                Some(acc) => {
                    total.log_likelihood += acc.log_likelihood;
                    total.start += &acc.start;
                    total.trans += &acc.trans;
                    self.emission().merge_stats(&mut total.emission, acc.emission);
                    used += 1;
                }
                None => warn!(sequence = i, "sequence has zero probability; skipping it"),
            }
        }
        if used == 0 {
            return Err(HmmError::Numerical(
                "every training sequence has zero probability under the model".into(),
            ));
        }
        Ok(total)
    }

    /// Statistics of one sequence, or `None` if it has zero probability.
    fn sequence_stats<S: Data<Elem = f64>>(
        &self,
        obs: &ArrayBase<S, Ix2>,
        prune: &PruneConfig,
    ) -> Result<Option<Accumulator<E::Stats>>> {
        let frame = self.frame_log_likelihood(obs)?;
        let fb = self.forward_backward(frame, prune);
        if !fb.log_likelihood.is_finite() {
            return Ok(None);
        }

        let posteriors = lattice::posteriors(fb.forward.view(), fb.backward.view(), fb.log_likelihood);
        let trans = lattice::expected_transitions(
            fb.frame_log_lik.view(),
            self.log_transmat().view(),
            fb.forward.view(),
            fb.backward.view(),
            fb.log_likelihood,
        );
        let mut emission = self.emission().new_stats();
        self.emission().accumulate(&mut emission, obs.view(), posteriors.view());

        Ok(Some(Accumulator {
            log_likelihood: fb.log_likelihood,
            start: posteriors.row(0).to_owned(),
            trans,
            emission,
        }))
    }

    /// Re-estimate the selected parameter groups from summed statistics.
    fn maximization(&mut self, stats: &Accumulator<E::Stats>, params: ParamSet, min_covar: f64) -> Result<()> {
        if params.startprob {
            let counts = with_dirichlet_prior(&stats.start, self.startprob_prior());
            let total = counts.sum();
            if total > 0.0 {
                self.set_startprob(&(counts / total))?;
            } else {
                warn!("no start-state mass; keeping start probabilities");
            }
        }

        if params.transmat {
            let mut transmat = self.transmat();
            let prior = self.transmat_prior();
            for (i, mut row) in transmat.rows_mut().into_iter().enumerate() {
                let counts = with_dirichlet_prior(&stats.trans.row(i), prior);
                let total = counts.sum();
                if total > 0.0 {
                    row.assign(&(counts / total));
                } else {
                    warn!(state = i, "no transitions out of state; keeping its row");
                }
            }
            self.set_transmat(&transmat)?;
        }

        self.emission_mut().maximization_step(&stats.emission, params, min_covar)
    }
}

/// `max(counts + concentration - 1, 0)`.
fn with_dirichlet_prior<S: Data<Elem = f64>>(
    counts: &ArrayBase<S, ndarray::Ix1>,
    concentration: f64,
) -> Array1<f64> {
    counts.mapv(|c| (c + concentration - 1.0).max(0.0))
}
