//! Rank and beam pruning of lattice frames.
//!
//! Given one frame of per-state log-probabilities, pruning decides which
//! states stay active for the next step of a recursion:
//!
//! - **Beam pruning** keeps states within `beam_log_prob` of the frame's
//!   total log-probability.
//! - **Rank pruning** keeps (at least) the `max_rank` most probable states,
//!   located with a histogram of the frame's live values.
//!
//! The stricter of the two thresholds wins. States at or below
//! [`LOG_ZERO`] are never active.

use hmmkit_core::{log_sum_exp, HmmError, Result, LOG_ZERO};
use ndarray::ArrayView1;
use tracing::trace;

/// Pruning limits for the forward and backward recursions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PruneConfig {
    /// Keep at least this many of the most probable states per forward
    /// frame. `None` disables rank pruning.
    pub max_rank: Option<usize>,
    /// Beam offset (non-positive) for the forward recursion.
    /// Negative infinity disables beam pruning.
    pub beam_log_prob: f64,
    /// Beam offset for the backward recursion, applied to the joint
    /// forward + backward score of each state (HTK-style pruning).
    pub backward_beam_log_prob: f64,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            max_rank: None,
            beam_log_prob: f64::NEG_INFINITY,
            backward_beam_log_prob: -50.0,
        }
    }
}

impl PruneConfig {
    /// No pruning in either direction.
    pub fn disabled() -> Self {
        Self {
            max_rank: None,
            beam_log_prob: f64::NEG_INFINITY,
            backward_beam_log_prob: f64::NEG_INFINITY,
        }
    }

    /// Check the limits are usable.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_rank` is zero or a beam offset is positive
    /// or NaN.
    pub fn validate(&self) -> Result<()> {
        if self.max_rank == Some(0) {
            return Err(HmmError::InvalidInput("max_rank must be > 0".into()));
        }
        for (name, beam) in [
            ("beam_log_prob", self.beam_log_prob),
            ("backward_beam_log_prob", self.backward_beam_log_prob),
        ] {
            if beam.is_nan() || beam > 0.0 {
                return Err(HmmError::InvalidInput(format!(
                    "{name} must be non-positive, got {beam}"
                )));
            }
        }
        Ok(())
    }
}

/// Indices of the active states of `frame` after rank and beam pruning.
///
/// With `max_rank = None` and `beam_log_prob = -inf` every live state is
/// returned. Rank pruning never keeps fewer than `max_rank` live states:
/// states tied with the `max_rank`-th best value all pass.
pub fn prune_states(
    frame: ArrayView1<'_, f64>,
    max_rank: Option<usize>,
    beam_log_prob: f64,
) -> Vec<usize> {
    let is_live = |v: f64| v > LOG_ZERO;

    // Beam pruning
    let mut threshold = if beam_log_prob == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else {
        log_sum_exp(frame.iter()) + beam_log_prob
    };

    // Rank pruning
    if let Some(rank) = max_rank {
        if let Some(rank_threshold) = rank_threshold(frame, rank) {
            // Only change the threshold if it is stricter than the beam.
            threshold = threshold.max(rank_threshold);
        }
    }

    let active: Vec<usize> = frame
        .iter()
        .enumerate()
        .filter(|&(_, &v)| is_live(v) && v >= threshold)
        .map(|(i, _)| i)
        .collect();

    if active.len() < frame.len() {
        trace!(active = active.len(), states = frame.len(), "pruned lattice frame");
    }
    active
}

/// The `rank`-th largest live value, located by scanning a histogram of the
/// live values from the top bin down. `None` when rank pruning would keep
/// every live state anyway.
fn rank_threshold(frame: ArrayView1<'_, f64>, rank: usize) -> Option<f64> {
    let live: Vec<f64> = frame.iter().copied().filter(|&v| v > LOG_ZERO).collect();
    if live.is_empty() || rank >= live.len() {
        return None;
    }

    let n_bins = 3 * frame.len();
    let hi = live.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let lo = live.iter().copied().fold(f64::INFINITY, f64::min) - 1.0;
    let width = (hi - lo) / n_bins as f64;
    let bin_of = |v: f64| (((v - lo) / width) as usize).min(n_bins - 1);

    let mut counts = vec![0usize; n_bins];
    for &v in &live {
        counts[bin_of(v)] += 1;
    }

    let mut cumulative = 0;
    let mut cut = 0;
    for b in (0..n_bins).rev() {
        cumulative += counts[b];
        if cumulative >= rank {
            cut = b;
            break;
        }
    }

    // Refine inside the cut bin so the threshold is exactly the rank-th
    // largest live value.
    let above: usize = counts[cut + 1..].iter().sum();
    let mut in_cut: Vec<f64> = live.iter().copied().filter(|&v| bin_of(v) == cut).collect();
    in_cut.sort_by(|a, b| b.total_cmp(a));
    in_cut.get(rank - above - 1).copied()
}
