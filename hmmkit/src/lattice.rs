//! Forward, backward and Viterbi recursions over the hidden-state lattice.
//!
//! All recursions work on a per-frame emission log-likelihood matrix of shape
//! `(n_obs, n_states)` and return lattices of the same shape, in log space.
//! Evaluation and decoding share one forward recursion, parameterised by the
//! [`Combine`] operator used to merge predecessor scores. Any lattice value
//! at or below [`LOG_ZERO`](hmmkit_core::LOG_ZERO) is clamped to negative
//! infinity as soon as it is produced.

use hmmkit_core::{clamp_log_zero, log_sum_exp};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use tracing::warn;

use crate::prune::prune_states;

/// How scores arriving at a state from its active predecessors are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    /// Sum over paths: total likelihood (evaluation).
    LogSumExp,
    /// Best path only: Viterbi decoding.
    Max,
}

impl Combine {
    /// Merge `scores`, returning the combined score and the position of the
    /// best entry (meaningful for [`Combine::Max`] only).
    fn reduce(self, scores: &[f64]) -> (f64, usize) {
        match self {
            Combine::LogSumExp => (log_sum_exp(scores), 0),
            Combine::Max => {
                let mut best = (f64::NEG_INFINITY, 0);
                for (k, &v) in scores.iter().enumerate() {
                    if v > best.0 {
                        best = (v, k);
                    }
                }
                best
            }
        }
    }
}

/// Output of the forward recursion.
#[derive(Debug, Clone)]
pub struct ForwardLattice {
    /// Log-sum-exp of the final lattice frame. For [`Combine::LogSumExp`]
    /// this is the total sequence log-likelihood.
    pub log_prob: f64,
    /// Forward log-values, shape `(n_obs, n_states)`.
    pub lattice: Array2<f64>,
    /// Best predecessor of each `(frame, state)`; only recorded for
    /// [`Combine::Max`]. Row 0 is unused.
    pub backpointers: Option<Array2<usize>>,
}

/// Most probable state path found by Viterbi decoding.
#[derive(Debug, Clone)]
pub struct ViterbiPath {
    /// Log-sum-exp of the final Viterbi lattice frame.
    pub log_prob: f64,
    /// Joint log-probability of `states` and the observations.
    pub best_path_log_prob: f64,
    /// Decoded state per frame.
    pub states: Vec<usize>,
}

/// Log-sum-exp of every lane of `values` along `axis`.
///
/// `Axis(1)` collapses each row (one value per frame); `Axis(0)` collapses
/// each column.
pub fn log_sum_exp_axis(values: ArrayView2<'_, f64>, axis: Axis) -> Array1<f64> {
    values
        .lanes(axis)
        .into_iter()
        .map(|lane| log_sum_exp(lane.iter()))
        .collect()
}

/// Run the forward recursion.
///
/// `forward[0] = log_startprob + frame_log_lik[0]`; each later frame takes the
/// states of the previous frame that survive pruning and combines
/// `log_transmat[src, dst] + forward[n - 1, src]` with `combine`. States
/// pruned from a frame are set to negative infinity in the returned lattice.
pub fn forward(
    frame_log_lik: ArrayView2<'_, f64>,
    log_startprob: ArrayView1<'_, f64>,
    log_transmat: ArrayView2<'_, f64>,
    max_rank: Option<usize>,
    beam_log_prob: f64,
    combine: Combine,
) -> ForwardLattice {
    let (n_obs, n_states) = frame_log_lik.dim();
    let mut lattice = Array2::from_elem((n_obs, n_states), f64::NEG_INFINITY);
    let mut backpointers = match combine {
        Combine::Max => Some(Array2::<usize>::zeros((n_obs, n_states))),
        Combine::LogSumExp => None,
    };
    if n_obs == 0 {
        return ForwardLattice {
            log_prob: f64::NEG_INFINITY,
            lattice,
            backpointers,
        };
    }

    for s in 0..n_states {
        lattice[[0, s]] = clamp_log_zero(log_startprob[s] + frame_log_lik[[0, s]]);
    }

    let mut scores = Vec::with_capacity(n_states);
    for n in 1..n_obs {
        let active = prune_states(lattice.row(n - 1), max_rank, beam_log_prob);
        if active.len() < n_states {
            // Pruned states never propagate, so they hold no forward mass.
            let mut keep = vec![false; n_states];
            for &s in &active {
                keep[s] = true;
            }
            for (v, kept) in lattice.row_mut(n - 1).iter_mut().zip(keep) {
                if !kept {
                    *v = f64::NEG_INFINITY;
                }
            }
        }
        for dst in 0..n_states {
            scores.clear();
            scores.extend(
                active
                    .iter()
                    .map(|&src| log_transmat[[src, dst]] + lattice[[n - 1, src]]),
            );
            let (score, best) = combine.reduce(&scores);
            if let Some(bp) = backpointers.as_mut() {
                bp[[n, dst]] = active.get(best).copied().unwrap_or(0);
            }
            lattice[[n, dst]] = clamp_log_zero(score + frame_log_lik[[n, dst]]);
        }
    }

    let log_prob = log_sum_exp(lattice.row(n_obs - 1).iter());
    ForwardLattice {
        log_prob,
        lattice,
        backpointers,
    }
}

/// Run the backward recursion.
///
/// `backward[last] = 0`; for earlier frames each source state sums
/// `log_transmat[src, dst] + backward[n, dst] + frame_log_lik[n, dst]` over
/// the destination states that stay active. Activity is decided on the
/// joint score `forward[n] + backward[n]` with `beam_log_prob`, so states
/// whose contribution to the total likelihood is negligible are skipped.
pub fn backward(
    frame_log_lik: ArrayView2<'_, f64>,
    log_transmat: ArrayView2<'_, f64>,
    forward_lattice: ArrayView2<'_, f64>,
    beam_log_prob: f64,
) -> Array2<f64> {
    let (n_obs, n_states) = frame_log_lik.dim();
    let mut lattice = Array2::from_elem((n_obs, n_states), f64::NEG_INFINITY);
    if n_obs == 0 {
        return lattice;
    }
    lattice.row_mut(n_obs - 1).fill(0.0);

    let mut scores = Vec::with_capacity(n_states);
    for n in (1..n_obs).rev() {
        let joint: Array1<f64> = &lattice.row(n) + &forward_lattice.row(n);
        let active = prune_states(joint.view(), None, beam_log_prob);
        for src in 0..n_states {
            scores.clear();
            scores.extend(active.iter().map(|&dst| {
                log_transmat[[src, dst]] + lattice[[n, dst]] + frame_log_lik[[n, dst]]
            }));
            lattice[[n - 1, src]] = clamp_log_zero(log_sum_exp(&scores));
        }
    }
    lattice
}

/// Viterbi decoding: forward recursion with [`Combine::Max`] followed by a
/// traceback from the best final state.
pub fn viterbi(
    frame_log_lik: ArrayView2<'_, f64>,
    log_startprob: ArrayView1<'_, f64>,
    log_transmat: ArrayView2<'_, f64>,
    max_rank: Option<usize>,
    beam_log_prob: f64,
) -> ViterbiPath {
    let fwd = forward(
        frame_log_lik,
        log_startprob,
        log_transmat,
        max_rank,
        beam_log_prob,
        Combine::Max,
    );
    let n_obs = fwd.lattice.nrows();
    if n_obs == 0 {
        return ViterbiPath {
            log_prob: f64::NEG_INFINITY,
            best_path_log_prob: f64::NEG_INFINITY,
            states: Vec::new(),
        };
    }

    let last = fwd.lattice.row(n_obs - 1);
    let mut state = 0;
    let mut best_path_log_prob = f64::NEG_INFINITY;
    for (s, &v) in last.iter().enumerate() {
        if v > best_path_log_prob {
            best_path_log_prob = v;
            state = s;
        }
    }
    if best_path_log_prob == f64::NEG_INFINITY {
        warn!("every state path has zero probability; decoded path is arbitrary");
    }

    let mut states = vec![0usize; n_obs];
    states[n_obs - 1] = state;
    if let Some(bp) = fwd.backpointers.as_ref() {
        for n in (1..n_obs).rev() {
            state = bp[[n, state]];
            states[n - 1] = state;
        }
    }

    ViterbiPath {
        log_prob: fwd.log_prob,
        best_path_log_prob,
        states,
    }
}

/// Per-frame state posteriors `exp(forward + backward - log_prob)`.
///
/// A sequence with zero probability yields an all-zero matrix rather than
/// NaN.
pub fn posteriors(
    forward_lattice: ArrayView2<'_, f64>,
    backward_lattice: ArrayView2<'_, f64>,
    log_prob: f64,
) -> Array2<f64> {
    if !log_prob.is_finite() {
        return Array2::zeros(forward_lattice.raw_dim());
    }
    let mut post = &forward_lattice + &backward_lattice;
    post.mapv_inplace(|v| (v - log_prob).exp());
    post
}

/// Expected number of transitions between every pair of states, summed over
/// the sequence, in linear space.
pub fn expected_transitions(
    frame_log_lik: ArrayView2<'_, f64>,
    log_transmat: ArrayView2<'_, f64>,
    forward_lattice: ArrayView2<'_, f64>,
    backward_lattice: ArrayView2<'_, f64>,
    log_prob: f64,
) -> Array2<f64> {
    let (n_obs, n_states) = frame_log_lik.dim();
    let mut counts = Array2::<f64>::zeros((n_states, n_states));
    if !log_prob.is_finite() {
        return counts;
    }
    for n in 1..n_obs {
        for src in 0..n_states {
            let alpha = forward_lattice[[n - 1, src]];
            if alpha == f64::NEG_INFINITY {
                continue;
            }
            for dst in 0..n_states {
                // pruned at frame n
                if forward_lattice[[n, dst]] == f64::NEG_INFINITY {
                    continue;
                }
                let log_xi = alpha
                    + log_transmat[[src, dst]]
                    + frame_log_lik[[n, dst]]
                    + backward_lattice[[n, dst]]
                    - log_prob;
                if log_xi > f64::NEG_INFINITY {
                    counts[[src, dst]] += log_xi.exp();
                }
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    /// Two-state weather chain from the classic forward-backward worked
    /// example.
    fn weather() -> (Array2<f64>, Array1<f64>, Array2<f64>) {
        let frame = arr2(&[[0.9, 0.2], [0.9, 0.2], [0.1, 0.8], [0.9, 0.2], [0.9, 0.2]])
            .mapv(f64::ln);
        let start = arr1(&[0.5, 0.5]).mapv(f64::ln);
        let trans = arr2(&[[0.7, 0.3], [0.3, 0.7]]).mapv(f64::ln);
        (frame, start, trans)
    }

    fn assert_close(actual: &Array2<f64>, expected: &Array2<f64>, tol: f64) {
        assert_eq!(actual.dim(), expected.dim());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < tol, "got {actual:?}, expected {expected:?}");
        }
    }

    #[test]
    fn log_sum_exp_along_each_axis() {
        let values = arr2(&[[0.0, 0.0], [1.0_f64.ln(), 3.0_f64.ln()]]);
        let rows = log_sum_exp_axis(values.view(), Axis(1));
        assert!((rows[0] - 2.0_f64.ln()).abs() < 1e-12);
        assert!((rows[1] - 4.0_f64.ln()).abs() < 1e-12);
        let cols = log_sum_exp_axis(values.view(), Axis(0));
        assert!((cols[0] - 2.0_f64.ln()).abs() < 1e-12);
        assert!((cols[1] - 4.0_f64.ln()).abs() < 1e-12);

        let dead = Array2::from_elem((2, 3), f64::NEG_INFINITY);
        assert!(log_sum_exp_axis(dead.view(), Axis(1))
            .iter()
            .all(|&v| v == f64::NEG_INFINITY));
    }

    #[test]
    fn forward_reference_values() {
        let (frame, start, trans) = weather();
        let fwd = forward(
            frame.view(),
            start.view(),
            trans.view(),
            None,
            f64::NEG_INFINITY,
            Combine::LogSumExp,
        );
        assert!((fwd.log_prob - -3.3725).abs() < 1e-4);
        assert!(fwd.backpointers.is_none());
        let expected = arr2(&[
            [0.4500, 0.1000],
            [0.3105, 0.0410],
            [0.0230, 0.0975],
            [0.0408, 0.0150],
            [0.0298, 0.0046],
        ]);
        assert_close(&fwd.lattice.mapv(f64::exp), &expected, 1e-4);
    }

    #[test]
    fn backward_reference_values() {
        let (frame, _, trans) = weather();
        let fake_forward = Array2::<f64>::zeros(frame.raw_dim());
        let bwd = backward(frame.view(), trans.view(), fake_forward.view(), -50.0);
        let expected = arr2(&[
            [0.0661, 0.0455],
            [0.0906, 0.1503],
            [0.4593, 0.2437],
            [0.6900, 0.4100],
            [1.0000, 1.0000],
        ]);
        assert_close(&bwd.mapv(f64::exp), &expected, 1e-4);
    }

    #[test]
    fn posterior_reference_values() {
        let (frame, start, trans) = weather();
        let fwd = forward(
            frame.view(),
            start.view(),
            trans.view(),
            None,
            f64::NEG_INFINITY,
            Combine::LogSumExp,
        );
        let bwd = backward(frame.view(), trans.view(), fwd.lattice.view(), -50.0);
        let post = posteriors(fwd.lattice.view(), bwd.view(), fwd.log_prob);
        let expected = arr2(&[
            [0.8673, 0.1327],
            [0.8204, 0.1796],
            [0.3075, 0.6925],
            [0.8204, 0.1796],
            [0.8673, 0.1327],
        ]);
        assert_close(&post, &expected, 1e-4);
        for row in post.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn viterbi_reference_values() {
        let (frame, start, trans) = weather();
        let path = viterbi(frame.view(), start.view(), trans.view(), None, f64::NEG_INFINITY);
        assert_eq!(path.states, vec![0, 0, 1, 0, 0]);
        assert!((path.log_prob - -4.3500).abs() < 1e-4);
        // 0.5*0.9 * 0.7*0.9 * 0.3*0.8 * 0.3*0.9 * 0.7*0.9
        let exact = (0.45_f64 * 0.63 * 0.24 * 0.27 * 0.63).ln();
        assert!((path.best_path_log_prob - exact).abs() < 1e-12);
    }

    #[test]
    fn forward_and_backward_agree_on_total() {
        let (frame, start, trans) = weather();
        let fwd = forward(
            frame.view(),
            start.view(),
            trans.view(),
            None,
            f64::NEG_INFINITY,
            Combine::LogSumExp,
        );
        let bwd = backward(frame.view(), trans.view(), fwd.lattice.view(), f64::NEG_INFINITY);
        for n in 0..frame.nrows() {
            let joint: Array1<f64> = &fwd.lattice.row(n) + &bwd.row(n);
            assert!((log_sum_exp(joint.iter()) - fwd.log_prob).abs() < 1e-10);
        }
    }

    #[test]
    fn expected_transitions_sum_to_sequence_length() {
        let (frame, start, trans) = weather();
        let fwd = forward(
            frame.view(),
            start.view(),
            trans.view(),
            None,
            f64::NEG_INFINITY,
            Combine::LogSumExp,
        );
        let bwd = backward(frame.view(), trans.view(), fwd.lattice.view(), f64::NEG_INFINITY);
        let xi = expected_transitions(
            frame.view(),
            trans.view(),
            fwd.lattice.view(),
            bwd.view(),
            fwd.log_prob,
        );
        assert!((xi.sum() - (frame.nrows() - 1) as f64).abs() < 1e-10);
    }

    #[test]
    fn impossible_states_are_clamped() {
        let (frame, _, trans) = weather();
        // state 1 can never start
        let start = arr1(&[1.0, 0.0]).mapv(f64::ln);
        let fwd = forward(
            frame.view(),
            start.view(),
            trans.view(),
            None,
            f64::NEG_INFINITY,
            Combine::LogSumExp,
        );
        assert_eq!(fwd.lattice[[0, 1]], f64::NEG_INFINITY);
        assert!(fwd.log_prob.is_finite());
        assert!(fwd.lattice.iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn fully_dead_frame_gives_zero_posteriors() {
        let frame = Array2::from_elem((3, 2), f64::NEG_INFINITY);
        let start = arr1(&[0.5, 0.5]).mapv(f64::ln);
        let trans = arr2(&[[0.5, 0.5], [0.5, 0.5]]).mapv(f64::ln);
        let fwd = forward(
            frame.view(),
            start.view(),
            trans.view(),
            Some(1),
            -10.0,
            Combine::LogSumExp,
        );
        assert_eq!(fwd.log_prob, f64::NEG_INFINITY);
        let bwd = backward(frame.view(), trans.view(), fwd.lattice.view(), -50.0);
        let post = posteriors(fwd.lattice.view(), bwd.view(), fwd.log_prob);
        assert!(post.iter().all(|&p| p == 0.0));
    }

    #[test]
    fn rank_pruned_forward_tracks_best_path() {
        let (frame, start, trans) = weather();
        // Keeping a single state per frame turns the sum into a greedy path.
        let fwd = forward(
            frame.view(),
            start.view(),
            trans.view(),
            Some(1),
            f64::NEG_INFINITY,
            Combine::LogSumExp,
        );
        let full = forward(
            frame.view(),
            start.view(),
            trans.view(),
            None,
            f64::NEG_INFINITY,
            Combine::LogSumExp,
        );
        assert!(fwd.log_prob <= full.log_prob + 1e-12);
        assert!(fwd.log_prob.is_finite());
    }

    #[test]
    fn rank_pruned_lattice_keeps_posteriors_normalized() {
        let (frame, start, trans) = weather();
        let fwd = forward(
            frame.view(),
            start.view(),
            trans.view(),
            Some(1),
            f64::NEG_INFINITY,
            Combine::LogSumExp,
        );
        // Greedy path 0, 0, 1, 0 with both states open at the last frame.
        for (n, &pruned) in [1, 1, 0, 1].iter().enumerate() {
            assert_eq!(fwd.lattice[[n, pruned]], f64::NEG_INFINITY);
        }
        assert!((fwd.log_prob - 0.012675852_f64.ln()).abs() < 1e-12);

        let bwd = backward(frame.view(), trans.view(), fwd.lattice.view(), -50.0);
        let post = posteriors(fwd.lattice.view(), bwd.view(), fwd.log_prob);
        for row in post.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-10, "{post:?}");
        }
        assert!((post[[2, 1]] - 1.0).abs() < 1e-10);
        assert!((post[[4, 0]] - 0.63 / 0.69).abs() < 1e-10);

        let xi = expected_transitions(
            frame.view(),
            trans.view(),
            fwd.lattice.view(),
            bwd.view(),
            fwd.log_prob,
        );
        assert!((xi.sum() - (frame.nrows() - 1) as f64).abs() < 1e-10);
    }

    #[test]
    fn tight_backward_beam_skips_negligible_states() {
        let third = (1.0_f64 / 3.0).ln();
        let frame = arr2(&[[0.0, 0.0, 0.0], [0.0, 0.0, -5.0]]);
        let start = Array1::from_elem(3, third);
        let trans = Array2::from_elem((3, 3), third);
        let fwd = forward(
            frame.view(),
            start.view(),
            trans.view(),
            None,
            f64::NEG_INFINITY,
            Combine::LogSumExp,
        );
        assert!((fwd.log_prob - ((2.0 + (-5.0_f64).exp()) / 3.0).ln()).abs() < 1e-12);

        // State 2 sits 5 nats below the others at the last frame, outside a
        // beam of 3, so it drops out of every backward sum.
        let bwd = backward(frame.view(), trans.view(), fwd.lattice.view(), -3.0);
        for src in 0..3 {
            assert!((bwd[[0, src]] - (2.0_f64 / 3.0).ln()).abs() < 1e-12);
        }
        let post = posteriors(fwd.lattice.view(), bwd.view(), fwd.log_prob);
        let kept = 2.0 / (2.0 + (-5.0_f64).exp());
        assert!((post.row(0).sum() - kept).abs() < 1e-12);
        assert!((post.row(0).sum() - 1.0).abs() < (-5.0_f64).exp());
        assert!((post.row(1).sum() - 1.0).abs() < 1e-12);

        // A wide beam keeps the state.
        let wide = backward(frame.view(), trans.view(), fwd.lattice.view(), -50.0);
        let expected = ((2.0 + (-5.0_f64).exp()) / 3.0).ln();
        assert!((wide[[0, 0]] - expected).abs() < 1e-12);
    }
}
