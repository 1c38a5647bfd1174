//! Hidden Markov models with Gaussian emissions.
//!
//! - **Evaluation**: forward-backward in log space: total log-likelihood and
//!   per-frame state posteriors ([`Hmm::evaluate`], [`Hmm::log_density`])
//! - **Decoding**: Viterbi with traceback ([`Hmm::decode`])
//! - **Pruning**: rank and beam limits on active states ([`PruneConfig`])
//! - **Training**: Baum-Welch over one or more sequences ([`Hmm::train`])
//! - **Emissions**: the [`Emission`] trait, a tag registry, and Gaussian
//!   emissions with spherical, diagonal, tied or full covariances
//! - **Initialisation and sampling**: k-means seeding ([`Hmm::initialize`])
//!   and simulation ([`Hmm::sample`])
//!
//! Enable the `parallel` feature to run the training E-step across
//! sequences on the rayon thread pool, and `serde` to serialise models and
//! configuration.

pub mod cluster;
pub mod covariance;
pub mod emission;
pub mod lattice;
pub mod linalg;
pub mod model;
pub mod params;
pub mod prune;
pub mod train;

pub use cluster::{Clusterer, Clustering, KMeans, KMeansConfig};
pub use covariance::{expand_template, validate_covariances, CovarianceKind, Covariances};
pub use emission::{
    build_emission, Emission, EmissionModel, EmissionSpec, GaussianEmission, GaussianPriors,
};
pub use hmmkit_core::{HmmError, Result, Summarizable, ValidationError};
pub use lattice::Combine;
pub use model::{Decoding, Evaluation, GaussianHmm, Hmm};
pub use params::ParamSet;
pub use prune::PruneConfig;
pub use train::{TrainConfig, TrainReport};
