//! Shared primitives for the hmmkit hidden Markov model crates.
//!
//! `hmmkit-core` provides the foundation the engine crate builds on:
//!
//! - **Error types**: [`HmmError`], [`ValidationError`] and [`Result`]
//! - **Log-space arithmetic**: [`log_sum_exp`], [`ln_add`], the numeric
//!   floor [`LOG_ZERO`] and floor clamping
//! - **Traits**: [`Summarizable`] for one-line reports

pub mod error;
pub mod prob;
pub mod traits;

pub use error::{HmmError, Result, ValidationError};
pub use prob::{clamp_log_zero, ln_add, log_normalize, log_sum_exp, LOG_ZERO};
pub use traits::*;
