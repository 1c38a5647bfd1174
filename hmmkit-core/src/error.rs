//! Structured error types for hmmkit.

use thiserror::Error;

/// Unified error type for all hmmkit operations.
#[derive(Debug, Error)]
pub enum HmmError {
    /// A model parameter violated one of its invariants. The previous value
    /// of the parameter is left in place.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown covariance kind, emission type tag, or parameter selector.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// Invalid input (bad arguments, empty or malformed observations)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A numeric routine could not proceed (e.g. a covariance that is not
    /// positive-definite at evaluation time).
    #[error("numerical error: {0}")]
    Numerical(String),
}

/// The invariant a rejected parameter value broke.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must have length {expected}, got {actual}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{field} must have shape {expected:?}, got {actual:?}")]
    ShapeMismatch {
        field: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("{} sums to {sum}, expected 1.0", describe_row(.field, *.row))]
    NotNormalized {
        field: &'static str,
        row: Option<usize>,
        sum: f64,
    },

    #[error("{field} contains a negative probability ({value})")]
    NegativeProbability { field: &'static str, value: f64 },

    #[error("{field} contains a non-finite value")]
    NonFinite { field: &'static str },

    #[error("invalid covariance: {0}")]
    InvalidCovariance(String),
}

fn describe_row(field: &str, row: Option<usize>) -> String {
    match row {
        Some(r) => format!("row {r} of {field}"),
        None => field.to_string(),
    }
}

/// Convenience alias used throughout hmmkit.
pub type Result<T> = std::result::Result<T, HmmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_normalized_message_names_row() {
        let err = ValidationError::NotNormalized {
            field: "transmat",
            row: Some(2),
            sum: 0.5,
        };
        assert_eq!(err.to_string(), "row 2 of transmat sums to 0.5, expected 1.0");

        let err = ValidationError::NotNormalized {
            field: "startprob",
            row: None,
            sum: 2.0,
        };
        assert_eq!(err.to_string(), "startprob sums to 2, expected 1.0");
    }

    #[test]
    fn validation_converts_into_hmm_error() {
        let err: HmmError = ValidationError::LengthMismatch {
            field: "startprob",
            expected: 3,
            actual: 2,
        }
        .into();
        assert!(matches!(
            err,
            HmmError::Validation(ValidationError::LengthMismatch { expected: 3, .. })
        ));
        assert!(err.to_string().starts_with("validation error:"));
    }
}
