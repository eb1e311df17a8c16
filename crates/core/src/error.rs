//! Error types shared by every post-processing stage
//!
//! Input contract violations, missing resources and numerical instability are
//! all reported through [`Error`]. Non-convergence of an iterative solver is
//! not an error: solvers return their best estimate together with
//! diagnostics and log a warning instead.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the post-processing core
#[derive(Debug, Error)]
pub enum Error {
    /// A scalar argument is outside its valid range.
    #[error("invalid argument `{name}`: {message}")]
    InvalidArgument { name: &'static str, message: String },

    /// Two fields that must share a grid do not.
    #[error("grid mismatch between {left} and {right}: {detail}")]
    GridMismatch {
        left: String,
        right: String,
        detail: String,
    },

    /// A required dimension is absent from a field.
    #[error("field `{field}` has no `{dimension}` dimension")]
    MissingDimension { field: String, dimension: String },

    /// Data array and coordinates disagree.
    #[error("shape mismatch in `{field}`: {detail}")]
    ShapeMismatch { field: String, detail: String },

    /// Unit string not present in the conversion table.
    #[error("unknown unit `{0}`")]
    UnknownUnit(String),

    /// Units belong to different physical families.
    #[error("cannot convert `{from}` to `{to}`: incompatible units")]
    IncompatibleUnits { from: String, to: String },

    #[error("unsupported distribution `{0}` (expected `gaussian` or `truncated_gaussian`)")]
    UnknownDistribution(String),

    #[error(
        "the requested predictor mode `{0}` is not an accepted value; accepted values are `mean` or `members`"
    )]
    UnknownPredictorMode(String),

    #[error("unsupported calibration method `{0}` (expected `emos` or `ngr`)")]
    UnknownMethod(String),

    /// No usable forecast/truth pairs were available for a fit.
    #[error("insufficient training data: {0}")]
    InsufficientTrainingData(String),

    /// A component produced NaN or infinite output from finite input.
    #[error("numerical instability in {stage}: {detail}")]
    NumericalInstability { stage: &'static str, detail: String },

    /// Input file could not be read.
    #[error("failed to load {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Output file could not be written.
    #[error("failed to save {}: {source}", path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Field (de)serialisation failed.
    #[error("failed to (de)serialise {}: {source}", path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`].
    pub(crate) fn invalid(name: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::MissingDimension`].
    pub(crate) fn missing_dimension(field: &str, dimension: &str) -> Self {
        Self::MissingDimension {
            field: field.to_string(),
            dimension: dimension.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predictor_mode_message_lists_accepted_values() {
        let err = Error::UnknownPredictorMode("foo".to_string());
        let msg = err.to_string();
        assert!(msg.contains("foo"));
        assert!(msg.contains("`mean` or `members`"));
    }

    #[test]
    fn test_load_error_names_path() {
        let err = Error::Load {
            path: PathBuf::from("/no/such/input.json"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.to_string().contains("/no/such/input.json"));
    }
}
