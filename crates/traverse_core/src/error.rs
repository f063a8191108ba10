//! Error types for transcription, packing and extraction.

use thiserror::Error;

/// Structural and configuration errors. Always fatal to the attempt that hit them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TranscriptionError {
    /// A configuration value is out of its admissible range.
    #[error("invalid configuration `{field}`: {reason}")]
    Config { field: &'static str, reason: String },

    /// An array does not have the length the layout requires.
    #[error("{what} has length {got}, expected {expected}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// A bound row with `lower > upper`.
    #[error("{what} row {index} has lower bound {lower} > upper bound {upper}")]
    InvertedBound {
        what: &'static str,
        index: usize,
        lower: f64,
        upper: f64,
    },
}

impl TranscriptionError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Config {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type for transcription operations.
pub type TranscriptionResult<T> = std::result::Result<T, TranscriptionError>;
