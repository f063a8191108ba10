//! Errors raised by the solver adapter.
//!
//! Every variant here is raised before the backend runs. A backend that runs
//! and fails to converge reports through [`crate::SolveStatus`] instead.

use crate::config::{BackendKind, OptionName};
use thiserror::Error;
use traverse_core::TranscriptionError;

/// Rejected backend configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("option `{option}` is not recognised by the {backend} backend")]
    UnrecognizedOption {
        backend: BackendKind,
        option: OptionName,
    },

    #[error("option `{0}` was given more than once")]
    DuplicateOption(OptionName),

    #[error("option `{option}` has invalid value {value}: {reason}")]
    InvalidValue {
        option: OptionName,
        value: String,
        reason: &'static str,
    },

    #[error("unsupported combination for the {backend} backend: {reason}")]
    UnsupportedCombination {
        backend: BackendKind,
        reason: &'static str,
    },
}

/// The problem does not have the stage structure a structured backend needs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StructureError {
    #[error("variables {variables:?} do not belong to any stage")]
    VariableOutsideStage { variables: Vec<usize> },

    #[error("variable {variable} of stage {stage} comes after a variable of stage {previous}")]
    StageOrder {
        variable: usize,
        stage: usize,
        previous: usize,
    },

    #[error("rows {rows:?}: {reason}")]
    OffendingRows { rows: Vec<usize>, reason: String },

    #[error("stage {stage}: {reason}")]
    StageShape { stage: usize, reason: String },
}

/// Reasons a solve was refused.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error(transparent)]
    Problem(#[from] TranscriptionError),

    #[error("stage structure detection failed: {0}")]
    Structure(#[from] StructureError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Engine setup failed before the first iteration.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
