use crate::config::BackendKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use traverse_core::{Trajectory, Transcription, TranscriptionResult};

/// How a backend run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Converged,
    /// Outer or inner iteration limit reached.
    MaxIterations,
    /// `MaxDuration` elapsed.
    OutOfTime,
    /// The engine stopped on a non-finite evaluation or an internal failure.
    NumericalFailure,
}

impl SolveStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// Result of a backend run. Non-converged runs still carry the last iterate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub status: SolveStatus,
    pub backend: BackendKind,
    pub primal: Vec<f64>,
    pub objective: f64,
    /// Largest bound violation over variables and constraint rows.
    pub constraint_violation: f64,
    pub outer_iterations: usize,
    pub inner_iterations: usize,
    pub solve_time: Duration,
}

impl Solution {
    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }

    /// Unpacks the primal vector into a stage trajectory.
    pub fn trajectory(&self, transcription: &Transcription) -> TranscriptionResult<Trajectory> {
        transcription.extract(&self.primal)
    }
}
