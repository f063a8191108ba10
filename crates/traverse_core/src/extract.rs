use crate::dynamics::{CONTROL_DIM, POS_X, POS_Y, STATE_DIM};
use crate::error::{TranscriptionError, TranscriptionResult};
use crate::transcription::Transcription;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

pub type State = [f64; STATE_DIM];
pub type Control = [f64; CONTROL_DIM];

/// Structured view of a decision vector: what the packer consumes as an
/// initial guess and what the extractor reconstructs from a primal solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// `N + 1` states.
    pub states: Vec<State>,
    /// `N` controls.
    pub controls: Vec<Control>,
    /// Value of every time variable in stage order (one entry under a shared layout).
    pub time_copies: Vec<f64>,
    /// Resolved horizon time: the shared `T`, or the mean of the copies.
    pub total_time: f64,
}

impl Trajectory {
    pub fn positions(&self) -> Vec<Vector2<f64>> {
        self.states
            .iter()
            .map(|s| Vector2::new(s[POS_X], s[POS_Y]))
            .collect()
    }

    pub fn final_position(&self) -> Option<Vector2<f64>> {
        self.states.last().map(|s| Vector2::new(s[POS_X], s[POS_Y]))
    }

    /// Largest difference between any two time copies (zero for one copy).
    ///
    /// NaN when any copy is not finite.
    pub fn max_time_spread(&self) -> f64 {
        if self.time_copies.iter().any(|t| !t.is_finite()) {
            return f64::NAN;
        }
        let lo = self.time_copies.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = self
            .time_copies
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        if self.time_copies.is_empty() {
            0.0
        } else {
            hi - lo
        }
    }
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

impl Transcription {
    /// Rebuilds the stage trajectory from a flat primal vector.
    ///
    /// Exact inverse of [`Transcription::pack_guess`]; no dynamics are rolled out.
    pub fn extract(&self, primal: &[f64]) -> TranscriptionResult<Trajectory> {
        let layout = self.layout();
        if primal.len() != layout.len() {
            return Err(TranscriptionError::LengthMismatch {
                what: "primal solution",
                expected: layout.len(),
                got: primal.len(),
            });
        }

        let mut states = Vec::with_capacity(layout.stages().len());
        let mut controls = Vec::with_capacity(layout.intervals());
        for slots in layout.stages() {
            let mut state = [0.0; STATE_DIM];
            state.copy_from_slice(&primal[slots.state.clone()]);
            states.push(state);
            if let Some(range) = &slots.control {
                let mut control = [0.0; CONTROL_DIM];
                control.copy_from_slice(&primal[range.clone()]);
                controls.push(control);
            }
        }

        let time_copies: Vec<f64> = layout.time_indices().iter().map(|&i| primal[i]).collect();
        let total_time = mean(&time_copies);

        Ok(Trajectory {
            states,
            controls,
            time_copies,
            total_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::transcription;
    use crate::layout::{TimeLayout, VariableOrdering};
    use crate::transcription::HorizonConfig;

    #[test]
    fn extract_rejects_wrong_length() {
        let t = transcription(HorizonConfig::default());
        let err = t.extract(&vec![0.0; t.num_variables() - 1]).unwrap_err();
        assert!(matches!(err, TranscriptionError::LengthMismatch { .. }));
    }

    #[test]
    fn extract_reads_stage_slots() {
        let t = transcription(HorizonConfig {
            stages: 2,
            time_layout: TimeLayout::PerStage,
            ordering: VariableOrdering::Grouped,
            ..Default::default()
        });
        let primal: Vec<f64> = (0..t.num_variables()).map(|i| i as f64).collect();
        let traj = t.extract(&primal).expect("matching length");
        // Grouped per-stage: [T0 T1 T2 | X0 X1 X2 | U0 U1]
        assert_eq!(traj.time_copies, vec![0.0, 1.0, 2.0]);
        assert_eq!(traj.states[0], [3.0, 4.0, 5.0]);
        assert_eq!(traj.states[2], [9.0, 10.0, 11.0]);
        assert_eq!(traj.controls[1], [14.0, 15.0]);
        assert!((traj.total_time - 1.0).abs() < 1e-15);
        assert!((traj.max_time_spread() - 2.0).abs() < 1e-15);
    }

    #[test]
    fn positions_follow_states() {
        let traj = Trajectory {
            states: vec![[1.0, 2.0, 0.0], [3.0, 4.0, 0.5]],
            controls: vec![[0.0, 1.0]],
            time_copies: vec![2.0],
            total_time: 2.0,
        };
        assert_eq!(traj.positions()[1], Vector2::new(3.0, 4.0));
        assert_eq!(traj.final_position(), Some(Vector2::new(3.0, 4.0)));
        assert_eq!(traj.max_time_spread(), 0.0);
    }

    #[test]
    fn spread_of_non_finite_copies_is_nan() {
        let traj = Trajectory {
            states: vec![[0.0; 3]; 3],
            controls: vec![[0.0; 2]; 2],
            time_copies: vec![1.0, f64::NAN, 1.0],
            total_time: f64::NAN,
        };
        assert!(traj.max_time_spread().is_nan());

        let traj = Trajectory {
            time_copies: vec![1.0, f64::INFINITY],
            ..traj
        };
        assert!(traj.max_time_spread().is_nan());
    }
}
