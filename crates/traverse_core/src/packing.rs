//! Flattening of the structured problem into parallel numeric arrays.
//!
//! The decision vector, its bounds and its initial guess are all written
//! through the same [`VariableLayout`](crate::layout::VariableLayout), so index
//! `i` names the same variable in every array. Nothing downstream can detect a
//! misaligned array, hence the round-trip tests below.

use crate::dynamics::{CONTROL_DIM, HEADING, POS_X, POS_Y, SPEED, STATE_DIM, STEERING};
use crate::error::{TranscriptionError, TranscriptionResult};
use crate::extract::{mean, State, Trajectory};
use crate::transcription::{Interval, Transcription};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Runtime values that stay outside the decision vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub initial_state: State,
}

impl Parameters {
    pub fn new(initial_state: State) -> Self {
        Self { initial_state }
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.initial_state.to_vec()
    }
}

/// Parallel arrays handed to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedProblem {
    pub x0: Vec<f64>,
    pub lbx: Vec<f64>,
    pub ubx: Vec<f64>,
    pub lbg: Vec<f64>,
    pub ubg: Vec<f64>,
    pub equality: Vec<bool>,
    pub p: Vec<f64>,
    /// Stage owning each decision variable (`None` for variables shared by all stages).
    pub variable_stage: Vec<Option<usize>>,
}

impl PackedProblem {
    pub fn num_variables(&self) -> usize {
        self.x0.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.lbg.len()
    }

    /// Checks array lengths and that no bound row is inverted.
    pub fn validate(&self) -> TranscriptionResult<()> {
        let n = self.x0.len();
        let m = self.lbg.len();
        for (what, len, expected) in [
            ("variable lower bounds", self.lbx.len(), n),
            ("variable upper bounds", self.ubx.len(), n),
            ("variable stage map", self.variable_stage.len(), n),
            ("constraint upper bounds", self.ubg.len(), m),
            ("equality tags", self.equality.len(), m),
        ] {
            if len != expected {
                return Err(TranscriptionError::LengthMismatch {
                    what,
                    expected,
                    got: len,
                });
            }
        }
        check_bounds("variable", &self.lbx, &self.ubx)?;
        check_bounds("constraint", &self.lbg, &self.ubg)
    }
}

/// First row with `lower > upper` (or a NaN bound) is reported.
pub fn check_bounds(what: &'static str, lower: &[f64], upper: &[f64]) -> TranscriptionResult<()> {
    match lower
        .iter()
        .zip(upper)
        .position(|(lo, hi)| !(lo <= hi))
    {
        Some(index) => Err(TranscriptionError::InvertedBound {
            what,
            index,
            lower: lower[index],
            upper: upper[index],
        }),
        None => Ok(()),
    }
}

fn split(bounds: &[Interval]) -> (Vec<f64>, Vec<f64>) {
    bounds.iter().map(|b| (b.lower, b.upper)).unzip()
}

impl Transcription {
    /// Default guess: straight line from the initial position towards the
    /// target at top speed for `T0`, zero steering, every time variable at `T0`.
    pub fn straight_line_guess(&self, params: &Parameters) -> Trajectory {
        let config = self.config();
        let n = config.stages;
        let t0 = config.time_guess;
        let start = Vector2::new(params.initial_state[POS_X], params.initial_state[POS_Y]);
        let offset = Vector2::new(config.target[0], config.target[1]) - start;

        let speed = config.control_bounds.speed.upper;
        let steering = 0.0_f64.clamp(
            config.control_bounds.steering.lower,
            config.control_bounds.steering.upper,
        );

        let (direction, heading) = match offset.try_normalize(f64::EPSILON) {
            Some(dir) => (dir, dir.y.atan2(dir.x)),
            None => (Vector2::zeros(), params.initial_state[HEADING]),
        };

        let states = (0..=n)
            .map(|k| {
                let pos = start + direction * (speed * t0 * k as f64 / n as f64);
                let mut state = [0.0; STATE_DIM];
                state[POS_X] = pos.x;
                state[POS_Y] = pos.y;
                state[HEADING] = heading;
                state
            })
            .collect();

        let mut control = [0.0; CONTROL_DIM];
        control[STEERING] = steering;
        control[SPEED] = speed;

        let time_copies = vec![t0; self.layout().time_indices().len()];
        Trajectory {
            states,
            controls: vec![control; n],
            time_copies,
            total_time: t0,
        }
    }

    /// Flattens a structured guess into decision-vector order.
    pub fn pack_guess(&self, guess: &Trajectory) -> TranscriptionResult<Vec<f64>> {
        let layout = self.layout();
        let times = layout.time_indices();
        for (what, got, expected) in [
            ("guess states", guess.states.len(), layout.stages().len()),
            ("guess controls", guess.controls.len(), layout.intervals()),
            ("guess time copies", guess.time_copies.len(), times.len()),
        ] {
            if got != expected {
                return Err(TranscriptionError::LengthMismatch {
                    what,
                    expected,
                    got,
                });
            }
        }

        let mut x = vec![0.0; layout.len()];
        for (k, slots) in layout.stages().iter().enumerate() {
            x[slots.state.clone()].copy_from_slice(&guess.states[k]);
            if let Some(range) = &slots.control {
                x[range.clone()].copy_from_slice(&guess.controls[k]);
            }
        }
        for (&index, &value) in times.iter().zip(&guess.time_copies) {
            x[index] = value;
        }
        Ok(x)
    }

    /// Packs bounds, tags, guess and parameters into one validated problem.
    pub fn pack(
        &self,
        guess: &Trajectory,
        params: &Parameters,
    ) -> TranscriptionResult<PackedProblem> {
        let x0 = self.pack_guess(guess)?;
        let (lbx, ubx) = split(&self.variable_bounds());
        let (row_bounds, equality) = self.constraint_bounds();
        let (lbg, ubg) = split(&row_bounds);

        let packed = PackedProblem {
            x0,
            lbx,
            ubx,
            lbg,
            ubg,
            equality,
            p: params.to_vec(),
            variable_stage: self.layout().variable_stages(),
        };
        packed.validate()?;
        debug!(
            variables = packed.num_variables(),
            constraints = packed.num_constraints(),
            equalities = packed.equality.iter().filter(|&&e| e).count(),
            guess_time = mean(&guess.time_copies),
            "packed problem"
        );
        Ok(packed)
    }
}
