//! Direct multiple-shooting transcription.
//!
//! ```text
//! minimize    T + w · Σₖ xₖ²
//! subject to  Xₖ₊₁ − F(Xₖ, Uₖ, Tₖ/N) = 0      k = 0..N-1   (defects)
//!             Tₖ₊₁ − Tₖ = 0                    (per-stage time only)
//!             X₀ − p = 0                       (initial state parameter)
//!             U_lo ≤ Uₖ ≤ U_hi                 (control bounds)
//!             ‖posₖ − c‖² ≥ r²                 k = 0..N-1   (obstacle)
//!             pos_N = target                   (terminal)
//!             T ≥ 0
//! ```

use crate::autodiff::Dual;
use crate::dynamics::{KinematicBicycle, CONTROL_DIM, POS_X, POS_Y, SPEED, STATE_DIM, STEERING};
use crate::error::{TranscriptionError, TranscriptionResult};
use crate::integrator::TransitionMap;
use crate::layout::{TimeLayout, VariableLayout, VariableOrdering};
use crate::traits::Scalar;
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_6;
use std::ops::Range;
use tracing::info;

/// Closed interval `[lower, upper]`; either end may be infinite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    pub const FREE: Self = Self::new(f64::NEG_INFINITY, f64::INFINITY);

    pub const fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub const fn fixed(value: f64) -> Self {
        Self::new(value, value)
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// Circular exclusion zone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub center: [f64; 2],
    pub radius: f64,
}

impl Obstacle {
    /// Lower bound of the squared-distance row.
    pub fn clearance_sq(&self) -> f64 {
        self.radius * self.radius
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlBounds {
    pub steering: Interval,
    pub speed: Interval,
}

impl Default for ControlBounds {
    fn default() -> Self {
        Self {
            steering: Interval::new(-FRAC_PI_6, FRAC_PI_6),
            speed: Interval::new(0.0, 1.0),
        }
    }
}

impl ControlBounds {
    /// Bounds indexed like the control vector.
    pub fn per_component(&self) -> [Interval; CONTROL_DIM] {
        let mut out = [Interval::FREE; CONTROL_DIM];
        out[STEERING] = self.steering;
        out[SPEED] = self.speed;
        out
    }
}

/// Where control bounds end up in the NLP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoundPlacement {
    /// Simple bounds on the control variables.
    #[default]
    Variables,
    /// Explicit inequality rows, one block per stage.
    Constraints,
}

/// Shape of the horizon and the problem data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizonConfig {
    /// Number of shooting intervals `N`.
    pub stages: usize,
    /// Nominal horizon time `T0`, used by the default initial guess.
    pub time_guess: f64,
    pub obstacle: Obstacle,
    pub target: [f64; 2],
    pub control_bounds: ControlBounds,
    pub time_layout: TimeLayout,
    pub ordering: VariableOrdering,
    pub control_bounds_as: BoundPlacement,
    /// Weight of `Σ xₖ²` in the objective.
    pub regularization_weight: f64,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            stages: 20,
            time_guess: 10.0,
            obstacle: Obstacle {
                center: [0.2, 5.0],
                radius: 1.0,
            },
            target: [0.0, 10.0],
            control_bounds: ControlBounds::default(),
            time_layout: TimeLayout::Shared,
            ordering: VariableOrdering::StageMajor,
            control_bounds_as: BoundPlacement::Variables,
            regularization_weight: 1.0,
        }
    }
}

impl HorizonConfig {
    pub fn validate(&self) -> TranscriptionResult<()> {
        if self.stages == 0 {
            return Err(TranscriptionError::config("stages", "need at least one interval"));
        }
        if !(self.time_guess.is_finite() && self.time_guess > 0.0) {
            return Err(TranscriptionError::config(
                "time_guess",
                format!("must be positive and finite, got {}", self.time_guess),
            ));
        }
        if !(self.obstacle.radius.is_finite() && self.obstacle.radius >= 0.0) {
            return Err(TranscriptionError::config(
                "obstacle.radius",
                format!("must be non-negative and finite, got {}", self.obstacle.radius),
            ));
        }
        if !self.obstacle.center.iter().chain(&self.target).all(|v| v.is_finite()) {
            return Err(TranscriptionError::config(
                "target",
                "obstacle center and target must be finite",
            ));
        }
        for (field, bound) in [
            ("control_bounds.steering", self.control_bounds.steering),
            ("control_bounds.speed", self.control_bounds.speed),
        ] {
            if !(bound.lower.is_finite() && bound.upper.is_finite() && bound.lower <= bound.upper)
            {
                return Err(TranscriptionError::config(
                    field,
                    format!("need finite lower <= upper, got [{}, {}]", bound.lower, bound.upper),
                ));
            }
        }
        if !(self.regularization_weight.is_finite() && self.regularization_weight >= 0.0) {
            return Err(TranscriptionError::config(
                "regularization_weight",
                "must be non-negative and finite",
            ));
        }
        Ok(())
    }
}

/// What a block of constraint rows enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintKind {
    /// `X_{k+1} − F(X_k, U_k, T_k/N)`, `nx` rows.
    Defect { stage: usize },
    /// `T_{k+1} − T_k`, one row.
    TimeLink { stage: usize },
    /// `X_0 − p`, `nx` rows.
    InitialState,
    /// `U_k`, `nu` rows.
    ControlBounds { stage: usize },
    /// `‖pos_k − c‖²`, one row.
    Obstacle { stage: usize },
    /// `pos_N`, two rows.
    Terminal,
}

impl ConstraintKind {
    pub fn is_equality(&self) -> bool {
        !matches!(self, Self::ControlBounds { .. } | Self::Obstacle { .. })
    }
}

/// Contiguous rows of the constraint vector produced by one [`ConstraintKind`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintBlock {
    pub kind: ConstraintKind,
    pub rows: Range<usize>,
    pub bounds: Vec<Interval>,
    /// Decision variables the rows depend on.
    pub dependencies: Vec<usize>,
}

impl ConstraintBlock {
    pub fn is_equality(&self) -> bool {
        self.kind.is_equality()
    }
}

/// A built, immutable transcription.
#[derive(Debug, Clone)]
pub struct Transcription {
    config: HorizonConfig,
    transition: TransitionMap<KinematicBicycle>,
    layout: VariableLayout,
    blocks: Vec<ConstraintBlock>,
    num_rows: usize,
    objective_dependencies: Vec<usize>,
}

impl Transcription {
    pub fn new(
        transition: TransitionMap<KinematicBicycle>,
        config: HorizonConfig,
    ) -> TranscriptionResult<Self> {
        config.validate()?;
        let n = config.stages;
        let layout = VariableLayout::new(
            n,
            STATE_DIM,
            CONTROL_DIM,
            config.time_layout,
            config.ordering,
        );

        let mut blocks = Vec::new();
        let mut next_row = 0usize;
        let mut push = |kind: ConstraintKind, bounds: Vec<Interval>, dependencies: Vec<usize>| {
            let rows = next_row..next_row + bounds.len();
            next_row = rows.end;
            blocks.push(ConstraintBlock {
                kind,
                rows,
                bounds,
                dependencies,
            });
        };

        let control_rows = config.control_bounds.per_component().to_vec();
        let clearance = Interval::new(config.obstacle.clearance_sq(), f64::INFINITY);
        let target = config.target;

        for k in 0..n {
            let here = layout.stage(k);
            let next = layout.stage(k + 1);
            let control = here.control.clone().unwrap_or(0..0);

            let mut deps: Vec<usize> = here.state.clone().collect();
            deps.extend(control.clone());
            deps.push(layout.time_index(k));
            deps.extend(next.state.clone());
            push(
                ConstraintKind::Defect { stage: k },
                vec![Interval::fixed(0.0); STATE_DIM],
                deps,
            );

            if config.time_layout == TimeLayout::PerStage {
                push(
                    ConstraintKind::TimeLink { stage: k },
                    vec![Interval::fixed(0.0)],
                    vec![layout.time_index(k), layout.time_index(k + 1)],
                );
            }

            if k == 0 {
                push(
                    ConstraintKind::InitialState,
                    vec![Interval::fixed(0.0); STATE_DIM],
                    here.state.clone().collect(),
                );
            }

            if config.control_bounds_as == BoundPlacement::Constraints {
                push(
                    ConstraintKind::ControlBounds { stage: k },
                    control_rows.clone(),
                    control.clone().collect(),
                );
            }

            push(
                ConstraintKind::Obstacle { stage: k },
                vec![clearance],
                vec![here.state.start + POS_X, here.state.start + POS_Y],
            );

            if k == n - 1 {
                let last = &next.state;
                push(
                    ConstraintKind::Terminal,
                    vec![Interval::fixed(target[0]), Interval::fixed(target[1])],
                    vec![last.start + POS_X, last.start + POS_Y],
                );
            }
        }

        let mut objective_dependencies = layout.time_indices();
        objective_dependencies.extend(layout.stages().iter().map(|s| s.state.start + POS_X));

        info!(
            stages = n,
            variables = layout.len(),
            constraints = next_row,
            time_layout = ?config.time_layout,
            ordering = ?config.ordering,
            "built multiple-shooting transcription"
        );

        Ok(Self {
            config,
            transition,
            layout,
            blocks,
            num_rows: next_row,
            objective_dependencies,
        })
    }

    pub fn config(&self) -> &HorizonConfig {
        &self.config
    }

    pub fn layout(&self) -> &VariableLayout {
        &self.layout
    }

    pub fn transition(&self) -> &TransitionMap<KinematicBicycle> {
        &self.transition
    }

    pub fn blocks(&self) -> &[ConstraintBlock] {
        &self.blocks
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_variables(&self) -> usize {
        self.layout.len()
    }

    /// Length of the parameter block (the initial state).
    pub fn num_parameters(&self) -> usize {
        STATE_DIM
    }

    pub fn objective_dependencies(&self) -> &[usize] {
        &self.objective_dependencies
    }

    /// Simple bounds on the decision vector.
    pub fn variable_bounds(&self) -> Vec<Interval> {
        let mut bounds = vec![Interval::FREE; self.layout.len()];
        for t in self.layout.time_indices() {
            bounds[t] = Interval::new(0.0, f64::INFINITY);
        }
        if self.config.control_bounds_as == BoundPlacement::Variables {
            let per_component = self.config.control_bounds.per_component();
            for slots in self.layout.stages() {
                if let Some(control) = &slots.control {
                    for (i, index) in control.clone().enumerate() {
                        bounds[index] = per_component[i];
                    }
                }
            }
        }
        bounds
    }

    /// Row bounds and equality tags, one entry per constraint row.
    pub fn constraint_bounds(&self) -> (Vec<Interval>, Vec<bool>) {
        let mut bounds = Vec::with_capacity(self.num_rows);
        let mut equality = Vec::with_capacity(self.num_rows);
        for block in &self.blocks {
            bounds.extend_from_slice(&block.bounds);
            equality.extend(std::iter::repeat(block.is_equality()).take(block.bounds.len()));
        }
        (bounds, equality)
    }

    /// Objective value on any scalar type.
    pub fn objective_value<T: Scalar>(&self, x: &[T]) -> T {
        let times = self.layout.time_indices();
        let mut horizon = T::lift(0.0);
        for &t in &times {
            horizon = horizon + x[t];
        }
        horizon = horizon / T::lift(times.len() as f64);

        let mut regularization = T::lift(0.0);
        for slots in self.layout.stages() {
            let px = x[slots.state.start + POS_X];
            regularization = regularization + px * px;
        }
        horizon + T::lift(self.config.regularization_weight) * regularization
    }

    /// Evaluates the rows of `block` into `out` (length `block.rows.len()`).
    pub fn evaluate_block<T: Scalar>(
        &self,
        block: &ConstraintBlock,
        x: &[T],
        p: &[T],
        out: &mut [T],
    ) {
        let layout = &self.layout;
        match block.kind {
            ConstraintKind::Defect { stage } => {
                let here = layout.stage(stage);
                let next = layout.stage(stage + 1);
                let control = here.control.clone().unwrap_or(0..0);
                let dt = x[layout.time_index(stage)] / T::lift(self.config.stages as f64);
                let mut predicted = [T::lift(0.0); STATE_DIM];
                self.transition
                    .advance(&x[here.state.clone()], &x[control], dt, &mut predicted);
                for (i, index) in next.state.clone().enumerate() {
                    out[i] = x[index] - predicted[i];
                }
            }
            ConstraintKind::TimeLink { stage } => {
                out[0] = x[layout.time_index(stage + 1)] - x[layout.time_index(stage)];
            }
            ConstraintKind::InitialState => {
                for (i, index) in layout.stage(0).state.clone().enumerate() {
                    out[i] = x[index] - p[i];
                }
            }
            ConstraintKind::ControlBounds { stage } => {
                if let Some(control) = &layout.stage(stage).control {
                    for (i, index) in control.clone().enumerate() {
                        out[i] = x[index];
                    }
                }
            }
            ConstraintKind::Obstacle { stage } => {
                let [cx, cy] = self.config.obstacle.center;
                let start = layout.stage(stage).state.start;
                let dx = x[start + POS_X] - T::lift(cx);
                let dy = x[start + POS_Y] - T::lift(cy);
                out[0] = dx * dx + dy * dy;
            }
            ConstraintKind::Terminal => {
                let start = layout.stage(layout.intervals()).state.start;
                out[0] = x[start + POS_X];
                out[1] = x[start + POS_Y];
            }
        }
    }

    /// Full constraint vector on any scalar type.
    pub fn constraint_values<T: Scalar>(&self, x: &[T], p: &[T], out: &mut [T]) {
        for block in &self.blocks {
            self.evaluate_block(block, x, p, &mut out[block.rows.clone()]);
        }
    }

    /// Visits every structural Jacobian entry `(row, column, ∂g_row/∂x_column)`.
    ///
    /// One forward-mode sweep per dependency of each block; entries are
    /// reported block by block in row order.
    pub fn visit_jacobian(&self, x: &[f64], p: &[f64], visit: &mut dyn FnMut(usize, usize, f64)) {
        let mut xd: Vec<Dual> = x.iter().copied().map(Dual::constant).collect();
        let pd: Vec<Dual> = p.iter().copied().map(Dual::constant).collect();
        let mut out = Vec::new();
        for block in &self.blocks {
            out.clear();
            out.resize(block.rows.len(), Dual::default());
            for &column in &block.dependencies {
                xd[column].eps = 1.0;
                self.evaluate_block(block, &xd, &pd, &mut out);
                xd[column].eps = 0.0;
                for (offset, value) in out.iter().enumerate() {
                    visit(block.rows.start + offset, column, value.eps);
                }
            }
        }
    }

    /// Objective gradient by forward-mode sweeps over the objective's dependencies.
    pub fn objective_gradient_into(&self, x: &[f64], grad: &mut [f64]) {
        grad.iter_mut().for_each(|g| *g = 0.0);
        let mut xd: Vec<Dual> = x.iter().copied().map(Dual::constant).collect();
        for &column in &self.objective_dependencies {
            xd[column].eps = 1.0;
            grad[column] = self.objective_value(&xd).eps;
            xd[column].eps = 0.0;
        }
    }
}
