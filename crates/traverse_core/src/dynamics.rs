use crate::error::{TranscriptionError, TranscriptionResult};
use crate::traits::{ControlSystem, Scalar};
use serde::{Deserialize, Serialize};

/// State dimension: `(x, y, heading)`.
pub const STATE_DIM: usize = 3;
/// Control dimension: `(steering, speed)`.
pub const CONTROL_DIM: usize = 2;

pub const POS_X: usize = 0;
pub const POS_Y: usize = 1;
pub const HEADING: usize = 2;
pub const STEERING: usize = 0;
pub const SPEED: usize = 1;

/// Physical constants of the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleParams {
    /// Distance between the axles [m].
    pub wheelbase: f64,
}

impl Default for VehicleParams {
    fn default() -> Self {
        Self { wheelbase: 1.0 }
    }
}

impl VehicleParams {
    pub fn new(wheelbase: f64) -> TranscriptionResult<Self> {
        if !(wheelbase.is_finite() && wheelbase > 0.0) {
            return Err(TranscriptionError::config(
                "wheelbase",
                format!("must be positive and finite, got {wheelbase}"),
            ));
        }
        Ok(Self { wheelbase })
    }
}

/// Kinematic bicycle model (LaValle, Planning Algorithms, 2006, pp. 724–725).
///
/// ```text
/// ẋ = v cos θ
/// ẏ = v sin θ
/// θ̇ = v / L · tan δ
/// ```
///
/// The steering angle `δ` must stay away from ±π/2; the tangent is not
/// guarded and a singular steering angle propagates non-finite values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KinematicBicycle {
    params: VehicleParams,
}

impl KinematicBicycle {
    pub fn new(params: VehicleParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &VehicleParams {
        &self.params
    }
}

impl Default for KinematicBicycle {
    fn default() -> Self {
        Self::new(VehicleParams::default())
    }
}

impl ControlSystem for KinematicBicycle {
    fn state_dim(&self) -> usize {
        STATE_DIM
    }

    fn control_dim(&self) -> usize {
        CONTROL_DIM
    }

    fn rhs<T: Scalar>(&self, x: &[T], u: &[T], out: &mut [T]) {
        let heading = x[HEADING];
        let speed = u[SPEED];
        out[POS_X] = speed * heading.cos();
        out[POS_Y] = speed * heading.sin();
        out[HEADING] = speed / T::lift(self.params.wheelbase) * u[STEERING].tan();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn straight_driving_moves_along_heading() {
        let model = KinematicBicycle::default();
        let mut out = [0.0; STATE_DIM];
        model.rhs(&[0.0, 0.0, FRAC_PI_2], &[0.0, 1.0], &mut out);
        assert!(out[POS_X].abs() < 1e-15);
        assert!((out[POS_Y] - 1.0).abs() < 1e-15);
        assert_eq!(out[HEADING], 0.0);
    }

    #[test]
    fn heading_rate_scales_inversely_with_wheelbase() {
        let short = KinematicBicycle::new(VehicleParams::new(0.5).expect("valid wheelbase"));
        let long = KinematicBicycle::new(VehicleParams::new(2.0).expect("valid wheelbase"));
        let (mut a, mut b) = ([0.0; STATE_DIM], [0.0; STATE_DIM]);
        short.rhs(&[0.0, 0.0, 0.0], &[0.2, 1.0], &mut a);
        long.rhs(&[0.0, 0.0, 0.0], &[0.2, 1.0], &mut b);
        assert!((a[HEADING] / b[HEADING] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn dual_evaluation_gives_steering_sensitivity() {
        let model = KinematicBicycle::default();
        let x = [Dual::constant(0.0), Dual::constant(0.0), Dual::constant(0.0)];
        let u = [Dual::variable(0.1), Dual::constant(0.8)];
        let mut out = [Dual::default(); STATE_DIM];
        model.rhs(&x, &u, &mut out);
        let expected = 0.8 / (0.1_f64.cos() * 0.1_f64.cos());
        assert!((out[HEADING].eps - expected).abs() < 1e-12);
        assert_eq!(out[POS_X].eps, 0.0);
    }

    #[test]
    fn rejects_non_positive_wheelbase() {
        assert!(VehicleParams::new(0.0).is_err());
        assert!(VehicleParams::new(f64::NAN).is_err());
    }
}
