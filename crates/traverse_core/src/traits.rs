use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// Numeric type the dynamics, the integrator and the transcription are evaluated on.
///
/// Implemented for `f64` (plain evaluation) and for [`Dual`](crate::autodiff::Dual)
/// (forward-mode derivatives), so one generic definition of a constraint yields
/// both its value and its Jacobian entries.
pub trait Scalar: Float + FromPrimitive + Debug + Send + Sync + 'static {
    /// Lifts a constant into the scalar type (zero derivative part).
    fn lift(value: f64) -> Self;
}

impl Scalar for f64 {
    #[inline]
    fn lift(value: f64) -> Self {
        value
    }
}

/// A continuous-time controlled system `ẋ = f(x, u)`.
pub trait ControlSystem: Send + Sync {
    /// Dimension of the state vector.
    fn state_dim(&self) -> usize;

    /// Dimension of the control vector.
    fn control_dim(&self) -> usize;

    /// Evaluates the state derivative.
    /// x: current state
    /// u: applied control (held constant over the evaluation)
    /// out: buffer receiving dx/dt
    fn rhs<T: Scalar>(&self, x: &[T], u: &[T], out: &mut [T]);
}
