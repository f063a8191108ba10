//! The `traverse_core` crate is the pure engine behind the Traverse planner.
//!
//! It turns a time-optimal vehicle manoeuvre into a nonlinear program by direct
//! multiple shooting. Everything here is deterministic and generic over
//! [`traits::Scalar`], so the same code evaluates on `f64` and on dual numbers.
//!
//! Key components:
//! - **Traits**: `Scalar` (numeric type abstraction), `ControlSystem` (controlled ODEs).
//! - **Integrator**: fixed-step explicit Runge-Kutta over a scaled interval.
//! - **Transcription**: variable layout, constraint blocks, objective and Jacobians.
//! - **Packing / extraction**: parallel bound arrays and their exact inverse.
pub mod autodiff;
pub mod dynamics;
pub mod error;
pub mod extract;
pub mod integrator;
pub mod layout;
pub mod nlp;
pub mod packing;
pub mod traits;
pub mod transcription;

pub use dynamics::{KinematicBicycle, VehicleParams};
pub use error::{TranscriptionError, TranscriptionResult};
pub use extract::Trajectory;
pub use integrator::{FixedStepIntegrator, IntegratorConfig, RkScheme, TransitionMap};
pub use layout::{TimeLayout, VariableLayout, VariableOrdering};
pub use nlp::NlpFunctions;
pub use packing::{PackedProblem, Parameters};
pub use transcription::{BoundPlacement, HorizonConfig, Transcription};

/// Builds the kinematic-bicycle transcription from its three configuration pieces.
pub fn build_transcription(
    vehicle: VehicleParams,
    integrator: IntegratorConfig,
    horizon: HorizonConfig,
) -> TranscriptionResult<Transcription> {
    let vehicle = VehicleParams::new(vehicle.wheelbase)?;
    let transition = TransitionMap::new(
        KinematicBicycle::new(vehicle),
        FixedStepIntegrator::new(integrator)?,
    );
    Transcription::new(transition, horizon)
}
