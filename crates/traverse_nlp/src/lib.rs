//! Solver adapter for `traverse_core` transcriptions.
//!
//! A [`Solver`] takes a [`ProblemDescriptor`] (callable NLP functions plus
//! packed arrays), validates it, and runs an augmented-Lagrangian engine from
//! the `optimization_engine` crate:
//! - **Generic** backend: structure-agnostic, streamed or assembled Jacobian products.
//! - **Structured** backend: detects the stage structure first and multiplies
//!   with per-stage blocks. Needs every variable inside a stage block.
//!
//! Structural and configuration problems are `Err`s raised before the engine
//! runs. A run that does not converge is an `Ok` [`Solution`] whose
//! [`SolveStatus`] says why.
pub mod config;
mod engine;
pub mod error;
pub mod problem;
pub mod solution;
pub mod solver;
pub mod structure;

pub use config::{
    BackendConfig, BackendConfigBuilder, BackendKind, BackendOption, EngineSettings,
    StructureDetection,
};
pub use error::{ConfigError, SolveError, StructureError};
pub use problem::ProblemDescriptor;
pub use solution::{SolveStatus, Solution};
pub use solver::Solver;
pub use structure::{StageDims, StageStructure};
