//! Backend selection and enumerated backend options.
//!
//! Options are collected by [`BackendConfigBuilder`] and checked all at once by
//! [`BackendConfigBuilder::build`], so a misspelt or misplaced option fails at
//! configuration time instead of being silently ignored by the solver.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Structure-agnostic: only bounds, tags and callable functions are used.
    Generic,
    /// Stage-structure exploiting: detects the stage blocks before solving.
    Structured,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => f.write_str("generic"),
            Self::Structured => f.write_str("structured"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StructureDetection {
    Off,
    #[default]
    Auto,
}

/// One backend option.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackendOption {
    /// Assemble the sparse Jacobian before every product instead of streaming it.
    Expand(bool),
    StructureDetection(StructureDetection),
    /// Classify rows by the problem's equality tags (`true`) or by `lower == upper`.
    ExplicitEquality(bool),
    /// Inner (fixed-point residual) tolerance.
    Tolerance(f64),
    /// Outer tolerance on the constraint violation.
    ConstraintTolerance(f64),
    MaxOuterIterations(usize),
    MaxInnerIterations(usize),
    InitialPenalty(f64),
    PenaltyUpdateFactor(f64),
    /// Largest penalty an outer iteration may run with.
    MaxPenalty(f64),
    LbfgsMemory(usize),
    MaxDuration(Duration),
    /// Feasibility restoration steps after the engine stops; `0` disables them.
    PolishIterations(usize),
}

/// Name of a [`BackendOption`], used in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionName {
    Expand,
    StructureDetection,
    ExplicitEquality,
    Tolerance,
    ConstraintTolerance,
    MaxOuterIterations,
    MaxInnerIterations,
    InitialPenalty,
    PenaltyUpdateFactor,
    MaxPenalty,
    LbfgsMemory,
    MaxDuration,
    PolishIterations,
}

impl fmt::Display for OptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Expand => "expand",
            Self::StructureDetection => "structure_detection",
            Self::ExplicitEquality => "explicit_equality",
            Self::Tolerance => "tolerance",
            Self::ConstraintTolerance => "constraint_tolerance",
            Self::MaxOuterIterations => "max_outer_iterations",
            Self::MaxInnerIterations => "max_inner_iterations",
            Self::InitialPenalty => "initial_penalty",
            Self::PenaltyUpdateFactor => "penalty_update_factor",
            Self::MaxPenalty => "max_penalty",
            Self::LbfgsMemory => "lbfgs_memory",
            Self::MaxDuration => "max_duration",
            Self::PolishIterations => "polish_iterations",
        };
        f.write_str(name)
    }
}

impl BackendOption {
    pub fn name(&self) -> OptionName {
        match self {
            Self::Expand(_) => OptionName::Expand,
            Self::StructureDetection(_) => OptionName::StructureDetection,
            Self::ExplicitEquality(_) => OptionName::ExplicitEquality,
            Self::Tolerance(_) => OptionName::Tolerance,
            Self::ConstraintTolerance(_) => OptionName::ConstraintTolerance,
            Self::MaxOuterIterations(_) => OptionName::MaxOuterIterations,
            Self::MaxInnerIterations(_) => OptionName::MaxInnerIterations,
            Self::InitialPenalty(_) => OptionName::InitialPenalty,
            Self::PenaltyUpdateFactor(_) => OptionName::PenaltyUpdateFactor,
            Self::MaxPenalty(_) => OptionName::MaxPenalty,
            Self::LbfgsMemory(_) => OptionName::LbfgsMemory,
            Self::MaxDuration(_) => OptionName::MaxDuration,
            Self::PolishIterations(_) => OptionName::PolishIterations,
        }
    }
}

impl BackendKind {
    pub fn recognizes(&self, option: OptionName) -> bool {
        match option {
            OptionName::Expand => *self == Self::Generic,
            OptionName::StructureDetection | OptionName::ExplicitEquality => {
                *self == Self::Structured
            }
            _ => true,
        }
    }
}

/// Numerical settings of the augmented-Lagrangian engine.
///
/// The outer loop stops once another penalty update would exceed
/// `max_penalty`, so PANOC never sees a penalty above it. The polishing
/// steps that follow drive the bound violation below `polish_tolerance`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub tolerance: f64,
    pub constraint_tolerance: f64,
    pub max_outer_iterations: usize,
    pub max_inner_iterations: usize,
    pub initial_penalty: f64,
    pub penalty_update_factor: f64,
    pub max_penalty: f64,
    pub initial_inner_tolerance: f64,
    pub inner_tolerance_update_factor: f64,
    pub sufficient_decrease_coefficient: f64,
    pub lbfgs_memory: usize,
    pub max_duration: Option<Duration>,
    pub polish_iterations: usize,
    pub polish_tolerance: f64,
}

impl EngineSettings {
    /// Outer iterations that fit under `max_penalty`.
    ///
    /// Iteration `k` runs with a penalty of at most
    /// `initial_penalty · penalty_update_factor^(k - 1)`.
    pub fn outer_iteration_limit(&self) -> usize {
        let headroom = (self.max_penalty / self.initial_penalty).ln();
        let updates = (headroom / self.penalty_update_factor.ln()).max(0.0).floor() as usize;
        self.max_outer_iterations.min(updates.saturating_add(1))
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            constraint_tolerance: 1e-5,
            max_outer_iterations: 100,
            max_inner_iterations: 2000,
            initial_penalty: 10.0,
            penalty_update_factor: 5.0,
            max_penalty: 1e8,
            initial_inner_tolerance: 1e-2,
            inner_tolerance_update_factor: 0.1,
            sufficient_decrease_coefficient: 0.1,
            lbfgs_memory: 10,
            max_duration: None,
            polish_iterations: 8,
            polish_tolerance: 1e-10,
        }
    }
}

/// A validated backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub expand: bool,
    pub structure_detection: StructureDetection,
    pub explicit_equality: bool,
    pub engine: EngineSettings,
}

impl BackendConfig {
    pub fn builder(kind: BackendKind) -> BackendConfigBuilder {
        BackendConfigBuilder {
            kind,
            options: Vec::new(),
        }
    }

    /// Generic backend with every option at its default.
    pub fn generic() -> Self {
        Self::defaults(BackendKind::Generic)
    }

    /// Structured backend with automatic structure detection.
    pub fn structured() -> Self {
        Self::defaults(BackendKind::Structured)
    }

    fn defaults(kind: BackendKind) -> Self {
        Self {
            kind,
            expand: false,
            structure_detection: StructureDetection::Auto,
            explicit_equality: true,
            engine: EngineSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfigBuilder {
    kind: BackendKind,
    options: Vec<BackendOption>,
}

impl BackendConfigBuilder {
    pub fn option(mut self, option: BackendOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn options(mut self, options: impl IntoIterator<Item = BackendOption>) -> Self {
        self.options.extend(options);
        self
    }

    pub fn build(self) -> Result<BackendConfig, ConfigError> {
        let mut config = BackendConfig::defaults(self.kind);
        let mut seen: Vec<OptionName> = Vec::with_capacity(self.options.len());

        for option in self.options {
            let name = option.name();
            if !self.kind.recognizes(name) {
                return Err(ConfigError::UnrecognizedOption {
                    backend: self.kind,
                    option: name,
                });
            }
            if seen.contains(&name) {
                return Err(ConfigError::DuplicateOption(name));
            }
            seen.push(name);

            let engine = &mut config.engine;
            match option {
                BackendOption::Expand(on) => config.expand = on,
                BackendOption::StructureDetection(mode) => config.structure_detection = mode,
                BackendOption::ExplicitEquality(on) => config.explicit_equality = on,
                BackendOption::Tolerance(v) => engine.tolerance = positive(name, v)?,
                BackendOption::ConstraintTolerance(v) => {
                    engine.constraint_tolerance = positive(name, v)?
                }
                BackendOption::MaxOuterIterations(v) => {
                    engine.max_outer_iterations = nonzero(name, v)?
                }
                BackendOption::MaxInnerIterations(v) => {
                    engine.max_inner_iterations = nonzero(name, v)?
                }
                BackendOption::InitialPenalty(v) => engine.initial_penalty = positive(name, v)?,
                BackendOption::PenaltyUpdateFactor(v) => {
                    if !(v.is_finite() && v > 1.0) {
                        return Err(ConfigError::InvalidValue {
                            option: name,
                            value: v.to_string(),
                            reason: "must be finite and greater than 1",
                        });
                    }
                    engine.penalty_update_factor = v;
                }
                BackendOption::MaxPenalty(v) => engine.max_penalty = positive(name, v)?,
                BackendOption::LbfgsMemory(v) => engine.lbfgs_memory = nonzero(name, v)?,
                BackendOption::MaxDuration(d) => {
                    if d.is_zero() {
                        return Err(ConfigError::InvalidValue {
                            option: name,
                            value: format!("{d:?}"),
                            reason: "must be positive",
                        });
                    }
                    engine.max_duration = Some(d);
                }
                BackendOption::PolishIterations(v) => engine.polish_iterations = v,
            }
        }

        if config.engine.max_penalty < config.engine.initial_penalty {
            return Err(ConfigError::UnsupportedCombination {
                backend: config.kind,
                reason: "max_penalty must not be below initial_penalty",
            });
        }

        if config.kind == BackendKind::Structured
            && config.structure_detection == StructureDetection::Off
        {
            return Err(ConfigError::UnsupportedCombination {
                backend: config.kind,
                reason: "the structured backend requires stage-structure detection",
            });
        }
        Ok(config)
    }
}

fn positive(option: OptionName, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            option,
            value: value.to_string(),
            reason: "must be positive and finite",
        })
    }
}

fn nonzero(option: OptionName, value: usize) -> Result<usize, ConfigError> {
    if value > 0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            option,
            value: value.to_string(),
            reason: "must be at least 1",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shortcut_constructors() {
        let built = BackendConfig::builder(BackendKind::Generic)
            .build()
            .expect("empty option list should be valid");
        assert_eq!(built, BackendConfig::generic());
        assert!(!built.expand);
    }

    #[test]
    fn options_override_engine_settings() {
        let config = BackendConfig::builder(BackendKind::Generic)
            .options([
                BackendOption::Expand(true),
                BackendOption::Tolerance(1e-8),
                BackendOption::MaxOuterIterations(7),
                BackendOption::MaxDuration(Duration::from_millis(250)),
            ])
            .build()
            .expect("options should be accepted");
        assert!(config.expand);
        assert_eq!(config.engine.tolerance, 1e-8);
        assert_eq!(config.engine.max_outer_iterations, 7);
        assert_eq!(config.engine.max_duration, Some(Duration::from_millis(250)));
    }

    #[test]
    fn structured_only_options_are_refused_by_generic() {
        let err = BackendConfig::builder(BackendKind::Generic)
            .option(BackendOption::StructureDetection(StructureDetection::Auto))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnrecognizedOption {
                backend: BackendKind::Generic,
                option: OptionName::StructureDetection,
            }
        );

        let err = BackendConfig::builder(BackendKind::Structured)
            .option(BackendOption::Expand(true))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnrecognizedOption { .. }));
    }

    #[test]
    fn duplicate_option_is_an_error() {
        let err = BackendConfig::builder(BackendKind::Structured)
            .option(BackendOption::ExplicitEquality(true))
            .option(BackendOption::ExplicitEquality(false))
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateOption(OptionName::ExplicitEquality));
    }

    #[test]
    fn structured_without_detection_is_unsupported() {
        let err = BackendConfig::builder(BackendKind::Structured)
            .option(BackendOption::StructureDetection(StructureDetection::Off))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedCombination { .. }));
    }

    #[test]
    fn non_positive_values_are_rejected() {
        for option in [
            BackendOption::Tolerance(0.0),
            BackendOption::ConstraintTolerance(f64::NAN),
            BackendOption::MaxInnerIterations(0),
            BackendOption::PenaltyUpdateFactor(1.0),
            BackendOption::LbfgsMemory(0),
            BackendOption::MaxDuration(Duration::ZERO),
            BackendOption::MaxPenalty(f64::INFINITY),
        ] {
            let err = BackendConfig::builder(BackendKind::Generic)
                .option(option)
                .build()
                .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }), "{option:?}");
        }
    }

    #[test]
    fn penalty_cap_bounds_the_outer_iterations() {
        let defaults = EngineSettings::default();
        // 10·5^10 ≈ 9.8e7 is the last penalty under 1e8
        assert_eq!(defaults.outer_iteration_limit(), 11);

        let config = BackendConfig::builder(BackendKind::Generic)
            .options([
                BackendOption::MaxOuterIterations(4),
                BackendOption::MaxPenalty(1e12),
            ])
            .build()
            .expect("a higher cap is valid");
        assert_eq!(config.engine.outer_iteration_limit(), 4);

        let config = BackendConfig::builder(BackendKind::Generic)
            .option(BackendOption::MaxPenalty(10.0))
            .build()
            .expect("a cap equal to the initial penalty is valid");
        assert_eq!(config.engine.outer_iteration_limit(), 1);
    }

    #[test]
    fn cap_below_initial_penalty_is_unsupported() {
        let err = BackendConfig::builder(BackendKind::Generic)
            .options([
                BackendOption::InitialPenalty(100.0),
                BackendOption::MaxPenalty(50.0),
            ])
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedCombination { .. }));
    }
}
