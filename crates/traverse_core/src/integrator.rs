use crate::error::{TranscriptionError, TranscriptionResult};
use crate::traits::{ControlSystem, Scalar};
use serde::{Deserialize, Serialize};

/// Explicit Runge-Kutta schemes available to the fixed-step integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RkScheme {
    Euler,
    Midpoint,
    /// Classic 4th order.
    #[default]
    Rk4,
    /// Tsitouras 5th order (fixed step, no error estimate).
    Tsit5,
}

/// Butcher tableau of an explicit scheme. `a` is strictly lower triangular and
/// stored row by row: `a[i]` holds the coefficients of stage `i + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct ButcherTableau {
    pub a: Vec<Vec<f64>>,
    pub b: Vec<f64>,
}

impl ButcherTableau {
    pub fn stages(&self) -> usize {
        self.b.len()
    }

    pub fn for_scheme(scheme: RkScheme) -> Self {
        match scheme {
            RkScheme::Euler => Self {
                a: Vec::new(),
                b: vec![1.0],
            },
            RkScheme::Midpoint => Self {
                a: vec![vec![0.5]],
                b: vec![0.0, 1.0],
            },
            RkScheme::Rk4 => Self {
                a: vec![vec![0.5], vec![0.0, 0.5], vec![0.0, 0.0, 1.0]],
                b: vec![1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
            },
            RkScheme::Tsit5 => Self {
                a: vec![
                    vec![0.161],
                    vec![-0.008480655492356989, 0.335480655492357],
                    vec![2.898, -6.359447987781783, 4.361447987781783],
                    vec![
                        5.325864858437957,
                        -11.748883564062828,
                        7.495539342889693,
                        -0.09249506636030195,
                    ],
                    vec![
                        5.86145544294642,
                        -12.92096931784711,
                        8.159367898576159,
                        -0.071584973281401,
                        -0.02826857949054663,
                    ],
                ],
                b: vec![
                    0.09646076681806523,
                    0.01,
                    0.4798896504144996,
                    1.379008574103742,
                    -3.290069515436099,
                    2.324710524099774,
                ],
            },
        }
    }
}

/// Integrator settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegratorConfig {
    pub scheme: RkScheme,
    /// Number of equal sub-steps (finite elements) per interval.
    pub steps: usize,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            scheme: RkScheme::Rk4,
            steps: 4,
        }
    }
}

/// Fixed-step explicit Runge-Kutta integrator over a scaled interval.
///
/// The time-scaled system `dx/dτ = dt · f(x, u)` is integrated over `τ ∈ [0, 1]`
/// in `steps` equal sub-steps, so `dt` enters the arithmetic like any other
/// input and derivatives with respect to it come out of a dual evaluation.
/// `dt = 0` reproduces the input state exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedStepIntegrator {
    config: IntegratorConfig,
    tableau: ButcherTableau,
}

impl FixedStepIntegrator {
    pub fn new(config: IntegratorConfig) -> TranscriptionResult<Self> {
        if config.steps == 0 {
            return Err(TranscriptionError::config(
                "steps",
                "the integrator needs at least one sub-step",
            ));
        }
        Ok(Self {
            config,
            tableau: ButcherTableau::for_scheme(config.scheme),
        })
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }

    pub fn tableau(&self) -> &ButcherTableau {
        &self.tableau
    }

    /// Integrates `system` from `x` under constant `u` over an interval of
    /// length `dt`, writing the final state into `out`.
    pub fn integrate<T: Scalar, S: ControlSystem>(
        &self,
        system: &S,
        x: &[T],
        u: &[T],
        dt: T,
        out: &mut [T],
    ) {
        let n = x.len();
        let zero = T::lift(0.0);
        let h = dt * T::lift(1.0 / self.config.steps as f64);
        let stages = self.tableau.stages();

        let mut k = vec![vec![zero; n]; stages];
        let mut tmp = vec![zero; n];
        out[..n].copy_from_slice(x);

        for _ in 0..self.config.steps {
            for s in 0..stages {
                tmp.copy_from_slice(&out[..n]);
                if s > 0 {
                    for (j, &a) in self.tableau.a[s - 1].iter().enumerate() {
                        if a == 0.0 {
                            continue;
                        }
                        let a = T::lift(a);
                        for i in 0..n {
                            tmp[i] = tmp[i] + h * a * k[j][i];
                        }
                    }
                }
                system.rhs(&tmp, u, &mut k[s]);
            }

            for i in 0..n {
                let mut incr = zero;
                for (s, &b) in self.tableau.b.iter().enumerate() {
                    if b != 0.0 {
                        incr = incr + T::lift(b) * k[s][i];
                    }
                }
                out[i] = out[i] + h * incr;
            }
        }
    }
}

/// Discrete transition `F(x, u, dt)`: a dynamics model bound to an integrator.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMap<S> {
    system: S,
    integrator: FixedStepIntegrator,
}

impl<S: ControlSystem> TransitionMap<S> {
    pub fn new(system: S, integrator: FixedStepIntegrator) -> Self {
        Self { system, integrator }
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn integrator(&self) -> &FixedStepIntegrator {
        &self.integrator
    }

    pub fn state_dim(&self) -> usize {
        self.system.state_dim()
    }

    pub fn control_dim(&self) -> usize {
        self.system.control_dim()
    }

    pub fn advance<T: Scalar>(&self, x: &[T], u: &[T], dt: T, out: &mut [T]) {
        self.integrator.integrate(&self.system, x, u, dt, out);
    }
}
