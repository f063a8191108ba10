//! Augmented-Lagrangian plumbing around `optimization_engine`.
//!
//! The NLP `min f(x) s.t. x ∈ [lbx, ubx], g(x) ∈ [lbg, ubg]` maps onto the
//! engine's form with `U = [lbx, ubx]`, `F1 = g` and `C = [lbg, ubg]`. PANOC
//! solves the inner problems; its only use of the constraint Jacobian is the
//! product `Jᵀ·d`, which [`JacobianProduct`] provides in three flavours.
//!
//! The ALM stops at a moderate violation. [`polish`] then takes minimum-norm
//! Gauss-Newton steps on the active rows until the point is feasible to
//! `polish_tolerance`.

use crate::config::EngineSettings;
use crate::problem::bound_violation;
use crate::solution::SolveStatus;
use crate::structure::{StageBlocks, StageStructure};
use nalgebra::{DMatrix, DVector};
use optimization_engine::alm::{
    AlmCache, AlmFactory, AlmOptimizer, AlmProblem, NO_JACOBIAN_MAPPING, NO_MAPPING,
};
use optimization_engine::constraints::{BallInf, Rectangle};
use optimization_engine::core::ExitStatus;
use optimization_engine::panoc::PANOCCache;
use optimization_engine::FunctionCallResult;
use std::cell::RefCell;
use tracing::warn;
use traverse_core::NlpFunctions;

/// Radius of the multiplier set `Y`.
const MULTIPLIER_BOUND: f64 = 1e12;

/// Rows and variables this close to a bound count as active while polishing.
const ACTIVE_BAND: f64 = 1e-6;

/// Singular values below this are dropped from a polishing step.
const SINGULAR_CUTOFF: f64 = 1e-10;

const MAX_BACKTRACKS: usize = 6;

/// Strategy for `out = J(x)ᵀ · d`.
pub(crate) enum JacobianProduct<'s> {
    /// Stream Jacobian entries straight into the product.
    Streamed,
    /// Assemble the sparse Jacobian, then multiply.
    Assembled,
    /// Dense stage blocks from a detected structure.
    Staged {
        structure: &'s StageStructure,
        blocks: RefCell<StageBlocks>,
    },
}

impl<'s> JacobianProduct<'s> {
    pub(crate) fn staged(structure: &'s StageStructure) -> Self {
        Self::Staged {
            structure,
            blocks: RefCell::new(structure.blocks()),
        }
    }

    pub(crate) fn apply(
        &self,
        functions: &dyn NlpFunctions,
        x: &[f64],
        p: &[f64],
        d: &[f64],
        out: &mut [f64],
    ) {
        match self {
            Self::Streamed => functions.jacobian_transpose_product(x, p, d, out),
            Self::Assembled => {
                let jacobian = functions.constraint_jacobian(x, p);
                out.iter_mut().for_each(|o| *o = 0.0);
                for (row, col, value) in jacobian.triplet_iter() {
                    out[col] += value * d[row];
                }
            }
            Self::Staged { structure, blocks } => {
                let mut blocks = blocks.borrow_mut();
                structure.fill(functions, x, p, &mut blocks);
                structure.transpose_product(&blocks, d, out);
            }
        }
    }
}

/// Engine workspace, kept across solves of identically-sized problems.
pub(crate) struct Workspace {
    variables: usize,
    constraints: usize,
    lbfgs_memory: usize,
    cache: AlmCache,
}

impl Workspace {
    pub(crate) fn new(variables: usize, constraints: usize, settings: &EngineSettings) -> Self {
        let panoc = PANOCCache::new(variables, settings.tolerance, settings.lbfgs_memory);
        Self {
            variables,
            constraints,
            lbfgs_memory: settings.lbfgs_memory,
            cache: AlmCache::new(panoc, constraints, 0),
        }
    }

    pub(crate) fn fits(
        &self,
        variables: usize,
        constraints: usize,
        settings: &EngineSettings,
    ) -> bool {
        self.variables == variables
            && self.constraints == constraints
            && self.lbfgs_memory == settings.lbfgs_memory
    }
}

pub(crate) struct EngineRun {
    pub status: SolveStatus,
    pub outer_iterations: usize,
    pub inner_iterations: usize,
}

/// Runs the ALM/PANOC engine from `u`, leaving the last iterate in `u`.
///
/// A run that ends on non-finite values is a [`SolveStatus::NumericalFailure`]
/// and leaves the last point where the objective was finite, or the start.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run(
    workspace: &mut Workspace,
    functions: &dyn NlpFunctions,
    product: &JacobianProduct<'_>,
    settings: &EngineSettings,
    bounds: (&[f64], &[f64]),
    row_bounds: (&[f64], &[f64]),
    p: &[f64],
    u: &mut [f64],
) -> EngineRun {
    let m = workspace.constraints;
    let has_rows = m > 0;
    let last_finite = RefCell::new(u.to_vec());

    let f = |x: &[f64], cost: &mut f64| -> FunctionCallResult {
        *cost = functions.objective(x);
        if cost.is_finite() && x.iter().all(|v| v.is_finite()) {
            last_finite.borrow_mut().copy_from_slice(x);
        }
        Ok(())
    };
    let df = |x: &[f64], grad: &mut [f64]| -> FunctionCallResult {
        functions.objective_gradient(x, grad);
        Ok(())
    };
    let f1 = |x: &[f64], g: &mut [f64]| -> FunctionCallResult {
        functions.constraints(x, p, g);
        Ok(())
    };
    let jf1t = |x: &[f64], d: &[f64], out: &mut [f64]| -> FunctionCallResult {
        product.apply(functions, x, p, d, out);
        Ok(())
    };

    let set_u = Rectangle::new(Some(bounds.0), Some(bounds.1));
    let set_c = || Rectangle::new(Some(row_bounds.0), Some(row_bounds.1));

    let factory = AlmFactory::new(
        f,
        df,
        has_rows.then_some(f1),
        has_rows.then_some(jf1t),
        NO_MAPPING,
        NO_JACOBIAN_MAPPING,
        has_rows.then(set_c),
        0,
    );
    let problem = AlmProblem::new(
        set_u,
        has_rows.then(set_c),
        has_rows.then(|| BallInf::new(None, MULTIPLIER_BOUND)),
        |x: &[f64], xi: &[f64], cost: &mut f64| -> FunctionCallResult { factory.psi(x, xi, cost) },
        |x: &[f64], xi: &[f64], grad: &mut [f64]| -> FunctionCallResult {
            factory.d_psi(x, xi, grad)
        },
        has_rows.then_some(f1),
        NO_MAPPING,
        m,
        0,
    );

    let zeros = vec![0.0; m];
    let mut optimizer = AlmOptimizer::new(&mut workspace.cache, problem)
        .with_epsilon_tolerance(settings.tolerance)
        .with_delta_tolerance(settings.constraint_tolerance)
        .with_max_outer_iterations(settings.outer_iteration_limit())
        .with_max_inner_iterations(settings.max_inner_iterations)
        .with_initial_penalty(settings.initial_penalty)
        .with_penalty_update_factor(settings.penalty_update_factor)
        .with_initial_inner_tolerance(settings.initial_inner_tolerance.max(settings.tolerance))
        .with_inner_tolerance_update_factor(settings.inner_tolerance_update_factor)
        .with_sufficient_decrease_coefficient(settings.sufficient_decrease_coefficient);
    if has_rows {
        optimizer = optimizer.with_initial_lagrange_multipliers(&zeros);
    }
    if let Some(limit) = settings.max_duration {
        optimizer = optimizer.with_max_duration(limit);
    }

    let mut run = match optimizer.solve(u) {
        Ok(status) => EngineRun {
            status: match status.exit_status() {
                ExitStatus::Converged => SolveStatus::Converged,
                ExitStatus::NotConvergedIterations => SolveStatus::MaxIterations,
                ExitStatus::NotConvergedOutOfTime => SolveStatus::OutOfTime,
            },
            outer_iterations: status.num_outer_iterations(),
            inner_iterations: status.num_inner_iterations(),
        },
        Err(error) => {
            // the engine drops its counters on error
            warn!(?error, "engine stopped on a numerical error");
            EngineRun {
                status: SolveStatus::NumericalFailure,
                outer_iterations: 0,
                inner_iterations: 0,
            }
        }
    };
    if u.iter().any(|v| !v.is_finite()) {
        u.copy_from_slice(&last_finite.borrow());
        run.status = SolveStatus::NumericalFailure;
    }
    run
}

pub(crate) struct Polish {
    pub steps: usize,
    pub violation: f64,
}

/// Feasibility restoration around the point the engine stopped at.
///
/// Each step solves `J_A·dx = clamp(g) - g` in the minimum-norm sense, where
/// `J_A` keeps the rows near or outside their bounds and the variables clear
/// of theirs. Steps are halved until the bound violation drops; the first
/// step that cannot be made to reduce it ends the pass.
pub(crate) fn polish(
    functions: &dyn NlpFunctions,
    settings: &EngineSettings,
    bounds: (&[f64], &[f64]),
    row_bounds: (&[f64], &[f64]),
    p: &[f64],
    u: &mut [f64],
) -> Polish {
    let (lbx, ubx) = bounds;
    let (lbg, ubg) = row_bounds;
    let violation_at = |x: &[f64], g: &mut [f64]| {
        functions.constraints(x, p, g);
        bound_violation(x, lbx, ubx).max(bound_violation(g, lbg, ubg))
    };

    let mut g = vec![0.0; lbg.len()];
    let mut violation = violation_at(&*u, &mut g);
    let mut trial = u.to_vec();
    let mut trial_g = g.clone();
    let mut steps = 0;

    while steps < settings.polish_iterations
        && violation.is_finite()
        && violation > settings.polish_tolerance
    {
        let band = ACTIVE_BAND;
        let mut row_slot = vec![None; g.len()];
        let mut rows = Vec::new();
        for (i, slot) in row_slot.iter_mut().enumerate() {
            if g[i] <= lbg[i] + band || g[i] >= ubg[i] - band {
                *slot = Some(rows.len());
                rows.push(i);
            }
        }
        let mut column_slot = vec![None; u.len()];
        let mut free = 0;
        for (j, slot) in column_slot.iter_mut().enumerate() {
            if u[j] > lbx[j] + band && u[j] < ubx[j] - band {
                *slot = Some(free);
                free += 1;
            }
        }
        if rows.is_empty() || free == 0 {
            break;
        }

        let mut jacobian = DMatrix::<f64>::zeros(rows.len(), free);
        functions.visit_jacobian(u, p, &mut |row, col, value| {
            if let (Some(r), Some(c)) = (row_slot[row], column_slot[col]) {
                jacobian[(r, c)] += value;
            }
        });
        let target = DVector::from_iterator(
            rows.len(),
            rows.iter().map(|&i| g[i].clamp(lbg[i], ubg[i]) - g[i]),
        );
        let Ok(step) = jacobian.svd(true, true).solve(&target, SINGULAR_CUTOFF) else {
            break;
        };

        let mut alpha = 1.0;
        let mut accepted = false;
        for _ in 0..MAX_BACKTRACKS {
            for (j, slot) in column_slot.iter().enumerate() {
                trial[j] = match slot {
                    Some(c) => (u[j] + alpha * step[*c]).clamp(lbx[j], ubx[j]),
                    None => u[j],
                };
            }
            let reduced = violation_at(&trial, &mut trial_g);
            if reduced < violation {
                u.copy_from_slice(&trial);
                std::mem::swap(&mut g, &mut trial_g);
                violation = reduced;
                accepted = true;
                break;
            }
            alpha *= 0.5;
        }
        if !accepted {
            break;
        }
        steps += 1;
    }

    Polish { steps, violation }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit circle `x² + y² = 1` with a linear objective.
    struct Circle;

    impl NlpFunctions for Circle {
        fn num_variables(&self) -> usize {
            2
        }
        fn num_constraints(&self) -> usize {
            1
        }
        fn num_parameters(&self) -> usize {
            0
        }
        fn objective(&self, x: &[f64]) -> f64 {
            x[0] + x[1]
        }
        fn objective_gradient(&self, _x: &[f64], grad: &mut [f64]) {
            grad.copy_from_slice(&[1.0, 1.0]);
        }
        fn constraints(&self, x: &[f64], _p: &[f64], out: &mut [f64]) {
            out[0] = x[0] * x[0] + x[1] * x[1];
        }
        fn visit_jacobian(&self, x: &[f64], _p: &[f64], visit: &mut dyn FnMut(usize, usize, f64)) {
            visit(0, 0, 2.0 * x[0]);
            visit(0, 1, 2.0 * x[1]);
        }
    }

    #[test]
    fn polish_restores_feasibility_with_active_bounds_fixed() {
        let settings = EngineSettings::default();
        let mut u = [1.1, 0.2];
        let polish = polish(
            &Circle,
            &settings,
            (&[-2.0, 0.2], &[2.0, 1.0]),
            (&[1.0], &[1.0]),
            &[],
            &mut u,
        );
        assert!(polish.violation <= settings.polish_tolerance, "{}", polish.violation);
        assert!(polish.steps > 0);
        // y sits on its lower bound, so only x moves
        assert_eq!(u[1], 0.2);
        assert!((u[0] - 0.96_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn polish_leaves_a_feasible_point_alone() {
        let settings = EngineSettings::default();
        let mut u = [0.6, 0.8];
        let polish = polish(
            &Circle,
            &settings,
            (&[-1.0, -1.0], &[1.0, 1.0]),
            (&[0.0], &[1.0]),
            &[],
            &mut u,
        );
        assert_eq!(polish.steps, 0);
        assert_eq!(u, [0.6, 0.8]);
    }
}
