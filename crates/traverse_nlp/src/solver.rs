use crate::config::{BackendConfig, BackendKind};
use crate::engine::{self, JacobianProduct, Workspace};
use crate::error::SolveError;
use crate::problem::ProblemDescriptor;
use crate::solution::{SolveStatus, Solution};
use crate::structure::StageStructure;
use anyhow::{bail, ensure};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A configured backend plus its reusable workspace.
///
/// Solving needs `&mut self`; run concurrent solves on separate solvers that
/// share the same immutable transcription.
pub struct Solver {
    config: BackendConfig,
    workspace: Option<Workspace>,
}

impl Solver {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            workspace: None,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Validates `problem`, detects its stage structure when the backend needs
    /// it, and runs the engine from the packed initial guess.
    ///
    /// Unless the engine failed numerically, its last iterate is polished
    /// towards feasibility before the metrics are taken.
    pub fn solve(&mut self, problem: &ProblemDescriptor<'_>) -> Result<Solution, SolveError> {
        problem.validate()?;
        let packed = problem.packed;
        let n = problem.num_variables();
        let m = problem.num_constraints();
        check_engine_inputs(problem)?;

        let structure = match self.config.kind {
            BackendKind::Generic => None,
            BackendKind::Structured => Some(StageStructure::detect(
                problem,
                self.config.explicit_equality,
            )?),
        };
        let product = match &structure {
            Some(structure) => JacobianProduct::staged(structure),
            None if self.config.expand => JacobianProduct::Assembled,
            None => JacobianProduct::Streamed,
        };

        let settings = &self.config.engine;
        let workspace = match self.workspace.take() {
            Some(w) if w.fits(n, m, settings) => w,
            _ => {
                debug!(variables = n, constraints = m, "allocating engine workspace");
                Workspace::new(n, m, settings)
            }
        };
        let workspace = self.workspace.insert(workspace);

        let mut primal = packed.x0.clone();
        let started = Instant::now();
        let bounds = (packed.lbx.as_slice(), packed.ubx.as_slice());
        let row_bounds = (packed.lbg.as_slice(), packed.ubg.as_slice());
        let run = engine::run(
            workspace,
            problem.functions,
            &product,
            settings,
            bounds,
            row_bounds,
            &packed.p,
            &mut primal,
        );

        let mut status = run.status;
        if !problem.functions.objective(&primal).is_finite() {
            status = SolveStatus::NumericalFailure;
        }
        if status != SolveStatus::NumericalFailure && settings.polish_iterations > 0 {
            let polish = engine::polish(
                problem.functions,
                settings,
                bounds,
                row_bounds,
                &packed.p,
                &mut primal,
            );
            debug!(
                steps = polish.steps,
                violation = polish.violation,
                "polished engine iterate"
            );
        }
        let solve_time = started.elapsed();

        let objective = problem.functions.objective(&primal);
        let mut g = vec![0.0; m];
        problem.functions.constraints(&primal, &packed.p, &mut g);
        let constraint_violation = problem.max_violation(&primal, &g);
        if !(objective.is_finite() && constraint_violation.is_finite()) {
            status = SolveStatus::NumericalFailure;
        }

        let solution = Solution {
            status,
            backend: self.config.kind,
            primal,
            objective,
            constraint_violation,
            outer_iterations: run.outer_iterations,
            inner_iterations: run.inner_iterations,
            solve_time,
        };
        if solution.is_converged() {
            info!(
                backend = %solution.backend,
                objective = solution.objective,
                violation = solution.constraint_violation,
                outer = solution.outer_iterations,
                inner = solution.inner_iterations,
                elapsed = ?solution.solve_time,
                "solve converged"
            );
        } else {
            warn!(
                backend = %solution.backend,
                status = ?solution.status,
                objective = solution.objective,
                violation = solution.constraint_violation,
                outer = solution.outer_iterations,
                "solve did not converge"
            );
        }
        Ok(solution)
    }
}

/// Preconditions the engine would otherwise trip over at its first iteration.
fn check_engine_inputs(problem: &ProblemDescriptor<'_>) -> anyhow::Result<()> {
    ensure!(
        problem.num_variables() > 0,
        "engine setup: the problem has no decision variables"
    );
    if let Some(i) = problem.packed.x0.iter().position(|v| !v.is_finite()) {
        bail!("engine setup: initial guess entry {i} is not finite");
    }
    Ok(())
}
