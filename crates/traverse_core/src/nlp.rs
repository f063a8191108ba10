//! Function interface between a transcription and an NLP backend.

use crate::transcription::Transcription;
use nalgebra_sparse::{pattern::SparsityPattern, CooMatrix, CscMatrix, CsrMatrix};

/// Callable NLP functions `f(x)`, `g(x, p)` and their first derivatives.
///
/// Backends only see this trait plus the packed arrays, so any transcription
/// that can fill these buffers can be solved.
pub trait NlpFunctions: Send + Sync {
    fn num_variables(&self) -> usize;
    fn num_constraints(&self) -> usize;
    fn num_parameters(&self) -> usize;

    fn objective(&self, x: &[f64]) -> f64;
    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]);
    fn constraints(&self, x: &[f64], p: &[f64], out: &mut [f64]);

    /// Reports every structural Jacobian entry `(row, column, value)`.
    ///
    /// Entries may repeat; repeated entries add up.
    fn visit_jacobian(&self, x: &[f64], p: &[f64], visit: &mut dyn FnMut(usize, usize, f64));

    fn constraint_jacobian(&self, x: &[f64], p: &[f64]) -> CscMatrix<f64> {
        let mut coo = CooMatrix::new(self.num_constraints(), self.num_variables());
        self.visit_jacobian(x, p, &mut |row, col, value| coo.push(row, col, value));
        CscMatrix::from(&coo)
    }

    /// `out = J(x, p)ᵀ · weights`, streamed without assembling `J`.
    fn jacobian_transpose_product(&self, x: &[f64], p: &[f64], weights: &[f64], out: &mut [f64]) {
        out.iter_mut().for_each(|o| *o = 0.0);
        self.visit_jacobian(x, p, &mut |row, col, value| out[col] += value * weights[row]);
    }

    /// Structural nonzeros of the Jacobian, independent of the values at `x`.
    fn jacobian_sparsity(&self, x: &[f64], p: &[f64]) -> SparsityPattern {
        let mut coo = CooMatrix::new(self.num_constraints(), self.num_variables());
        self.visit_jacobian(x, p, &mut |row, col, _| coo.push(row, col, 1.0));
        CsrMatrix::from(&coo).pattern().clone()
    }
}

impl NlpFunctions for Transcription {
    fn num_variables(&self) -> usize {
        Transcription::num_variables(self)
    }

    fn num_constraints(&self) -> usize {
        self.num_rows()
    }

    fn num_parameters(&self) -> usize {
        Transcription::num_parameters(self)
    }

    fn objective(&self, x: &[f64]) -> f64 {
        self.objective_value(x)
    }

    fn objective_gradient(&self, x: &[f64], grad: &mut [f64]) {
        self.objective_gradient_into(x, grad);
    }

    fn constraints(&self, x: &[f64], p: &[f64], out: &mut [f64]) {
        self.constraint_values(x, p, out);
    }

    fn visit_jacobian(&self, x: &[f64], p: &[f64], visit: &mut dyn FnMut(usize, usize, f64)) {
        Transcription::visit_jacobian(self, x, p, visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TimeLayout;
    use crate::test_support::transcription;
    use crate::transcription::{ConstraintKind, HorizonConfig};

    fn point(n: usize) -> Vec<f64> {
        (0..n).map(|i| 0.5 + 0.05 * i as f64).collect()
    }

    #[test]
    fn assembled_and_streamed_products_agree() {
        let t = transcription(HorizonConfig {
            stages: 5,
            time_layout: TimeLayout::PerStage,
            ..Default::default()
        });
        let f: &dyn NlpFunctions = &t;
        let x = point(f.num_variables());
        let p = [0.0, 0.1, 1.0];
        let weights: Vec<f64> = (0..f.num_constraints()).map(|i| (i as f64).cos()).collect();

        let mut streamed = vec![0.0; f.num_variables()];
        f.jacobian_transpose_product(&x, &p, &weights, &mut streamed);

        let jac = f.constraint_jacobian(&x, &p);
        assert_eq!(jac.nrows(), f.num_constraints());
        assert_eq!(jac.ncols(), f.num_variables());
        let mut assembled = vec![0.0; f.num_variables()];
        for (row, col, value) in jac.triplet_iter() {
            assembled[col] += value * weights[row];
        }
        for (a, b) in assembled.iter().zip(&streamed) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn sparsity_only_couples_neighbouring_stages() {
        let t = transcription(HorizonConfig {
            stages: 6,
            time_layout: TimeLayout::PerStage,
            ..Default::default()
        });
        let x = point(t.num_variables());
        let pattern = NlpFunctions::jacobian_sparsity(&t, &x, &[0.0; 3]);
        let owners = t.layout().variable_stages();
        for block in t.blocks() {
            let base = match block.kind {
                ConstraintKind::Defect { stage }
                | ConstraintKind::TimeLink { stage }
                | ConstraintKind::ControlBounds { stage }
                | ConstraintKind::Obstacle { stage } => stage,
                ConstraintKind::InitialState => 0,
                ConstraintKind::Terminal => 6,
            };
            for row in block.rows.clone() {
                let lane = pattern.lane(row);
                assert!(!lane.is_empty(), "row {row} has no entries");
                for &col in lane {
                    let owner = owners[col].expect("per-stage layout owns every variable");
                    assert!(owner == base || owner == base + 1, "row {row} touches stage {owner}");
                }
            }
        }
    }

    #[test]
    fn parameters_do_not_change_the_pattern() {
        let t = transcription(HorizonConfig::default());
        let x = point(t.num_variables());
        let a = NlpFunctions::jacobian_sparsity(&t, &x, &[0.0; 3]);
        let b = NlpFunctions::jacobian_sparsity(&t, &x, &[4.0, -2.0, 0.3]);
        assert_eq!(a, b);
    }
}
