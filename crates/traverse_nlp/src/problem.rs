use traverse_core::{NlpFunctions, PackedProblem, TranscriptionError, TranscriptionResult};

/// Everything a backend needs: callable functions plus the packed arrays.
#[derive(Clone, Copy)]
pub struct ProblemDescriptor<'a> {
    pub functions: &'a dyn NlpFunctions,
    pub packed: &'a PackedProblem,
}

impl<'a> ProblemDescriptor<'a> {
    pub fn new(functions: &'a dyn NlpFunctions, packed: &'a PackedProblem) -> Self {
        Self { functions, packed }
    }

    pub fn num_variables(&self) -> usize {
        self.functions.num_variables()
    }

    pub fn num_constraints(&self) -> usize {
        self.functions.num_constraints()
    }

    /// Checks the arrays against the function dimensions and every bound row.
    pub fn validate(&self) -> TranscriptionResult<()> {
        let f = self.functions;
        let packed = self.packed;
        for (what, got, expected) in [
            ("initial guess", packed.x0.len(), f.num_variables()),
            ("constraint lower bounds", packed.lbg.len(), f.num_constraints()),
            ("parameters", packed.p.len(), f.num_parameters()),
        ] {
            if got != expected {
                return Err(TranscriptionError::LengthMismatch {
                    what,
                    expected,
                    got,
                });
            }
        }
        packed.validate()
    }

    /// Largest bound violation of `x` over variables and constraint rows.
    ///
    /// Infinite when any entry of `x` or `g` is not finite.
    pub fn max_violation(&self, x: &[f64], g: &[f64]) -> f64 {
        let packed = self.packed;
        bound_violation(x, &packed.lbx, &packed.ubx)
            .max(bound_violation(g, &packed.lbg, &packed.ubg))
    }
}

/// Largest distance of `values` outside `[lower, upper]`, infinite for a NaN or
/// infinite value.
pub(crate) fn bound_violation(values: &[f64], lower: &[f64], upper: &[f64]) -> f64 {
    let mut worst = 0.0_f64;
    for ((&v, &lo), &hi) in values.iter().zip(lower).zip(upper) {
        if !v.is_finite() {
            return f64::INFINITY;
        }
        worst = worst.max(lo - v).max(v - hi);
    }
    worst
}
