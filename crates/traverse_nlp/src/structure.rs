//! Automatic stage-structure detection.
//!
//! A structured backend needs the NLP in optimal-control form: variables
//! grouped into stage blocks `[x_k, u_k]`, and every constraint row either a
//! path row of one stage or a dynamics row `x_{k+1} - φ(x_k, u_k) = 0`
//! coupling stage `k` to the next. Detection reads the Jacobian at the initial
//! guess and rebuilds that form from the sparsity alone: the caller never
//! declares which row is which.

use crate::error::StructureError;
use crate::problem::ProblemDescriptor;
use nalgebra::{DMatrix, DVector};
use std::ops::Range;
use tracing::debug;
use traverse_core::NlpFunctions;

/// Tolerance on the unit coefficient of a dynamics row.
const UNIT_TOLERANCE: f64 = 1e-12;

/// Dimensions of one stage, in the usual OCP notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDims {
    pub nx: usize,
    pub nu: usize,
    pub ng_eq: usize,
    pub ng_ineq: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageBlock {
    pub variables: Range<usize>,
    pub dims: StageDims,
    /// Rows coupling this stage to the next, ordered by the state they determine.
    pub dynamics_rows: Vec<usize>,
    pub path_rows: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowSlot {
    Dynamics { stage: usize, local: usize },
    Path { stage: usize, local: usize },
}

/// Detected stage structure of an NLP.
#[derive(Debug, Clone)]
pub struct StageStructure {
    stages: Vec<StageBlock>,
    /// `∂x_{k+1}/∂x_k` at the detection point, one per interval.
    a: Vec<DMatrix<f64>>,
    /// `∂x_{k+1}/∂u_k` at the detection point, one per interval.
    b: Vec<DMatrix<f64>>,
    row_slots: Vec<RowSlot>,
    /// `(stage, local index)` of every variable.
    columns: Vec<(usize, usize)>,
    /// Variable each dynamics row determines, by row.
    successor: Vec<Option<usize>>,
}

impl StageStructure {
    /// Detects the structure of `problem`, classifying path rows by the
    /// equality tags (`explicit_equality`) or by `lower == upper`.
    pub fn detect(
        problem: &ProblemDescriptor<'_>,
        explicit_equality: bool,
    ) -> Result<Self, StructureError> {
        let packed = problem.packed;
        let ranges = stage_ranges(&packed.variable_stage)?;
        let stage_count = ranges.len();

        let mut columns = vec![(0, 0); packed.num_variables()];
        for (stage, range) in ranges.iter().enumerate() {
            for (local, i) in range.clone().enumerate() {
                columns[i] = (stage, local);
            }
        }

        let m = problem.num_constraints();
        let mut entries: Vec<Vec<(usize, f64)>> = vec![Vec::new(); m];
        problem
            .functions
            .visit_jacobian(&packed.x0, &packed.p, &mut |row, col, value| {
                entries[row].push((col, value))
            });
        for row in entries.iter_mut() {
            merge_duplicates(row);
        }

        // Row classification from the stages each row touches.
        let mut kinds: Vec<(usize, Option<usize>)> = Vec::with_capacity(m);
        let mut offending: Vec<(usize, &'static str)> = Vec::new();
        for (row, row_entries) in entries.iter().enumerate() {
            let Some(lo) = row_entries.iter().map(|&(c, _)| columns[c].0).min() else {
                offending.push((row, "row depends on no variable"));
                kinds.push((0, None));
                continue;
            };
            let hi = row_entries.iter().map(|&(c, _)| columns[c].0).max().unwrap_or(lo);
            if hi == lo {
                kinds.push((lo, None));
            } else if hi == lo + 1 {
                let mut next = row_entries
                    .iter()
                    .filter(|&&(c, v)| columns[c].0 == hi && v != 0.0);
                match (next.next(), next.next()) {
                    (Some(&(col, value)), None) if (value - 1.0).abs() <= UNIT_TOLERANCE => {
                        kinds.push((lo, Some(col)))
                    }
                    _ => {
                        offending.push((
                            row,
                            "dynamics row needs a single unit coefficient on the next stage",
                        ));
                        kinds.push((lo, None));
                    }
                }
            } else {
                offending.push((row, "row couples non-adjacent stages"));
                kinds.push((lo, None));
            }
        }
        first_group(&offending)?;

        if let Some(row) = kinds.windows(2).position(|w| w[1].0 < w[0].0) {
            return Err(StructureError::OffendingRows {
                rows: vec![row, row + 1],
                reason: "rows are not in stage order".into(),
            });
        }

        for (row, &(_, successor)) in kinds.iter().enumerate() {
            if successor.is_none() {
                continue;
            }
            if packed.lbg[row] != 0.0 || packed.ubg[row] != 0.0 {
                offending.push((row, "dynamics rows must have zero lower and upper bounds"));
            } else if explicit_equality && !packed.equality[row] {
                offending.push((row, "dynamics rows must be tagged as equalities"));
            }
        }
        first_group(&offending)?;

        // Assemble stage blocks.
        let mut stages: Vec<StageBlock> = ranges
            .iter()
            .map(|range| StageBlock {
                variables: range.clone(),
                dims: StageDims {
                    nx: 0,
                    nu: 0,
                    ng_eq: 0,
                    ng_ineq: 0,
                },
                dynamics_rows: Vec::new(),
                path_rows: Vec::new(),
            })
            .collect();
        let mut successor = vec![None; m];
        for (row, &(stage, next)) in kinds.iter().enumerate() {
            match next {
                Some(col) => {
                    stages[stage].dynamics_rows.push(row);
                    successor[row] = Some(col);
                }
                None => {
                    stages[stage].path_rows.push(row);
                    let equality = if explicit_equality {
                        if packed.equality[row] && packed.lbg[row] != packed.ubg[row] {
                            offending.push((
                                row,
                                "rows tagged as equalities must have lower == upper",
                            ));
                        }
                        packed.equality[row]
                    } else {
                        packed.lbg[row] == packed.ubg[row]
                    };
                    if equality {
                        stages[stage].dims.ng_eq += 1;
                    } else {
                        stages[stage].dims.ng_ineq += 1;
                    }
                }
            }
        }
        first_group(&offending)?;

        // Dynamics rows of stage k must determine exactly the leading variables of k + 1.
        for k in 0..stage_count.saturating_sub(1) {
            let rows = &mut stages[k].dynamics_rows;
            if rows.is_empty() {
                return Err(StructureError::StageShape {
                    stage: k + 1,
                    reason: format!("no dynamics rows connect it to stage {k}"),
                });
            }
            rows.sort_by_key(|&r| successor[r].map(|c| columns[c].1));
            let leading = rows
                .iter()
                .enumerate()
                .all(|(expected, &r)| successor[r].map(|c| columns[c].1) == Some(expected));
            if !leading {
                return Err(StructureError::StageShape {
                    stage: k + 1,
                    reason: format!(
                        "dynamics rows of stage {k} must determine its leading variables, one each"
                    ),
                });
            }
            let nx = rows.len();
            let size = stages[k + 1].variables.len();
            stages[k + 1].dims.nx = nx;
            stages[k + 1].dims.nu = size - nx;
        }

        let first_nx = if stage_count > 1 {
            stages[1].dims.nx
        } else {
            stages[0].variables.len()
        };
        let first_size = stages[0].variables.len();
        if first_size < first_nx {
            return Err(StructureError::StageShape {
                stage: 0,
                reason: format!("{first_size} variables cannot hold {first_nx} states"),
            });
        }
        stages[0].dims.nx = first_nx;
        stages[0].dims.nu = first_size - first_nx;

        let last = stage_count - 1;
        if stages[last].dims.nu != 0 {
            return Err(StructureError::StageShape {
                stage: last,
                reason: format!("final stage carries {} controls", stages[last].dims.nu),
            });
        }

        let mut row_slots = vec![RowSlot::Path { stage: 0, local: 0 }; m];
        for (stage, block) in stages.iter().enumerate() {
            for (local, &row) in block.dynamics_rows.iter().enumerate() {
                row_slots[row] = RowSlot::Dynamics { stage, local };
            }
            for (local, &row) in block.path_rows.iter().enumerate() {
                row_slots[row] = RowSlot::Path { stage, local };
            }
        }

        let mut a = Vec::with_capacity(last);
        let mut b = Vec::with_capacity(last);
        for block in &stages[..last] {
            let StageDims { nx, nu, .. } = block.dims;
            let rows = block.dynamics_rows.len();
            let mut ak = DMatrix::zeros(rows, nx);
            let mut bk = DMatrix::zeros(rows, nu);
            for (i, &row) in block.dynamics_rows.iter().enumerate() {
                for &(col, value) in &entries[row] {
                    if !block.variables.contains(&col) {
                        continue;
                    }
                    let local = col - block.variables.start;
                    if local < nx {
                        ak[(i, local)] = -value;
                    } else {
                        bk[(i, local - nx)] = -value;
                    }
                }
            }
            a.push(ak);
            b.push(bk);
        }

        debug!(
            stages = stage_count,
            dynamics_rows = successor.iter().filter(|s| s.is_some()).count(),
            first = ?stages[0].dims,
            last = ?stages[last].dims,
            "detected stage structure"
        );

        Ok(Self {
            stages,
            a,
            b,
            row_slots,
            columns,
            successor,
        })
    }

    pub fn stages(&self) -> &[StageBlock] {
        &self.stages
    }

    pub fn dims(&self) -> Vec<StageDims> {
        self.stages.iter().map(|s| s.dims).collect()
    }

    pub fn a(&self, k: usize) -> &DMatrix<f64> {
        &self.a[k]
    }

    pub fn b(&self, k: usize) -> &DMatrix<f64> {
        &self.b[k]
    }

    /// Zeroed per-stage Jacobian storage for this structure.
    pub fn blocks(&self) -> StageBlocks {
        StageBlocks {
            dynamics: self
                .stages
                .iter()
                .map(|s| DMatrix::zeros(s.dynamics_rows.len(), s.variables.len()))
                .collect(),
            path: self
                .stages
                .iter()
                .map(|s| DMatrix::zeros(s.path_rows.len(), s.variables.len()))
                .collect(),
        }
    }

    /// Evaluates the stage-local Jacobian blocks at `(x, p)`.
    ///
    /// The unit coefficients that tie a dynamics row to its successor variable
    /// are implied by the structure and not stored.
    pub fn fill(
        &self,
        functions: &dyn NlpFunctions,
        x: &[f64],
        p: &[f64],
        blocks: &mut StageBlocks,
    ) {
        blocks.dynamics.iter_mut().for_each(|m| m.fill(0.0));
        blocks.path.iter_mut().for_each(|m| m.fill(0.0));
        functions.visit_jacobian(x, p, &mut |row, col, value| {
            let (owner, local_col) = self.columns[col];
            match self.row_slots[row] {
                RowSlot::Dynamics { stage, local } if owner == stage => {
                    blocks.dynamics[stage][(local, local_col)] += value;
                }
                RowSlot::Path { stage, local } if owner == stage => {
                    blocks.path[stage][(local, local_col)] += value;
                }
                _ => {}
            }
        });
    }

    /// `out = Jᵀ · weights` from filled stage blocks.
    pub fn transpose_product(&self, blocks: &StageBlocks, weights: &[f64], out: &mut [f64]) {
        out.iter_mut().for_each(|o| *o = 0.0);
        for (k, stage) in self.stages.iter().enumerate() {
            let target = &mut out[stage.variables.clone()];
            for (rows, block) in [
                (&stage.dynamics_rows, &blocks.dynamics[k]),
                (&stage.path_rows, &blocks.path[k]),
            ] {
                if rows.is_empty() {
                    continue;
                }
                let w = DVector::from_iterator(rows.len(), rows.iter().map(|&r| weights[r]));
                let contribution = block.tr_mul(&w);
                for (o, c) in target.iter_mut().zip(contribution.iter()) {
                    *o += c;
                }
            }
            for &row in &stage.dynamics_rows {
                if let Some(col) = self.successor[row] {
                    out[col] += weights[row];
                }
            }
        }
    }
}

/// Dense per-stage Jacobian blocks, reused across products.
#[derive(Debug, Clone)]
pub struct StageBlocks {
    dynamics: Vec<DMatrix<f64>>,
    path: Vec<DMatrix<f64>>,
}

fn stage_ranges(owners: &[Option<usize>]) -> Result<Vec<Range<usize>>, StructureError> {
    let outside: Vec<usize> = owners
        .iter()
        .enumerate()
        .filter_map(|(i, o)| o.is_none().then_some(i))
        .collect();
    if !outside.is_empty() {
        return Err(StructureError::VariableOutsideStage { variables: outside });
    }

    let mut ranges: Vec<Range<usize>> = Vec::new();
    for (i, owner) in owners.iter().enumerate() {
        let stage = owner.unwrap_or_default();
        match ranges.len().checked_sub(1) {
            Some(current) if stage == current => ranges[current].end = i + 1,
            Some(current) if stage == current + 1 => ranges.push(i..i + 1),
            None if stage == 0 => ranges.push(i..i + 1),
            Some(current) if stage < current => {
                return Err(StructureError::StageOrder {
                    variable: i,
                    stage,
                    previous: current,
                })
            }
            _ => {
                return Err(StructureError::StageShape {
                    stage: ranges.len(),
                    reason: "stage owns no variables".into(),
                })
            }
        }
    }
    if ranges.is_empty() {
        return Err(StructureError::StageShape {
            stage: 0,
            reason: "problem has no variables".into(),
        });
    }
    Ok(ranges)
}

fn merge_duplicates(row: &mut Vec<(usize, f64)>) {
    row.sort_by_key(|&(c, _)| c);
    row.dedup_by(|later, earlier| {
        if later.0 == earlier.0 {
            earlier.1 += later.1;
            true
        } else {
            false
        }
    });
}

/// Reports every row sharing the first recorded reason.
fn first_group(offending: &[(usize, &'static str)]) -> Result<(), StructureError> {
    match offending.first() {
        Some(&(_, reason)) => Err(StructureError::OffendingRows {
            rows: offending
                .iter()
                .filter(|&&(_, r)| r == reason)
                .map(|&(row, _)| row)
                .collect(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use traverse_core::transcription::{BoundPlacement, ConstraintKind};
    use traverse_core::{
        build_transcription, HorizonConfig, IntegratorConfig, PackedProblem, Parameters, TimeLayout,
        Transcription, VariableOrdering, VehicleParams,
    };

    fn setup(config: HorizonConfig) -> (Transcription, PackedProblem) {
        let t = build_transcription(VehicleParams::default(), IntegratorConfig::default(), config)
            .expect("transcription should build");
        let params = Parameters::new([0.0, 0.0, std::f64::consts::FRAC_PI_2]);
        let packed = t
            .pack(&t.straight_line_guess(&params), &params)
            .expect("problem should pack");
        (t, packed)
    }

    fn per_stage(stages: usize) -> HorizonConfig {
        HorizonConfig {
            stages,
            time_layout: TimeLayout::PerStage,
            ..Default::default()
        }
    }

    #[test]
    fn per_stage_stage_major_yields_ocp_dims() {
        let (t, packed) = setup(per_stage(20));
        let s = StageStructure::detect(&ProblemDescriptor::new(&t, &packed), true)
            .expect("per-stage layout should have stage structure");
        let dims = s.dims();
        assert_eq!(dims.len(), 21);
        // states carry the time copy: [x, y, θ, T]
        assert_eq!(dims[0], StageDims { nx: 4, nu: 2, ng_eq: 3, ng_ineq: 1 });
        assert_eq!(dims[7], StageDims { nx: 4, nu: 2, ng_eq: 0, ng_ineq: 1 });
        assert_eq!(dims[20], StageDims { nx: 4, nu: 0, ng_eq: 2, ng_ineq: 0 });
        assert_eq!(s.a(3).shape(), (4, 4));
        assert_eq!(s.b(3).shape(), (4, 2));
        assert!((s.a(3)[(0, 0)] - 1.0).abs() < 1e-12);
        assert!((s.a(3)[(3, 3)] - 1.0).abs() < 1e-12);
        assert_eq!(s.b(3).row(3).iter().filter(|v| **v != 0.0).count(), 0);
    }

    #[test]
    fn control_rows_count_as_path_inequalities() {
        let (t, packed) = setup(HorizonConfig {
            control_bounds_as: BoundPlacement::Constraints,
            ..per_stage(4)
        });
        let s = StageStructure::detect(&ProblemDescriptor::new(&t, &packed), true)
            .expect("structure should be detected");
        assert_eq!(s.dims()[1].ng_ineq, 3);
        assert_eq!(s.dims()[4].ng_ineq, 0);
    }

    #[test]
    fn shared_time_is_outside_every_stage() {
        let (t, packed) = setup(HorizonConfig::default());
        let err = StageStructure::detect(&ProblemDescriptor::new(&t, &packed), true).unwrap_err();
        assert_eq!(err, StructureError::VariableOutsideStage { variables: vec![0] });
    }

    #[test]
    fn grouped_ordering_breaks_stage_order() {
        let (t, packed) = setup(HorizonConfig {
            ordering: VariableOrdering::Grouped,
            ..per_stage(3)
        });
        let err = StageStructure::detect(&ProblemDescriptor::new(&t, &packed), true).unwrap_err();
        assert!(matches!(err, StructureError::StageOrder { .. }), "{err:?}");
    }

    #[test]
    fn dynamics_rows_must_have_zero_bounds() {
        let (t, mut packed) = setup(per_stage(3));
        packed.lbg[1] = -1.0;
        let err = StageStructure::detect(&ProblemDescriptor::new(&t, &packed), true).unwrap_err();
        match err {
            StructureError::OffendingRows { rows, .. } => assert_eq!(rows, vec![1]),
            other => panic!("expected offending rows, got {other:?}"),
        }
    }

    #[test]
    fn equality_classification_modes() {
        let (t, mut packed) = setup(per_stage(3));
        let obstacle = t
            .blocks()
            .iter()
            .find(|b| matches!(b.kind, ConstraintKind::Obstacle { stage: 1 }))
            .map(|b| b.rows.start)
            .expect("obstacle row for stage 1");

        let by_bounds = StageStructure::detect(&ProblemDescriptor::new(&t, &packed), false)
            .expect("bounds-based classification should succeed");
        let by_tags = StageStructure::detect(&ProblemDescriptor::new(&t, &packed), true)
            .expect("tag-based classification should succeed");
        assert_eq!(by_bounds.dims(), by_tags.dims());

        packed.equality[obstacle] = true;
        let err = StageStructure::detect(&ProblemDescriptor::new(&t, &packed), true).unwrap_err();
        match err {
            StructureError::OffendingRows { rows, .. } => assert_eq!(rows, vec![obstacle]),
            other => panic!("expected offending rows, got {other:?}"),
        }
        StageStructure::detect(&ProblemDescriptor::new(&t, &packed), false)
            .expect("bounds-based classification ignores the tag");
    }

    #[test]
    fn block_product_matches_streamed_product() {
        let (t, packed) = setup(per_stage(5));
        let d = ProblemDescriptor::new(&t, &packed);
        let s = StageStructure::detect(&d, true).expect("structure should be detected");

        let x: Vec<f64> = packed
            .x0
            .iter()
            .enumerate()
            .map(|(i, v)| v + 0.01 * (i as f64).sin())
            .collect();
        let weights: Vec<f64> = (0..t.num_rows()).map(|i| 1.0 + 0.1 * i as f64).collect();

        let mut blocks = s.blocks();
        s.fill(&t, &x, &packed.p, &mut blocks);
        let mut structured = vec![0.0; x.len()];
        s.transpose_product(&blocks, &weights, &mut structured);

        let mut streamed = vec![0.0; x.len()];
        NlpFunctions::jacobian_transpose_product(&t, &x, &packed.p, &weights, &mut streamed);
        for (a, b) in structured.iter().zip(&streamed) {
            assert!((a - b).abs() < 1e-10, "{a} vs {b}");
        }
    }
}
