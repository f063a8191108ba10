use std::f64::consts::FRAC_PI_2;
use traverse_core::{
    build_transcription, HorizonConfig, IntegratorConfig, PackedProblem, Parameters, TimeLayout,
    Transcription, VehicleParams,
};
use traverse_nlp::{
    BackendConfig, BackendKind, BackendOption, ProblemDescriptor, SolveError, Solution, Solver,
    StructureError,
};

fn reference_start() -> Parameters {
    Parameters::new([0.0, 0.0, FRAC_PI_2])
}

fn transcription(time_layout: TimeLayout) -> Transcription {
    build_transcription(
        VehicleParams::default(),
        IntegratorConfig::default(),
        HorizonConfig {
            time_layout,
            ..Default::default()
        },
    )
    .expect("reference scenario should build")
}

fn pack(t: &Transcription, params: &Parameters) -> PackedProblem {
    t.pack(&t.straight_line_guess(params), params)
        .expect("reference scenario should pack")
}

fn solve(t: &Transcription, packed: &PackedProblem, config: BackendConfig) -> Solution {
    let solution = Solver::new(config)
        .solve(&ProblemDescriptor::new(t, packed))
        .expect("reference scenario is well formed");
    assert!(
        solution.is_converged(),
        "status {:?}, violation {:e}",
        solution.status,
        solution.constraint_violation
    );
    solution
}

fn assert_reaches_target(t: &Transcription, solution: &Solution) {
    let trajectory = solution.trajectory(t).expect("primal has layout length");
    let end = trajectory.final_position().expect("trajectory has states");
    let target = t.config().target;
    assert!((end.x - target[0]).abs() < 1e-6, "x_N = {}", end.x);
    assert!((end.y - target[1]).abs() < 1e-6, "y_N = {}", end.y);
}

fn assert_avoids_obstacle(t: &Transcription, solution: &Solution) {
    let obstacle = t.config().obstacle;
    let trajectory = solution.trajectory(t).expect("primal has layout length");
    let positions = trajectory.positions();
    for pos in &positions[..positions.len() - 1] {
        let dx = pos.x - obstacle.center[0];
        let dy = pos.y - obstacle.center[1];
        assert!(dx * dx + dy * dy >= obstacle.clearance_sq() - 1e-6);
    }
}

#[test]
fn shared_time_reference_scenario_converges() {
    let t = transcription(TimeLayout::Shared);
    let packed = pack(&t, &reference_start());
    let solution = solve(&t, &packed, BackendConfig::generic());
    assert_reaches_target(&t, &solution);
    assert_avoids_obstacle(&t, &solution);

    let trajectory = solution.trajectory(&t).expect("primal has layout length");
    assert!(trajectory.total_time > 0.0);
    assert!(trajectory.total_time.is_finite());
}

#[test]
fn per_stage_time_copies_agree_and_cost_matches_shared() {
    let shared = transcription(TimeLayout::Shared);
    let per_stage = transcription(TimeLayout::PerStage);
    let a = solve(&shared, &pack(&shared, &reference_start()), BackendConfig::generic());
    let b = solve(
        &per_stage,
        &pack(&per_stage, &reference_start()),
        BackendConfig::generic(),
    );

    assert_reaches_target(&per_stage, &b);
    let trajectory = b.trajectory(&per_stage).expect("primal has layout length");
    assert_eq!(trajectory.time_copies.len(), 21);
    assert!(trajectory.max_time_spread() < 1e-5);
    assert!((a.objective - b.objective).abs() < 1e-3, "{} vs {}", a.objective, b.objective);
}

#[test]
fn structured_backend_matches_generic_on_per_stage_layout() {
    let t = transcription(TimeLayout::PerStage);
    let packed = pack(&t, &reference_start());
    let generic = solve(&t, &packed, BackendConfig::generic());
    let structured = solve(&t, &packed, BackendConfig::structured());
    assert_reaches_target(&t, &structured);
    assert!((generic.objective - structured.objective).abs() < 1e-3);
}

#[test]
fn assembled_jacobian_gives_the_same_solution() {
    let t = transcription(TimeLayout::Shared);
    let packed = pack(&t, &reference_start());
    let streamed = solve(&t, &packed, BackendConfig::generic());
    let config = BackendConfig::builder(BackendKind::Generic)
        .option(BackendOption::Expand(true))
        .build()
        .expect("expand is a generic option");
    let assembled = solve(&t, &packed, config);
    assert!((streamed.objective - assembled.objective).abs() < 1e-4);
}

#[test]
fn re_solve_from_new_start_keeps_the_structure() {
    let t = transcription(TimeLayout::PerStage);
    let first = pack(&t, &reference_start());
    let moved = Parameters::new([-0.5, 0.0, FRAC_PI_2]);
    let second = pack(&t, &moved);
    assert_eq!(first.lbx, second.lbx);
    assert_eq!(first.ubg, second.ubg);
    assert_eq!(first.equality, second.equality);

    let mut solver = Solver::new(BackendConfig::structured());
    solver
        .solve(&ProblemDescriptor::new(&t, &first))
        .expect("first start is well formed");
    let solution = solver
        .solve(&ProblemDescriptor::new(&t, &second))
        .expect("second start is well formed");
    assert!(solution.is_converged(), "{:?}", solution.status);

    let trajectory = solution.trajectory(&t).expect("primal has layout length");
    for (got, want) in trajectory.states[0].iter().zip(&moved.initial_state) {
        assert!((got - want).abs() < 1e-6);
    }
    assert_reaches_target(&t, &solution);
}

#[test]
fn structured_backend_refuses_shared_time_before_solving() {
    let t = transcription(TimeLayout::Shared);
    let packed = pack(&t, &reference_start());
    let err = Solver::new(BackendConfig::structured())
        .solve(&ProblemDescriptor::new(&t, &packed))
        .unwrap_err();
    match err {
        SolveError::Structure(StructureError::VariableOutsideStage { variables }) => {
            assert_eq!(variables, vec![t.layout().time_index(0)]);
        }
        other => panic!("expected a structural error, got {other}"),
    }
}

#[test]
fn inverted_bound_fails_fast_with_its_index() {
    let t = transcription(TimeLayout::PerStage);
    let mut packed = pack(&t, &reference_start());
    let row = t.num_rows() - 1;
    packed.lbg[row] = 11.0;
    packed.ubg[row] = 10.0;
    let err = Solver::new(BackendConfig::generic())
        .solve(&ProblemDescriptor::new(&t, &packed))
        .unwrap_err();
    assert!(err.to_string().contains(&format!("row {row}")), "{err}");
}
