mod test_utils;

use approx::*;
use mpm::*;
use test_utils::*;

const NSTEPS: u64 = 10;

fn single_particle_solver(scheme: SchemeType, initial_acceleration: bool) -> Solver<2, SingleRank> {
    init_logger();
    let config = run_config_2d(scheme, [4, 4], NSTEPS);
    let mut particle = single_particle(Vector::<2>::new(2.5, 2.5));
    if initial_acceleration {
        particle.acceleration = Vector::<2>::new(0.0, GRAVITY);
    }
    let mut builder = SolverBuilder::new(config);
    builder
        .set_materials(soft_materials())
        .add_particles(vec![particle]);
    builder.build(SingleRank).unwrap()
}

/// Exact free fall: `v = g t` and `y = y0 + g t^2 / 2`.
fn check_free_fall(solver: &Solver<2, SingleRank>) {
    let t = NSTEPS as f64 * solver.config().analysis.dt;
    let p = &solver.mesh().particles()[0];
    assert_relative_eq!(p.velocity[1], GRAVITY * t, max_relative = 1e-9);
    assert_relative_eq!(p.position[1], 2.5 + 0.5 * GRAVITY * t * t, max_relative = 1e-9);
    assert_relative_eq!(p.velocity[0], 0.0, epsilon = 1e-12);
    assert_relative_eq!(p.position[0], 2.5, epsilon = 1e-12);
}

#[test]
fn explicit_free_fall() {
    let mut solver = single_particle_solver(SchemeType::Explicit, false);
    let summary = solver.solve().unwrap();
    assert_eq!(summary.steps_taken, NSTEPS);
    assert_eq!(summary.final_step, NSTEPS);
    assert!(!summary.interrupted);
    check_free_fall(&solver);
    assert_relative_eq!(
        solver.mesh().particles()[0].velocity[1],
        -0.0981,
        max_relative = 1e-9
    );
}

/// With a consistent initial acceleration the trapezoidal Newmark rule reproduces free fall.
#[test]
fn newmark_free_fall() {
    let mut solver = single_particle_solver(SchemeType::ImplicitLinear, true);
    let mut iterations = Vec::new();
    solver
        .solve_with(|result| {
            let solve = result.linear_solve.expect("implicit steps report a linear solve");
            assert!(solve.is_success());
            iterations.push(solve.iterations);
        })
        .unwrap();
    assert_eq!(iterations.len(), NSTEPS as usize);
    check_free_fall(&solver);
}

/// Starting from rest the first Newmark step only picks up half of the velocity increment.
#[test]
fn newmark_from_rest() {
    let mut solver = single_particle_solver(SchemeType::ImplicitLinear, false);
    let result = solver.step().unwrap();
    let dt = solver.config().analysis.dt;
    let p = &solver.mesh().particles()[0];
    assert_eq!(result.step, 1);
    assert_relative_eq!(p.velocity[1], 0.5 * GRAVITY * dt, max_relative = 1e-9);
    assert_relative_eq!(p.acceleration[1], GRAVITY, max_relative = 1e-9);
    assert_relative_eq!(p.position[1], 2.5 + 0.25 * GRAVITY * dt * dt, max_relative = 1e-9);
}

/// PIC and FLIP coincide for a rigid motion.
#[test]
fn velocity_update_modes_agree() {
    init_logger();
    let mut results = Vec::new();
    for velocity_update in [false, true] {
        let mut config = run_config_2d(SchemeType::Explicit, [4, 4], NSTEPS);
        config.analysis.velocity_update = velocity_update;
        let mut builder = SolverBuilder::<2>::new(config);
        builder
            .set_materials(soft_materials())
            .add_particles(vec![single_particle(Vector::<2>::new(1.5, 2.5))
                .with_velocity(Vector::<2>::new(0.3, 0.0))]);
        let mut solver = builder.build(SingleRank).unwrap();
        solver.solve().unwrap();
        results.push(solver.mesh().particles()[0].clone());
    }
    assert_relative_eq!(results[0].velocity, results[1].velocity, max_relative = 1e-9);
    assert_relative_eq!(results[0].position, results[1].position, max_relative = 1e-9);
}

#[test]
fn step_timings_are_accumulated() {
    let mut solver = single_particle_solver(SchemeType::Explicit, false);
    let first = solver.step().unwrap();
    let second = solver.step().unwrap();
    let mut total = first.timings;
    total += second.timings;
    assert_eq!(*solver.timings(), total);
    assert_eq!(solver.current_step(), 2);
    assert_eq!(second.total_particles, 1);
    assert_relative_eq!(second.total_mass, 1.0);
}

/// Without forces the Newmark step moves a particle by `v dt` and keeps its velocity.
#[test]
fn newmark_consistency_without_force() {
    init_logger();
    let mut config = run_config_2d(SchemeType::ImplicitLinear, [4, 4], 1);
    config.analysis.gravity = Vec::new();
    let v = Vector::<2>::new(0.3, -0.2);
    let mut builder = SolverBuilder::<2>::new(config);
    builder
        .set_materials(soft_materials())
        .add_particles(vec![single_particle(Vector::<2>::new(2.5, 2.5)).with_velocity(v)]);
    let mut solver = builder.build(SingleRank).unwrap();
    solver.step().unwrap();
    let dt = solver.config().analysis.dt;
    let p = &solver.mesh().particles()[0];
    assert_relative_eq!(p.position, Vector::<2>::new(2.5, 2.5) + v * dt, epsilon = 1e-12);
    assert_relative_eq!(p.velocity, v, epsilon = 1e-12);
    assert_relative_eq!(p.acceleration, Vector::<2>::zeros(), epsilon = 1e-9);
}
