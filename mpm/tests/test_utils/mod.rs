#![allow(dead_code)]

use approx::*;
use mpm::scene::SceneConfig;
use mpm::{Communicator, Error, LocalCluster, Particle, RunConfig, Solver};
pub use mpm::test_utils::*;

pub fn init_logger() {
    let _ = env_logger::Builder::from_env("MPM_LOG")
        .is_test(true)
        .try_init();
}

/// Runs the scene on `ranks` ranks and returns the particles of all ranks sorted by id.
pub fn run_distributed<const D: usize>(
    scene: &SceneConfig,
    ranks: usize,
) -> Result<Vec<Particle<D>>, Error> {
    let results = LocalCluster::run(ranks, |comm| -> Result<Vec<Particle<D>>, Error> {
        let mut solver = scene.build_solver::<D, _>(comm)?;
        solver.solve()?;
        Ok(solver.mesh().particles().to_vec())
    });
    let mut particles = Vec::new();
    for result in results {
        particles.extend(result?);
    }
    particles.sort_by_key(|p| p.id);
    Ok(particles)
}

/// Runs the solver to completion and returns its particles sorted by id.
pub fn sorted_particles<const D: usize, C: Communicator + Send>(
    solver: &Solver<D, C>,
) -> Vec<Particle<D>> {
    let mut particles = solver.mesh().particles().to_vec();
    particles.sort_by_key(|p| p.id);
    particles
}

/// Utility function to compare the state of two particle sets.
pub fn compare_particles<const D: usize>(
    solution: &[Particle<D>],
    expected: &[Particle<D>],
    tol: f64,
) {
    assert_eq!(solution.len(), expected.len());
    for (p, q) in solution.iter().zip(expected.iter()) {
        assert_eq!(p.id, q.id);
        assert_eq!(p.material_id, q.material_id);
        assert_relative_eq!(p.mass, q.mass, max_relative = tol);
        for i in 0..D {
            assert_relative_eq!(p.position[i], q.position[i], max_relative = tol, epsilon = tol);
            assert_relative_eq!(p.velocity[i], q.velocity[i], max_relative = tol, epsilon = tol);
        }
        for (s, t) in p.stress.iter().zip(q.stress.iter()) {
            assert_relative_eq!(*s, *t, max_relative = tol, epsilon = tol);
        }
    }
}

/// A falling elastic block resting across the middle of an `8 x 8` grid.
pub fn falling_block_scene(nsteps: u64) -> SceneConfig {
    let mut config: RunConfig = run_config_2d(mpm::SchemeType::Explicit, [8, 8], nsteps);
    config.analysis.locate_policy = mpm::LocatePolicy::Clamp;
    let mut scene = SceneConfig::new(config);
    scene
        .add_material(0, SOFT_MATERIAL)
        .add_block(block_2d([2.0, 2.5], [6.0, 4.5]));
    scene
}
