use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};

use mpm::scene::SceneConfig;
use mpm::test_utils::*;
use mpm::*;

fn rng() -> rand::rngs::StdRng {
    if cfg!(feature = "deterministic") {
        rand::rngs::StdRng::seed_from_u64(42)
    } else {
        rand::rngs::StdRng::from_entropy()
    }
}

/// A `cells x cells` grid half filled with slightly perturbed particles.
fn block_scene(scheme: SchemeType, cells: usize) -> (SceneConfig, Vec<Particle<2>>) {
    let mut config = run_config_2d(scheme, [cells, cells], u64::MAX);
    config.analysis.num_threads = None;
    config.analysis.locate_policy = LocatePolicy::Clamp;
    // Rest the block on a support so that it stays inside the grid for any number of steps.
    config.velocity_constraints.nodes.push(NodalVelocityConstraintConfig {
        region: RegionConfig {
            min: vec![0.0, 0.0],
            max: vec![cells as f64, 1.0],
        },
        dir: 1,
        velocity: 0.0,
    });
    let mut scene = SceneConfig::new(config);
    let half = cells as f64 * 0.5;
    scene
        .add_material(0, SOFT_MATERIAL)
        .add_block(block_2d([1.0, 1.0], [cells as f64 - 1.0, half]));

    let mut rng = rng();
    let mut particles = scene.particles::<2>().unwrap();
    for p in particles.iter_mut() {
        p.position[0] += rng.gen_range(-0.05..0.05);
        p.position[1] += rng.gen_range(-0.05..0.05);
    }
    (scene, particles)
}

fn step_performance(c: &mut Criterion) {
    let mut group = c.benchmark_group("Step");
    group.sample_size(20);

    for (name, scheme) in [
        ("Explicit", SchemeType::Explicit),
        ("ImplicitLinear", SchemeType::ImplicitLinear),
    ] {
        for cells in [16, 32] {
            let (scene, particles) = block_scene(scheme, cells);
            let mut builder = SolverBuilder::<2>::new(scene.config.clone());
            builder
                .set_materials(scene.materials::<2>())
                .add_particles(particles);
            let mut solver = builder.build(SingleRank).unwrap();
            group.bench_with_input(BenchmarkId::new(name, cells), &cells, |b, _| {
                b.iter(|| solver.step().unwrap())
            });
        }
    }

    group.finish();
}

criterion_group!(benches, step_performance);
criterion_main!(benches);
