use crate::material::{LinearElastic, Materials};
use crate::mesh::Particle;
use crate::params::{GridConfig, RunConfig, SchemeType};
use crate::scene::ParticleBlock;
use crate::Vector;

/*
 * Setup code
 */

pub const GRAVITY: f64 = -9.81;

/// Soft enough to keep explicit steps of `1e-3` stable on unit cells.
pub const SOFT_MATERIAL: LinearElastic = LinearElastic {
    youngs_modulus: 1e3,
    poisson_ratio: 0.2,
};

pub fn grid_config(cells: &[usize], spacing: f64) -> GridConfig {
    GridConfig {
        origin: vec![0.0; cells.len()],
        spacing: vec![spacing; cells.len()],
        cells: cells.to_vec(),
    }
}

/// A 2D run configuration on a `cells[0] x cells[1]` grid of unit cells with gravity along `-y`.
pub fn run_config_2d(scheme: SchemeType, cells: [usize; 2], nsteps: u64) -> RunConfig {
    let mut config = RunConfig {
        mesh: grid_config(&cells, 1.0),
        ..Default::default()
    };
    config.analysis.scheme = scheme;
    config.analysis.gravity = vec![0.0, GRAVITY];
    config.analysis.dt = 1e-3;
    config.analysis.nsteps = nsteps;
    config.analysis.num_threads = Some(1);
    config
}

pub fn soft_materials<const D: usize>() -> Materials<D> {
    let mut materials = Materials::new();
    materials.insert(0, SOFT_MATERIAL);
    materials
}

/// A single unit mass particle of material 0.
pub fn single_particle<const D: usize>(position: Vector<D>) -> Particle<D> {
    Particle::new(0, 0, position, 1.0, 1.0)
}

/// A block of particles spanning `[min, max)` with four particles per unit cell along each axis.
pub fn block_2d(min: [f64; 2], max: [f64; 2]) -> ParticleBlock {
    ParticleBlock {
        min: min.to_vec(),
        max: max.to_vec(),
        spacing: 0.25,
        material_id: 0,
        density: 100.0,
        velocity: Vec::new(),
    }
}
