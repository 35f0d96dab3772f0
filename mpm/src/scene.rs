//! This module describes a convenient scene struct describing a simulatable configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comm::{Communicator, SingleRank};
use crate::material::{LinearElastic, Materials};
use crate::mesh::Particle;
use crate::params::{to_vector, ConfigError, RunConfig};
use crate::solver::{RunSummary, Solver, SolverBuilder};
use crate::Vector;

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("IO Error")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    Deserialize(#[from] ron::error::SpannedError),
    #[error("Serialization error")]
    Serialize,
    #[error("Invalid scene: {0}")]
    Config(#[from] ConfigError),
    #[error("Solver error: {0}")]
    Solver(#[from] crate::Error),
}

/// A box filled with a regular lattice of particles.
///
/// Particles are placed at the centers of lattice cells of size `spacing` and carry the volume of
/// their lattice cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleBlock {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub spacing: f64,
    pub material_id: usize,
    pub density: f64,
    #[serde(default)]
    pub velocity: Vec<f64>,
}

impl ParticleBlock {
    fn lattice<const D: usize>(&self) -> Result<(Vector<D>, [usize; D]), ConfigError> {
        let min = to_vector::<D>(&self.min, "blocks.min")?;
        let max = to_vector::<D>(&self.max, "blocks.max")?;
        if !(self.spacing > 0.0) || !(self.density > 0.0) {
            return Err(ConfigError::NonPositive {
                name: String::from("blocks.spacing or blocks.density"),
            });
        }
        let mut counts = [0; D];
        for i in 0..D {
            let n = ((max[i] - min[i]) / self.spacing).round();
            if !(n >= 1.0) {
                return Err(ConfigError::InvalidValue {
                    name: String::from("blocks"),
                    reason: format!("block is thinner than the particle spacing along axis {}", i),
                });
            }
            counts[i] = n as usize;
        }
        Ok((min, counts))
    }

    /// Number of particles in this block.
    pub fn num_particles<const D: usize>(&self) -> Result<usize, ConfigError> {
        Ok(self.lattice::<D>()?.1.iter().product())
    }

    fn particles<const D: usize>(&self, first_id: u64) -> Result<Vec<Particle<D>>, ConfigError> {
        let (min, counts) = self.lattice::<D>()?;
        let velocity = if self.velocity.is_empty() {
            Vector::<D>::zeros()
        } else {
            to_vector::<D>(&self.velocity, "blocks.velocity")?
        };
        let volume = self.spacing.powi(D as i32);
        let mass = self.density * volume;
        let total: usize = counts.iter().product();

        let mut particles = Vec::with_capacity(total);
        for linear in 0..total {
            let mut rem = linear;
            let mut pos = min;
            for i in 0..D {
                pos[i] += (rem % counts[i]) as f64 * self.spacing + 0.5 * self.spacing;
                rem /= counts[i];
            }
            particles.push(
                Particle::new(first_id + linear as u64, self.material_id, pos, mass, volume)
                    .with_velocity(velocity),
            );
        }
        Ok(particles)
    }
}

/// Scene configuration.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub config: RunConfig,
    pub materials: Vec<(usize, LinearElastic)>,
    pub blocks: Vec<ParticleBlock>,
}

impl SceneConfig {
    /// Construct a new scene configuration.
    pub fn new(config: RunConfig) -> Self {
        SceneConfig {
            config,
            materials: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn add_material(&mut self, id: usize, material: LinearElastic) -> &mut Self {
        self.materials.push((id, material));
        self
    }

    pub fn add_block(&mut self, block: ParticleBlock) -> &mut Self {
        self.blocks.push(block);
        self
    }

    /// Loads a scene configuration from the given RON file.
    pub fn load_from_ron(path: impl AsRef<std::path::Path>) -> Result<Self, SceneError> {
        let f = std::fs::File::open(path.as_ref())?;
        Ok(ron::de::from_reader(f)?)
    }

    /// Saves this scene configuration to the given path interpreted as a RON file.
    pub fn save_as_ron(&self, path: impl AsRef<std::path::Path>) -> Result<(), SceneError> {
        let f = std::fs::File::create(path.as_ref())?;
        ron::ser::to_writer_pretty(f, self, ron::ser::PrettyConfig::new())
            .map_err(|_| SceneError::Serialize)
    }

    /// Initial particles of all blocks. Ids are assigned consecutively in block order.
    pub fn particles<const D: usize>(&self) -> Result<Vec<Particle<D>>, ConfigError> {
        let mut particles = Vec::new();
        for block in self.blocks.iter() {
            let first = particles.len() as u64;
            particles.extend(block.particles::<D>(first)?);
        }
        Ok(particles)
    }

    pub fn materials<const D: usize>(&self) -> Materials<D> {
        let mut materials = Materials::new();
        for &(id, m) in self.materials.iter() {
            materials.insert(id, m);
        }
        materials
    }

    /// Builds the solver for the rank of `comm`.
    pub fn build_solver<const D: usize, C: Communicator + Send>(
        &self,
        comm: C,
    ) -> Result<Solver<D, C>, crate::Error> {
        let mut builder = SolverBuilder::<D>::new(self.config.clone());
        builder
            .set_materials(self.materials::<D>())
            .add_particles(self.particles::<D>()?);
        builder.build(comm)
    }

    /// Runs a simulation on this scene on a single rank.
    pub fn run<const D: usize>(&self) -> Result<RunSummary, SceneError> {
        self.run_with::<D, _>(SingleRank, Box::new(|| false))
    }

    /// Runs a simulation on this scene on the rank of `comm`.
    ///
    /// If `interrupter` returns `true` on any rank, the simulation stops after the current step.
    pub fn run_with<const D: usize, C: Communicator + Send>(
        &self,
        comm: C,
        interrupter: Box<dyn FnMut() -> bool + Send>,
    ) -> Result<RunSummary, SceneError> {
        let mut solver = self.build_solver::<D, C>(comm)?;
        solver.set_interrupter(interrupter);
        Ok(solver.solve()?)
    }
}
