//! Particle sets, velocity constraints and concentrated nodal forces.
//!
//! None of these are persisted in checkpoints. They are rebuilt from the run configuration
//! against the current particle positions whenever a run starts or resumes.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::mesh::Mesh;
use crate::params::{ConfigError, RunConfig};
use crate::Error;

/// A set of particles identified by id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleSet {
    pub id: usize,
    pub particles: AHashSet<u64>,
}

/// A velocity component prescribed on a single particle.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveVelocityConstraint {
    pub particle: u64,
    pub dir: usize,
    pub velocity: f64,
}

#[derive(Clone, Debug, PartialEq)]
struct NodalConstraint {
    nodes: Vec<usize>,
    dir: usize,
    velocity: f64,
}

#[derive(Clone, Debug, PartialEq)]
struct ConcentratedForce {
    nodes: Vec<usize>,
    dir: usize,
    force: f64,
}

#[derive(Clone, Debug, PartialEq)]
struct ParticleConstraint {
    set_id: usize,
    dir: usize,
    velocity: f64,
}

/// Boundary conditions resolved against a mesh.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Constraints {
    particle_sets: Vec<ParticleSet>,
    particle_velocity: Vec<ParticleConstraint>,
    nodal_velocity: Vec<NodalConstraint>,
    concentrated_forces: Vec<ConcentratedForce>,
}

impl Constraints {
    /// Resolves node based conditions. Particle sets are left empty until
    /// [`Constraints::build_particle_sets`] is called.
    pub fn from_config<const D: usize>(
        config: &RunConfig,
        mesh: &Mesh<D>,
    ) -> Result<Self, ConfigError> {
        let mut nodal_velocity = Vec::new();
        for c in config.velocity_constraints.nodes.iter() {
            let (min, max) = c.region.bounds::<D>("velocity_constraints.nodes.region")?;
            nodal_velocity.push(NodalConstraint {
                nodes: mesh.nodes_in_region(&min, &max),
                dir: c.dir,
                velocity: c.velocity,
            });
        }
        let mut concentrated_forces = Vec::new();
        for f in config.concentrated_forces.iter() {
            let (min, max) = f.region.bounds::<D>("concentrated_forces.region")?;
            concentrated_forces.push(ConcentratedForce {
                nodes: mesh.nodes_in_region(&min, &max),
                dir: f.dir,
                force: f.force,
            });
        }
        let particle_velocity = config
            .velocity_constraints
            .particles
            .iter()
            .map(|c| ParticleConstraint {
                set_id: c.set_id,
                dir: c.dir,
                velocity: c.velocity,
            })
            .collect();
        Ok(Constraints {
            particle_sets: Vec::new(),
            particle_velocity,
            nodal_velocity,
            concentrated_forces,
        })
    }

    /// Builds particle sets from the configured regions using the current positions of all
    /// particles on all ranks.
    pub fn build_particle_sets<const D: usize, C: Communicator>(
        &mut self,
        config: &RunConfig,
        mesh: &Mesh<D>,
        comm: &C,
    ) -> Result<(), Error> {
        self.particle_sets.clear();
        for set in config.particle_sets.iter() {
            let (min, max) = set.region.bounds::<D>("particle_sets.region")?;
            let local: Vec<u64> = mesh
                .particles()
                .iter()
                .filter(|p| (0..D).all(|i| p.position[i] >= min[i] && p.position[i] <= max[i]))
                .map(|p| p.id)
                .collect();
            let mut particles: AHashSet<u64> = local.iter().cloned().collect();
            for ids in crate::halo::all_gather(comm, &local)? {
                particles.extend(ids);
            }
            log::debug!("Particle set {} has {} particles", set.id, particles.len());
            self.particle_sets.push(ParticleSet {
                id: set.id,
                particles,
            });
        }
        Ok(())
    }

    pub fn particle_set(&self, id: usize) -> Option<&ParticleSet> {
        self.particle_sets.iter().find(|s| s.id == id)
    }

    /// Attaches nodal velocity constraints to the mesh nodes.
    pub fn assign_nodal_velocity_constraints<const D: usize>(&self, mesh: &mut Mesh<D>) {
        for node in mesh.nodes_mut() {
            node.velocity_constraints.clear();
        }
        for c in self.nodal_velocity.iter() {
            for &n in c.nodes.iter() {
                let node = &mut mesh.nodes_mut()[n];
                node.velocity_constraints.retain(|&(dir, _)| dir != c.dir);
                node.velocity_constraints.push((c.dir, c.velocity));
            }
        }
    }

    /// Adds concentrated forces to the external force of active nodes.
    ///
    /// Must be called after nodal forces are reduced across ranks, so that each force is
    /// counted once.
    pub fn apply_concentrated_forces<const D: usize>(&self, mesh: &mut Mesh<D>) {
        for f in self.concentrated_forces.iter() {
            for &n in f.nodes.iter() {
                let node = &mut mesh.nodes_mut()[n];
                if node.is_active() {
                    node.external_force[f.dir] += f.force;
                }
            }
        }
    }

    /// Overwrites prescribed particle velocity components.
    pub fn apply_particle_velocity_constraints<const D: usize>(&self, mesh: &mut Mesh<D>) {
        if self.particle_velocity.is_empty() {
            return;
        }
        for c in self.particle_velocity.iter() {
            let set = match self.particle_set(c.set_id) {
                Some(set) => set,
                None => continue,
            };
            for p in mesh.particles_mut() {
                if set.particles.contains(&p.id) {
                    p.velocity[c.dir] = c.velocity;
                    p.acceleration[c.dir] = 0.0;
                }
            }
        }
    }

    /// Particle velocity constraints acting on the local particles.
    pub fn active_particle_constraints<const D: usize>(
        &self,
        mesh: &Mesh<D>,
    ) -> Vec<ActiveVelocityConstraint> {
        let mut active = Vec::new();
        for c in self.particle_velocity.iter() {
            if let Some(set) = self.particle_set(c.set_id) {
                active.extend(
                    mesh.particles()
                        .iter()
                        .filter(|p| set.particles.contains(&p.id))
                        .map(|p| ActiveVelocityConstraint {
                            particle: p.id,
                            dir: c.dir,
                            velocity: c.velocity,
                        }),
                );
            }
        }
        active
    }
}
