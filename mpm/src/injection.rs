//! Particles entering the domain during a run.

use crate::mesh::{Mesh, Particle};
use crate::params::{to_vector, ConfigError, InjectionConfig, LocatePolicy};
use crate::{Error, Vector};

/// A batch of particles injected every `interval` steps in `[start, end)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Injection<const D: usize> {
    positions: Vec<Vector<D>>,
    velocity: Vector<D>,
    mass: f64,
    volume: f64,
    material_id: usize,
    start: u64,
    end: u64,
    interval: u64,
}

impl<const D: usize> Injection<D> {
    pub fn from_config(config: &InjectionConfig) -> Result<Self, ConfigError> {
        let positions = config
            .positions
            .iter()
            .map(|p| to_vector::<D>(p, "injections.positions"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Injection {
            positions,
            velocity: to_vector::<D>(&config.velocity, "injections.velocity")?,
            mass: config.mass,
            volume: config.volume,
            material_id: config.material_id,
            start: config.start,
            end: config.end,
            interval: config.interval.max(1),
        })
    }

    pub fn material_id(&self) -> usize {
        self.material_id
    }

    pub fn is_active(&self, step: u64) -> bool {
        step >= self.start && step < self.end && (step - self.start) % self.interval == 0
    }

    fn particles(&self, first_id: u64) -> impl Iterator<Item = Particle<D>> + '_ {
        self.positions.iter().enumerate().map(move |(i, &pos)| {
            Particle::new(first_id + i as u64, self.material_id, pos, self.mass, self.volume)
                .with_velocity(self.velocity)
        })
    }
}

/// Injects the particles of all injections active at `step`.
///
/// Every rank must call this with the same injections and step. Ids are reserved identically on
/// all ranks and each rank keeps only the particles inside the cells it owns. Returns the number
/// of particles added to this rank.
pub fn inject_particles<const D: usize>(
    injections: &[Injection<D>],
    mesh: &mut Mesh<D>,
    step: u64,
    policy: LocatePolicy,
) -> Result<usize, Error> {
    let mut added = 0;
    for injection in injections.iter().filter(|i| i.is_active(step)) {
        let first = mesh.reserve_particle_ids(injection.positions.len() as u64);
        added += mesh.add_particles(injection.particles(first), policy)?;
    }
    if added > 0 {
        log::debug!("Injected {} particles on rank {} at step {}", added, mesh.rank(), step);
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Grid;

    fn config() -> InjectionConfig {
        InjectionConfig {
            positions: vec![vec![0.5, 0.5], vec![1.5, 0.5]],
            velocity: vec![0.0, -1.0],
            mass: 1.0,
            volume: 0.1,
            material_id: 0,
            start: 2,
            end: 7,
            interval: 2,
        }
    }

    #[test]
    fn schedule() {
        let injection = Injection::<2>::from_config(&config()).unwrap();
        let active: Vec<_> = (0..10).filter(|&s| injection.is_active(s)).collect();
        assert_eq!(active, vec![2, 4, 6]);
    }

    #[test]
    fn ids_are_unique_across_ranks() {
        let injections = vec![Injection::<2>::from_config(&config()).unwrap()];
        let grid = Grid::new(Vector::<2>::zeros(), Vector::<2>::repeat(1.0), [2, 1]);
        let mut meshes: Vec<_> = (0..2)
            .map(|r| {
                let mut mesh = Mesh::new(grid.clone(), r);
                mesh.set_cell_ranks(&[0, 1]).unwrap();
                mesh
            })
            .collect();
        for step in 0..5 {
            for mesh in meshes.iter_mut() {
                inject_particles(&injections, mesh, step, LocatePolicy::Abort).unwrap();
            }
        }
        let ids0: Vec<_> = meshes[0].particles().iter().map(|p| p.id).collect();
        let ids1: Vec<_> = meshes[1].particles().iter().map(|p| p.id).collect();
        assert_eq!(ids0, vec![0, 2]);
        assert_eq!(ids1, vec![1, 3]);
        assert_eq!(meshes[0].next_particle_id(), meshes[1].next_particle_id());
    }
}
