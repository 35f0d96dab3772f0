//! Background grid, nodes, cells and the rank-local particle population.

mod cell;
mod grid;
mod node;
mod particle;

pub use cell::*;
pub use grid::*;
pub use node::*;
pub use particle::*;

use rayon::prelude::*;

use crate::params::LocatePolicy;
use crate::{Error, Vector};

/// Outcome of [`Mesh::locate_particles`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocateReport {
    /// Ids of particles removed because they left the domain.
    pub discarded: Vec<u64>,
    /// Number of particles projected back into the domain.
    pub clamped: usize,
    /// Number of particles now inside cells owned by another rank.
    pub foreign: usize,
}

/// The nodes, cells and particles of a single rank.
///
/// Every rank holds the complete grid along with the cell ownership map, but only the particles
/// inside cells it owns (after halo transfer).
#[derive(Clone, Debug)]
pub struct Mesh<const D: usize> {
    grid: Grid<D>,
    nodes: Vec<Node<D>>,
    cells: Vec<Cell>,
    particles: Vec<Particle<D>>,
    rank: usize,
    next_particle_id: u64,
}

impl<const D: usize> Mesh<D> {
    pub fn new(grid: Grid<D>, rank: usize) -> Self {
        let nodes = (0..grid.num_nodes())
            .map(|i| Node::new(i, grid.node_position(i)))
            .collect();
        let cells = (0..grid.num_cells())
            .map(|i| Cell::new(i, grid.cell_nodes(i)))
            .collect();
        Mesh {
            grid,
            nodes,
            cells,
            particles: Vec::new(),
            rank,
            next_particle_id: 0,
        }
    }

    pub fn grid(&self) -> &Grid<D> {
        &self.grid
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn nodes(&self) -> &[Node<D>] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node<D>] {
        &mut self.nodes
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn particles(&self) -> &[Particle<D>] {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut [Particle<D>] {
        &mut self.particles
    }

    pub fn num_particles(&self) -> usize {
        self.particles.len()
    }

    /// Borrows nodes mutably along with particles immutably.
    pub fn nodes_and_particles_mut(&mut self) -> (&mut [Node<D>], &[Particle<D>]) {
        (&mut self.nodes, &self.particles)
    }

    /// Borrows particles mutably along with nodes immutably.
    pub fn particles_and_nodes_mut(&mut self) -> (&mut [Particle<D>], &[Node<D>]) {
        (&mut self.particles, &self.nodes)
    }

    pub fn next_particle_id(&self) -> u64 {
        self.next_particle_id
    }

    pub(crate) fn set_next_particle_id(&mut self, id: u64) {
        self.next_particle_id = id;
    }

    /// Reserves a contiguous block of `n` particle ids.
    ///
    /// Every rank must reserve the same blocks in the same order to keep ids globally unique.
    pub fn reserve_particle_ids(&mut self, n: u64) -> u64 {
        let first = self.next_particle_id;
        self.next_particle_id += n;
        first
    }

    pub fn cell_ranks(&self) -> Vec<usize> {
        self.cells.iter().map(|c| c.rank).collect()
    }

    /// Overwrites the cell ownership map.
    pub fn set_cell_ranks(&mut self, ranks: &[usize]) -> Result<(), Error> {
        if ranks.len() != self.cells.len() {
            return Err(Error::MeshInit {
                reason: format!(
                    "ownership map has {} entries for {} cells",
                    ranks.len(),
                    self.cells.len()
                ),
            });
        }
        for (cell, &rank) in self.cells.iter_mut().zip(ranks.iter()) {
            cell.rank = rank;
        }
        Ok(())
    }

    pub fn is_local_cell(&self, cell: usize) -> bool {
        self.cells[cell].rank == self.rank
    }

    /// Total mass of the particles held by this rank.
    pub fn local_mass(&self) -> f64 {
        self.particles.iter().map(|p| p.mass).sum()
    }

    /// Number of local particles in each cell.
    pub fn particle_counts_per_cell(&self) -> Vec<f64> {
        let mut counts = vec![0.0; self.cells.len()];
        for p in self.particles.iter() {
            if let Some(cell) = p.cell {
                counts[cell] += 1.0;
            }
        }
        counts
    }

    /// Adds particles to this rank.
    ///
    /// Particles are located first. Only the particles inside cells owned by this rank are kept,
    /// so every rank can be handed the same global set. Particles outside of the domain are
    /// handled according to `policy`. Returns the number of particles added.
    pub fn add_particles(
        &mut self,
        particles: impl IntoIterator<Item = Particle<D>>,
        policy: LocatePolicy,
    ) -> Result<usize, Error> {
        let mut added = 0;
        for mut p in particles {
            match self.locate_one(&mut p, policy)? {
                Located::Inside => {}
                Located::Clamped => {}
                Located::Discarded => {
                    log::warn!("Particle {} outside of the mesh was not added", p.id);
                    continue;
                }
            }
            self.next_particle_id = self.next_particle_id.max(p.id + 1);
            if p.cell.map_or(false, |c| self.is_local_cell(c)) {
                self.particles.push(p);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Adds particles already known to be owned by this rank, e.g. received from another rank.
    pub(crate) fn append_particles(&mut self, particles: Vec<Particle<D>>) {
        self.particles.extend(particles);
    }

    pub(crate) fn replace_particles(&mut self, particles: Vec<Particle<D>>) {
        self.particles = particles;
    }

    fn locate_one(&self, p: &mut Particle<D>, policy: LocatePolicy) -> Result<Located, Error> {
        if let Some(cell) = self.grid.locate(&p.position) {
            p.cell = Some(cell);
            return Ok(Located::Inside);
        }
        p.cell = None;
        match policy {
            LocatePolicy::Discard => Ok(Located::Discarded),
            LocatePolicy::Clamp => {
                p.position = self.grid.clamp_inside(&p.position);
                p.cell = self.grid.locate(&p.position);
                Ok(Located::Clamped)
            }
            LocatePolicy::Abort => Err(Error::ParticleOutsideDomain {
                id: p.id,
                position: p.position.iter().cloned().collect(),
            }),
        }
    }

    /// Re-resolves the owning cell of every particle after a position update.
    ///
    /// Particles that moved into cells owned by another rank are counted as foreign; they stay
    /// in this rank until they are handed over by halo transfer.
    pub fn locate_particles(&mut self, policy: LocatePolicy) -> Result<LocateReport, Error> {
        let mut report = LocateReport::default();
        let mut particles = std::mem::take(&mut self.particles);
        let mut result = Ok(());
        particles.retain_mut(|p| {
            if result.is_err() {
                return true;
            }
            match self.locate_one(p, policy) {
                Ok(Located::Inside) => true,
                Ok(Located::Clamped) => {
                    report.clamped += 1;
                    true
                }
                Ok(Located::Discarded) => {
                    report.discarded.push(p.id);
                    false
                }
                Err(e) => {
                    result = Err(e);
                    true
                }
            }
        });
        self.particles = particles;
        result?;

        report.foreign = self
            .particles
            .iter()
            .filter(|p| p.cell.map_or(false, |c| !self.is_local_cell(c)))
            .count();
        if !report.discarded.is_empty() {
            log::warn!(
                "Discarded {} particles that left the mesh: {:?}",
                report.discarded.len(),
                report.discarded
            );
        }
        Ok(report)
    }

    /// Removes and returns all particles located in cells owned by other ranks.
    pub(crate) fn take_foreign_particles(&mut self) -> Vec<Particle<D>> {
        let rank = self.rank;
        let cells = &self.cells;
        let (foreign, local): (Vec<_>, Vec<_>) = std::mem::take(&mut self.particles)
            .into_iter()
            .partition(|p| p.cell.map_or(false, |c| cells[c].rank != rank));
        self.particles = local;
        foreign
    }

    /// Owning rank of each given particle's cell.
    pub(crate) fn destination(&self, p: &Particle<D>) -> Option<usize> {
        p.cell.map(|c| self.cells[c].rank)
    }

    /// Applies an operation to every particle in parallel.
    pub fn iterate_particles(&mut self, op: impl Fn(&mut Particle<D>) + Sync + Send) {
        self.particles.par_iter_mut().for_each(op);
    }

    /// Applies a fallible operation to every particle in parallel, stopping at the first error.
    pub fn try_iterate_particles<E: Send>(
        &mut self,
        op: impl Fn(&mut Particle<D>) -> Result<(), E> + Sync + Send,
    ) -> Result<(), E> {
        self.particles.par_iter_mut().try_for_each(op)
    }

    /// Applies an operation to every node in parallel.
    pub fn iterate_nodes(&mut self, op: impl Fn(&mut Node<D>) + Sync + Send) {
        self.nodes.par_iter_mut().for_each(op);
    }

    /// Applies an operation to every particle with read access to the nodes.
    pub fn iterate_particles_with_nodes(
        &mut self,
        op: impl Fn(&mut Particle<D>, &[Node<D>]) + Sync + Send,
    ) {
        let (particles, nodes) = self.particles_and_nodes_mut();
        particles.par_iter_mut().for_each(|p| op(p, nodes));
    }

    /// Nodes whose position lies inside the given box.
    pub fn nodes_in_region(&self, min: &Vector<D>, max: &Vector<D>) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|n| (0..D).all(|i| n.position[i] >= min[i] && n.position[i] <= max[i]))
            .map(|n| n.id)
            .collect()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Located {
    Inside,
    Clamped,
    Discarded,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mesh() -> Mesh<2> {
        let grid = Grid::new(Vector::<2>::zeros(), Vector::<2>::repeat(1.0), [4, 4]);
        Mesh::new(grid, 0)
    }

    fn particle(id: u64, x: f64, y: f64) -> Particle<2> {
        Particle::new(id, 0, Vector::<2>::new(x, y), 1.0, 1.0)
    }

    #[test]
    fn add_only_local_particles() {
        let mut mesh = mesh();
        let ranks: Vec<_> = (0..16).map(|c| if c < 8 { 0 } else { 1 }).collect();
        mesh.set_cell_ranks(&ranks).unwrap();
        let added = mesh
            .add_particles(
                vec![particle(0, 0.5, 0.5), particle(1, 0.5, 3.5)],
                LocatePolicy::Abort,
            )
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(mesh.particles()[0].id, 0);
        assert_eq!(mesh.next_particle_id(), 2);
    }

    #[test]
    fn locate_policies() {
        let mut mesh = mesh();
        mesh.add_particles(vec![particle(0, 0.5, 0.5), particle(1, 1.5, 0.5)], LocatePolicy::Abort)
            .unwrap();
        mesh.particles_mut()[1].position = Vector::<2>::new(5.0, 0.5);

        let mut discard = mesh.clone();
        let report = discard.locate_particles(LocatePolicy::Discard).unwrap();
        assert_eq!(report.discarded, vec![1]);
        assert_eq!(discard.num_particles(), 1);

        let mut clamp = mesh.clone();
        let report = clamp.locate_particles(LocatePolicy::Clamp).unwrap();
        assert_eq!(report.clamped, 1);
        assert_eq!(clamp.particles()[1].cell(), Some(3));

        let mut abort = mesh.clone();
        assert!(matches!(
            abort.locate_particles(LocatePolicy::Abort),
            Err(Error::ParticleOutsideDomain { id: 1, .. })
        ));
        // No particle is lost on abort.
        assert_eq!(abort.num_particles(), 2);
    }

    #[test]
    fn foreign_particles() {
        let mut mesh = mesh();
        mesh.add_particles(vec![particle(0, 0.5, 0.5), particle(1, 3.5, 3.5)], LocatePolicy::Abort)
            .unwrap();
        let ranks: Vec<_> = (0..16).map(|c| if c < 8 { 0 } else { 1 }).collect();
        mesh.set_cell_ranks(&ranks).unwrap();
        let report = mesh.locate_particles(LocatePolicy::Abort).unwrap();
        assert_eq!(report.foreign, 1);
        let foreign = mesh.take_foreign_particles();
        assert_eq!(foreign.len(), 1);
        assert_eq!(foreign[0].id, 1);
        assert_eq!(mesh.num_particles(), 1);
    }
}
