//! Particle transfer kernel.
//!
//! Scatter operations (particle to node) run sequentially per rank so that nodal sums are
//! reproducible. Gather operations (node to particle) run in parallel over particles.

use rayon::prelude::*;

use crate::comm::{CommError, Communicator};
use crate::mesh::{Mesh, Node};
use crate::Vector;

/// Rebuilds the shape function data of every particle for its current cell.
pub fn compute_shapefn<const D: usize>(mesh: &mut Mesh<D>) {
    let grid = mesh.grid().clone();
    mesh.iterate_particles(|p| p.compute_shapefn(&grid));
}

/// Scatters particle mass, momentum and mass weighted acceleration to the nodes.
pub fn map_mass_momentum_to_nodes<const D: usize>(mesh: &mut Mesh<D>) {
    let (nodes, particles) = mesh.nodes_and_particles_mut();
    for p in particles.iter() {
        for (n, w, _) in p.shape().iter() {
            let node = &mut nodes[n];
            let m = w * p.mass;
            node.mass += m;
            node.momentum += p.velocity * m;
            node.acceleration += p.acceleration * m;
            node.add_material(p.material_id);
        }
    }
}

/// Scatters gravity to the external nodal force.
pub fn map_body_force<const D: usize>(mesh: &mut Mesh<D>, gravity: &Vector<D>) {
    if gravity.iter().all(|&g| g == 0.0) {
        return;
    }
    let (nodes, particles) = mesh.nodes_and_particles_mut();
    for p in particles.iter() {
        for (n, w, _) in p.shape().iter() {
            nodes[n].external_force += gravity * (w * p.mass);
        }
    }
}

/// Scatters the divergence of particle stresses to the internal nodal force.
pub fn map_internal_force<const D: usize>(mesh: &mut Mesh<D>) {
    let (nodes, particles) = mesh.nodes_and_particles_mut();
    for p in particles.iter() {
        let stress = p.stress * p.volume;
        for (n, _, grad) in p.shape().iter() {
            nodes[n].internal_force -= stress * grad;
        }
    }
}

fn all_reduce_nodal<const D: usize, C: Communicator>(
    nodes: &mut [Node<D>],
    comm: &C,
    pack: impl Fn(&Node<D>, &mut Vec<f64>),
    unpack: impl Fn(&mut Node<D>, &[f64]),
    stride: usize,
) -> Result<(), CommError> {
    if comm.size() == 1 {
        return Ok(());
    }
    let mut buf = Vec::with_capacity(nodes.len() * stride);
    for node in nodes.iter() {
        pack(node, &mut buf);
    }
    comm.all_reduce_sum(&mut buf)?;
    for (node, chunk) in nodes.iter_mut().zip(buf.chunks_exact(stride)) {
        unpack(node, chunk);
    }
    Ok(())
}

/// Sums nodal mass, momentum and mass weighted acceleration over all ranks.
pub fn all_reduce_mass_momentum<const D: usize, C: Communicator>(
    mesh: &mut Mesh<D>,
    comm: &C,
) -> Result<(), CommError> {
    all_reduce_nodal(
        mesh.nodes_mut(),
        comm,
        |node, buf| {
            buf.push(node.mass);
            buf.extend(node.momentum.iter());
            buf.extend(node.acceleration.iter());
        },
        |node, chunk| {
            node.mass = chunk[0];
            node.momentum.copy_from_slice(&chunk[1..1 + D]);
            node.acceleration.copy_from_slice(&chunk[1 + D..1 + 2 * D]);
        },
        1 + 2 * D,
    )
}

/// Sums internal and external nodal forces over all ranks.
pub fn all_reduce_forces<const D: usize, C: Communicator>(
    mesh: &mut Mesh<D>,
    comm: &C,
) -> Result<(), CommError> {
    all_reduce_nodal(
        mesh.nodes_mut(),
        comm,
        |node, buf| {
            buf.extend(node.internal_force.iter());
            buf.extend(node.external_force.iter());
        },
        |node, chunk| {
            node.internal_force.copy_from_slice(&chunk[..D]);
            node.external_force.copy_from_slice(&chunk[D..2 * D]);
        },
        2 * D,
    )
}

/// Gathers the nodal solution to the particles.
///
/// Positions move by the interpolated displacement increment and accelerations are
/// interpolated directly. With `velocity_update` the particle velocity is replaced by the
/// interpolated nodal velocity, otherwise it is incremented by the interpolated change in nodal
/// velocity over the step.
pub fn map_particle_kinematics<const D: usize>(mesh: &mut Mesh<D>, velocity_update: bool) {
    mesh.iterate_particles_with_nodes(|p, nodes| {
        let shape = p.shape();
        let displacement = shape.interpolate(nodes, |n| n.displacement);
        let acceleration = shape.interpolate(nodes, |n| n.acceleration);
        let velocity = if velocity_update {
            shape.interpolate(nodes, |n| n.velocity)
        } else {
            p.velocity + shape.interpolate(nodes, |n| n.velocity - n.mapped_velocity)
        };
        p.position += displacement;
        p.acceleration = acceleration;
        p.velocity = velocity;
    });
}

/// Replaces the volumetric stress of each particle with the volume weighted average pressure of
/// the particles sharing its cell.
///
/// Particles sharing a cell always live on the same rank, so no communication is required.
pub fn smooth_pressure<const D: usize>(mesh: &mut Mesh<D>) {
    let ncells = mesh.cells().len();
    let mut weighted = vec![0.0; ncells];
    let mut volume = vec![0.0; ncells];
    for p in mesh.particles().iter() {
        if let Some(cell) = p.cell() {
            weighted[cell] += p.pressure() * p.volume;
            volume[cell] += p.volume;
        }
    }
    let pressure: Vec<f64> = weighted
        .iter()
        .zip(volume.iter())
        .map(|(&pv, &v)| if v > 0.0 { pv / v } else { 0.0 })
        .collect();
    mesh.iterate_particles(|p| {
        if let Some(cell) = p.cell() {
            p.set_pressure(pressure[cell]);
        }
    });
}

/// Finds nodes receiving contributions from more than one material on any rank.
pub fn detect_interface_nodes<const D: usize, C: Communicator>(
    mesh: &Mesh<D>,
    comm: &C,
    num_materials: usize,
) -> Result<Vec<usize>, CommError> {
    if num_materials < 2 {
        return Ok(Vec::new());
    }
    let nodes = mesh.nodes();
    let mut presence = vec![0.0; nodes.len() * num_materials];
    for node in nodes.iter() {
        for &m in node.materials.iter().filter(|&&m| m < num_materials) {
            presence[node.id * num_materials + m] = 1.0;
        }
    }
    comm.all_reduce_sum(&mut presence)?;
    Ok(presence
        .par_chunks_exact(num_materials)
        .enumerate()
        .filter(|(_, mats)| mats.iter().filter(|&&x| x > 0.0).count() > 1)
        .map(|(n, _)| n)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleRank;
    use crate::mesh::{Grid, Particle};
    use crate::params::LocatePolicy;
    use crate::Tensor;
    use approx::*;

    fn mesh(particles: Vec<Particle<2>>) -> Mesh<2> {
        let grid = Grid::new(Vector::<2>::zeros(), Vector::<2>::repeat(1.0), [2, 2]);
        let mut mesh = Mesh::new(grid, 0);
        mesh.add_particles(particles, LocatePolicy::Abort).unwrap();
        compute_shapefn(&mut mesh);
        mesh
    }

    #[test]
    fn mass_and_momentum_are_conserved() {
        let mut mesh = mesh(vec![
            Particle::new(0, 0, Vector::<2>::new(0.3, 0.4), 2.0, 1.0)
                .with_velocity(Vector::<2>::new(1.0, -1.0)),
            Particle::new(1, 0, Vector::<2>::new(1.7, 1.2), 3.0, 1.0)
                .with_velocity(Vector::<2>::new(0.5, 2.0)),
        ]);
        map_mass_momentum_to_nodes(&mut mesh);
        all_reduce_mass_momentum(&mut mesh, &SingleRank).unwrap();
        let mass: f64 = mesh.nodes().iter().map(|n| n.mass).sum();
        let momentum = mesh
            .nodes()
            .iter()
            .fold(Vector::<2>::zeros(), |acc, n| acc + n.momentum);
        assert_relative_eq!(mass, 5.0, epsilon = 1e-12);
        assert_relative_eq!(momentum, Vector::<2>::new(3.5, 4.0), epsilon = 1e-12);
    }

    #[test]
    fn uniform_stress_has_no_interior_force() {
        // Four particles at the Gauss points of the center cell of a 3x3 grid.
        let grid = Grid::new(Vector::<2>::zeros(), Vector::<2>::repeat(1.0), [3, 3]);
        let mut mesh = Mesh::new(grid, 0);
        let g = 0.5 / 3.0_f64.sqrt();
        let particles = [(-g, -g), (g, -g), (-g, g), (g, g)]
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| {
                Particle::new(i as u64, 0, Vector::<2>::new(1.5 + x, 1.5 + y), 1.0, 0.25)
                    .with_stress(Tensor::<2>::identity() * -10.0)
            })
            .collect::<Vec<_>>();
        mesh.add_particles(particles, LocatePolicy::Abort).unwrap();
        compute_shapefn(&mut mesh);
        map_internal_force(&mut mesh);
        let total = mesh
            .nodes()
            .iter()
            .fold(Vector::<2>::zeros(), |acc, n| acc + n.internal_force);
        assert_relative_eq!(total, Vector::<2>::zeros(), epsilon = 1e-12);
        // Compressive stress pushes the corner nodes outward.
        let node = &mesh.nodes()[5];
        assert!(node.internal_force[0] < 0.0 && node.internal_force[1] < 0.0);
    }

    #[test]
    fn pressure_smoothing_equalises_cells() {
        let mut mesh = mesh(vec![
            Particle::new(0, 0, Vector::<2>::new(0.2, 0.2), 1.0, 1.0)
                .with_stress(Tensor::<2>::identity() * -1.0),
            Particle::new(1, 0, Vector::<2>::new(0.8, 0.8), 1.0, 3.0)
                .with_stress(Tensor::<2>::new(-5.0, 2.0, 2.0, -5.0)),
            Particle::new(2, 0, Vector::<2>::new(1.5, 1.5), 1.0, 1.0)
                .with_stress(Tensor::<2>::identity() * -7.0),
        ]);
        smooth_pressure(&mut mesh);
        let p = mesh.particles();
        assert_relative_eq!(p[0].pressure(), -4.0, epsilon = 1e-12);
        assert_relative_eq!(p[1].pressure(), -4.0, epsilon = 1e-12);
        assert_relative_eq!(p[1].stress[(0, 1)], 2.0);
        assert_relative_eq!(p[2].pressure(), -7.0, epsilon = 1e-12);
    }

    #[test]
    fn interface_nodes() {
        let mut mesh = mesh(vec![
            Particle::new(0, 0, Vector::<2>::new(0.5, 0.5), 1.0, 1.0),
            Particle::new(1, 1, Vector::<2>::new(1.5, 0.5), 1.0, 1.0),
        ]);
        map_mass_momentum_to_nodes(&mut mesh);
        let nodes = detect_interface_nodes(&mesh, &SingleRank, 2).unwrap();
        // Nodes on the shared edge x = 1.
        assert_eq!(nodes, vec![1, 4]);
    }
}
