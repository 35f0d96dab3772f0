//! Newmark predictor/corrector with a single linear solve per step.

use crate::comm::{CommError, Communicator};
use crate::material::Materials;
use crate::mesh::Mesh;
use crate::Error;

use super::linsolve::{ConjugateResidual, SolveResult};
use super::SchemeParams;

pub(super) fn predictor<const D: usize>(mesh: &mut Mesh<D>, params: &SchemeParams) {
    let dt = params.dt;
    let NewmarkCoefficients { beta, gamma } = NewmarkCoefficients::from(params);
    mesh.iterate_nodes(|n| n.predict_newmark(dt, beta, gamma));
}

pub(super) fn corrector<const D: usize>(
    mesh: &mut Mesh<D>,
    params: &SchemeParams,
    correction: &[f64],
) {
    let dt = params.dt;
    let NewmarkCoefficients { beta, gamma } = NewmarkCoefficients::from(params);
    let zero = [0.0; D];
    mesh.iterate_nodes(|n| {
        let c = correction.get(n.id * D..(n.id + 1) * D).unwrap_or(&zero[..]);
        n.correct_newmark(&crate::Vector::<D>::from_column_slice(c), dt, beta, gamma);
    });
}

struct NewmarkCoefficients {
    beta: f64,
    gamma: f64,
}

impl From<&SchemeParams> for NewmarkCoefficients {
    fn from(params: &SchemeParams) -> Self {
        NewmarkCoefficients {
            beta: params.newmark.beta,
            gamma: params.newmark.gamma,
        }
    }
}

/// Maps each nodal degree of freedom to its index in the reduced system.
///
/// Only unconstrained directions of active nodes are solved for.
fn dof_map<const D: usize>(mesh: &Mesh<D>) -> (Vec<Option<usize>>, usize) {
    let mut map = vec![None; mesh.nodes().len() * D];
    let mut count = 0;
    for node in mesh.nodes().iter().filter(|n| n.is_active()) {
        for i in 0..D {
            if !node.is_constrained(i) {
                map[node.id * D + i] = Some(count);
                count += 1;
            }
        }
    }
    (map, count)
}

/// Assembles the stiffness of the local particles over the reduced degrees of freedom.
fn assemble_stiffness<const D: usize>(
    mesh: &Mesh<D>,
    materials: &Materials<D>,
    dofs: &[Option<usize>],
    size: usize,
) -> Result<sprs::CsMat<f64>, Error> {
    let mut rows = Vec::new();
    let mut cols = Vec::new();
    let mut values = Vec::new();
    for p in mesh.particles().iter() {
        let material = materials
            .get(p.material_id)
            .ok_or(Error::MissingMaterial {
                id: p.material_id,
                particle: p.id,
            })?;
        for (a, _, grad_a) in p.shape().iter() {
            for (b, _, grad_b) in p.shape().iter() {
                let block = material.tangent(grad_a, grad_b) * p.volume;
                for i in 0..D {
                    for j in 0..D {
                        if let (Some(row), Some(col)) = (dofs[a * D + i], dofs[b * D + j]) {
                            rows.push(row);
                            cols.push(col);
                            values.push(block[(i, j)]);
                        }
                    }
                }
            }
        }
    }
    Ok(sprs::TriMat::from_triplets((size, size), rows, cols, values).to_csr())
}

fn mul_vec(mat: &sprs::CsMat<f64>, x: &[f64], out: &mut [f64]) {
    for (row, vec) in mat.outer_iterator().enumerate() {
        out[row] = vec.iter().map(|(col, &val)| val * x[col]).sum();
    }
}

/// Solves `(M / (beta dt^2) + K) c = f - K u*` for the displacement correction `c`.
///
/// Every rank holds identical reduced nodal masses, forces and predicted displacements, while
/// `K` is the stiffness of the rank-local particles only. Stiffness products are summed over
/// ranks, so all ranks follow identical solver iterations.
pub(super) fn solve<const D: usize, C: Communicator>(
    mesh: &Mesh<D>,
    comm: &C,
    materials: &Materials<D>,
    params: &SchemeParams,
) -> Result<(Vec<f64>, SolveResult), Error> {
    let NewmarkCoefficients { beta, .. } = NewmarkCoefficients::from(params);
    let dt = params.dt;
    let nodes = mesh.nodes();
    let mut correction = vec![0.0; nodes.len() * D];

    let (dofs, size) = dof_map(mesh);
    if size == 0 {
        return Ok((correction, SolveResult::default()));
    }

    let stiffness = assemble_stiffness(mesh, materials, &dofs, size)?;

    let mut inertia = vec![0.0; size];
    let mut predicted = vec![0.0; size];
    let mut rhs = vec![0.0; size];
    for node in nodes.iter() {
        let force = node.damped_force(node.total_force(), params.damping);
        for i in 0..D {
            if let Some(d) = dofs[node.id * D + i] {
                inertia[d] = node.mass / (beta * dt * dt);
                predicted[d] = node.displacement[i];
                rhs[d] = force[i];
            }
        }
    }

    let mut ku = vec![0.0; size];
    mul_vec(&stiffness, &predicted, &mut ku);
    comm.all_reduce_sum(&mut ku)?;
    for (r, ku) in rhs.iter_mut().zip(ku.iter()) {
        *r -= ku;
    }

    let mut comm_error: Option<CommError> = None;
    let mut x = vec![0.0; size];
    let mut cr = ConjugateResidual::new(
        size,
        params.linear_solver.max_iterations,
        params.linear_solver.tolerance,
    );
    let result = cr.solve(
        |x, out| {
            mul_vec(&stiffness, x, out);
            if let Err(e) = comm.all_reduce_sum(out) {
                comm_error = Some(e);
                return false;
            }
            for ((o, &m), &x) in out.iter_mut().zip(inertia.iter()).zip(x.iter()) {
                *o += m * x;
            }
            true
        },
        &mut x,
        &mut rhs,
    );
    if let Some(e) = comm_error {
        return Err(e.into());
    }
    if !result.is_success() {
        return Err(Error::LinearSolve { result });
    }

    for (dof, c) in dofs.iter().zip(correction.iter_mut()) {
        if let Some(d) = dof {
            *c = x[*d];
        }
    }
    Ok((correction, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleRank;
    use crate::material::LinearElastic;
    use crate::mesh::{Grid, Particle};
    use crate::params::{AnalysisConfig, LocatePolicy};
    use crate::{transfer, Vector};
    use approx::*;

    fn setup() -> (Mesh<2>, Materials<2>) {
        let grid = Grid::new(Vector::<2>::zeros(), Vector::<2>::repeat(1.0), [2, 1]);
        let mut mesh = Mesh::new(grid, 0);
        let particles = (0..4).map(|i| {
            Particle::new(i, 0, Vector::<2>::new(0.25 + 0.5 * i as f64, 0.5), 1.0, 0.5)
        });
        mesh.add_particles(particles, LocatePolicy::Abort).unwrap();
        transfer::compute_shapefn(&mut mesh);
        transfer::map_mass_momentum_to_nodes(&mut mesh);
        mesh.iterate_nodes(|n| n.compute_velocity());
        let mut materials = Materials::new();
        materials.insert(0, LinearElastic::new(100.0, 0.0));
        (mesh, materials)
    }

    #[test]
    fn stiffness_is_symmetric_with_rigid_null_space() {
        let (mesh, materials) = setup();
        let (dofs, size) = dof_map(&mesh);
        assert_eq!(size, 12);
        let k = assemble_stiffness(&mesh, &materials, &dofs, size).unwrap();
        let entry = |i, j| k.get(i, j).cloned().unwrap_or(0.0);
        for i in 0..size {
            for j in 0..size {
                assert_relative_eq!(entry(i, j), entry(j, i), epsilon = 1e-10);
            }
        }
        // Rigid translation along x.
        let translation: Vec<f64> = (0..size).map(|d| if d % 2 == 0 { 1.0 } else { 0.0 }).collect();
        let mut out = vec![0.0; size];
        mul_vec(&k, &translation, &mut out);
        for o in out {
            assert_relative_eq!(o, 0.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn inertia_only_solve() {
        let (mut mesh, materials) = setup();
        for n in mesh.nodes_mut() {
            n.external_force = Vector::<2>::new(0.0, -n.mass);
        }
        let config = AnalysisConfig {
            dt: 0.1,
            ..Default::default()
        };
        let params = SchemeParams::from_config(&config);
        let (c, result) = solve(&mesh, &SingleRank, &materials, &params).unwrap();
        assert!(result.is_success());
        // A uniform body force produces a uniform correction a * beta * dt^2.
        for node in 0..mesh.nodes().len() {
            assert_relative_eq!(c[node * 2], 0.0, epsilon = 1e-9);
            assert_relative_eq!(c[node * 2 + 1], -0.25 * 0.01, epsilon = 1e-9);
        }
    }
}
