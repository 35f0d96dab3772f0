use crate::mesh::Mesh;

use super::SchemeParams;

/// Explicit update of nodal acceleration, velocity and displacement increment from the
/// unbalanced nodal force.
pub(super) fn corrector<const D: usize>(mesh: &mut Mesh<D>, params: &SchemeParams) {
    let dt = params.dt;
    let gamma = params.newmark.gamma;
    let damping = params.damping;
    mesh.iterate_nodes(|n| n.update_explicit(dt, gamma, damping));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Grid;
    use crate::params::{AnalysisConfig, Damping};
    use crate::Vector;
    use approx::*;

    #[test]
    fn constant_force() {
        let grid = Grid::new(Vector::<2>::zeros(), Vector::<2>::repeat(1.0), [1, 1]);
        let mut mesh = Mesh::new(grid, 0);
        for n in mesh.nodes_mut() {
            n.mass = 2.0;
            n.velocity = Vector::<2>::new(1.0, 0.0);
            n.external_force = Vector::<2>::new(0.0, -4.0);
        }
        // Inactive node.
        mesh.nodes_mut()[3].mass = 0.0;

        let mut params = SchemeParams::from_config(&AnalysisConfig::default());
        params.dt = 0.1;
        params.damping = Damping::None;
        corrector(&mut mesh, &params);

        let n = &mesh.nodes()[0];
        assert_relative_eq!(n.acceleration, Vector::<2>::new(0.0, -2.0));
        assert_relative_eq!(n.velocity, Vector::<2>::new(1.0, -0.2));
        // dt * v0 + 0.5 * dt^2 * a
        assert_relative_eq!(n.displacement, Vector::<2>::new(0.1, -0.01), epsilon = 1e-14);
        assert_eq!(mesh.nodes()[3].displacement, Vector::<2>::zeros());
    }
}
