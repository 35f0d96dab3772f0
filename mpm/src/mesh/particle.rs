use serde::{Deserialize, Serialize};

use crate::material::{Material, MaterialError};
use crate::mesh::{Grid, Node};
use crate::{Tensor, Vector};

/// Shape function data of a particle with respect to the nodes of its cell.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ShapeData<const D: usize> {
    pub nodes: Vec<usize>,
    pub weights: Vec<f64>,
    pub gradients: Vec<Vector<D>>,
}

impl<const D: usize> ShapeData<D> {
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64, &Vector<D>)> + '_ {
        self.nodes
            .iter()
            .zip(self.weights.iter())
            .zip(self.gradients.iter())
            .map(|((&n, &w), g)| (n, w, g))
    }

    /// Interpolates a nodal vector field at the particle.
    pub fn interpolate(&self, nodes: &[Node<D>], field: impl Fn(&Node<D>) -> Vector<D>) -> Vector<D> {
        self.nodes
            .iter()
            .zip(self.weights.iter())
            .fold(Vector::zeros(), |acc, (&n, &w)| acc + field(&nodes[n]) * w)
    }

    /// Gradient of a nodal vector field at the particle: `sum_a f_a ⊗ ∇N_a`.
    pub fn gradient(&self, nodes: &[Node<D>], field: impl Fn(&Node<D>) -> Vector<D>) -> Tensor<D> {
        self.nodes
            .iter()
            .zip(self.gradients.iter())
            .fold(Tensor::zeros(), |acc, (&n, g)| {
                acc + field(&nodes[n]) * g.transpose()
            })
    }
}

/// A material point.
///
/// The owning cell is only a lookup index into the mesh cells, which are owned by the mesh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle<const D: usize> {
    pub id: u64,
    pub material_id: usize,
    pub position: Vector<D>,
    pub mass: f64,
    pub volume: f64,
    pub velocity: Vector<D>,
    pub acceleration: Vector<D>,
    pub stress: Tensor<D>,
    pub strain: Tensor<D>,
    /// Strain increment over the last step.
    pub dstrain: Tensor<D>,
    #[serde(skip)]
    pub(crate) cell: Option<usize>,
    #[serde(skip)]
    pub(crate) shape: ShapeData<D>,
}

impl<const D: usize> Particle<D> {
    pub fn new(id: u64, material_id: usize, position: Vector<D>, mass: f64, volume: f64) -> Self {
        Particle {
            id,
            material_id,
            position,
            mass,
            volume,
            velocity: Vector::zeros(),
            acceleration: Vector::zeros(),
            stress: Tensor::zeros(),
            strain: Tensor::zeros(),
            dstrain: Tensor::zeros(),
            cell: None,
            shape: ShapeData::default(),
        }
    }

    pub fn with_velocity(mut self, velocity: Vector<D>) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_stress(mut self, stress: Tensor<D>) -> Self {
        self.stress = stress;
        self
    }

    pub fn cell(&self) -> Option<usize> {
        self.cell
    }

    pub fn shape(&self) -> &ShapeData<D> {
        &self.shape
    }

    /// Sets the mass from the given density and the current volume.
    pub fn compute_mass(&mut self, density: f64) {
        self.mass = density * self.volume;
    }

    /// Rebuilds the shape function data for the current cell.
    pub fn compute_shapefn(&mut self, grid: &Grid<D>) {
        match self.cell {
            Some(cell) => self.shape = grid.shape_data(cell, &self.position),
            None => self.shape = ShapeData::default(),
        }
    }

    /// Computes the strain increment from the nodal displacement increments and accumulates it.
    pub fn compute_strain(&mut self, nodes: &[Node<D>]) {
        let grad = self.shape.gradient(nodes, |n| n.displacement);
        self.dstrain = (grad + grad.transpose()) * 0.5;
        self.strain += self.dstrain;
    }

    /// Updates the volume with the volumetric part of the strain increment.
    pub fn update_volume(&mut self) -> Result<(), MaterialError> {
        let factor = 1.0 + self.dstrain.trace();
        if !(factor > 0.0) {
            return Err(MaterialError::NonPhysicalStrain {
                volumetric: self.dstrain.trace(),
            });
        }
        self.volume *= factor;
        Ok(())
    }

    /// Updates the stress with the given material using the last strain increment.
    pub fn compute_stress(&mut self, material: &dyn Material<D>) -> Result<(), MaterialError> {
        self.stress = material.compute_stress(&self.stress, &self.dstrain)?;
        Ok(())
    }

    /// Mean normal stress.
    pub fn pressure(&self) -> f64 {
        self.stress.trace() / D as f64
    }

    /// Replaces the volumetric part of the stress.
    pub fn set_pressure(&mut self, pressure: f64) {
        let shift = pressure - self.pressure();
        for i in 0..D {
            self.stress[(i, i)] += shift;
        }
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|x| x.is_finite())
            && self.velocity.iter().all(|x| x.is_finite())
            && self.acceleration.iter().all(|x| x.is_finite())
            && self.stress.iter().all(|x| x.is_finite())
            && self.strain.iter().all(|x| x.is_finite())
            && self.mass.is_finite()
            && self.volume.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::LinearElastic;
    use approx::*;

    #[test]
    fn pressure_shift_keeps_deviator() {
        let mut p = Particle::<2>::new(0, 0, Vector::<2>::zeros(), 1.0, 1.0)
            .with_stress(Tensor::<2>::new(-3.0, 1.0, 1.0, -1.0));
        p.set_pressure(-1.0);
        assert_relative_eq!(p.pressure(), -1.0);
        assert_relative_eq!(p.stress, Tensor::<2>::new(-2.0, 1.0, 1.0, 0.0));
    }

    #[test]
    fn strain_from_uniform_stretch() {
        let grid = Grid::<2>::new(Vector::<2>::zeros(), Vector::<2>::repeat(1.0), [1, 1]);
        let mut nodes: Vec<_> = (0..grid.num_nodes())
            .map(|i| Node::new(i, grid.node_position(i)))
            .collect();
        // Displacement u = 0.01 * x along the first axis.
        for node in nodes.iter_mut() {
            node.displacement = Vector::<2>::new(0.01 * node.position[0], 0.0);
        }
        let mut p = Particle::<2>::new(0, 0, Vector::<2>::new(0.3, 0.7), 1.0, 1.0);
        p.cell = grid.locate(&p.position);
        p.compute_shapefn(&grid);
        p.compute_strain(&nodes);
        assert_relative_eq!(p.dstrain, Tensor::<2>::new(0.01, 0.0, 0.0, 0.0), epsilon = 1e-14);
        p.update_volume().unwrap();
        assert_relative_eq!(p.volume, 1.01, epsilon = 1e-14);

        let material = LinearElastic::new(1000.0, 0.0);
        p.compute_stress(&material).unwrap();
        assert_relative_eq!(p.stress[(0, 0)], 10.0, epsilon = 1e-10);
    }

    #[test]
    fn inverted_volume_is_rejected() {
        let mut p = Particle::<2>::new(0, 0, Vector::<2>::zeros(), 1.0, 1.0);
        p.dstrain = Tensor::<2>::identity() * -0.6;
        assert!(p.update_volume().is_err());
        assert_eq!(p.volume, 1.0);
    }
}
