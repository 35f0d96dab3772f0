//! Constitutive model interface.
//!
//! The solver only sees materials through the [`Material`] trait. [`LinearElastic`] is provided
//! as a reference model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Tensor, Vector};

#[derive(Clone, Debug, PartialEq, Error)]
pub enum MaterialError {
    #[error("Non-physical strain state (volumetric strain increment {volumetric})")]
    NonPhysicalStrain { volumetric: f64 },
    #[error("Non-finite stress")]
    NonFiniteStress,
}

pub trait Material<const D: usize>: Send + Sync {
    /// Returns the updated stress given the current stress and a strain increment.
    fn compute_stress(
        &self,
        stress: &Tensor<D>,
        dstrain: &Tensor<D>,
    ) -> Result<Tensor<D>, MaterialError>;

    /// Stiffness block per unit volume coupling the displacements of two nodes with the given
    /// shape function gradients.
    fn tangent(&self, grad_a: &Vector<D>, grad_b: &Vector<D>) -> Tensor<D>;
}

/// Isotropic linear elasticity.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearElastic {
    pub youngs_modulus: f64,
    pub poisson_ratio: f64,
}

impl LinearElastic {
    pub fn new(youngs_modulus: f64, poisson_ratio: f64) -> Self {
        LinearElastic {
            youngs_modulus,
            poisson_ratio,
        }
    }

    /// Lamé parameters `(lambda, mu)`.
    pub fn lame_parameters(&self) -> (f64, f64) {
        let e = self.youngs_modulus;
        let nu = self.poisson_ratio;
        let lambda = e * nu / ((1.0 + nu) * (1.0 - 2.0 * nu));
        let mu = e / (2.0 * (1.0 + nu));
        (lambda, mu)
    }
}

impl<const D: usize> Material<D> for LinearElastic {
    fn compute_stress(
        &self,
        stress: &Tensor<D>,
        dstrain: &Tensor<D>,
    ) -> Result<Tensor<D>, MaterialError> {
        if dstrain.iter().any(|x| !x.is_finite()) {
            return Err(MaterialError::NonPhysicalStrain {
                volumetric: dstrain.trace(),
            });
        }
        let (lambda, mu) = self.lame_parameters();
        let updated = stress + Tensor::<D>::identity() * (lambda * dstrain.trace()) + dstrain * (2.0 * mu);
        if updated.iter().any(|x| !x.is_finite()) {
            return Err(MaterialError::NonFiniteStress);
        }
        Ok(updated)
    }

    fn tangent(&self, grad_a: &Vector<D>, grad_b: &Vector<D>) -> Tensor<D> {
        let (lambda, mu) = self.lame_parameters();
        grad_a * grad_b.transpose() * lambda
            + (grad_b * grad_a.transpose() + Tensor::<D>::identity() * grad_a.dot(grad_b)) * mu
    }
}

/// Materials indexed by id.
pub struct Materials<const D: usize> {
    models: Vec<Option<Box<dyn Material<D>>>>,
}

impl<const D: usize> Default for Materials<D> {
    fn default() -> Self {
        Materials { models: Vec::new() }
    }
}

impl<const D: usize> Materials<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: usize, material: impl Material<D> + 'static) -> &mut Self {
        if self.models.len() <= id {
            self.models.resize_with(id + 1, || None);
        }
        self.models[id] = Some(Box::new(material));
        self
    }

    pub fn get(&self, id: usize) -> Option<&dyn Material<D>> {
        self.models.get(id).and_then(|m| m.as_deref())
    }

    pub fn contains(&self, id: usize) -> bool {
        self.get(id).is_some()
    }

    /// One past the largest material id.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.iter().all(|m| m.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::*;

    #[test]
    fn tangent_is_symmetric() {
        let m = LinearElastic::new(1e6, 0.3);
        let ga = Vector::<3>::new(0.1, -0.4, 0.2);
        let gb = Vector::<3>::new(-0.3, 0.2, 0.7);
        let kab = Material::<3>::tangent(&m, &ga, &gb);
        let kba = Material::<3>::tangent(&m, &gb, &ga);
        assert_relative_eq!(kab, kba.transpose(), max_relative = 1e-12);
    }

    #[test]
    fn uniaxial_strain() {
        let m = LinearElastic::new(1e6, 0.25);
        let (lambda, mu) = m.lame_parameters();
        let mut dstrain = Tensor::<2>::zeros();
        dstrain[(0, 0)] = 1e-3;
        let stress = m.compute_stress(&Tensor::<2>::zeros(), &dstrain).unwrap();
        assert_relative_eq!(stress[(0, 0)], (lambda + 2.0 * mu) * 1e-3, max_relative = 1e-12);
        assert_relative_eq!(stress[(1, 1)], lambda * 1e-3, max_relative = 1e-12);
    }

    #[test]
    fn non_finite_strain_fails() {
        let m = LinearElastic::new(1e6, 0.25);
        let mut dstrain = Tensor::<2>::zeros();
        dstrain[(0, 1)] = f64::NAN;
        assert!(m.compute_stress(&Tensor::<2>::zeros(), &dstrain).is_err());
    }

    #[test]
    fn registry() {
        let mut materials = Materials::<2>::new();
        materials.insert(2, LinearElastic::new(1.0, 0.0));
        assert!(materials.contains(2));
        assert!(!materials.contains(0));
        assert!(!materials.contains(5));
    }
}
