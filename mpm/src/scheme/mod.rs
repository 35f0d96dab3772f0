//! Time integration.
//!
//! A [`Scheme`] advances the nodal solution of a single step through a fixed sequence of stages:
//!
//! 1. [`Scheme::initialise`]
//! 2. [`Scheme::compute_nodal_kinematics`]
//! 3. [`Scheme::predictor`]
//! 4. [`Scheme::compute_forces`]
//! 5. [`Scheme::solve`]
//! 6. [`Scheme::corrector`]
//! 7. [`Scheme::compute_particle_kinematics`]
//! 8. [`Scheme::postcompute_stress_strain`]
//! 9. [`Scheme::locate_particles`]
//!
//! Requesting a stage out of this order is an error.

mod explicit;
pub mod linsolve;
mod newmark;

use rayon::prelude::*;

use crate::comm::Communicator;
use crate::constraints::Constraints;
use crate::material::Materials;
use crate::mesh::{LocateReport, Mesh};
use crate::params::{
    AnalysisConfig, Damping, LinearSolverParams, LocatePolicy, NewmarkParams, SchemeType,
};
use crate::transfer;
use crate::{Error, Vector, SOLID_PHASE};

pub use linsolve::SolveResult;

/// Immutable integration parameters.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SchemeParams {
    pub dt: f64,
    pub newmark: NewmarkParams,
    pub damping: Damping,
    pub velocity_update: bool,
    pub pressure_smoothing: bool,
    pub locate_policy: LocatePolicy,
    pub linear_solver: LinearSolverParams,
}

impl SchemeParams {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        SchemeParams {
            dt: config.dt,
            newmark: config.newmark,
            damping: config.damping,
            velocity_update: config.velocity_update,
            pressure_smoothing: config.pressure_smoothing,
            locate_policy: config.locate_policy,
            linear_solver: config.linear_solver,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    Initialised,
    NodalKinematics,
    Predicted,
    Forces,
    Solved,
    Corrected,
    ParticleKinematics,
    StressStrain,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Initialised => "initialise",
            Stage::NodalKinematics => "nodal kinematics",
            Stage::Predicted => "predictor",
            Stage::Forces => "forces",
            Stage::Solved => "solve",
            Stage::Corrected => "corrector",
            Stage::ParticleKinematics => "particle kinematics",
            Stage::StressStrain => "stress and strain update",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Integrator {
    Explicit,
    ImplicitLinear,
}

/// The integration scheme of a run.
#[derive(Clone, Debug)]
pub struct Scheme {
    integrator: Integrator,
    params: SchemeParams,
    stage: Stage,
    /// Displacement corrections from the last implicit solve, `D` entries per node.
    correction: Vec<f64>,
    last_solve: Option<SolveResult>,
}

impl Scheme {
    /// Builds the scheme selected in the analysis configuration.
    pub fn new(config: &AnalysisConfig) -> Result<Self, Error> {
        let integrator = match config.scheme {
            SchemeType::Explicit => Integrator::Explicit,
            SchemeType::ImplicitLinear => {
                if !(config.newmark.beta > 0.0) {
                    return Err(Error::InvalidParameter {
                        name: String::from("analysis.newmark.beta"),
                    });
                }
                Integrator::ImplicitLinear
            }
            SchemeType::ImplicitNonlinear => {
                return Err(Error::UnimplementedFeature {
                    description: String::from("nonlinear implicit integration"),
                })
            }
        };
        Ok(Scheme {
            integrator,
            params: SchemeParams::from_config(config),
            stage: Stage::Idle,
            correction: Vec::new(),
            last_solve: None,
        })
    }

    pub fn integrator(&self) -> Integrator {
        self.integrator
    }

    pub fn params(&self) -> &SchemeParams {
        &self.params
    }

    pub fn is_implicit(&self) -> bool {
        self.integrator == Integrator::ImplicitLinear
    }

    /// Result of the linear solve of the current step, if any.
    pub fn last_solve(&self) -> Option<&SolveResult> {
        self.last_solve.as_ref()
    }

    fn advance(&mut self, from: Stage, to: Stage) -> Result<(), Error> {
        if self.stage != from {
            return Err(Error::StageOrder {
                requested: to.name(),
                current: self.stage.name(),
            });
        }
        self.stage = to;
        Ok(())
    }

    /// Resets nodal accumulators and rebuilds particle shape functions.
    ///
    /// This starts a new step regardless of the stage reached by the previous one.
    pub fn initialise<const D: usize>(&mut self, mesh: &mut Mesh<D>) {
        mesh.iterate_nodes(|n| n.initialise());
        transfer::compute_shapefn(mesh);
        self.correction.clear();
        self.last_solve = None;
        self.stage = Stage::Initialised;
    }

    /// Maps particle mass and momentum to the nodes and derives nodal velocities.
    pub fn compute_nodal_kinematics<const D: usize, C: Communicator>(
        &mut self,
        mesh: &mut Mesh<D>,
        comm: &C,
        phase: usize,
    ) -> Result<(), Error> {
        if phase != SOLID_PHASE {
            return Err(Error::InvalidParameter {
                name: format!("phase {}", phase),
            });
        }
        self.advance(Stage::Initialised, Stage::NodalKinematics)?;
        transfer::map_mass_momentum_to_nodes(mesh);
        transfer::all_reduce_mass_momentum(mesh, comm)?;
        mesh.iterate_nodes(|n| n.compute_velocity());
        Ok(())
    }

    pub fn predictor<const D: usize>(&mut self, mesh: &mut Mesh<D>) -> Result<(), Error> {
        self.advance(Stage::NodalKinematics, Stage::Predicted)?;
        match self.integrator {
            Integrator::Explicit => {}
            Integrator::ImplicitLinear => newmark::predictor(mesh, &self.params),
        }
        Ok(())
    }

    /// Maps body and internal forces to the nodes and adds concentrated nodal forces.
    pub fn compute_forces<const D: usize, C: Communicator>(
        &mut self,
        mesh: &mut Mesh<D>,
        comm: &C,
        gravity: &Vector<D>,
        constraints: &Constraints,
    ) -> Result<(), Error> {
        self.advance(Stage::Predicted, Stage::Forces)?;
        transfer::map_body_force(mesh, gravity);
        transfer::map_internal_force(mesh);
        transfer::all_reduce_forces(mesh, comm)?;
        constraints.apply_concentrated_forces(mesh);
        Ok(())
    }

    /// Solves for the displacement correction of the implicit scheme.
    pub fn solve<const D: usize, C: Communicator>(
        &mut self,
        mesh: &Mesh<D>,
        comm: &C,
        materials: &Materials<D>,
    ) -> Result<Option<SolveResult>, Error> {
        self.advance(Stage::Forces, Stage::Solved)?;
        if let Integrator::ImplicitLinear = self.integrator {
            let (correction, result) = newmark::solve(mesh, comm, materials, &self.params)?;
            log::debug!(
                "Linear solve: {} iterations, relative residual {:.3e}, |c|_inf = {:.3e}",
                result.iterations,
                result.error,
                crate::inf_norm(correction.iter().cloned())
            );
            self.correction = correction;
            self.last_solve = Some(result);
        }
        Ok(self.last_solve)
    }

    pub fn corrector<const D: usize>(&mut self, mesh: &mut Mesh<D>) -> Result<(), Error> {
        self.advance(Stage::Solved, Stage::Corrected)?;
        match self.integrator {
            Integrator::Explicit => explicit::corrector(mesh, &self.params),
            Integrator::ImplicitLinear => newmark::corrector(mesh, &self.params, &self.correction),
        }
        Ok(())
    }

    /// Updates particle positions, velocities and accelerations from the nodal solution.
    pub fn compute_particle_kinematics<const D: usize>(
        &mut self,
        mesh: &mut Mesh<D>,
        constraints: &Constraints,
    ) -> Result<(), Error> {
        self.advance(Stage::Corrected, Stage::ParticleKinematics)?;
        transfer::map_particle_kinematics(mesh, self.params.velocity_update);
        constraints.apply_particle_velocity_constraints(mesh);
        Ok(())
    }

    /// Updates strain, volume and stress of every particle.
    ///
    /// With pressure smoothing enabled, the cell averaged pressure replaces the volumetric stress
    /// before it is handed to the material.
    pub fn postcompute_stress_strain<const D: usize>(
        &mut self,
        mesh: &mut Mesh<D>,
        materials: &Materials<D>,
    ) -> Result<(), Error> {
        self.advance(Stage::ParticleKinematics, Stage::StressStrain)?;
        let (particles, nodes) = mesh.particles_and_nodes_mut();
        particles.par_iter_mut().try_for_each(|p| {
            p.compute_strain(nodes);
            let particle = p.id;
            p.update_volume()
                .map_err(|source| Error::Material { particle, source })
        })?;

        if self.params.pressure_smoothing {
            transfer::smooth_pressure(mesh);
        }

        mesh.try_iterate_particles(|p| {
            let material = materials
                .get(p.material_id)
                .ok_or(Error::MissingMaterial {
                    id: p.material_id,
                    particle: p.id,
                })?;
            let particle = p.id;
            p.compute_stress(material)
                .map_err(|source| Error::Material { particle, source })
        })
    }

    /// Finds the cell of every particle at its new position, which completes the step.
    pub fn locate_particles<const D: usize>(
        &mut self,
        mesh: &mut Mesh<D>,
    ) -> Result<LocateReport, Error> {
        self.advance(Stage::StressStrain, Stage::Idle)?;
        mesh.locate_particles(self.params.locate_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleRank;
    use crate::material::{LinearElastic, Material, MaterialError};
    use crate::mesh::{Grid, Particle};
    use crate::Tensor;
    use approx::*;
    use std::sync::{Arc, Mutex};

    fn mesh() -> Mesh<2> {
        let grid = Grid::new(Vector::<2>::zeros(), Vector::<2>::repeat(1.0), [4, 4]);
        let mut mesh = Mesh::new(grid, 0);
        let particles = (0..4).map(|i| {
            let x = 1.25 + 0.5 * (i % 2) as f64;
            let y = 1.25 + 0.5 * (i / 2) as f64;
            Particle::new(i, 0, Vector::<2>::new(x, y), 0.25, 0.25)
                .with_velocity(Vector::<2>::new(0.5, -0.25))
        });
        mesh.add_particles(particles, LocatePolicy::Abort).unwrap();
        mesh
    }

    fn materials() -> Materials<2> {
        let mut materials = Materials::new();
        materials.insert(0, LinearElastic::new(1e4, 0.3));
        materials
    }

    fn step(scheme: &mut Scheme, mesh: &mut Mesh<2>) {
        step_with(scheme, mesh, &materials());
    }

    fn step_with(scheme: &mut Scheme, mesh: &mut Mesh<2>, materials: &Materials<2>) {
        let constraints = Constraints::default();
        scheme.initialise(mesh);
        scheme.compute_nodal_kinematics(mesh, &SingleRank, SOLID_PHASE).unwrap();
        scheme.predictor(mesh).unwrap();
        scheme
            .compute_forces(mesh, &SingleRank, &Vector::<2>::zeros(), &constraints)
            .unwrap();
        scheme.solve(mesh, &SingleRank, materials).unwrap();
        scheme.corrector(mesh).unwrap();
        scheme.compute_particle_kinematics(mesh, &constraints).unwrap();
        scheme.postcompute_stress_strain(mesh, materials).unwrap();
        scheme.locate_particles(mesh).unwrap();
    }

    /// Linear elastic material that records the pressure of every stress it is handed.
    struct PressureLog {
        elastic: LinearElastic,
        seen: Arc<Mutex<Vec<f64>>>,
    }

    impl Material<2> for PressureLog {
        fn compute_stress(
            &self,
            stress: &Tensor<2>,
            dstrain: &Tensor<2>,
        ) -> Result<Tensor<2>, MaterialError> {
            self.seen.lock().unwrap().push(stress.trace() / 2.0);
            Material::<2>::compute_stress(&self.elastic, stress, dstrain)
        }

        fn tangent(&self, grad_a: &Vector<2>, grad_b: &Vector<2>) -> Tensor<2> {
            Material::<2>::tangent(&self.elastic, grad_a, grad_b)
        }
    }

    #[test]
    fn material_receives_smoothed_pressure() {
        let elastic = LinearElastic::new(1e4, 0.3);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut materials = Materials::new();
        materials.insert(
            0,
            PressureLog {
                elastic,
                seen: Arc::clone(&seen),
            },
        );

        // Two particles sharing a cell, converging along the diagonal at different speeds.
        let grid = Grid::new(Vector::<2>::zeros(), Vector::<2>::repeat(1.0), [4, 4]);
        let mut mesh = Mesh::new(grid, 0);
        let particles = vec![
            Particle::new(0, 0, Vector::<2>::new(1.25, 1.25), 1.0, 0.25)
                .with_velocity(Vector::<2>::new(2.0, 1.0))
                .with_stress(Tensor::<2>::identity() * -1.0),
            Particle::new(1, 0, Vector::<2>::new(1.75, 1.6), 1.0, 0.25)
                .with_velocity(Vector::<2>::new(-0.5, -1.5))
                .with_stress(Tensor::<2>::identity() * -3.0),
        ];
        mesh.add_particles(particles, LocatePolicy::Abort).unwrap();

        let config = AnalysisConfig {
            pressure_smoothing: true,
            ..Default::default()
        };
        let mut scheme = Scheme::new(&config).unwrap();
        step_with(&mut scheme, &mut mesh, &materials);

        let p = mesh.particles();
        let smoothed = (-1.0 * p[0].volume - 3.0 * p[1].volume) / (p[0].volume + p[1].volume);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        for &pressure in seen.iter() {
            assert_relative_eq!(pressure, smoothed, max_relative = 1e-12);
        }

        // Each particle adds its own elastic increment on top of the shared pressure.
        for q in p.iter() {
            let increment =
                Material::<2>::compute_stress(&elastic, &Tensor::<2>::zeros(), &q.dstrain).unwrap();
            assert_relative_eq!(
                q.pressure(),
                smoothed + increment.trace() / 2.0,
                max_relative = 1e-9
            );
        }
        assert!((p[0].pressure() - p[1].pressure()).abs() > 1e-9);
    }

    #[test]
    fn nonlinear_is_rejected() {
        let config = AnalysisConfig {
            scheme: SchemeType::ImplicitNonlinear,
            ..Default::default()
        };
        assert!(matches!(
            Scheme::new(&config),
            Err(Error::UnimplementedFeature { .. })
        ));
    }

    #[test]
    fn implicit_requires_positive_beta() {
        let mut config = AnalysisConfig {
            scheme: SchemeType::ImplicitLinear,
            ..Default::default()
        };
        config.newmark.beta = 0.0;
        assert!(matches!(
            Scheme::new(&config),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn corrector_before_predictor_fails() {
        let mut scheme = Scheme::new(&AnalysisConfig::default()).unwrap();
        let mut mesh = mesh();
        scheme.initialise(&mut mesh);
        assert!(matches!(
            scheme.corrector(&mut mesh),
            Err(Error::StageOrder { .. })
        ));
    }

    #[test]
    fn invalid_phase() {
        let mut scheme = Scheme::new(&AnalysisConfig::default()).unwrap();
        let mut mesh = mesh();
        scheme.initialise(&mut mesh);
        assert!(matches!(
            scheme.compute_nodal_kinematics(&mut mesh, &SingleRank, 1),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn newmark_rigid_translation() {
        let dt = 0.01;
        let config = AnalysisConfig {
            scheme: SchemeType::ImplicitLinear,
            dt,
            ..Default::default()
        };
        let mut scheme = Scheme::new(&config).unwrap();
        let mut mesh = mesh();
        let before: Vec<_> = mesh.particles().iter().map(|p| p.position).collect();
        step(&mut scheme, &mut mesh);
        assert!(scheme.last_solve().unwrap().is_success());
        for (p, x0) in mesh.particles().iter().zip(before.iter()) {
            assert_relative_eq!(p.position, x0 + Vector::<2>::new(0.5, -0.25) * dt, epsilon = 1e-12);
            assert_relative_eq!(p.velocity, Vector::<2>::new(0.5, -0.25), epsilon = 1e-12);
        }
    }

    #[test]
    fn explicit_rigid_translation() {
        let dt = 0.01;
        let config = AnalysisConfig {
            dt,
            ..Default::default()
        };
        let mut scheme = Scheme::new(&config).unwrap();
        let mut mesh = mesh();
        let before: Vec<_> = mesh.particles().iter().map(|p| p.position).collect();
        step(&mut scheme, &mut mesh);
        for (p, x0) in mesh.particles().iter().zip(before.iter()) {
            assert_relative_eq!(p.position, x0 + Vector::<2>::new(0.5, -0.25) * dt, epsilon = 1e-12);
            assert_relative_eq!(p.stress, crate::Tensor::<2>::zeros(), epsilon = 1e-9);
        }
    }
}
