//! Step orchestration.

use std::fmt::{Display, Formatter};
use std::time::Instant;

use ahash::AHashSet;

use crate::checkpoint;
use crate::comm::Communicator;
use crate::constraints::Constraints;
use crate::decomposition::{LoadBalanceReport, LoadBalancer};
use crate::halo::{self, HaloReport};
use crate::injection::{self, Injection};
use crate::material::Materials;
use crate::mesh::{Grid, LocateReport, Mesh, Particle};
use crate::output::{CheckpointWriter, OutputFrame, OutputWriter, Outputs};
use crate::params::{ConfigError, RunConfig};
use crate::scheme::{Scheme, SolveResult};
use crate::timing::{add_time, Timings};
use crate::transfer;
use crate::{Error, Vector, SOLID_PHASE};

/// Phases of a single step, used to report where a step failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepPhase {
    Injection,
    Initialise,
    NodalKinematics,
    Predictor,
    Forces,
    Solve,
    Corrector,
    ParticleKinematics,
    StressStrain,
    Locate,
    HaloTransfer,
    LoadBalance,
}

impl Display for StepPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepPhase::Injection => "particle injection",
            StepPhase::Initialise => "initialisation",
            StepPhase::NodalKinematics => "nodal kinematics",
            StepPhase::Predictor => "predictor",
            StepPhase::Forces => "force mapping",
            StepPhase::Solve => "linear solve",
            StepPhase::Corrector => "corrector",
            StepPhase::ParticleKinematics => "particle kinematics",
            StepPhase::StressStrain => "stress and strain update",
            StepPhase::Locate => "particle location",
            StepPhase::HaloTransfer => "halo transfer",
            StepPhase::LoadBalance => "load balancing",
        };
        write!(f, "{}", name)
    }
}

/// Result of a single step on one rank.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepResult {
    /// Number of completed steps after this step.
    pub step: u64,
    /// Particles held by this rank.
    pub local_particles: usize,
    /// Particles held by all ranks.
    pub total_particles: usize,
    /// Mass of the particles held by all ranks.
    pub total_mass: f64,
    /// Particles injected into this rank.
    pub injected: usize,
    pub locate: LocateReport,
    pub halo: HaloReport,
    pub load_balance: Option<LoadBalanceReport>,
    pub linear_solve: Option<SolveResult>,
    /// Nodes shared by particles of different materials, when interface detection is enabled.
    pub interface_nodes: Vec<usize>,
    pub timings: Timings,
}

impl Display for StepResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Step {}:", self.step)?;
        writeln!(
            f,
            "  Particles: {} local, {} total (mass {:.6e})",
            self.local_particles, self.total_particles, self.total_mass
        )?;
        if let Some(solve) = self.linear_solve.as_ref() {
            writeln!(
                f,
                "  Linear solve: {} iterations, relative residual {:.3e}",
                solve.iterations, solve.error
            )?;
        }
        if !self.halo.skipped {
            writeln!(
                f,
                "  Halo: {} sent, {} received",
                self.halo.sent, self.halo.received
            )?;
        }
        write!(f, "{}", self.timings)
    }
}

/// Summary of a call to [`Solver::solve`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub steps_taken: u64,
    /// Number of completed steps at the end of the run.
    pub final_step: u64,
    pub nsteps: u64,
    pub interrupted: bool,
    /// Step from which the run was resumed.
    pub resumed_from: Option<u64>,
    pub timings: Timings,
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Completed {} of {} steps ({} in this run)",
            self.final_step, self.nsteps, self.steps_taken
        )?;
        if let Some(step) = self.resumed_from {
            writeln!(f, "Resumed from step {}", step)?;
        }
        write!(f, "{}", self.timings)
    }
}

/// Builds a [`Solver`] for one rank.
///
/// Every rank must be given the same configuration, materials and particles.
pub struct SolverBuilder<const D: usize> {
    config: RunConfig,
    materials: Materials<D>,
    particles: Vec<Particle<D>>,
    outputs: Outputs<D>,
}

impl<const D: usize> SolverBuilder<D> {
    pub fn new(config: RunConfig) -> Self {
        SolverBuilder {
            config,
            materials: Materials::new(),
            particles: Vec::new(),
            outputs: Outputs::new(),
        }
    }

    pub fn set_materials(&mut self, materials: Materials<D>) -> &mut Self {
        self.materials = materials;
        self
    }

    /// Adds initial particles. These are ignored when the run resumes from a checkpoint.
    pub fn add_particles(&mut self, particles: impl IntoIterator<Item = Particle<D>>) -> &mut Self {
        self.particles.extend(particles);
        self
    }

    pub fn add_output(&mut self, writer: impl OutputWriter<D> + 'static) -> &mut Self {
        self.outputs.add(Box::new(writer));
        self
    }

    fn check_particles(&self) -> Result<(), Error> {
        let mut ids = AHashSet::with_capacity(self.particles.len());
        for p in self.particles.iter() {
            if !self.materials.contains(p.material_id) {
                return Err(Error::MissingMaterial {
                    id: p.material_id,
                    particle: p.id,
                });
            }
            if !ids.insert(p.id) {
                return Err(ConfigError::InvalidValue {
                    name: String::from("particles"),
                    reason: format!("duplicate particle id {}", p.id),
                }
                .into());
            }
            if !p.is_finite() || !(p.mass > 0.0) || !(p.volume > 0.0) {
                return Err(ConfigError::InvalidValue {
                    name: String::from("particles"),
                    reason: format!("particle {} has an invalid state", p.id),
                }
                .into());
            }
        }
        Ok(())
    }

    fn thread_pool(&self, nranks: usize) -> Result<rayon::ThreadPool, Error> {
        let num_threads = self
            .config
            .analysis
            .num_threads
            .unwrap_or_else(|| (num_cpus::get() / nranks).max(1));
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| Error::InvalidParameter {
                name: format!("analysis.num_threads ({})", e),
            })
    }

    /// Builds the solver for the rank of `comm`.
    ///
    /// This validates the configuration, then either resumes from a checkpoint or distributes
    /// the initial particles, and finally resolves boundary conditions.
    pub fn build<C: Communicator + Send>(self, comm: C) -> Result<Solver<D, C>, Error> {
        let config = &self.config;
        config.validate::<D>()?;
        let scheme = Scheme::new(&config.analysis)?;
        let gravity = config.analysis.gravity::<D>()?;
        self.check_particles()?;

        let injections = config
            .injections
            .iter()
            .map(Injection::<D>::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(inj) = injections
            .iter()
            .find(|i| !self.materials.contains(i.material_id()))
        {
            return Err(ConfigError::InvalidValue {
                name: String::from("injections.material_id"),
                reason: format!("unknown material {}", inj.material_id()),
            }
            .into());
        }

        let grid = Grid::<D>::from_config(&config.mesh)?;
        let mut mesh = Mesh::new(grid, comm.rank());
        let thread_pool = self.thread_pool(comm.size())?;
        let load_balancer = LoadBalancer::new(config.load_balance.tolerance);

        let resumed_from = if config.resume.resume {
            checkpoint::checkpoint_resume(config, &mut mesh, &comm)?
        } else {
            None
        };

        if resumed_from.is_none() {
            // All cells start out owned by the first rank, so the initial decomposition sees the
            // complete particle distribution.
            mesh.add_particles(self.particles.iter().cloned(), config.analysis.locate_policy)?;
            load_balancer.decompose(&mut mesh, &comm, true)?;
            halo::transfer_halo_particles(&mut mesh, &comm)?;
        } else if let Some(p) = mesh
            .particles()
            .iter()
            .find(|p| !self.materials.contains(p.material_id))
        {
            return Err(Error::MissingMaterial {
                id: p.material_id,
                particle: p.id,
            });
        }

        let mut constraints = Constraints::from_config(config, &mesh)?;
        constraints.build_particle_sets(config, &mesh, &comm)?;
        constraints.assign_nodal_velocity_constraints(&mut mesh);

        let SolverBuilder {
            config,
            materials,
            mut outputs,
            ..
        } = self;

        if config.output.checkpoint && config.output.interval.is_some() {
            outputs.add(Box::new(CheckpointWriter::new(
                config.output.directory.clone(),
                &config.analysis.uuid,
            )));
        }

        if comm.is_root() {
            log::info!(
                "Built {}D solver on {} ranks with {} threads per rank{}",
                D,
                comm.size(),
                thread_pool.current_num_threads(),
                resumed_from.map_or(String::new(), |s| format!(", resuming from step {}", s))
            );
        }

        Ok(Solver {
            step: resumed_from.unwrap_or(0),
            resumed_from,
            config,
            comm,
            mesh,
            scheme,
            materials,
            constraints,
            injections,
            load_balancer,
            outputs,
            gravity,
            thread_pool: Some(thread_pool),
            interrupt_checker: Box::new(|| false),
            timings: Timings::default(),
        })
    }
}

/// The MPM solver of a single rank.
pub struct Solver<const D: usize, C: Communicator> {
    config: RunConfig,
    comm: C,
    mesh: Mesh<D>,
    scheme: Scheme,
    materials: Materials<D>,
    constraints: Constraints,
    injections: Vec<Injection<D>>,
    load_balancer: LoadBalancer,
    outputs: Outputs<D>,
    gravity: Vector<D>,
    /// Number of completed steps.
    step: u64,
    resumed_from: Option<u64>,
    thread_pool: Option<rayon::ThreadPool>,
    /// Polled between steps. Returns `true` to stop the run.
    interrupt_checker: Box<dyn FnMut() -> bool + Send>,
    timings: Timings,
}

impl<const D: usize, C: Communicator + Send> Solver<D, C> {
    /// Sets the interrupt checker to be called before every step.
    ///
    /// The run stops if the checker returns `true` on any rank.
    pub fn set_interrupter(&mut self, checker: Box<dyn FnMut() -> bool + Send>) {
        self.interrupt_checker = checker;
    }

    pub fn mesh(&self) -> &Mesh<D> {
        &self.mesh
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Number of completed steps.
    pub fn current_step(&self) -> u64 {
        self.step
    }

    pub fn resumed_from(&self) -> Option<u64> {
        self.resumed_from
    }

    /// Accumulated timings of all steps taken by this solver.
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    /// Runs a single step.
    pub fn step(&mut self) -> Result<StepResult, Error> {
        let pool = self.thread_pool.take();
        let result = match pool.as_ref() {
            Some(pool) => pool.install(|| self.step_inner()),
            None => self.step_inner(),
        };
        self.thread_pool = pool;

        result.map_err(|(phase, source)| {
            let step = self.step + 1;
            log::error!(
                "Rank {}: step {} failed during {}: {}",
                self.comm.rank(),
                step,
                phase,
                source
            );
            Error::StepFailed {
                step,
                phase,
                source: Box::new(source),
            }
        })
    }

    fn step_inner(&mut self) -> Result<StepResult, (StepPhase, Error)> {
        use StepPhase::*;
        let start = Instant::now();
        let mut t = Timings::default();
        let mut result = StepResult::default();
        let Solver {
            ref config,
            ref comm,
            ref mut mesh,
            ref mut scheme,
            ref materials,
            ref constraints,
            ref injections,
            ref load_balancer,
            ref gravity,
            ref mut step,
            ..
        } = *self;
        let policy = config.analysis.locate_policy;

        result.injected = add_time(&mut t.injection, || {
            injection::inject_particles(injections, mesh, *step, policy)
        })
        .map_err(|e| (Injection, e))?;

        add_time(&mut t.initialise, || scheme.initialise(mesh));

        add_time(&mut t.nodal_kinematics, || -> Result<(), Error> {
            scheme.compute_nodal_kinematics(mesh, comm, SOLID_PHASE)?;
            if config.analysis.interface {
                result.interface_nodes =
                    transfer::detect_interface_nodes(mesh, comm, materials.len())?;
                log::debug!("{} interface nodes", result.interface_nodes.len());
            }
            Ok(())
        })
        .map_err(|e| (NodalKinematics, e))?;

        add_time(&mut t.predictor, || scheme.predictor(mesh)).map_err(|e| (Predictor, e))?;

        add_time(&mut t.forces, || {
            scheme.compute_forces(mesh, comm, gravity, constraints)
        })
        .map_err(|e| (Forces, e))?;

        result.linear_solve = add_time(&mut t.linear_solve, || {
            scheme.solve(mesh, comm, materials)
        })
        .map_err(|e| (Solve, e))?;

        add_time(&mut t.corrector, || scheme.corrector(mesh)).map_err(|e| (Corrector, e))?;

        add_time(&mut t.particle_kinematics, || {
            scheme.compute_particle_kinematics(mesh, constraints)
        })
        .map_err(|e| (ParticleKinematics, e))?;

        add_time(&mut t.stress_strain, || {
            scheme.postcompute_stress_strain(mesh, materials)
        })
        .map_err(|e| (StressStrain, e))?;

        result.locate =
            add_time(&mut t.locate, || scheme.locate_particles(mesh)).map_err(|e| (Locate, e))?;

        result.halo = add_time(&mut t.halo, || halo::transfer_halo_particles(mesh, comm))
            .map_err(|e| (HaloTransfer, e))?;

        *step += 1;

        if let Some(interval) = config.load_balance.interval {
            if *step % interval == 0 {
                result.load_balance = Some(
                    add_time(&mut t.load_balance, || -> Result<_, Error> {
                        let report = load_balancer.decompose(mesh, comm, false)?;
                        halo::transfer_halo_particles(mesh, comm)?;
                        Ok(report)
                    })
                    .map_err(|e| (LoadBalance, e))?,
                );
            }
        }

        let mut totals = [mesh.num_particles() as f64, mesh.local_mass()];
        comm.all_reduce_sum(&mut totals)
            .map_err(|e| (HaloTransfer, e.into()))?;
        result.step = *step;
        result.local_particles = mesh.num_particles();
        result.total_particles = totals[0] as usize;
        result.total_mass = totals[1];

        if let Some(interval) = config.output.interval {
            if *step % interval == 0 {
                add_time(&mut t.output, || self.write_outputs());
            }
        }

        t.total = start.elapsed();
        result.timings = t;
        self.timings += t;
        Ok(result)
    }

    fn write_outputs(&mut self) {
        let velocity_constraints = self.constraints.active_particle_constraints(&self.mesh);
        let frame = OutputFrame {
            step: self.step,
            nsteps: self.config.analysis.nsteps,
            rank: self.comm.rank(),
            nranks: self.comm.size(),
            mesh: &self.mesh,
            velocity_constraints: &velocity_constraints,
        };
        self.outputs.write_all(&frame);
    }

    /// Checks the interrupter on every rank. Returns `true` if any rank requested a stop.
    fn interrupted(&mut self) -> Result<bool, Error> {
        let mut flag = [if (self.interrupt_checker)() { 1.0 } else { 0.0 }];
        self.comm.all_reduce_sum(&mut flag)?;
        Ok(flag[0] > 0.0)
    }

    /// Runs steps until the configured number of steps is completed or the run is interrupted.
    pub fn solve(&mut self) -> Result<RunSummary, Error> {
        self.solve_with(|_| {})
    }

    /// Same as [`Solver::solve`] but calls `callback` with the result of every completed step.
    pub fn solve_with(
        &mut self,
        mut callback: impl FnMut(&StepResult),
    ) -> Result<RunSummary, Error> {
        let nsteps = self.config.analysis.nsteps;
        let mut summary = RunSummary {
            nsteps,
            resumed_from: self.resumed_from,
            ..Default::default()
        };
        while self.step < nsteps {
            if self.interrupted()? {
                log::info!("Run interrupted after step {}", self.step);
                summary.interrupted = true;
                break;
            }
            let result = self.step()?;
            summary.steps_taken += 1;
            summary.timings += result.timings;
            if self.comm.is_root() {
                log::debug!("{}", result);
            }
            callback(&result);
        }
        summary.final_step = self.step;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleRank;
    use crate::material::LinearElastic;
    use crate::params::GridConfig;
    use approx::*;

    fn config() -> RunConfig {
        let mut config = RunConfig::default();
        config.mesh = GridConfig {
            origin: vec![0.0, 0.0],
            spacing: vec![1.0, 1.0],
            cells: vec![4, 4],
        };
        config.analysis.gravity = vec![0.0, -9.81];
        config.analysis.nsteps = 3;
        config
    }

    fn materials() -> Materials<2> {
        let mut materials = Materials::new();
        materials.insert(0, LinearElastic::new(1e3, 0.2));
        materials
    }

    #[test]
    fn missing_material_is_fatal() {
        let mut builder = SolverBuilder::<2>::new(config());
        builder.add_particles(vec![Particle::new(0, 1, Vector::<2>::new(1.5, 1.5), 1.0, 1.0)]);
        builder.set_materials(materials());
        assert!(matches!(
            builder.build(SingleRank),
            Err(Error::MissingMaterial { id: 1, particle: 0 })
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut builder = SolverBuilder::<2>::new(config());
        builder.set_materials(materials()).add_particles(vec![
            Particle::new(0, 0, Vector::<2>::new(1.5, 1.5), 1.0, 1.0),
            Particle::new(0, 0, Vector::<2>::new(2.5, 1.5), 1.0, 1.0),
        ]);
        assert!(matches!(
            builder.build(SingleRank),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn interrupted_before_first_step() {
        let mut builder = SolverBuilder::<2>::new(config());
        builder
            .set_materials(materials())
            .add_particles(vec![Particle::new(0, 0, Vector::<2>::new(1.5, 1.5), 1.0, 1.0)]);
        let mut solver = builder.build(SingleRank).unwrap();
        solver.set_interrupter(Box::new(|| true));
        let summary = solver.solve().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.steps_taken, 0);
        assert_eq!(solver.current_step(), 0);
    }

    #[test]
    fn solve_runs_all_steps() {
        let mut builder = SolverBuilder::<2>::new(config());
        builder
            .set_materials(materials())
            .add_particles(vec![Particle::new(0, 0, Vector::<2>::new(1.5, 2.5), 1.0, 1.0)]);
        let mut solver = builder.build(SingleRank).unwrap();
        let summary = solver.solve().unwrap();
        assert!(!summary.interrupted);
        assert_eq!(summary.final_step, 3);
        let p = &solver.mesh().particles()[0];
        assert_relative_eq!(p.velocity[1], -9.81 * 3e-3, epsilon = 1e-12);
    }
}
