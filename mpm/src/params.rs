//! Run configuration.
//!
//! All types here are plain serializable descriptions. Dimension dependent quantities are stored
//! as `Vec<f64>` and converted to fixed size vectors by [`RunConfig::validate`] and the typed
//! accessors below, which is where configuration errors are reported.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Vector;

#[derive(Clone, Debug, PartialEq, Error)]
pub enum ConfigError {
    #[error("'{name}' has {found} components, expected {expected}")]
    Dimension {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("'{name}' must be positive")]
    NonPositive { name: String },
    #[error("'{name}' is invalid: {reason}")]
    InvalidValue { name: String, reason: String },
}

/// Integration scheme family.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemeType {
    /// Explicit update with a trapezoidal (`gamma`) position integration.
    Explicit,
    /// Implicit Newmark predictor/corrector with a single linear solve per step.
    ImplicitLinear,
    /// Implicit Newmark with Newton iterations. Not supported.
    ImplicitNonlinear,
}

impl Default for SchemeType {
    fn default() -> Self {
        SchemeType::Explicit
    }
}

/// Newmark integration parameters.
///
/// The scheme is unconditionally stable for `beta >= 0.25` and `gamma >= 0.5`. These values are
/// not validated; choosing stable parameters is the caller's responsibility.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewmarkParams {
    pub beta: f64,
    pub gamma: f64,
}

impl Default for NewmarkParams {
    fn default() -> Self {
        NewmarkParams {
            beta: 0.25,
            gamma: 0.5,
        }
    }
}

/// Damping model applied to the nodal unbalanced force.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Damping {
    None,
    /// Cundall local non-viscous damping with the given damping factor.
    Cundall(f64),
}

impl Default for Damping {
    fn default() -> Self {
        Damping::None
    }
}

/// What to do with a particle that cannot be located in any cell.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocatePolicy {
    /// Remove the particle from the simulation.
    Discard,
    /// Project the particle back inside the mesh domain.
    Clamp,
    /// Fail the step.
    Abort,
}

impl Default for LocatePolicy {
    fn default() -> Self {
        LocatePolicy::Abort
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearSolverParams {
    pub max_iterations: u32,
    /// Relative residual tolerance. Values below `f32::EPSILON` cannot be reached by the
    /// solver and are rejected by [`RunConfig::validate`].
    pub tolerance: f32,
}

impl Default for LinearSolverParams {
    fn default() -> Self {
        LinearSolverParams {
            max_iterations: 1000,
            tolerance: f32::EPSILON,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub scheme: SchemeType,
    /// Time increment.
    pub dt: f64,
    /// Total number of steps.
    pub nsteps: u64,
    pub gravity: Vec<f64>,
    pub newmark: NewmarkParams,
    pub damping: Damping,
    /// Use the interpolated nodal velocity (PIC) instead of the nodal velocity increment (FLIP)
    /// when updating particle velocities.
    pub velocity_update: bool,
    /// Smooth the volumetric stress across particles sharing a cell.
    pub pressure_smoothing: bool,
    /// Detect nodes shared by multiple materials.
    pub interface: bool,
    pub locate_policy: LocatePolicy,
    pub linear_solver: LinearSolverParams,
    /// Analysis identifier used to name output and checkpoint directories.
    pub uuid: String,
    /// Number of worker threads per rank. All available cores are used if not set.
    pub num_threads: Option<usize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            scheme: SchemeType::default(),
            dt: 1e-3,
            nsteps: 1,
            gravity: Vec::new(),
            newmark: NewmarkParams::default(),
            damping: Damping::default(),
            velocity_update: false,
            pressure_smoothing: false,
            interface: false,
            locate_policy: LocatePolicy::default(),
            linear_solver: LinearSolverParams::default(),
            uuid: String::from("mpm"),
            num_threads: None,
        }
    }
}

/// Structured background grid description.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct GridConfig {
    pub origin: Vec<f64>,
    pub spacing: Vec<f64>,
    pub cells: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    pub resume: bool,
    /// Analysis whose checkpoints should be loaded. Defaults to the current analysis.
    pub uuid: Option<String>,
    /// Step to resume from. The latest available checkpoint is used if not set.
    pub step: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Number of steps between consecutive outputs. No output is produced if not set.
    pub interval: Option<u64>,
    pub directory: PathBuf,
    /// Register the checkpoint writer.
    pub checkpoint: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            interval: None,
            directory: PathBuf::from("results"),
            checkpoint: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalanceConfig {
    /// Number of steps between consecutive repartitions. Disabled if not set.
    pub interval: Option<u64>,
    /// Acceptable ratio of the largest rank load to the mean load before repartitioning.
    pub tolerance: f64,
}

impl Default for LoadBalanceConfig {
    fn default() -> Self {
        LoadBalanceConfig {
            interval: None,
            tolerance: 1.1,
        }
    }
}

/// Axis aligned box.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct RegionConfig {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleSetConfig {
    pub id: usize,
    /// Particles inside this region when the set is built belong to the set.
    pub region: RegionConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticleVelocityConstraintConfig {
    pub set_id: usize,
    pub dir: usize,
    pub velocity: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodalVelocityConstraintConfig {
    pub region: RegionConfig,
    pub dir: usize,
    pub velocity: f64,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityConstraintsConfig {
    pub particles: Vec<ParticleVelocityConstraintConfig>,
    pub nodes: Vec<NodalVelocityConstraintConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConcentratedForceConfig {
    pub region: RegionConfig,
    pub dir: usize,
    pub force: f64,
}

/// Particles injected into the domain at a fixed step interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InjectionConfig {
    pub positions: Vec<Vec<f64>>,
    pub velocity: Vec<f64>,
    pub mass: f64,
    pub volume: f64,
    pub material_id: usize,
    /// First step (inclusive) at which particles are injected.
    pub start: u64,
    /// Last step (exclusive) at which particles are injected.
    pub end: u64,
    pub interval: u64,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub analysis: AnalysisConfig,
    pub mesh: GridConfig,
    pub resume: ResumeConfig,
    pub output: OutputConfig,
    pub load_balance: LoadBalanceConfig,
    pub particle_sets: Vec<ParticleSetConfig>,
    pub velocity_constraints: VelocityConstraintsConfig,
    pub concentrated_forces: Vec<ConcentratedForceConfig>,
    pub injections: Vec<InjectionConfig>,
}

/// Converts a configuration vector into a fixed size vector.
pub fn to_vector<const D: usize>(v: &[f64], name: &str) -> Result<Vector<D>, ConfigError> {
    if v.len() != D {
        return Err(ConfigError::Dimension {
            name: name.to_string(),
            expected: D,
            found: v.len(),
        });
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            reason: String::from("non-finite component"),
        });
    }
    Ok(Vector::<D>::from_column_slice(v))
}

fn check_dir<const D: usize>(dir: usize, name: &str) -> Result<(), ConfigError> {
    if dir >= D {
        return Err(ConfigError::InvalidValue {
            name: name.to_string(),
            reason: format!("direction {} is out of range for {} dimensions", dir, D),
        });
    }
    Ok(())
}

fn check_positive(value: f64, name: &str) -> Result<(), ConfigError> {
    if !(value > 0.0) || !value.is_finite() {
        return Err(ConfigError::NonPositive {
            name: name.to_string(),
        });
    }
    Ok(())
}

impl RegionConfig {
    pub fn bounds<const D: usize>(&self, name: &str) -> Result<(Vector<D>, Vector<D>), ConfigError> {
        let min = to_vector::<D>(&self.min, &format!("{}.min", name))?;
        let max = to_vector::<D>(&self.max, &format!("{}.max", name))?;
        if (0..D).any(|i| min[i] > max[i]) {
            return Err(ConfigError::InvalidValue {
                name: name.to_string(),
                reason: String::from("min exceeds max"),
            });
        }
        Ok((min, max))
    }
}

impl AnalysisConfig {
    pub fn gravity<const D: usize>(&self) -> Result<Vector<D>, ConfigError> {
        if self.gravity.is_empty() {
            return Ok(Vector::<D>::zeros());
        }
        to_vector::<D>(&self.gravity, "analysis.gravity")
    }
}

impl RunConfig {
    /// Checks all options required to start a run in `D` dimensions.
    pub fn validate<const D: usize>(&self) -> Result<(), ConfigError> {
        let analysis = &self.analysis;
        check_positive(analysis.dt, "analysis.dt")?;
        analysis.gravity::<D>()?;
        if analysis.newmark.beta < 0.0 || !analysis.newmark.beta.is_finite() {
            return Err(ConfigError::InvalidValue {
                name: String::from("analysis.newmark.beta"),
                reason: String::from("must be non-negative"),
            });
        }
        if !(0.0..=1.0).contains(&analysis.newmark.gamma) {
            return Err(ConfigError::InvalidValue {
                name: String::from("analysis.newmark.gamma"),
                reason: String::from("must be in [0, 1]"),
            });
        }
        if let Damping::Cundall(factor) = analysis.damping {
            if !(0.0..1.0).contains(&factor) {
                return Err(ConfigError::InvalidValue {
                    name: String::from("analysis.damping"),
                    reason: String::from("Cundall damping factor must be in [0, 1)"),
                });
            }
        }
        let tolerance = analysis.linear_solver.tolerance;
        if !(tolerance >= f32::EPSILON) || !tolerance.is_finite() {
            return Err(ConfigError::InvalidValue {
                name: String::from("analysis.linear_solver.tolerance"),
                reason: format!("must be a finite value of at least {:e}", f32::EPSILON),
            });
        }
        if analysis.uuid.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: String::from("analysis.uuid"),
                reason: String::from("must not be empty"),
            });
        }
        if analysis.num_threads == Some(0) {
            return Err(ConfigError::NonPositive {
                name: String::from("analysis.num_threads"),
            });
        }

        to_vector::<D>(&self.mesh.origin, "mesh.origin")?;
        let spacing = to_vector::<D>(&self.mesh.spacing, "mesh.spacing")?;
        for h in spacing.iter() {
            check_positive(*h, "mesh.spacing")?;
        }
        if self.mesh.cells.len() != D {
            return Err(ConfigError::Dimension {
                name: String::from("mesh.cells"),
                expected: D,
                found: self.mesh.cells.len(),
            });
        }
        if self.mesh.cells.iter().any(|&n| n == 0) {
            return Err(ConfigError::NonPositive {
                name: String::from("mesh.cells"),
            });
        }

        if self.output.interval == Some(0) {
            return Err(ConfigError::NonPositive {
                name: String::from("output.interval"),
            });
        }
        if self.load_balance.interval == Some(0) {
            return Err(ConfigError::NonPositive {
                name: String::from("load_balance.interval"),
            });
        }
        if !(self.load_balance.tolerance >= 1.0) {
            return Err(ConfigError::InvalidValue {
                name: String::from("load_balance.tolerance"),
                reason: String::from("must be at least 1"),
            });
        }

        for set in self.particle_sets.iter() {
            set.region.bounds::<D>("particle_sets.region")?;
        }
        for c in self.velocity_constraints.particles.iter() {
            check_dir::<D>(c.dir, "velocity_constraints.particles.dir")?;
            if !self.particle_sets.iter().any(|s| s.id == c.set_id) {
                return Err(ConfigError::InvalidValue {
                    name: String::from("velocity_constraints.particles.set_id"),
                    reason: format!("unknown particle set {}", c.set_id),
                });
            }
        }
        for c in self.velocity_constraints.nodes.iter() {
            check_dir::<D>(c.dir, "velocity_constraints.nodes.dir")?;
            c.region.bounds::<D>("velocity_constraints.nodes.region")?;
        }
        for f in self.concentrated_forces.iter() {
            check_dir::<D>(f.dir, "concentrated_forces.dir")?;
            f.region.bounds::<D>("concentrated_forces.region")?;
        }
        for inj in self.injections.iter() {
            to_vector::<D>(&inj.velocity, "injections.velocity")?;
            for p in inj.positions.iter() {
                to_vector::<D>(p, "injections.positions")?;
            }
            check_positive(inj.mass, "injections.mass")?;
            check_positive(inj.volume, "injections.volume")?;
            if inj.interval == 0 {
                return Err(ConfigError::NonPositive {
                    name: String::from("injections.interval"),
                });
            }
        }
        Ok(())
    }

    /// Analysis identifier of the checkpoints to resume from.
    pub fn resume_uuid(&self) -> &str {
        self.resume
            .uuid
            .as_deref()
            .unwrap_or(self.analysis.uuid.as_str())
    }
}
