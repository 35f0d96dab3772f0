//! A distributed Material Point Method (MPM) step solver.
//!
//! Particles carry the material state and move through a structured background grid whose
//! nodes only hold momentum and forces for the duration of a single step. The [`solver::Solver`]
//! drives the per-step sequence, while the [`comm::Communicator`] abstraction lets the same
//! sequence run on a single rank or on several cooperating ranks.

pub mod checkpoint;
pub mod comm;
pub mod constraints;
pub mod decomposition;
pub mod halo;
pub mod injection;
pub mod io;
pub mod material;
pub mod mesh;
pub mod output;
pub mod params;
pub mod scene;
pub mod scheme;
pub mod solver;
pub mod timing;
pub mod transfer;

// TODO: This should be feature gated like in the rest of the tests, but integration tests and
// benches need access to it without passing features explicitly.
pub mod test_utils;

pub use self::comm::{CommError, Communicator, LocalCluster, LocalComm, SingleRank};
pub use self::material::{LinearElastic, Material, MaterialError, Materials};
pub use self::mesh::{Cell, Grid, Mesh, Node, Particle};
pub use self::params::*;
pub use self::scheme::Scheme;
pub use self::solver::{RunSummary, Solver, SolverBuilder, StepPhase, StepResult};

use thiserror::Error;

/// Spatial vector in `D` dimensions.
pub type Vector<const D: usize> = na::SVector<f64, D>;
/// Second order tensor (stress, strain) in `D` dimensions.
pub type Tensor<const D: usize> = na::SMatrix<f64, D, D>;

/// Index of the only supported phase.
pub const SOLID_PHASE: usize = 0;

/// Nodes with mass below this value are treated as massless.
pub const MASS_TOLERANCE: f64 = 1.0e-12;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },
    #[error("Communication failure: {source}")]
    Comm {
        #[from]
        source: CommError,
    },
    #[error("Material failure for particle {particle}: {source}")]
    Material {
        particle: u64,
        source: MaterialError,
    },
    #[error("Missing material with id {id} required by particle {particle}")]
    MissingMaterial { id: usize, particle: u64 },
    #[error("Particle {id} left the mesh domain at {position:?}")]
    ParticleOutsideDomain { id: u64, position: Vec<f64> },
    #[error("Invalid parameter: {name:?}")]
    InvalidParameter { name: String },
    #[error("Integration stage {requested} requested after {current}")]
    StageOrder {
        requested: &'static str,
        current: &'static str,
    },
    #[error("Linear solve failed: {result:?}")]
    LinearSolve {
        result: scheme::linsolve::SolveResult,
    },
    #[error("Checkpoint error: {source}")]
    Checkpoint {
        #[from]
        source: checkpoint::CheckpointError,
    },
    #[error("Failed to encode or decode particles: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },
    #[error("Mesh initialisation failed: {reason}")]
    MeshInit { reason: String },
    #[error("File I/O Error")]
    FileIO {
        #[from]
        source: std::io::Error,
    },
    #[error("Unimplemented feature: {description:?}")]
    UnimplementedFeature { description: String },
    #[error("Step {step} failed during {phase}: {source}")]
    StepFailed {
        step: u64,
        phase: StepPhase,
        source: Box<Error>,
    },
}

/// Overall outcome of a simulation run as reported to the caller.
pub enum SimResult {
    Success(String),
    Warning(String),
    Error(String),
}

impl From<Error> for SimResult {
    fn from(err: Error) -> SimResult {
        match err {
            Error::StepFailed {
                step,
                phase,
                source,
            } => SimResult::Error(format!("Step {} failed during {}: {}", step, phase, source)),
            Error::Config { source } => {
                SimResult::Error(format!("Invalid configuration: {}", source))
            }
            Error::UnimplementedFeature { description } => {
                SimResult::Error(format!("Unimplemented feature: {:?}", description))
            }
            _ => SimResult::Error(err.to_string()),
        }
    }
}

impl From<Result<RunSummary, Error>> for SimResult {
    fn from(res: Result<RunSummary, Error>) -> SimResult {
        match res {
            Ok(summary) if summary.interrupted => {
                SimResult::Warning(format!("Interrupted\n{}", summary))
            }
            Ok(summary) => SimResult::Success(format!("{}", summary)),
            Err(err) => err.into(),
        }
    }
}

pub(crate) fn inf_norm<I>(iter: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    iter.into_iter()
        .map(|x| x.abs())
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Less))
        .unwrap_or(0.0)
}
