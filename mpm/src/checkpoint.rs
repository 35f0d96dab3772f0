//! Per-rank checkpoints and resume.
//!
//! Each rank writes its own particles together with the full cell ownership map to
//! `{output}/{uuid}/checkpoint/rank{r}_step{step}.bin`. A resume only takes effect once every rank
//! has loaded and validated its record.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comm::Communicator;
use crate::constraints::ActiveVelocityConstraint;
use crate::decomposition;
use crate::mesh::{Mesh, Particle};
use crate::params::RunConfig;

/// Version of the checkpoint record layout.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO Error")]
    IO(#[from] std::io::Error),
    #[error("Failed to encode or decode checkpoint: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("No checkpoint found in {path:?}")]
    NotFound { path: PathBuf },
    #[error("Checkpoint version {found} is not supported (expected {expected})")]
    Version { expected: u32, found: u32 },
    #[error("Checkpoint has {found} dimensions, expected {expected}")]
    Dimension { expected: usize, found: usize },
    #[error("Checkpoint was written by rank {found} of {found_size}, expected rank {expected} of {expected_size}")]
    Rank {
        expected: usize,
        expected_size: usize,
        found: usize,
        found_size: usize,
    },
    #[error("Checkpoint ownership map has {found} cells, expected {expected}")]
    CellCount { expected: usize, found: usize },
    #[error("Cell {cell} is owned by rank {rank} which does not exist")]
    InvalidOwner { cell: usize, rank: usize },
    #[error("Particle {id} is invalid: {reason}")]
    InvalidParticle { id: u64, reason: String },
    #[error("Checkpoint failed to load on {failures} ranks")]
    Disagreement { failures: usize },
}

/// Everything a rank needs to continue a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord<const D: usize> {
    pub version: u32,
    pub dim: usize,
    /// Number of completed steps.
    pub step: u64,
    pub rank: usize,
    pub nranks: usize,
    pub particles: Vec<Particle<D>>,
    pub cell_ranks: Vec<usize>,
    pub next_particle_id: u64,
    /// Particle velocity constraints active when the record was written. These are rebuilt from
    /// the configuration on resume.
    pub velocity_constraints: Vec<ActiveVelocityConstraint>,
}

impl<const D: usize> CheckpointRecord<D> {
    pub fn capture(
        mesh: &Mesh<D>,
        step: u64,
        nranks: usize,
        velocity_constraints: Vec<ActiveVelocityConstraint>,
    ) -> Self {
        CheckpointRecord {
            version: CHECKPOINT_VERSION,
            dim: D,
            step,
            rank: mesh.rank(),
            nranks,
            particles: mesh.particles().to_vec(),
            cell_ranks: mesh.cell_ranks(),
            next_particle_id: mesh.next_particle_id(),
            velocity_constraints,
        }
    }

    /// Checks that this record can be applied to `mesh` on a run with `nranks` ranks.
    pub fn validate(&self, mesh: &Mesh<D>, nranks: usize) -> Result<(), CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Version {
                expected: CHECKPOINT_VERSION,
                found: self.version,
            });
        }
        if self.dim != D {
            return Err(CheckpointError::Dimension {
                expected: D,
                found: self.dim,
            });
        }
        if self.rank != mesh.rank() || self.nranks != nranks {
            return Err(CheckpointError::Rank {
                expected: mesh.rank(),
                expected_size: nranks,
                found: self.rank,
                found_size: self.nranks,
            });
        }
        if self.cell_ranks.len() != mesh.cells().len() {
            return Err(CheckpointError::CellCount {
                expected: mesh.cells().len(),
                found: self.cell_ranks.len(),
            });
        }
        if let Some((cell, &rank)) = self
            .cell_ranks
            .iter()
            .enumerate()
            .find(|(_, &r)| r >= nranks)
        {
            return Err(CheckpointError::InvalidOwner { cell, rank });
        }
        for p in self.particles.iter() {
            let invalid = |reason: &str| CheckpointError::InvalidParticle {
                id: p.id,
                reason: reason.to_string(),
            };
            if !p.is_finite() {
                return Err(invalid("non-finite state"));
            }
            if p.id >= self.next_particle_id {
                return Err(invalid("id is not below the next free id"));
            }
            match mesh.grid().locate(&p.position) {
                Some(cell) if self.cell_ranks[cell] == self.rank => {}
                Some(_) => return Err(invalid("located in a cell owned by another rank")),
                None => return Err(invalid("outside of the mesh")),
            }
        }
        Ok(())
    }

    /// Replaces the particles, ownership map and id counter of `mesh` with this record.
    fn apply<C: Communicator>(self, mesh: &mut Mesh<D>, comm: &C) -> Result<u64, crate::Error> {
        decomposition::resume_domain_cell_ranks(mesh, comm, &self.cell_ranks)?;
        let grid = mesh.grid().clone();
        let particles = self
            .particles
            .into_iter()
            .map(|mut p| {
                p.cell = grid.locate(&p.position);
                p
            })
            .collect();
        mesh.replace_particles(particles);
        mesh.set_next_particle_id(self.next_particle_id);
        Ok(self.step)
    }
}

pub fn checkpoint_dir(output_dir: impl AsRef<Path>, uuid: &str) -> PathBuf {
    output_dir.as_ref().join(uuid).join("checkpoint")
}

pub fn checkpoint_path(dir: impl AsRef<Path>, rank: usize, step: u64) -> PathBuf {
    dir.as_ref().join(format!("rank{}_step{}.bin", rank, step))
}

/// Writes a record atomically by writing to a temporary file first.
pub fn write_checkpoint<const D: usize>(
    path: impl AsRef<Path>,
    record: &CheckpointRecord<D>,
) -> Result<(), CheckpointError> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("bin.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        bincode::serialize_into(&mut writer, record)?;
        std::io::Write::flush(&mut writer)?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_checkpoint<const D: usize>(
    path: impl AsRef<Path>,
) -> Result<CheckpointRecord<D>, CheckpointError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(CheckpointError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(reader)?)
}

/// The largest step for which a checkpoint of `rank` exists in `dir`.
pub fn latest_step(dir: impl AsRef<Path>, rank: usize) -> Option<u64> {
    let prefix = format!("rank{}_step", rank);
    std::fs::read_dir(dir.as_ref())
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            name.strip_prefix(&prefix)?
                .strip_suffix(".bin")?
                .parse::<u64>()
                .ok()
        })
        .max()
}

fn load_record<const D: usize>(
    config: &RunConfig,
    mesh: &Mesh<D>,
    nranks: usize,
    step: Option<u64>,
) -> Result<CheckpointRecord<D>, CheckpointError> {
    let dir = checkpoint_dir(&config.output.directory, config.resume_uuid());
    let step = step.ok_or_else(|| CheckpointError::NotFound { path: dir.clone() })?;
    let record = read_checkpoint::<D>(checkpoint_path(&dir, mesh.rank(), step))?;
    record.validate(mesh, nranks)?;
    Ok(record)
}

/// Loads this rank's checkpoint and applies it if every rank succeeded.
///
/// Returns the step to continue from, or `None` if the run should start fresh. Load failures
/// are logged and never fatal. Communication failures are.
pub fn checkpoint_resume<const D: usize, C: Communicator>(
    config: &RunConfig,
    mesh: &mut Mesh<D>,
    comm: &C,
) -> Result<Option<u64>, crate::Error> {
    let dir = checkpoint_dir(&config.output.directory, config.resume_uuid());

    // All ranks must resume from the same step.
    let step = match config.resume.step {
        Some(step) => Some(step),
        None => {
            let latest = latest_step(&dir, comm.rank());
            let others = crate::halo::all_gather(comm, &latest)?;
            if others.iter().all(|s| *s == latest) {
                latest
            } else {
                None
            }
        }
    };

    let loaded = load_record::<D>(config, mesh, comm.size(), step);
    let mut failures = [if loaded.is_ok() { 0.0 } else { 1.0 }];
    comm.all_reduce_sum(&mut failures)?;

    match loaded {
        Ok(record) if failures[0] == 0.0 => {
            let step = record.apply(mesh, comm)?;
            log::info!("Resumed rank {} from step {} in {:?}", comm.rank(), step, dir);
            Ok(Some(step))
        }
        Ok(_) => {
            let err = CheckpointError::Disagreement {
                failures: failures[0] as usize,
            };
            log::warn!("Resume failed: {}; starting a fresh run", err);
            Ok(None)
        }
        Err(err) => {
            log::warn!(
                "Resume failed on rank {}: {}; starting a fresh run",
                comm.rank(),
                err
            );
            Ok(None)
        }
    }
}
