//! Pluggable output writers.
//!
//! Writers are invoked by the solver every `output.interval` steps. A failing writer is logged
//! and otherwise ignored: output never affects the simulation.

use std::path::PathBuf;

use crate::checkpoint::{checkpoint_dir, checkpoint_path, write_checkpoint, CheckpointRecord};
use crate::constraints::ActiveVelocityConstraint;
use crate::mesh::Mesh;
use crate::Error;

/// Read-only view of the simulation state handed to output writers.
pub struct OutputFrame<'a, const D: usize> {
    /// Number of completed steps.
    pub step: u64,
    pub nsteps: u64,
    pub rank: usize,
    pub nranks: usize,
    pub mesh: &'a Mesh<D>,
    pub velocity_constraints: &'a [ActiveVelocityConstraint],
}

pub trait OutputWriter<const D: usize>: Send {
    fn name(&self) -> &str;
    fn write(&mut self, frame: &OutputFrame<D>) -> Result<(), Error>;
}

/// Writes a checkpoint record of the calling rank.
#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointWriter {
    directory: PathBuf,
}

impl CheckpointWriter {
    pub fn new(output_dir: impl Into<PathBuf>, uuid: &str) -> Self {
        CheckpointWriter {
            directory: checkpoint_dir(output_dir.into(), uuid),
        }
    }

    pub fn directory(&self) -> &PathBuf {
        &self.directory
    }
}

impl<const D: usize> OutputWriter<D> for CheckpointWriter {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn write(&mut self, frame: &OutputFrame<D>) -> Result<(), Error> {
        let record = CheckpointRecord::capture(
            frame.mesh,
            frame.step,
            frame.nranks,
            frame.velocity_constraints.to_vec(),
        );
        write_checkpoint(checkpoint_path(&self.directory, frame.rank, frame.step), &record)?;
        Ok(())
    }
}

/// The set of writers registered with a solver.
pub struct Outputs<const D: usize> {
    writers: Vec<Box<dyn OutputWriter<D>>>,
}

impl<const D: usize> Default for Outputs<D> {
    fn default() -> Self {
        Outputs {
            writers: Vec::new(),
        }
    }
}

impl<const D: usize> Outputs<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, writer: Box<dyn OutputWriter<D>>) {
        self.writers.push(writer);
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Invokes every writer and returns the number of failures.
    pub fn write_all(&mut self, frame: &OutputFrame<D>) -> usize {
        let mut failures = 0;
        for writer in self.writers.iter_mut() {
            if let Err(err) = writer.write(frame) {
                log::warn!(
                    "Output writer '{}' failed at step {} on rank {}: {}",
                    writer.name(),
                    frame.step,
                    frame.rank,
                    err
                );
                failures += 1;
            }
        }
        failures
    }
}
