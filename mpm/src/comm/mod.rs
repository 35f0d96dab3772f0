//! Message passing between ranks.
//!
//! Ranks never share memory. All cross-rank interaction goes through the collective operations of
//! the [`Communicator`] trait, which every rank must invoke in the same order.

mod local;

pub use local::*;

use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CommError {
    #[error("Rank {rank} disconnected")]
    Disconnected { rank: usize },
    #[error("Unexpected message from rank {rank}: expected {expected}, got {found}")]
    UnexpectedMessage {
        rank: usize,
        expected: &'static str,
        found: &'static str,
    },
    #[error("Reduction size mismatch with rank {rank}: expected {expected}, got {found}")]
    SizeMismatch {
        rank: usize,
        expected: usize,
        found: usize,
    },
    #[error("Expected {expected} outgoing buffers, got {found}")]
    InvalidExchange { expected: usize, found: usize },
}

pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Blocks until every rank has reached the barrier.
    fn barrier(&self) -> Result<(), CommError>;

    /// Replaces `values` with the element-wise sum over all ranks.
    ///
    /// Every rank receives bit-identical results.
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), CommError>;

    /// Sends `outgoing[r]` to rank `r` and returns the buffers received from all other ranks in
    /// rank order.
    ///
    /// The entry for the calling rank is ignored. This call returns only after every destination
    /// acknowledged receipt, so a sender may safely discard what it sent once this returns `Ok`.
    fn exchange(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// Trivial communicator for serial runs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SingleRank;

impl Communicator for SingleRank {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) -> Result<(), CommError> {
        Ok(())
    }
    fn all_reduce_sum(&self, _values: &mut [f64]) -> Result<(), CommError> {
        Ok(())
    }
    fn exchange(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        if outgoing.len() != 1 {
            return Err(CommError::InvalidExchange {
                expected: 1,
                found: outgoing.len(),
            });
        }
        Ok(Vec::new())
    }
}

impl<C: Communicator + ?Sized> Communicator for &C {
    fn rank(&self) -> usize {
        (**self).rank()
    }
    fn size(&self) -> usize {
        (**self).size()
    }
    fn barrier(&self) -> Result<(), CommError> {
        (**self).barrier()
    }
    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<(), CommError> {
        (**self).all_reduce_sum(values)
    }
    fn exchange(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        (**self).exchange(outgoing)
    }
}
