mod cr;

pub use cr::*;

use thiserror::Error;

/// Scalar type supported by the iterative solvers.
pub trait Real: na::RealField + num_traits::ToPrimitive + Copy {}
impl<T> Real for T where T: na::RealField + num_traits::ToPrimitive + Copy {}

#[derive(Copy, Clone, Debug, PartialEq, Error)]
pub enum Status {
    #[error("Success")]
    Success,
    #[error("Maximum number of linear solver iterations exceeded")]
    MaximumIterationsExceeded,
    #[error("Linear solve interrupted")]
    Interrupted,
    #[error("NaN detected")]
    NanDetected,
}

impl Default for Status {
    fn default() -> Self {
        Status::Success
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct SolveResult {
    /// Number of iterations of an iterative solver.
    pub iterations: u32,
    /// Absolute residual 2-norm.
    pub residual: f64,
    /// Relative residual 2-norm.
    ///
    /// Residual divided by the norm of the right-hand-side.
    pub error: f64,
    /// Final status of the linear solve.
    pub status: Status,
}

impl SolveResult {
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}
