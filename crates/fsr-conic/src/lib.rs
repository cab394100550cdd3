#![forbid(unsafe_code)]

//! Conic programming seam used by the geometry and reachability crates.
//!
//! Callers build a [`ConicProgram`] (linear objective, zero / nonnegative /
//! second-order / exponential cone blocks) and hand it to any [`ConicSolver`].
//! [`ClarabelSolver`] is the default implementation.

pub mod clarabel_backend;
pub mod program;

pub use clarabel_backend::{ClarabelSettings, ClarabelSolver};
pub use program::{ConeBlock, ConeKind, ConicProgram, LinExpr, RowRange, Sense};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConicError {
    #[error("invalid conic program: {message}")]
    InvalidProgram { message: String },
    #[error("solver setup failed: {message}")]
    SolverSetup { message: String },
}

/// Outcome class of a conic solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Solved,
    /// Converged to relaxed tolerances; values are usable with a warning.
    SolvedInaccurate,
    Infeasible,
    Unbounded,
    Failed,
}

impl SolveStatus {
    /// Whether the primal values may be read.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Solved | Self::SolvedInaccurate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConicSolution {
    pub status: SolveStatus,
    /// Primal values, one per program variable.
    pub x: Vec<f64>,
    /// Dual values, one per constraint row.
    pub z: Vec<f64>,
    /// Objective value in the program's own sense.
    pub objective: f64,
    pub iterations: u32,
}

impl ConicSolution {
    #[must_use]
    pub fn value(&self, var: usize) -> f64 {
        self.x.get(var).copied().unwrap_or(f64::NAN)
    }

    #[must_use]
    pub fn values(&self, start: usize, len: usize) -> &[f64] {
        let end = (start + len).min(self.x.len());
        &self.x[start.min(end)..end]
    }

    #[must_use]
    pub fn dual(&self, rows: RowRange) -> &[f64] {
        let end = (rows.start + rows.len).min(self.z.len());
        &self.z[rows.start.min(end)..end]
    }
}

/// Convex/conic optimizer.
pub trait ConicSolver {
    /// Solve `program`. Infeasibility and failed convergence are reported
    /// through [`ConicSolution::status`]; `Err` is reserved for malformed
    /// programs and solver setup errors.
    fn solve(&self, program: &ConicProgram) -> Result<ConicSolution, ConicError>;
}

impl<T: ConicSolver + ?Sized> ConicSolver for &T {
    fn solve(&self, program: &ConicProgram) -> Result<ConicSolution, ConicError> {
        (**self).solve(program)
    }
}
