use fsr_conic::{ConicError, SolveStatus};
use fsr_geometry::GeometryError;
use fsr_linalg::LinalgError;
use thiserror::Error;

pub type ReachResult<T> = Result<T, ReachError>;

/// Hard failures of a reachability call.
///
/// "No certificate found" outcomes (infeasible programs, DC iteration cap)
/// are reported through [`crate::PointOutcome`] and an empty set result,
/// never through this enum.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReachError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("horizon must be positive, got {horizon}")]
    InvalidHorizon { horizon: usize },
    #[error("state matrix at stage {stage} is singular")]
    SingularMatrix { stage: usize },
    #[error("no feasible state-input pair at stage {stage}")]
    NoFeasiblePoint { stage: usize },
    #[error("boundary computation failed at stage {stage}, direction {direction}")]
    BoundaryComputationFailed { stage: usize, direction: usize },
    #[error("conic solver ended with status {status:?} at stage {stage}")]
    SolverFailed { stage: usize, status: SolveStatus },
    #[error(
        "Gaussian integration did not reach accuracy {requested:e} after {attempts} attempts (achieved {achieved:e})"
    )]
    IntegrationDidNotConverge {
        requested: f64,
        achieved: f64,
        attempts: usize,
    },
    #[error(transparent)]
    Linalg(#[from] LinalgError),
    #[error(transparent)]
    Conic(#[from] ConicError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

pub(crate) fn invalid(message: impl Into<String>) -> ReachError {
    ReachError::InvalidArgument {
        message: message.into(),
    }
}
