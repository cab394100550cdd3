#![forbid(unsafe_code)]

//! Convex set algebra for reachability computations.
//!
//! ## Module layout
//!
//! | Module      | Contents                                                     |
//! |-------------|--------------------------------------------------------------|
//! | `polytope`  | [`Polytope`]: halfspace form, Minkowski algebra, projection, Chebyshev center |
//! | `ellipsoid` | [`Ellipsoid`]: support function and linear images            |
//! | `set`       | [`BoundedSet`] union and the [`SupportFunction`] trait       |
//! | `enumerate` | vertex enumeration and convex hull (crate-private)           |

mod enumerate;
pub mod ellipsoid;
pub mod polytope;
pub mod set;

pub use ellipsoid::Ellipsoid;
pub use polytope::Polytope;
pub use set::{BoundedSet, SupportFunction};

use fsr_conic::{ConicError, SolveStatus};
use fsr_linalg::LinalgError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("polytope is unbounded; no vertex representation exists")]
    Unbounded,
    #[error("auxiliary program ended with status {status:?}")]
    SolverFailed { status: SolveStatus },
    #[error(transparent)]
    Linalg(#[from] LinalgError),
    #[error(transparent)]
    Conic(#[from] ConicError),
}
