//! Ellipsoid `{c + L u : ‖u‖ <= 1}` with shape matrix `Q = L Lᵀ`.

use fsr_linalg::{LinalgError, checked_inverse, ensure_square, psd_factor};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::GeometryError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ellipsoid {
    center: DVector<f64>,
    shape: DMatrix<f64>,
    factor: DMatrix<f64>,
}

impl Ellipsoid {
    /// `{x : (x - c)ᵀ Q⁻¹ (x - c) <= 1}` for PSD `Q` (degenerate shapes allowed).
    pub fn new(center: DVector<f64>, shape: DMatrix<f64>) -> Result<Self, GeometryError> {
        let n = ensure_square(&shape)?;
        if n != center.len() {
            return Err(GeometryError::DimensionMismatch {
                expected: center.len(),
                actual: n,
            });
        }
        let factor = psd_factor(&shape)?;
        Ok(Self {
            center,
            shape,
            factor,
        })
    }

    /// Ball of radius `radius` around `center`.
    pub fn ball(center: DVector<f64>, radius: f64) -> Result<Self, GeometryError> {
        let n = center.len();
        Self::new(center, DMatrix::identity(n, n) * radius * radius)
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.center.len()
    }

    #[must_use]
    pub fn center(&self) -> &DVector<f64> {
        &self.center
    }

    #[must_use]
    pub fn shape(&self) -> &DMatrix<f64> {
        &self.shape
    }

    /// `L` with `L Lᵀ = Q`.
    #[must_use]
    pub fn factor(&self) -> &DMatrix<f64> {
        &self.factor
    }

    /// `cᵀℓ + ‖Lᵀℓ‖`.
    #[must_use]
    pub fn support(&self, direction: &DVector<f64>) -> f64 {
        self.center.dot(direction) + (self.factor.transpose() * direction).norm()
    }

    /// `{M x : x ∈ self}`.
    pub fn map(&self, matrix: &DMatrix<f64>) -> Result<Self, GeometryError> {
        if matrix.ncols() != self.dim() {
            return Err(GeometryError::DimensionMismatch {
                expected: self.dim(),
                actual: matrix.ncols(),
            });
        }
        let factor = matrix * &self.factor;
        Ok(Self {
            center: matrix * &self.center,
            shape: &factor * factor.transpose(),
            factor,
        })
    }

    /// Membership for full-dimensional ellipsoids.
    pub fn contains(&self, x: &DVector<f64>, tol: f64) -> Result<bool, GeometryError> {
        let inverse = checked_inverse(&self.shape).map_err(|err| match err {
            LinalgError::SingularMatrix { .. } => GeometryError::InvalidArgument {
                message: String::from("membership needs a full-dimensional ellipsoid"),
            },
            other => GeometryError::Linalg(other),
        })?;
        let d = x - &self.center;
        Ok(d.dot(&(inverse * &d)) <= 1.0 + tol)
    }
}
