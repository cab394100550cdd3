//! Closed union over the bounded convex sets used as disturbance and input
//! descriptions.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{Ellipsoid, GeometryError, Polytope};

/// Sets that expose a support function `h(ℓ) = sup { ℓᵀx : x ∈ S }`.
pub trait SupportFunction {
    fn dim(&self) -> usize;
    fn support(&self, direction: &DVector<f64>) -> Result<f64, GeometryError>;
}

impl SupportFunction for Polytope {
    fn dim(&self) -> usize {
        Polytope::dim(self)
    }

    fn support(&self, direction: &DVector<f64>) -> Result<f64, GeometryError> {
        Polytope::support(self, direction)
    }
}

impl SupportFunction for Ellipsoid {
    fn dim(&self) -> usize {
        Ellipsoid::dim(self)
    }

    fn support(&self, direction: &DVector<f64>) -> Result<f64, GeometryError> {
        if direction.len() != Ellipsoid::dim(self) {
            return Err(GeometryError::DimensionMismatch {
                expected: Ellipsoid::dim(self),
                actual: direction.len(),
            });
        }
        Ok(Ellipsoid::support(self, direction))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BoundedSet {
    Polytope(Polytope),
    Ellipsoid(Ellipsoid),
}

impl BoundedSet {
    /// `{M x : x ∈ self}`.
    pub fn map(&self, matrix: &DMatrix<f64>) -> Result<Self, GeometryError> {
        match self {
            Self::Polytope(p) => Ok(Self::Polytope(p.image(matrix)?)),
            Self::Ellipsoid(e) => Ok(Self::Ellipsoid(e.map(matrix)?)),
        }
    }

    /// Points whose convex hull is (Polytope) or inner-approximates
    /// (Ellipsoid, `samples` boundary points per principal plane) the set.
    pub fn extreme_points(&self, samples: usize) -> Result<Vec<DVector<f64>>, GeometryError> {
        match self {
            Self::Polytope(p) => p.vertices(),
            Self::Ellipsoid(e) => {
                let n = e.dim();
                let mut points = Vec::new();
                let count = samples.max(4);
                for i in 0..n {
                    for j in (i + 1)..n {
                        for k in 0..count {
                            let angle = std::f64::consts::TAU * k as f64 / count as f64;
                            let mut u = DVector::zeros(n);
                            u[i] = angle.cos();
                            u[j] = angle.sin();
                            points.push(e.center() + e.factor() * u);
                        }
                    }
                }
                if n == 1 {
                    let u = DVector::from_element(1, 1.0);
                    points.push(e.center() + e.factor() * &u);
                    points.push(e.center() - e.factor() * &u);
                }
                Ok(points)
            }
        }
    }
}

impl SupportFunction for BoundedSet {
    fn dim(&self) -> usize {
        match self {
            Self::Polytope(p) => p.dim(),
            Self::Ellipsoid(e) => e.dim(),
        }
    }

    fn support(&self, direction: &DVector<f64>) -> Result<f64, GeometryError> {
        match self {
            Self::Polytope(p) => SupportFunction::support(p, direction),
            Self::Ellipsoid(e) => SupportFunction::support(e, direction),
        }
    }
}

impl From<Polytope> for BoundedSet {
    fn from(value: Polytope) -> Self {
        Self::Polytope(value)
    }
}

impl From<Ellipsoid> for BoundedSet {
    fn from(value: Ellipsoid) -> Self {
        Self::Ellipsoid(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsr_runtime::assert_close;

    #[test]
    fn support_dispatches_by_variant() {
        let square: BoundedSet = Polytope::from_box(&[-1.0, -2.0], &[1.0, 2.0])
            .expect("box")
            .into();
        let ball: BoundedSet = Ellipsoid::ball(DVector::zeros(2), 0.5).expect("ball").into();
        let l = DVector::from_vec(vec![0.0, 1.0]);
        assert_close(square.support(&l).expect("support"), 2.0, 1e-12, 0.0);
        assert_close(ball.support(&l).expect("support"), 0.5, 1e-12, 0.0);
    }

    #[test]
    fn ellipsoid_extreme_points_lie_on_boundary() {
        let ball = BoundedSet::Ellipsoid(Ellipsoid::ball(DVector::zeros(3), 2.0).expect("ball"));
        let points = ball.extreme_points(8).expect("points");
        assert!(!points.is_empty());
        for p in points {
            assert_close(p.norm(), 2.0, 1e-12, 0.0);
        }
    }

    #[test]
    fn map_keeps_variant() {
        let square = BoundedSet::Polytope(Polytope::from_box(&[0.0, 0.0], &[1.0, 1.0]).expect("box"));
        let mapped = square
            .map(&DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 1.0]))
            .expect("map");
        let l = DVector::from_vec(vec![1.0, 0.0]);
        assert_close(mapped.support(&l).expect("support"), 2.0, 1e-9, 0.0);
    }
}
