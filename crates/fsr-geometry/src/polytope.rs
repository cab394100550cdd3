//! Convex polytope in halfspace form `{x : A x <= b, Ae x = be}`.

use std::sync::OnceLock;

use fsr_conic::{ConicProgram, ConicSolver, LinExpr, SolveStatus};
use fsr_linalg::{checked_inverse, null_space};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::GeometryError;
use crate::enumerate::{FEAS_TOL, enumerate_vertices, hull};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Polytope {
    dim: usize,
    a: DMatrix<f64>,
    b: DVector<f64>,
    ae: DMatrix<f64>,
    be: DVector<f64>,
    #[serde(skip)]
    vertex_cache: OnceLock<Vec<DVector<f64>>>,
}

impl PartialEq for Polytope {
    fn eq(&self, other: &Self) -> bool {
        self.dim == other.dim
            && self.a == other.a
            && self.b == other.b
            && self.ae == other.ae
            && self.be == other.be
    }
}

impl Polytope {
    /// `{x : A x <= b}`.
    pub fn from_halfspaces(a: DMatrix<f64>, b: DVector<f64>) -> Result<Self, GeometryError> {
        let dim = a.ncols();
        Self::new(a, b, DMatrix::zeros(0, dim), DVector::zeros(0))
    }

    /// `{x : A x <= b, Ae x = be}`.
    pub fn new(
        a: DMatrix<f64>,
        b: DVector<f64>,
        ae: DMatrix<f64>,
        be: DVector<f64>,
    ) -> Result<Self, GeometryError> {
        let dim = a.ncols();
        if a.nrows() != b.len() {
            return Err(GeometryError::InvalidArgument {
                message: format!(
                    "inequality matrix has {} rows but rhs has {}",
                    a.nrows(),
                    b.len()
                ),
            });
        }
        if ae.ncols() != dim {
            return Err(GeometryError::DimensionMismatch {
                expected: dim,
                actual: ae.ncols(),
            });
        }
        if ae.nrows() != be.len() {
            return Err(GeometryError::InvalidArgument {
                message: format!(
                    "equality matrix has {} rows but rhs has {}",
                    ae.nrows(),
                    be.len()
                ),
            });
        }
        let finite = a.iter().chain(ae.iter()).all(|v| v.is_finite())
            && b.iter().chain(be.iter()).all(|v| !v.is_nan());
        if !finite {
            return Err(GeometryError::InvalidArgument {
                message: String::from("halfspace data must not contain NaN"),
            });
        }
        Ok(Self {
            dim,
            a,
            b,
            ae,
            be,
            vertex_cache: OnceLock::new(),
        })
    }

    /// Axis-aligned box `lower <= x <= upper`.
    pub fn from_box(lower: &[f64], upper: &[f64]) -> Result<Self, GeometryError> {
        if lower.len() != upper.len() {
            return Err(GeometryError::DimensionMismatch {
                expected: lower.len(),
                actual: upper.len(),
            });
        }
        let dim = lower.len();
        let mut a = DMatrix::zeros(2 * dim, dim);
        let mut b = DVector::zeros(2 * dim);
        for i in 0..dim {
            a[(2 * i, i)] = 1.0;
            b[2 * i] = upper[i];
            a[(2 * i + 1, i)] = -1.0;
            b[2 * i + 1] = -lower[i];
        }
        Self::from_halfspaces(a, b)
    }

    /// Convex hull of a point cloud.
    pub fn from_vertices(points: &[DVector<f64>], dim: usize) -> Result<Self, GeometryError> {
        if let Some(bad) = points.iter().find(|p| p.len() != dim) {
            return Err(GeometryError::DimensionMismatch {
                expected: dim,
                actual: bad.len(),
            });
        }
        let data = hull(points, dim);
        Self::new(data.a, data.b, data.ae, data.be)
    }

    /// The empty subset of `R^dim`.
    #[must_use]
    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            a: DMatrix::zeros(1, dim),
            b: DVector::from_element(1, -1.0),
            ae: DMatrix::zeros(0, dim),
            be: DVector::zeros(0),
            vertex_cache: OnceLock::new(),
        }
    }

    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    #[must_use]
    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }

    #[must_use]
    pub fn b(&self) -> &DVector<f64> {
        &self.b
    }

    #[must_use]
    pub fn ae(&self) -> &DMatrix<f64> {
        &self.ae
    }

    #[must_use]
    pub fn be(&self) -> &DVector<f64> {
        &self.be
    }

    #[must_use]
    pub fn num_inequalities(&self) -> usize {
        self.a.nrows()
    }

    #[must_use]
    pub fn num_equalities(&self) -> usize {
        self.ae.nrows()
    }

    #[must_use]
    pub fn has_equalities(&self) -> bool {
        self.ae.nrows() > 0
    }

    fn check_dim(&self, actual: usize) -> Result<(), GeometryError> {
        if actual != self.dim {
            return Err(GeometryError::DimensionMismatch {
                expected: self.dim,
                actual,
            });
        }
        Ok(())
    }

    /// Membership with slack `tol · (1 + |b_i|)` per row.
    #[must_use]
    pub fn contains(&self, x: &DVector<f64>, tol: f64) -> bool {
        if x.len() != self.dim {
            return false;
        }
        let ineq = (&self.b - &self.a * x)
            .iter()
            .zip(self.b.iter())
            .all(|(s, bi)| *s >= -tol * (1.0 + bi.abs()));
        let eq = (&self.ae * x - &self.be)
            .iter()
            .zip(self.be.iter())
            .all(|(r, bi)| r.abs() <= tol * (1.0 + bi.abs()));
        ineq && eq
    }

    /// Largest halfspace violation at `x`; negative when `x` is strictly inside.
    #[must_use]
    pub fn max_violation(&self, x: &DVector<f64>) -> f64 {
        let ineq = (&self.a * x - &self.b)
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let eq = (&self.ae * x - &self.be)
            .iter()
            .fold(f64::NEG_INFINITY, |acc, r| acc.max(r.abs()));
        ineq.max(eq)
    }

    /// Same set with every equality split into two inequalities.
    #[must_use]
    pub fn with_split_equalities(&self) -> Self {
        if !self.has_equalities() {
            return self.clone();
        }
        let rows = self.a.nrows() + 2 * self.ae.nrows();
        let mut a = DMatrix::zeros(rows, self.dim);
        let mut b = DVector::zeros(rows);
        let m = self.a.nrows();
        let e = self.ae.nrows();
        a.view_mut((0, 0), (m, self.dim)).copy_from(&self.a);
        b.rows_mut(0, m).copy_from(&self.b);
        a.view_mut((m, 0), (e, self.dim)).copy_from(&self.ae);
        b.rows_mut(m, e).copy_from(&self.be);
        a.view_mut((m + e, 0), (e, self.dim)).copy_from(&(-&self.ae));
        b.rows_mut(m + e, e).copy_from(&(-&self.be));
        Self {
            dim: self.dim,
            a,
            b,
            ae: DMatrix::zeros(0, self.dim),
            be: DVector::zeros(0),
            vertex_cache: OnceLock::new(),
        }
    }

    /// `self ∩ other`.
    pub fn intersect(&self, other: &Self) -> Result<Self, GeometryError> {
        self.check_dim(other.dim)?;
        let a = stack_rows(&self.a, &other.a);
        let b = stack_vec(&self.b, &other.b);
        let ae = stack_rows(&self.ae, &other.ae);
        let be = stack_vec(&self.be, &other.be);
        Self::new(a, b, ae, be)
    }

    /// Add the rows `A x <= b`.
    pub fn with_halfspaces(&self, a: &DMatrix<f64>, b: &DVector<f64>) -> Result<Self, GeometryError> {
        self.check_dim(a.ncols())?;
        Self::new(
            stack_rows(&self.a, a),
            stack_vec(&self.b, b),
            self.ae.clone(),
            self.be.clone(),
        )
    }

    /// `{x : M x ∈ self}` for `M` of shape `dim × k`.
    pub fn preimage(&self, map: &DMatrix<f64>) -> Result<Self, GeometryError> {
        self.check_dim(map.nrows())?;
        Self::new(&self.a * map, self.b.clone(), &self.ae * map, self.be.clone())
    }

    /// `{M x : x ∈ self}` for a square invertible `M`.
    pub fn image_invertible(&self, map: &DMatrix<f64>) -> Result<Self, GeometryError> {
        let inverse = checked_inverse(map)?;
        self.preimage(&inverse)
    }

    /// `{M x : x ∈ self}` for any linear map, through the vertices.
    pub fn image(&self, map: &DMatrix<f64>) -> Result<Self, GeometryError> {
        self.check_dim(map.ncols())?;
        let mapped: Vec<DVector<f64>> = self.vertices()?.iter().map(|v| map * v).collect();
        if mapped.is_empty() {
            return Ok(Self::empty(map.nrows()));
        }
        Self::from_vertices(&mapped, map.nrows())
    }

    /// `{x + t : x ∈ self}`.
    pub fn translate(&self, t: &DVector<f64>) -> Result<Self, GeometryError> {
        self.check_dim(t.len())?;
        Self::new(
            self.a.clone(),
            &self.b + &self.a * t,
            self.ae.clone(),
            &self.be + &self.ae * t,
        )
    }

    /// `{-x : x ∈ self}`.
    #[must_use]
    pub fn negate(&self) -> Self {
        Self {
            dim: self.dim,
            a: -&self.a,
            b: self.b.clone(),
            ae: -&self.ae,
            be: self.be.clone(),
            vertex_cache: OnceLock::new(),
        }
    }

    /// Coordinates `dims` of the set (vertex projection followed by a hull).
    pub fn project(&self, dims: &[usize]) -> Result<Self, GeometryError> {
        if let Some(&bad) = dims.iter().find(|&&d| d >= self.dim) {
            return Err(GeometryError::InvalidArgument {
                message: format!("projection index {bad} out of range for dimension {}", self.dim),
            });
        }
        let mut selector = DMatrix::zeros(dims.len(), self.dim);
        for (row, &col) in dims.iter().enumerate() {
            selector[(row, col)] = 1.0;
        }
        self.image(&selector)
    }

    /// Vertex list (bounded sets only; empty for the empty set).
    pub fn vertices(&self) -> Result<Vec<DVector<f64>>, GeometryError> {
        if let Some(cached) = self.vertex_cache.get() {
            return Ok(cached.clone());
        }
        let vertices = enumerate_vertices(&self.a, &self.b, &self.ae, &self.be)?;
        let _ = self.vertex_cache.set(vertices.clone());
        Ok(vertices)
    }

    /// Emptiness test through vertex enumeration (bounded sets only).
    pub fn is_empty(&self) -> Result<bool, GeometryError> {
        Ok(self.vertices()?.is_empty())
    }

    /// `max { ℓᵀx : x ∈ self }` through the vertices; `-∞` for the empty set.
    pub fn support(&self, direction: &DVector<f64>) -> Result<f64, GeometryError> {
        self.check_dim(direction.len())?;
        Ok(self
            .vertices()?
            .iter()
            .map(|v| direction.dot(v))
            .fold(f64::NEG_INFINITY, f64::max))
    }

    /// `self ⊕ other` through pairwise vertex sums.
    pub fn minkowski_sum(&self, other: &Self) -> Result<Self, GeometryError> {
        self.check_dim(other.dim)?;
        let left = self.vertices()?;
        let right = other.vertices()?;
        if left.is_empty() || right.is_empty() {
            return Ok(Self::empty(self.dim));
        }
        let mut sums = Vec::with_capacity(left.len() * right.len());
        for p in &left {
            for q in &right {
                sums.push(p + q);
            }
        }
        Self::from_vertices(&sums, self.dim)
    }

    /// `self ⊖ W = {x : x + W ⊆ self}`, given the support function of `W`.
    ///
    /// Equalities are split into inequality pairs first, so the result is in
    /// pure inequality form.
    pub fn minkowski_difference(
        &self,
        support: impl Fn(&DVector<f64>) -> Result<f64, GeometryError>,
    ) -> Result<Self, GeometryError> {
        let split = self.with_split_equalities();
        let mut b = split.b.clone();
        for i in 0..split.a.nrows() {
            let normal = split.a.row(i).transpose();
            b[i] -= support(&normal)?;
        }
        Self::from_halfspaces(split.a, b)
    }

    /// Whether every vertex of `self` lies in `other`.
    pub fn is_subset_of(&self, other: &Self, tol: f64) -> Result<bool, GeometryError> {
        self.check_dim(other.dim)?;
        Ok(self.vertices()?.iter().all(|v| other.contains(v, tol)))
    }

    /// Center and radius of the largest ball inside the set (radius measured
    /// within the affine hull of the equalities and capped at `radius_cap`).
    /// `None` for an empty set.
    pub fn chebyshev_center(
        &self,
        solver: &dyn ConicSolver,
        radius_cap: f64,
    ) -> Result<Option<(DVector<f64>, f64)>, GeometryError> {
        let projector = if self.has_equalities() {
            let basis = null_space(&self.ae);
            &basis * basis.transpose()
        } else {
            DMatrix::identity(self.dim, self.dim)
        };
        let mut program = ConicProgram::new();
        let x = program.add_variables(self.dim);
        let r = program.add_variable();
        for i in 0..self.a.nrows() {
            let row = self.a.row(i).transpose();
            let norm = (&projector * &row).norm();
            let expr = LinExpr::dot(x, row.as_slice()).term(r, norm);
            program.add_le(expr, self.b[i]);
        }
        for i in 0..self.ae.nrows() {
            let row = self.ae.row(i).transpose();
            program.add_eq(LinExpr::dot(x, row.as_slice()), self.be[i]);
        }
        program.add_bounds(r, 0.0, radius_cap);
        program.maximize(LinExpr::var(r));
        let solution = solver.solve(&program)?;
        match solution.status {
            SolveStatus::Solved | SolveStatus::SolvedInaccurate => {
                let center = DVector::from_column_slice(solution.values(x, self.dim));
                Ok(Some((center, solution.value(r).max(0.0))))
            }
            SolveStatus::Infeasible => Ok(None),
            status => Err(GeometryError::SolverFailed { status }),
        }
    }

    /// Emptiness test through the Chebyshev LP (works for unbounded sets).
    pub fn is_empty_with(&self, solver: &dyn ConicSolver) -> Result<bool, GeometryError> {
        Ok(self.chebyshev_center(solver, 1.0)?.is_none())
    }

    /// `(lower, upper)` per coordinate over the vertices.
    pub fn bounding_box(&self) -> Result<Option<(DVector<f64>, DVector<f64>)>, GeometryError> {
        let vertices = self.vertices()?;
        let Some(first) = vertices.first() else {
            return Ok(None);
        };
        let mut lower = first.clone();
        let mut upper = first.clone();
        for v in &vertices[1..] {
            lower = lower.inf(v);
            upper = upper.sup(v);
        }
        Ok(Some((lower, upper)))
    }

    /// Whether `x` satisfies the rows up to the default feasibility slack.
    #[must_use]
    pub fn contains_default(&self, x: &DVector<f64>) -> bool {
        self.contains(x, FEAS_TOL * 10.0)
    }
}

fn stack_rows(top: &DMatrix<f64>, bottom: &DMatrix<f64>) -> DMatrix<f64> {
    let cols = top.ncols().max(bottom.ncols());
    let mut out = DMatrix::zeros(top.nrows() + bottom.nrows(), cols);
    out.view_mut((0, 0), top.shape()).copy_from(top);
    out.view_mut((top.nrows(), 0), bottom.shape())
        .copy_from(bottom);
    out
}

fn stack_vec(top: &DVector<f64>, bottom: &DVector<f64>) -> DVector<f64> {
    let mut out = DVector::zeros(top.len() + bottom.len());
    out.rows_mut(0, top.len()).copy_from(top);
    out.rows_mut(top.len(), bottom.len()).copy_from(bottom);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsr_conic::ClarabelSolver;
    use fsr_runtime::assert_close;

    fn v(values: &[f64]) -> DVector<f64> {
        DVector::from_column_slice(values)
    }

    #[test]
    fn box_contains_center_not_outside() {
        let square = Polytope::from_box(&[-1.0, -1.0], &[1.0, 1.0]).expect("box");
        assert!(square.contains(&v(&[0.0, 0.0]), 0.0));
        assert!(square.contains(&v(&[1.0, -1.0]), 1e-12));
        assert!(!square.contains(&v(&[1.5, 0.0]), 1e-9));
        assert!(!square.contains(&v(&[0.0]), 1e-9));
    }

    #[test]
    fn rejects_mismatched_rhs() {
        let err = Polytope::from_halfspaces(DMatrix::zeros(2, 2), DVector::zeros(3))
            .expect_err("rhs length must match");
        assert!(matches!(err, GeometryError::InvalidArgument { .. }));
    }

    #[test]
    fn minkowski_sum_of_boxes() {
        let left = Polytope::from_box(&[-1.0, -1.0], &[1.0, 1.0]).expect("box");
        let right = Polytope::from_box(&[0.0, -0.5], &[2.0, 0.5]).expect("box");
        let sum = left.minkowski_sum(&right).expect("sum");
        let (lower, upper) = sum.bounding_box().expect("bounded").expect("nonempty");
        assert_close(lower[0], -1.0, 1e-9, 0.0);
        assert_close(upper[0], 3.0, 1e-9, 0.0);
        assert_close(lower[1], -1.5, 1e-9, 0.0);
        assert_close(upper[1], 1.5, 1e-9, 0.0);
        assert_eq!(sum.vertices().expect("bounded").len(), 4);
    }

    #[test]
    fn minkowski_difference_shrinks_box() {
        let outer = Polytope::from_box(&[-2.0, -2.0], &[2.0, 2.0]).expect("box");
        let inner = Polytope::from_box(&[-0.5, -1.0], &[0.5, 1.0]).expect("box");
        let diff = outer
            .minkowski_difference(|l| inner.support(l))
            .expect("difference");
        assert!(diff.contains(&v(&[1.5, 1.0]), 1e-9));
        assert!(!diff.contains(&v(&[1.6, 0.0]), 1e-9));
        assert!(!diff.contains(&v(&[0.0, 1.1]), 1e-9));
    }

    #[test]
    fn preimage_and_image_are_inverse() {
        let square = Polytope::from_box(&[0.0, 0.0], &[1.0, 1.0]).expect("box");
        let shear = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]);
        let mapped = square.image_invertible(&shear).expect("image");
        assert!(mapped.contains(&v(&[2.0, 1.0]), 1e-9));
        assert!(!mapped.contains(&v(&[0.0, 1.0]), 1e-9));
        let back = mapped.preimage(&shear).expect("preimage");
        assert!(back.contains(&v(&[1.0, 1.0]), 1e-9));
    }

    #[test]
    fn projection_of_cube() {
        let cube = Polytope::from_box(&[0.0, -1.0, 2.0], &[1.0, 1.0, 3.0]).expect("box");
        let shadow = cube.project(&[0, 2]).expect("project");
        assert_eq!(shadow.dim(), 2);
        assert!(shadow.contains(&v(&[0.5, 2.5]), 1e-9));
        assert!(!shadow.contains(&v(&[0.5, 1.5]), 1e-9));
    }

    #[test]
    fn hull_round_trip_through_vertices() {
        let points = vec![v(&[0.0, 0.0]), v(&[2.0, 0.0]), v(&[0.0, 2.0]), v(&[0.5, 0.5])];
        let triangle = Polytope::from_vertices(&points, 2).expect("hull");
        assert_eq!(triangle.vertices().expect("bounded").len(), 3);
        assert!(triangle.contains(&v(&[1.0, 1.0]), 1e-9));
        assert!(!triangle.contains(&v(&[1.1, 1.1]), 1e-9));
    }

    #[test]
    fn empty_polytope_has_no_vertices() {
        let empty = Polytope::empty(2);
        assert!(empty.is_empty().expect("bounded"));
        let disjoint = Polytope::from_box(&[0.0], &[1.0])
            .expect("box")
            .intersect(&Polytope::from_box(&[2.0], &[3.0]).expect("box"))
            .expect("intersect");
        assert!(disjoint.is_empty().expect("bounded"));
    }

    #[test]
    fn chebyshev_center_of_rectangle() {
        let rect = Polytope::from_box(&[0.0, 0.0], &[4.0, 2.0]).expect("box");
        let solver = ClarabelSolver::default();
        let (center, radius) = rect
            .chebyshev_center(&solver, 100.0)
            .expect("solve")
            .expect("nonempty");
        assert_close(radius, 1.0, 1e-6, 0.0);
        assert_close(center[1], 1.0, 1e-6, 0.0);
        assert!(rect.contains(&center, 1e-9));
    }

    #[test]
    fn chebyshev_center_detects_empty() {
        let empty = Polytope::from_box(&[0.0], &[1.0])
            .expect("box")
            .intersect(&Polytope::from_box(&[2.0], &[3.0]).expect("box"))
            .expect("intersect");
        let solver = ClarabelSolver::default();
        assert!(empty.is_empty_with(&solver).expect("solve"));
    }

    #[test]
    fn subset_check() {
        let small = Polytope::from_box(&[0.0, 0.0], &[1.0, 1.0]).expect("box");
        let large = Polytope::from_box(&[-1.0, -1.0], &[2.0, 2.0]).expect("box");
        assert!(small.is_subset_of(&large, 1e-9).expect("bounded"));
        assert!(!large.is_subset_of(&small, 1e-9).expect("bounded"));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn hull_contains_its_generators(coords in proptest::collection::vec(-5.0_f64..5.0, 12)) {
                let points: Vec<DVector<f64>> = coords
                    .chunks(2)
                    .map(|c| DVector::from_column_slice(c))
                    .collect();
                let polytope = Polytope::from_vertices(&points, 2).expect("hull");
                for p in &points {
                    prop_assert!(polytope.contains(p, 1e-7));
                }
            }

            #[test]
            fn minkowski_sum_contains_pairwise_sums(
                shift in proptest::collection::vec(-3.0_f64..3.0, 2),
                width in 0.1_f64..2.0,
            ) {
                let left = Polytope::from_box(&[-1.0, -1.0], &[1.0, 1.0]).expect("box");
                let right = Polytope::from_box(
                    &[shift[0], shift[1]],
                    &[shift[0] + width, shift[1] + width],
                ).expect("box");
                let sum = left.minkowski_sum(&right).expect("sum");
                let probe = DVector::from_vec(vec![1.0 + shift[0] + width, -1.0 + shift[1]]);
                prop_assert!(sum.contains(&probe, 1e-7));
            }
        }
    }
}
