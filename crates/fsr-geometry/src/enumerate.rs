//! Halfspace ↔ vertex conversion for low-dimensional polytopes.
//!
//! Both directions are combinatorial (subset enumeration over rows or
//! points). Cost grows as `C(m, d)`, which is fine for the state and
//! joint state-input dimensions handled here.

use fsr_linalg::{least_squares, null_space, reciprocal_condition};
use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::GeometryError;

/// Feasibility slack relative to `1 + |b_i|`.
pub(crate) const FEAS_TOL: f64 = 1e-9;
const DEDUP_TOL: f64 = 1e-8;
const MIN_RCOND: f64 = 1e-10;

/// Call `visit` for every increasing `k`-subset of `0..m`.
pub(crate) fn for_each_combination(m: usize, k: usize, mut visit: impl FnMut(&[usize])) {
    if k > m {
        return;
    }
    if k == 0 {
        visit(&[]);
        return;
    }
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        visit(&idx);
        let mut i = k;
        while i > 0 {
            i -= 1;
            if idx[i] != i + m - k {
                idx[i] += 1;
                for j in i + 1..k {
                    idx[j] = idx[j - 1] + 1;
                }
                break;
            }
            if i == 0 {
                return;
            }
        }
    }
}

pub(crate) fn push_unique(points: &mut Vec<DVector<f64>>, candidate: DVector<f64>) {
    let scale = 1.0 + candidate.amax();
    if points
        .iter()
        .all(|p| (p - &candidate).amax() > DEDUP_TOL * scale)
    {
        points.push(candidate);
    }
}

/// Rows normalised to unit length. Zero rows are dropped; `None` when a
/// zero row is violated (the system is empty).
fn normalize_rows(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<(DMatrix<f64>, DVector<f64>)> {
    let mut rows = Vec::new();
    let mut rhs = Vec::new();
    for i in 0..a.nrows() {
        let norm = a.row(i).norm();
        if norm <= 1e-12 {
            if b[i] < -FEAS_TOL * (1.0 + b[i].abs()) {
                return None;
            }
            continue;
        }
        rows.push(a.row(i) / norm);
        rhs.push(b[i] / norm);
    }
    let out = if rows.is_empty() {
        DMatrix::zeros(0, a.ncols())
    } else {
        DMatrix::from_rows(&rows)
    };
    Some((out, DVector::from_vec(rhs)))
}

/// Vertices of `{y : A y <= b}` with `A` already row-normalised.
fn enumerate_reduced(a: &DMatrix<f64>, b: &DVector<f64>) -> Vec<DVector<f64>> {
    let (m, k) = a.shape();
    let mut vertices = Vec::new();
    for_each_combination(m, k, |subset| {
        let sub_a = a.select_rows(subset);
        let sub_b = b.select_rows(subset);
        match reciprocal_condition(&sub_a) {
            Ok(rcond) if rcond > MIN_RCOND => {}
            _ => return,
        }
        let Some(y) = sub_a.lu().solve(&sub_b) else {
            return;
        };
        let slack = b - a * &y;
        let feasible = slack
            .iter()
            .zip(b.iter())
            .all(|(s, bi)| *s >= -FEAS_TOL * (1.0 + bi.abs()));
        if feasible {
            push_unique(&mut vertices, y);
        }
    });
    vertices
}

/// Whether `{y : A y <= 0}` is the origin only.
fn recession_is_trivial(a: &DMatrix<f64>) -> bool {
    let k = a.ncols();
    let m = a.nrows();
    let mut boxed = DMatrix::zeros(m + 2 * k, k);
    boxed.view_mut((0, 0), (m, k)).copy_from(a);
    for j in 0..k {
        boxed[(m + 2 * j, j)] = 1.0;
        boxed[(m + 2 * j + 1, j)] = -1.0;
    }
    let mut rhs = DVector::zeros(m + 2 * k);
    for i in m..m + 2 * k {
        rhs[i] = 1.0;
    }
    enumerate_reduced(&boxed, &rhs)
        .iter()
        .all(|v| v.amax() < 1e-7)
}

/// Vertices of `{x : A x <= b, Ae x = be}`.
///
/// Returns an empty list for an empty polytope and
/// [`GeometryError::Unbounded`] when the set has a nontrivial recession cone.
pub(crate) fn enumerate_vertices(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    ae: &DMatrix<f64>,
    be: &DVector<f64>,
) -> Result<Vec<DVector<f64>>, GeometryError> {
    let dim = a.ncols();
    let (origin, basis) = if ae.nrows() == 0 {
        (DVector::zeros(dim), DMatrix::identity(dim, dim))
    } else {
        let particular = least_squares(ae, be)?;
        let residual = (ae * &particular - be).amax();
        if residual > 1e-8 * (1.0 + be.amax()) {
            return Ok(Vec::new());
        }
        (particular, null_space(ae))
    };

    let reduced_a = a * &basis;
    let reduced_b = b - a * &origin;
    let Some((reduced_a, reduced_b)) = normalize_rows(&reduced_a, &reduced_b) else {
        return Ok(Vec::new());
    };

    if basis.ncols() == 0 {
        let feasible = reduced_b
            .iter()
            .all(|bi| *bi >= -FEAS_TOL * (1.0 + bi.abs()));
        return Ok(if feasible { vec![origin] } else { Vec::new() });
    }

    let reduced = enumerate_reduced(&reduced_a, &reduced_b);
    if !recession_is_trivial(&reduced_a) {
        return Err(GeometryError::Unbounded);
    }
    Ok(reduced
        .into_iter()
        .map(|y| &origin + &basis * y)
        .collect())
}

/// Halfspace data of a convex hull.
pub(crate) struct HullData {
    pub a: DMatrix<f64>,
    pub b: DVector<f64>,
    pub ae: DMatrix<f64>,
    pub be: DVector<f64>,
}

/// Convex hull of `points` in `R^dim` as `{A x <= b, Ae x = be}`.
///
/// Degenerate point sets are handled by restricting to their affine hull,
/// which becomes the equality part.
pub(crate) fn hull(points: &[DVector<f64>], dim: usize) -> HullData {
    let mut unique: Vec<DVector<f64>> = Vec::new();
    for p in points {
        push_unique(&mut unique, p.clone());
    }
    let count = unique.len();
    if count == 0 {
        return HullData {
            a: DMatrix::zeros(1, dim),
            b: DVector::from_element(1, -1.0),
            ae: DMatrix::zeros(0, dim),
            be: DVector::zeros(0),
        };
    }
    let centroid = unique
        .iter()
        .fold(DVector::zeros(dim), |acc, p| acc + p)
        / count as f64;

    let mut spread = DMatrix::zeros(dim, dim);
    for p in &unique {
        let d = p - &centroid;
        spread += &d * d.transpose();
    }
    let eig = SymmetricEigen::new(spread);
    let max_eig = eig.eigenvalues.iter().copied().fold(0.0_f64, f64::max);
    let threshold = 1e-14 * max_eig.max(f64::MIN_POSITIVE);
    let mut range_cols = Vec::new();
    let mut complement_cols = Vec::new();
    for (j, lambda) in eig.eigenvalues.iter().enumerate() {
        if *lambda > threshold && max_eig > 1e-24 {
            range_cols.push(eig.eigenvectors.column(j).into_owned());
        } else {
            complement_cols.push(eig.eigenvectors.column(j).into_owned());
        }
    }

    let ae = if complement_cols.is_empty() {
        DMatrix::zeros(0, dim)
    } else {
        DMatrix::from_columns(&complement_cols).transpose()
    };
    let be = &ae * &centroid;

    let r = range_cols.len();
    if r == 0 {
        return HullData {
            a: DMatrix::zeros(0, dim),
            b: DVector::zeros(0),
            ae,
            be,
        };
    }
    let basis = DMatrix::from_columns(&range_cols);
    let local: Vec<DVector<f64>> = unique
        .iter()
        .map(|p| basis.transpose() * (p - &centroid))
        .collect();

    let facets = if r == 1 {
        let lo = local.iter().map(|y| y[0]).fold(f64::INFINITY, f64::min);
        let hi = local.iter().map(|y| y[0]).fold(f64::NEG_INFINITY, f64::max);
        vec![
            (DVector::from_element(1, 1.0), hi),
            (DVector::from_element(1, -1.0), -lo),
        ]
    } else {
        local_facets(&local, r)
    };

    let mut a_rows = Vec::with_capacity(facets.len());
    let mut b_vals = Vec::with_capacity(facets.len());
    for (normal, offset) in facets {
        let lifted = &basis * &normal;
        b_vals.push(offset + lifted.dot(&centroid));
        a_rows.push(lifted.transpose());
    }
    let a = if a_rows.is_empty() {
        DMatrix::zeros(0, dim)
    } else {
        DMatrix::from_rows(&a_rows)
    };
    HullData {
        a,
        b: DVector::from_vec(b_vals),
        ae,
        be,
    }
}

/// Facets of a full-dimensional point cloud in `R^r`, `r >= 2`.
fn local_facets(points: &[DVector<f64>], r: usize) -> Vec<(DVector<f64>, f64)> {
    let scale = points.iter().map(|p| p.amax()).fold(1.0_f64, f64::max);
    let tol = 1e-9 * scale;
    let mut facets: Vec<(DVector<f64>, f64)> = Vec::new();
    for_each_combination(points.len(), r, |subset| {
        let base = &points[subset[0]];
        let rows: Vec<_> = subset[1..]
            .iter()
            .map(|&i| (&points[i] - base).transpose())
            .collect();
        let edges = DMatrix::from_rows(&rows);
        let normals = null_space(&edges);
        if normals.ncols() != 1 {
            return;
        }
        let normal: DVector<f64> = normals.column(0).into_owned();
        let offset = normal.dot(base);
        let mut above = false;
        let mut below = false;
        for p in points {
            let s = normal.dot(p) - offset;
            above |= s > tol;
            below |= s < -tol;
            if above && below {
                return;
            }
        }
        let (normal, offset) = if above {
            (-normal, -offset)
        } else {
            (normal, offset)
        };
        let duplicate = facets
            .iter()
            .any(|(n, o)| n.dot(&normal) > 1.0 - 1e-9 && (o - offset).abs() <= tol);
        if !duplicate {
            facets.push((normal, offset));
        }
    });
    facets
}
