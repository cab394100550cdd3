#![forbid(unsafe_code)]

//! Dense linear-algebra helpers shared by the geometry and reachability
//! crates. Everything operates on `nalgebra` dynamic matrices.

use fsr_runtime::{RuntimeMode, first_non_finite};
use nalgebra::{DMatrix, DVector, Dyn, LU, SymmetricEigen, linalg::SVD};
use thiserror::Error;

/// Relative singular-value threshold used for rank decisions.
pub const RANK_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LinalgError {
    #[error("expected square matrix, got {rows}x{cols}")]
    ExpectedSquareMatrix { rows: usize, cols: usize },
    #[error("incompatible shapes for {context}: expected {expected:?}, got {actual:?}")]
    IncompatibleShapes {
        context: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("array must not contain infs or NaNs (first at index {index})")]
    NonFiniteInput { index: usize },
    #[error("singular matrix (reciprocal condition {reciprocal_condition:e})")]
    SingularMatrix { reciprocal_condition: f64 },
    #[error("matrix is not positive semidefinite (min eigenvalue {min_eigenvalue:e})")]
    NotPositiveSemidefinite { min_eigenvalue: f64 },
}

/// Reject NaN/Inf when the mode requires it.
pub fn validate_finite_matrix(
    matrix: &DMatrix<f64>,
    mode: RuntimeMode,
    check_finite: bool,
) -> Result<(), LinalgError> {
    if !mode.must_check_finite(check_finite) {
        return Ok(());
    }
    match first_non_finite(matrix.as_slice()) {
        Some((index, _)) => Err(LinalgError::NonFiniteInput { index }),
        None => Ok(()),
    }
}

pub fn validate_finite_vector(
    vector: &DVector<f64>,
    mode: RuntimeMode,
    check_finite: bool,
) -> Result<(), LinalgError> {
    if !mode.must_check_finite(check_finite) {
        return Ok(());
    }
    match first_non_finite(vector.as_slice()) {
        Some((index, _)) => Err(LinalgError::NonFiniteInput { index }),
        None => Ok(()),
    }
}

pub fn ensure_square(matrix: &DMatrix<f64>) -> Result<usize, LinalgError> {
    let (rows, cols) = matrix.shape();
    if rows != cols {
        return Err(LinalgError::ExpectedSquareMatrix { rows, cols });
    }
    Ok(rows)
}

pub fn ensure_shape(
    matrix: &DMatrix<f64>,
    expected: (usize, usize),
    context: &'static str,
) -> Result<(), LinalgError> {
    let actual = matrix.shape();
    if actual != expected {
        return Err(LinalgError::IncompatibleShapes {
            context,
            expected,
            actual,
        });
    }
    Ok(())
}

/// O(n) reciprocal condition estimate from the LU diagonal. Conservative lower
/// bound on the true rcond.
fn fast_rcond_from_lu(lu: &LU<f64, Dyn, Dyn>, n: usize) -> f64 {
    if n == 0 {
        return 1.0;
    }
    let u = lu.u();
    let mut max_diag: f64 = 0.0;
    let mut min_diag = f64::INFINITY;
    for i in 0..n {
        let d = u[(i, i)].abs();
        max_diag = max_diag.max(d);
        min_diag = min_diag.min(d);
    }
    if max_diag == 0.0 {
        return 0.0;
    }
    min_diag / max_diag
}

/// Reciprocal condition estimate of a square matrix.
pub fn reciprocal_condition(matrix: &DMatrix<f64>) -> Result<f64, LinalgError> {
    let n = ensure_square(matrix)?;
    let lu: LU<f64, Dyn, Dyn> = matrix.clone().lu();
    Ok(fast_rcond_from_lu(&lu, n))
}

/// Inverse of a square matrix, rejecting matrices whose LU rcond falls below
/// machine epsilon.
pub fn checked_inverse(matrix: &DMatrix<f64>) -> Result<DMatrix<f64>, LinalgError> {
    let n = ensure_square(matrix)?;
    if n == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }
    let lu: LU<f64, Dyn, Dyn> = matrix.clone().lu();
    let rcond = fast_rcond_from_lu(&lu, n);
    if rcond < f64::EPSILON {
        return Err(LinalgError::SingularMatrix {
            reciprocal_condition: rcond,
        });
    }
    lu.solve(&DMatrix::identity(n, n))
        .ok_or(LinalgError::SingularMatrix {
            reciprocal_condition: rcond,
        })
}

/// `(M + Mᵀ) / 2`.
#[must_use]
pub fn symmetrize(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    (matrix + matrix.transpose()) * 0.5
}

/// Factor `L` with `L Lᵀ = Σ` for a symmetric positive semidefinite `Σ`.
///
/// Cholesky is attempted first; singular covariances fall back to
/// `V diag(√λ)` from the symmetric eigendecomposition, with eigenvalues down
/// to `-1e-9 · max|λ|` clamped to zero.
pub fn psd_factor(sigma: &DMatrix<f64>) -> Result<DMatrix<f64>, LinalgError> {
    let n = ensure_square(sigma)?;
    if n == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }
    let sym = symmetrize(sigma);
    if let Some(chol) = sym.clone().cholesky() {
        return Ok(chol.l());
    }
    let eig = SymmetricEigen::new(sym);
    let scale = eig.eigenvalues.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let min_eigenvalue = eig.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if min_eigenvalue < -1e-9 * scale.max(1.0) {
        return Err(LinalgError::NotPositiveSemidefinite { min_eigenvalue });
    }
    let mut factor = eig.eigenvectors.clone();
    for (j, lambda) in eig.eigenvalues.iter().enumerate() {
        let root = lambda.max(0.0).sqrt();
        factor.column_mut(j).scale_mut(root);
    }
    Ok(factor)
}

/// Symmetric square root `Σ^{1/2}` of a PSD matrix.
pub fn psd_sqrt(sigma: &DMatrix<f64>) -> Result<DMatrix<f64>, LinalgError> {
    let n = ensure_square(sigma)?;
    if n == 0 {
        return Ok(DMatrix::zeros(0, 0));
    }
    let eig = SymmetricEigen::new(symmetrize(sigma));
    let scale = eig.eigenvalues.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let min_eigenvalue = eig.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if min_eigenvalue < -1e-9 * scale.max(1.0) {
        return Err(LinalgError::NotPositiveSemidefinite { min_eigenvalue });
    }
    let roots = DMatrix::from_diagonal(&eig.eigenvalues.map(|lambda| lambda.max(0.0).sqrt()));
    Ok(&eig.eigenvectors * roots * eig.eigenvectors.transpose())
}

/// Orthonormal basis (as columns) of the null space of `matrix`.
///
/// A matrix with fewer rows than columns is padded with zero rows so the SVD
/// exposes the full right singular basis.
#[must_use]
pub fn null_space(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    let (rows, cols) = matrix.shape();
    if cols == 0 {
        return DMatrix::zeros(0, 0);
    }
    if rows == 0 {
        return DMatrix::identity(cols, cols);
    }
    let padded = if rows < cols {
        let mut padded = DMatrix::zeros(cols, cols);
        padded.view_mut((0, 0), (rows, cols)).copy_from(matrix);
        padded
    } else {
        matrix.clone()
    };
    let svd = SVD::new(padded, false, true);
    let Some(v_t) = svd.v_t else {
        return DMatrix::zeros(cols, 0);
    };
    let max_s = svd.singular_values.iter().copied().fold(0.0_f64, f64::max);
    let threshold = RANK_TOLERANCE * max_s.max(1.0);
    let null_rows: Vec<usize> = svd
        .singular_values
        .iter()
        .enumerate()
        .filter(|(_, s)| **s <= threshold)
        .map(|(idx, _)| idx)
        .collect();
    let mut basis = DMatrix::zeros(cols, null_rows.len());
    for (j, &row) in null_rows.iter().enumerate() {
        basis.set_column(j, &v_t.row(row).transpose());
    }
    basis
}

/// Numerical rank using the relative [`RANK_TOLERANCE`].
#[must_use]
pub fn rank(matrix: &DMatrix<f64>) -> usize {
    if matrix.nrows() == 0 || matrix.ncols() == 0 {
        return 0;
    }
    let svd = SVD::new(matrix.clone(), false, false);
    let max_s = svd.singular_values.iter().copied().fold(0.0_f64, f64::max);
    let threshold = RANK_TOLERANCE * max_s.max(1.0);
    svd.singular_values.iter().filter(|s| **s > threshold).count()
}

/// Least-squares solution of `A x = b` via the SVD pseudo-inverse.
pub fn least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, LinalgError> {
    if a.nrows() != b.len() {
        return Err(LinalgError::IncompatibleShapes {
            context: "least_squares",
            expected: (a.nrows(), 1),
            actual: (b.len(), 1),
        });
    }
    let svd = SVD::new(a.clone(), true, true);
    let max_s = svd.singular_values.iter().copied().fold(0.0_f64, f64::max);
    svd.solve(b, RANK_TOLERANCE * max_s.max(f64::MIN_POSITIVE))
        .map_err(|_| LinalgError::SingularMatrix {
            reciprocal_condition: 0.0,
        })
}

/// Block-diagonal matrix from a list of blocks.
#[must_use]
pub fn block_diag(blocks: &[DMatrix<f64>]) -> DMatrix<f64> {
    let rows = blocks.iter().map(DMatrix::nrows).sum();
    let cols = blocks.iter().map(DMatrix::ncols).sum();
    let mut out = DMatrix::zeros(rows, cols);
    let (mut r, mut c) = (0, 0);
    for block in blocks {
        out.view_mut((r, c), block.shape()).copy_from(block);
        r += block.nrows();
        c += block.ncols();
    }
    out
}

/// `I_times ⊗ block`.
#[must_use]
pub fn repeat_block_diag(block: &DMatrix<f64>, times: usize) -> DMatrix<f64> {
    let (rows, cols) = block.shape();
    let mut out = DMatrix::zeros(rows * times, cols * times);
    for k in 0..times {
        out.view_mut((k * rows, k * cols), (rows, cols))
            .copy_from(block);
    }
    out
}

/// `[v; v; ...; v]` with `times` copies.
#[must_use]
pub fn repeat_vector(vector: &DVector<f64>, times: usize) -> DVector<f64> {
    let len = vector.len();
    DVector::from_fn(len * times, |i, _| vector[i % len.max(1)])
}

/// Vertically stack matrices sharing a column count.
pub fn vstack(blocks: &[DMatrix<f64>]) -> Result<DMatrix<f64>, LinalgError> {
    let Some(first) = blocks.first() else {
        return Ok(DMatrix::zeros(0, 0));
    };
    let cols = first.ncols();
    let rows = blocks.iter().map(DMatrix::nrows).sum();
    let mut out = DMatrix::zeros(rows, cols);
    let mut r = 0;
    for block in blocks {
        if block.ncols() != cols {
            return Err(LinalgError::IncompatibleShapes {
                context: "vstack",
                expected: (block.nrows(), cols),
                actual: block.shape(),
            });
        }
        out.view_mut((r, 0), block.shape()).copy_from(block);
        r += block.nrows();
    }
    Ok(out)
}

/// `matrix^power` by repeated multiplication.
pub fn matrix_power(matrix: &DMatrix<f64>, power: usize) -> Result<DMatrix<f64>, LinalgError> {
    let n = ensure_square(matrix)?;
    let mut out = DMatrix::identity(n, n);
    for _ in 0..power {
        out = &out * matrix;
    }
    Ok(out)
}

/// Largest absolute entry, 0 for empty matrices.
#[must_use]
pub fn max_abs(matrix: &DMatrix<f64>) -> f64 {
    matrix.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
}
