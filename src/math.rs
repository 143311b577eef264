use faer::{Mat, Side};
use itertools::izip;
use multiversion::multiversion;

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).fold(0f64, |acc, (x, y)| acc + x * y)
}

/// `y += L * eps` for a lower triangular `L` stored row major.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn lower_triangular_mul_add(factor: &[f64], eps: &[f64], y: &mut [f64]) {
    let n = y.len();
    assert!(eps.len() == n);
    assert!(factor.len() == n * n);

    factor
        .chunks_exact(n)
        .zip(y.iter_mut())
        .enumerate()
        .for_each(|(i, (row, y))| {
            *y += vector_dot(&row[..=i], &eps[..=i]);
        });
}

/// Lower Cholesky factor of a symmetric positive definite matrix.
///
/// Returns `None` if the matrix is not positive definite.
pub(crate) fn cholesky_lower(mat: &Mat<f64>) -> Option<Mat<f64>> {
    let llt = mat.llt(Side::Lower).ok()?;
    let factor = llt.L().to_owned();
    if !mat_all_finite(&factor) {
        return None;
    }
    Some(factor)
}

/// Copy a square matrix into a row major buffer.
pub(crate) fn write_row_major(mat: &Mat<f64>, out: &mut [f64]) {
    let n = mat.nrows();
    assert!(mat.ncols() == n);
    assert!(out.len() == n * n);
    out.chunks_exact_mut(n).enumerate().for_each(|(i, row)| {
        row.iter_mut()
            .enumerate()
            .for_each(|(j, val)| *val = mat[(i, j)]);
    });
}

/// Numerical rank of a symmetric matrix.
pub(crate) fn symmetric_rank(mat: &Mat<f64>) -> Option<usize> {
    let n = mat.nrows();
    if n == 0 {
        return Some(0);
    }
    let eig = mat.self_adjoint_eigen(Side::Lower).ok()?;
    let vals = eig.S().column_vector().to_owned();
    let largest = vals.iter().fold(0f64, |acc, val| acc.max(val.abs()));
    if largest == 0. {
        return Some(0);
    }
    let tol = (n as f64) * f64::EPSILON * largest;
    Some(vals.iter().filter(|val| val.abs() > tol).count())
}

/// `(X^T X)^-1` through the eigendecomposition of `X^T X`.
pub(crate) fn xtx_inverse(x: &Mat<f64>) -> Option<Mat<f64>> {
    let xtx = x.transpose() * x;
    let eig = xtx.self_adjoint_eigen(Side::Lower).ok()?;
    let u = eig.U();
    let mut vals = eig.S().column_vector().to_owned();
    if vals.iter().any(|&val| val <= 0.) {
        return None;
    }
    vals.iter_mut().for_each(|val| *val = val.recip());
    Some(u * vals.into_diagonal() * u.transpose())
}

pub(crate) fn mat_all_finite(mat: &Mat<f64>) -> bool {
    (0..mat.nrows()).all(|i| (0..mat.ncols()).all(|j| mat[(i, j)].is_finite()))
}
