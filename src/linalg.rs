use faer::linalg::solvers::{Llt, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{Result, SurvivalError};

const PIVOT_EPS: f64 = 1e-12;

fn to_faer(a: ArrayView2<f64>) -> Mat<f64> {
    Mat::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn to_array(m: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

fn check_square(a: ArrayView2<f64>) -> Result<()> {
    if a.nrows() != a.ncols() {
        return Err(SurvivalError::invalid_dimensions(format!(
            "expected a square matrix, got {}x{}",
            a.nrows(),
            a.ncols()
        )));
    }
    Ok(())
}

/// Solve `a x = b` with partially pivoted gaussian elimination
pub fn solve(a: ArrayView2<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return Err(SurvivalError::invalid_dimensions("matrix dimensions mismatch"));
    }

    let mut a = a.to_owned();
    let mut b = b.to_owned();

    for i in 0..n {
        let pivot = (i..n)
            .max_by(|&r, &s| a[[r, i]].abs().total_cmp(&a[[s, i]].abs()))
            .unwrap_or(i);

        if a[[pivot, i]].abs() < PIVOT_EPS {
            return Err(SurvivalError::singular(format!("zero pivot in column {i}")));
        }

        if pivot != i {
            for j in 0..n {
                a.swap([i, j], [pivot, j]);
            }
            b.swap(i, pivot);
        }

        for k in i + 1..n {
            let factor = a[[k, i]] / a[[i, i]];
            for j in i..n {
                a[[k, j]] -= factor * a[[i, j]];
            }
            b[k] -= factor * b[i];
        }
    }

    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let tail: f64 = (i + 1..n).map(|j| a[[i, j]] * x[j]).sum();
        x[i] = (b[i] - tail) / a[[i, i]];
    }

    Ok(x)
}

/// faer LLT, rejecting pivots that are tiny relative to the diagonal
fn llt(a: ArrayView2<f64>) -> Result<Llt<f64>> {
    check_square(a)?;
    let factor = to_faer(a)
        .as_ref()
        .llt(Side::Lower)
        .map_err(|e| SurvivalError::singular(format!("matrix not positive definite: {e:?}")))?;

    let l = factor.L();
    for j in 0..l.nrows() {
        let pivot = l[(j, j)] * l[(j, j)];
        if !pivot.is_finite() || pivot <= PIVOT_EPS * a[[j, j]].abs().max(1.0) {
            return Err(SurvivalError::singular(format!(
                "matrix not positive definite at column {j}"
            )));
        }
    }
    Ok(factor)
}

/// lower cholesky factor of a symmetric positive definite matrix
pub fn cholesky(a: ArrayView2<f64>) -> Result<Array2<f64>> {
    let factor = llt(a)?;
    let l = factor.L();
    Ok(Array2::from_shape_fn((l.nrows(), l.ncols()), |(i, j)| if j <= i { l[(i, j)] } else { 0.0 }))
}

/// inverse of a symmetric positive definite matrix, symmetrised
pub fn inverse_spd(a: ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    let factor = llt(a)?;
    let identity = Mat::<f64>::identity(n, n);
    let inverse = to_array(factor.solve(identity.as_ref()).as_ref());
    Ok((&inverse + &inverse.t()) * 0.5)
}

/// eigenvalues (ascending) and matching eigenvectors as columns
pub fn symmetric_eigen(a: ArrayView2<f64>) -> Result<(Array1<f64>, Array2<f64>)> {
    check_square(a)?;
    let eigen = to_faer(a)
        .as_ref()
        .self_adjoint_eigen(Side::Lower)
        .map_err(|e| SurvivalError::numerical_error(format!("eigendecomposition failed: {e:?}")))?;

    let diagonal = eigen.S().column_vector().as_mat();
    let values: Vec<f64> = (0..diagonal.nrows()).map(|i| diagonal[(i, 0)]).collect();
    let vectors = to_array(eigen.U());

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));
    let sorted = order.iter().map(|&i| values[i]).collect();
    Ok((sorted, vectors.select(ndarray::Axis(1), &order)))
}

/// eigenvalues of a symmetric matrix, ascending
pub fn symmetric_eigenvalues(a: ArrayView2<f64>) -> Result<Vec<f64>> {
    let (values, _) = symmetric_eigen(a)?;
    Ok(values.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_solve() {
        let a = array![[0.0, 2.0], [3.0, 1.0]]; // needs a row swap
        let b = array![4.0, 5.0];
        let x = solve(a.view(), b.view()).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_singular() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let b = array![1.0, 2.0];
        assert!(solve(a.view(), b.view()).is_err());
    }

    #[test]
    fn test_inverse_spd() {
        let a = array![[4.0, 2.0, 0.6], [2.0, 5.0, 1.0], [0.6, 1.0, 3.0]];
        let inv = inverse_spd(a.view()).unwrap();
        let eye = a.dot(&inv);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(eye[[i, j]], expected, epsilon = 1e-10);
                assert_eq!(inv[[i, j]], inv[[j, i]]);
            }
        }
    }

    #[test]
    fn test_cholesky_reconstructs() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let l = cholesky(a.view()).unwrap();
        assert_relative_eq!(l[[0, 0]], 2.0, epsilon = 1e-12);
        assert_relative_eq!(l[[0, 1]], 0.0);
        let back = l.dot(&l.t());
        for (x, y) in back.iter().zip(a.iter()) {
            assert_relative_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_cholesky_rejects_indefinite() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(cholesky(a.view()).is_err());
        let singular = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(inverse_spd(singular.view()).is_err());
    }

    #[test]
    fn test_eigenvalues() {
        let a = array![[2.0, 1.0], [1.0, 2.0]];
        let values = symmetric_eigenvalues(a.view()).unwrap();
        assert_relative_eq!(values[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(values[1], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_eigenvalues_of_rank_one() {
        let a = array![[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [3.0, 6.0, 9.0]];
        let values = symmetric_eigenvalues(a.view()).unwrap();
        assert!(values[0].abs() < 1e-10 && values[1].abs() < 1e-10);
        assert_relative_eq!(values[2], 14.0, epsilon = 1e-10);
    }

    #[test]
    fn test_eigenvectors() {
        let a = array![[2.0, 1.0], [1.0, 2.0]];
        let (values, vectors) = symmetric_eigen(a.view()).unwrap();
        for j in 0..2 {
            let v = vectors.column(j);
            let av = a.dot(&v);
            for i in 0..2 {
                assert_relative_eq!(av[i], values[j] * v[i], epsilon = 1e-10);
            }
            assert_relative_eq!(v.dot(&v), 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_non_square_rejected() {
        let a = Array2::<f64>::zeros((2, 3));
        assert!(symmetric_eigenvalues(a.view()).is_err());
        assert!(cholesky(a.view()).is_err());
    }
}
