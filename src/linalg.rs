use ndarray::prelude::*;
use tracing::trace;

use crate::{AppError, AppResult};

/// Scale every row to unit L2 norm. All-zero rows are left as they are.
#[tracing::instrument(name = "Normalizing embeddings", level = "debug", skip(data))]
pub fn normalize_rows(mut data: Array2<f64>) -> Array2<f64> {
    for mut row in data.axis_iter_mut(Axis(0)) {
        normalize_row(row.view_mut());
    }
    data
}

pub fn normalize_row(mut row: ArrayViewMut1<f64>) {
    let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        row.mapv_inplace(|v| v / norm);
    }
}

/// Squared euclidean distance between two rows.
///
/// Plain sequential accumulation: the result for a pair of rows is bit-identical no matter
/// how many other rows are processed alongside them.
pub fn squared_euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Cosine distance between two rows that are already unit-normalized.
pub fn cosine_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    (1.0 - dot).max(0.0)
}

/// Convert embedding rows into an `(n_rows, dim)` matrix.
///
/// `expected_dim` is the dimensionality a fitted model was trained with; without it the
/// first row fixes the dimensionality for the rest.
#[tracing::instrument(name = "Converting embeddings", level = "trace", skip(embs))]
pub fn embeddings_to_ndarray(
    embs: &[Vec<f32>],
    expected_dim: Option<usize>,
) -> AppResult<Array2<f64>> {
    let cols = match (expected_dim, embs.first()) {
        (Some(dim), _) => dim,
        (None, Some(first)) => first.len(),
        (None, None) => 0,
    };
    if let Some((row, emb)) = embs.iter().enumerate().find(|(_, e)| e.len() != cols) {
        return Err(AppError::DimensionMismatch {
            expected: cols,
            found: emb.len(),
            row,
        });
    }
    let mut arr: Array2<f64> = Array2::<f64>::zeros((embs.len(), cols));
    trace!("Initialized ndarray with shape: {:?}", arr.dim());
    for (i, mut row) in arr.axis_iter_mut(Axis(0)).enumerate() {
        for (j, val) in row.iter_mut().enumerate() {
            *val = embs[i][j] as f64;
        }
    }
    Ok(arr)
}

/// Reject NaN and infinite values before they poison distance computations.
pub fn ensure_finite(data: &Array2<f64>) -> AppResult<()> {
    match data
        .axis_iter(Axis(0))
        .position(|row| row.iter().any(|v| !v.is_finite()))
    {
        Some(row) => Err(AppError::NonFinite { row }),
        None => Ok(()),
    }
}

/// Fail with `DimensionMismatch` unless `data` has exactly `expected` columns.
pub fn ensure_dim(data: &Array2<f64>, expected: usize) -> AppResult<()> {
    if data.ncols() != expected {
        return Err(AppError::DimensionMismatch {
            expected,
            found: data.ncols(),
            row: 0,
        });
    }
    Ok(())
}

/// Little-endian bytes of a row, used to hash points.
pub fn row_bytes(row: ArrayView1<f64>) -> Vec<u8> {
    row.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rows_to_unit_norm_and_keeps_zero_rows() {
        let data = array![[3.0, 4.0], [0.0, 5.0], [0.0, 0.0]];
        let normed = normalize_rows(data);
        for row in normed.slice(s![..2, ..]).axis_iter(Axis(0)) {
            let norm: f64 = row.mapv(|v| v * v).sum().sqrt();
            assert!((norm - 1.0).abs() < 1e-10);
        }
        assert_eq!(normed.row(2), arr1(&[0.0, 0.0]));
    }

    #[test]
    fn distances_match_manual() {
        let a = arr1(&[0.0, 0.0]);
        let b = arr1(&[3.0, 4.0]);
        assert_eq!(squared_euclidean(a.view(), b.view()), 25.0);

        let u = arr1(&[1.0, 0.0]);
        let v = arr1(&[0.0, 1.0]);
        assert!((cosine_distance(u.view(), v.view()) - 1.0).abs() < 1e-12);
        assert_eq!(cosine_distance(u.view(), u.view()), 0.0);
    }

    #[test]
    fn converts_embeddings_to_f64_ndarray() {
        let embs = vec![vec![1.0_f32, 2.5_f32], vec![3.75_f32, -4.0_f32]];

        let arr = embeddings_to_ndarray(&embs, None).unwrap();

        assert_eq!(arr.dim(), (2, 2));
        let expected = array![[1.0_f64, 2.5_f64], [3.75_f64, -4.0_f64]];
        assert_eq!(arr, expected);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let embs = vec![vec![1.0_f32, 2.0], vec![3.0_f32]];
        match embeddings_to_ndarray(&embs, None) {
            Err(AppError::DimensionMismatch { expected, found, row }) => {
                assert_eq!((expected, found, row), (2, 1, 1));
            }
            other => panic!("expected DimensionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn expected_dim_is_enforced_and_empty_input_keeps_width() {
        let embs = vec![vec![1.0_f32, 2.0, 3.0]];
        assert!(matches!(
            embeddings_to_ndarray(&embs, Some(2)),
            Err(AppError::DimensionMismatch { expected: 2, found: 3, row: 0 })
        ));
        let empty = embeddings_to_ndarray(&[], Some(7)).unwrap();
        assert_eq!(empty.dim(), (0, 7));
    }

    #[test]
    fn non_finite_rows_are_reported() {
        let data = array![[1.0, 2.0], [f64::NAN, 0.0]];
        assert!(matches!(ensure_finite(&data), Err(AppError::NonFinite { row: 1 })));
    }
}
