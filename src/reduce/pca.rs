use ndarray::prelude::*;
use ndarray_linalg::SVD;

use crate::{AppError, AppResult};

/// Project `data` onto its first `n_components` principal axes.
#[tracing::instrument(name = "Performing PCA", level = "debug", skip(data))]
pub fn pca_reduce(data: &Array2<f64>, n_components: usize) -> AppResult<Array2<f64>> {
    let mean: Array1<f64> = data.mean_axis(Axis(0)).ok_or(AppError::EmptyCorpus)?;
    let centered: Array2<f64> = data - &mean;
    let (_, _, vt) = centered.svd(false, true)?;
    let vt = vt.ok_or_else(|| AppError::Other("SVD returned no right singular vectors".into()))?;
    let n_components = n_components.min(vt.nrows());
    let components: Array2<f64> = vt.slice(s![0..n_components, ..]).t().to_owned();
    Ok(centered.dot(&components))
}
