use std::cmp::Ordering;

use ndarray::prelude::*;
use tracing::info_span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::linalg::{cosine_distance, squared_euclidean};
use crate::logging::progress_bar_style;
use crate::reduce::Metric;

/// k nearest reference rows for every query row, closest first.
#[derive(Debug, Clone)]
pub struct Neighbors {
    pub indices: Array2<usize>, // indices = (n_queries, k)
    pub distances: Array2<f64>, // distances = (n_queries, k)
}

impl Neighbors {
    pub fn k(&self) -> usize {
        self.indices.ncols()
    }
}

pub fn distance(metric: Metric, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    match metric {
        Metric::Cosine => cosine_distance(a, b),
        Metric::Euclidean => squared_euclidean(a, b).sqrt(),
    }
}

/// Order by distance, then by index so ties resolve the same way on every run.
fn by_distance(a: &(f64, usize), b: &(f64, usize)) -> Ordering {
    a.0.partial_cmp(&b.0)
        .unwrap_or(Ordering::Equal)
        .then(a.1.cmp(&b.1))
}

/// The `k` smallest `(distance, index)` pairs from `row_dists`, sorted ascending.
pub fn k_smallest(mut row_dists: Vec<(f64, usize)>, k: usize) -> Vec<(f64, usize)> {
    if k == 0 {
        return Vec::new();
    }
    if k < row_dists.len() {
        row_dists.select_nth_unstable_by(k - 1, by_distance);
        row_dists.truncate(k);
    }
    row_dists.sort_by(by_distance);
    row_dists
}

/// Exact brute-force neighbour search.
///
/// Every query row is handled on its own, so a row's neighbours never depend on the other
/// rows of the query batch. When `queries` is the reference set itself each point is its own
/// first neighbour.
#[tracing::instrument(
    name = "Building nearest neighbour graph",
    level = "debug",
    skip(queries, reference),
    fields(queries = queries.nrows(), reference = reference.nrows())
)]
pub fn nearest_neighbors(
    queries: &Array2<f64>,   // queries = (n_queries, dim)
    reference: &Array2<f64>, // reference = (n_reference, dim)
    k: usize,
    metric: Metric,
) -> Neighbors {
    let k = k.min(reference.nrows());
    let mut indices = Array2::<usize>::zeros((queries.nrows(), k));
    let mut distances = Array2::<f64>::zeros((queries.nrows(), k));

    let span = info_span!("Searching neighbours");
    span.pb_set_style(&progress_bar_style());
    span.pb_set_length(queries.nrows() as u64);
    span.pb_set_message("kNN");
    let _enter = span.enter();

    for (i, query) in queries.axis_iter(Axis(0)).enumerate() {
        let row_dists: Vec<(f64, usize)> = reference
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(j, other)| (distance(metric, query, other), j))
            .collect();
        for (slot, (d, j)) in k_smallest(row_dists, k).into_iter().enumerate() {
            indices[(i, slot)] = j;
            distances[(i, slot)] = d;
        }
        span.pb_inc(1);
    }

    Neighbors { indices, distances }
}
