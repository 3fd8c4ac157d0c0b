//! Fuzzy simplicial set construction: per-point distance normalisation, membership strengths
//! and the symmetric union of the directed neighbour graph.

use std::collections::BTreeMap;

use ndarray::prelude::*;

use crate::reduce::knn::Neighbors;

const SMOOTH_K_TOLERANCE: f64 = 1e-5;
const MIN_K_DIST_SCALE: f64 = 1e-3;
const BINARY_SEARCH_STEPS: usize = 64;

/// Weighted, directed edge of the neighbour graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub head: usize,
    pub tail: usize,
    pub weight: f64,
}

/// Per-point `(sigma, rho)`.
///
/// `rho` is the distance to the `local_connectivity`-th nearest non-identical neighbour,
/// `sigma` is found by binary search so that the smoothed membership of the neighbours sums to
/// `log2(k)`. `fallback_mean` floors `sigma` for points with `rho == 0`; it is passed in rather
/// than computed from `distances` so that points can be processed one at a time.
pub fn smooth_knn_dist(
    distances: &Array2<f64>, // distances = (n_points, k), ascending per row
    k: f64,
    local_connectivity: f64,
    fallback_mean: f64,
) -> (Array1<f64>, Array1<f64>) {
    let n = distances.nrows();
    let target = k.log2();
    let mut sigmas = Array1::<f64>::zeros(n);
    let mut rhos = Array1::<f64>::zeros(n);

    for (i, row) in distances.axis_iter(Axis(0)).enumerate() {
        let non_zero: Vec<f64> = row.iter().copied().filter(|&d| d > 0.0).collect();
        let index = local_connectivity.floor() as usize;
        let interpolation = local_connectivity - index as f64;
        let rho = if non_zero.len() as f64 >= local_connectivity {
            if index > 0 {
                let mut rho = non_zero[index - 1];
                if interpolation > SMOOTH_K_TOLERANCE && index < non_zero.len() {
                    rho += interpolation * (non_zero[index] - non_zero[index - 1]);
                }
                rho
            } else if let Some(first) = non_zero.first() {
                interpolation * first
            } else {
                0.0
            }
        } else {
            non_zero.iter().copied().fold(0.0, f64::max)
        };

        let (mut lo, mut hi, mut mid) = (0.0_f64, f64::INFINITY, 1.0_f64);
        for _ in 0..BINARY_SEARCH_STEPS {
            let psum: f64 = row
                .iter()
                .skip(1)
                .map(|&d| {
                    let d = d - rho;
                    if d > 0.0 { (-d / mid).exp() } else { 1.0 }
                })
                .sum();
            if (psum - target).abs() < SMOOTH_K_TOLERANCE {
                break;
            }
            if psum > target {
                hi = mid;
                mid = (lo + hi) / 2.0;
            } else {
                lo = mid;
                mid = if hi == f64::INFINITY { mid * 2.0 } else { (lo + hi) / 2.0 };
            }
        }

        let floor = if rho > 0.0 {
            MIN_K_DIST_SCALE * row.mean().unwrap_or(0.0)
        } else {
            MIN_K_DIST_SCALE * fallback_mean
        };
        sigmas[i] = mid.max(floor);
        rhos[i] = rho;
    }

    (sigmas, rhos)
}

/// Membership strength of the edge from point `i` to a neighbour at distance `d`.
pub fn membership(d: f64, sigma: f64, rho: f64) -> f64 {
    if d - rho <= 0.0 || sigma == 0.0 {
        1.0
    } else {
        (-(d - rho) / sigma).exp()
    }
}

/// Directed membership edges of the kNN graph. Self edges are dropped.
pub fn membership_strengths(
    knn: &Neighbors,
    sigmas: &Array1<f64>,
    rhos: &Array1<f64>,
) -> Vec<Edge> {
    let mut edges = Vec::with_capacity(knn.indices.len());
    for ((i, slot), &j) in knn.indices.indexed_iter() {
        if j == i {
            continue;
        }
        let weight = membership(knn.distances[(i, slot)], sigmas[i], rhos[i]);
        if weight > 0.0 {
            edges.push(Edge {
                head: i,
                tail: j,
                weight,
            });
        }
    }
    edges
}

/// Probabilistic union `w_ij + w_ji - w_ij * w_ji`, emitted in both directions and in a fixed
/// order.
pub fn fuzzy_union(edges: &[Edge]) -> Vec<Edge> {
    let directed: BTreeMap<(usize, usize), f64> =
        edges.iter().map(|e| ((e.head, e.tail), e.weight)).collect();
    let mut symmetric: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for (&(i, j), &w) in &directed {
        let transpose = directed.get(&(j, i)).copied().unwrap_or(0.0);
        let union = w + transpose - w * transpose;
        symmetric.insert((i, j), union);
        symmetric.insert((j, i), union);
    }
    symmetric
        .into_iter()
        .filter(|(_, w)| *w > 0.0)
        .map(|((head, tail), weight)| Edge { head, tail, weight })
        .collect()
}
