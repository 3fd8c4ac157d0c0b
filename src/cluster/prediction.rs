//! Density summaries kept from fitting, used to place new points without refitting.

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info_span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::linalg::squared_euclidean;
use crate::logging::progress_bar_style;
use crate::reduce::Metric;
use crate::reduce::knn::{k_smallest, nearest_neighbors};

/// Density summary of one cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterSummary {
    pub size: usize,
    /// Smallest core distance among the members, i.e. the density at the cluster's heart.
    pub min_core: f64,
    /// Largest mutual reachability a member needs to reach its closest fellow member.
    pub reach: f64,
}

/// Distance to the `min_samples`-th nearest training point, the point itself included.
pub fn core_distances(points: &Array2<f64>, min_samples: usize) -> Array1<f64> {
    let knn = nearest_neighbors(points, points, min_samples.max(1), Metric::Euclidean);
    let last = knn.k().saturating_sub(1);
    knn.distances.column(last).to_owned()
}

pub fn mutual_reachability(core_a: f64, core_b: f64, distance: f64) -> f64 {
    core_a.max(core_b).max(distance)
}

/// Per-cluster summaries for `n_clusters` contiguous labels. Noise (`-1`) is ignored.
#[tracing::instrument(name = "Summarizing clusters", level = "debug", skip_all)]
pub fn summarize(
    points: &Array2<f64>,
    labels: &[i32],
    core: &Array1<f64>,
    n_clusters: usize,
) -> Vec<ClusterSummary> {
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_clusters];
    for (i, &label) in labels.iter().enumerate() {
        if label >= 0 {
            members[label as usize].push(i);
        }
    }

    let span = info_span!("Measuring cluster reach");
    span.pb_set_style(&progress_bar_style());
    span.pb_set_length(n_clusters as u64);
    let _enter = span.enter();

    members
        .iter()
        .map(|idx| {
            let min_core = idx.iter().map(|&i| core[i]).fold(f64::INFINITY, f64::min);
            let reach = idx
                .iter()
                .map(|&i| {
                    idx.iter()
                        .filter(|&&j| j != i)
                        .map(|&j| {
                            let d = squared_euclidean(points.row(i), points.row(j)).sqrt();
                            mutual_reachability(core[i], core[j], d)
                        })
                        .fold(f64::INFINITY, f64::min)
                })
                .filter(|r| r.is_finite())
                .fold(0.0, f64::max);
            span.pb_inc(1);
            ClusterSummary {
                size: idx.len(),
                min_core: if min_core.is_finite() { min_core } else { 0.0 },
                reach: if idx.len() > 1 { reach } else { min_core.max(0.0) },
            }
        })
        .collect()
}

/// `densest / distance` clamped to `[0, 1]`; a zero distance is full membership.
pub fn strength(densest: f64, distance: f64) -> f64 {
    if distance <= 0.0 {
        1.0
    } else {
        (densest / distance).clamp(0.0, 1.0)
    }
}

/// Nearest training point to `query` under mutual reachability.
///
/// Returns `(index, mutual_reachability)`. Ties go to the smaller raw distance, then the
/// smaller index.
pub fn nearest_by_reachability(
    query: ArrayView1<f64>,
    points: &Array2<f64>,
    core: &Array1<f64>,
    min_samples: usize,
) -> Option<(usize, f64)> {
    let raw: Vec<(f64, usize)> = points
        .axis_iter(Axis(0))
        .enumerate()
        .map(|(j, p)| (squared_euclidean(query, p).sqrt(), j))
        .collect();
    let own_core = k_smallest(raw.clone(), min_samples.max(1))
        .last()
        .map(|(d, _)| *d)?;

    raw.into_iter()
        .map(|(d, j)| (mutual_reachability(own_core, core[j], d), d, j))
        .min_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.total_cmp(&b.1))
                .then(a.2.cmp(&b.2))
        })
        .map(|(mr, _, j)| (j, mr))
}
