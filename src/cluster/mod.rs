//! Density-based clusterer over the manifold reducer's output.
//!
//! Training goes through HDBSCAN. Assignment of new points is approximate: the fitted
//! hierarchy is not kept, instead every training point's core distance and every cluster's
//! density summary are, and a new point joins the cluster of its nearest training point under
//! mutual reachability if that link is no longer than the cluster's own internal links.

pub(crate) mod prediction;

use std::collections::BTreeSet;

use hdbscan::{DistanceMetric, Hdbscan, HdbscanHyperParams, NnAlgorithm};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cluster::prediction::{
    ClusterSummary, core_distances, nearest_by_reachability, strength, summarize,
};
use crate::linalg::{ensure_dim, ensure_finite};
use crate::{AppError, AppResult};

/// Label of points that belong to no cluster.
pub const NOISE: i32 = -1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClustererParams {
    pub min_cluster_size: usize,
    pub min_samples: usize,
    pub cluster_selection_epsilon: f64,
}

impl Default for ClustererParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 250,
            min_samples: 5,
            cluster_selection_epsilon: 0.0,
        }
    }
}

impl ClustererParams {
    pub fn validate(&self) -> AppResult<()> {
        if self.min_cluster_size < 2 || self.min_samples == 0 {
            return Err(AppError::Other(
                "invalid clusterer parameters: min_cluster_size must be at least 2 and \
                 min_samples at least 1"
                    .into(),
            ));
        }
        if self.cluster_selection_epsilon < 0.0 {
            return Err(AppError::Other(
                "invalid clusterer parameters: cluster_selection_epsilon must not be negative"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Fewest points a fit accepts. Core distances need `min_samples` neighbours, the point
    /// itself included.
    pub fn min_points(&self) -> usize {
        self.min_cluster_size.max(self.min_samples)
    }

    pub(crate) fn insufficient(&self, points: usize) -> AppError {
        AppError::InsufficientData {
            points,
            min_cluster_size: self.min_cluster_size,
            min_samples: self.min_samples,
        }
    }
}

/// Cluster of one point. `label` is `-1` for noise; `strength` lies in `[0, 1]` and is 0 for
/// noise.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub label: i32,
    pub strength: f64,
}

impl Assignment {
    pub fn noise() -> Self {
        Self {
            label: NOISE,
            strength: 0.0,
        }
    }

    pub fn is_noise(&self) -> bool {
        self.label == NOISE
    }
}

/// A fitted clusterer together with the data it needs for approximate prediction.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Clusterer {
    params: ClustererParams,
    points: Array2<f64>, // points = (n_samples, n_components)
    labels: Vec<i32>,
    core: Array1<f64>,
    strengths: Vec<f64>,
    clusters: Vec<ClusterSummary>,
    reducer_fingerprint: u128,
}

/// Renumber cluster ids to `0..n` keeping their relative order; anything negative is noise.
fn normalize_labels(raw: &[i32]) -> (Vec<i32>, usize) {
    let ids: Vec<i32> = raw
        .iter()
        .copied()
        .filter(|&l| l >= 0)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let labels = raw
        .iter()
        .map(|l| match ids.binary_search(l) {
            Ok(rank) if *l >= 0 => rank as i32,
            _ => NOISE,
        })
        .collect();
    (labels, ids.len())
}

impl Clusterer {
    /// Fit on reduced points and return the clusterer with the training labels.
    #[tracing::instrument(
        name = "Clustering",
        level = "info",
        skip(points, params, reducer_fingerprint),
        fields(n = points.nrows(), min_cluster_size = params.min_cluster_size)
    )]
    pub fn fit(
        points: &Array2<f64>,
        params: &ClustererParams,
        reducer_fingerprint: u128,
    ) -> AppResult<(Self, Vec<i32>)> {
        params.validate()?;
        if points.nrows() < params.min_points() {
            return Err(params.insufficient(points.nrows()));
        }
        ensure_finite(points)?;

        let hyper_params = HdbscanHyperParams::builder()
            .min_cluster_size(params.min_cluster_size)
            .min_samples(params.min_samples)
            .epsilon(params.cluster_selection_epsilon)
            .dist_metric(DistanceMetric::Euclidean)
            .nn_algorithm(NnAlgorithm::Auto)
            .build();
        let rows = points
            .axis_iter(Axis(0))
            .map(|row| row.to_vec())
            .collect::<Vec<Vec<f64>>>();
        let raw = Hdbscan::new(&rows, hyper_params).cluster()?;
        let (labels, n_clusters) = normalize_labels(&raw);

        let core = core_distances(points, params.min_samples);
        let clusters = summarize(points, &labels, &core, n_clusters);
        let strengths = labels
            .iter()
            .zip(core.iter())
            .map(|(&label, &c)| match label {
                NOISE => 0.0,
                l => strength(clusters[l as usize].min_core, c),
            })
            .collect();

        let noise = labels.iter().filter(|&&l| l == NOISE).count();
        info!(
            "Found {} clusters in {} points ({} noise)",
            n_clusters,
            labels.len(),
            noise
        );
        debug!("Cluster sizes: {:?}", clusters.iter().map(|c| c.size).collect::<Vec<_>>());

        let clusterer = Self {
            params: params.clone(),
            points: points.clone(),
            labels: labels.clone(),
            core,
            strengths,
            clusters,
            reducer_fingerprint,
        };
        Ok((clusterer, labels))
    }

    /// Assign reduced points to the fitted clusters without refitting.
    #[tracing::instrument(
        name = "Predicting clusters",
        level = "debug",
        skip_all,
        fields(n = points.nrows())
    )]
    pub fn approximate_predict(&self, points: &Array2<f64>) -> AppResult<Vec<Assignment>> {
        ensure_dim(points, self.points.ncols())?;
        ensure_finite(points)?;
        Ok(points
            .axis_iter(Axis(0))
            .map(|query| self.predict_one(query))
            .collect())
    }

    fn predict_one(&self, query: ArrayView1<f64>) -> Assignment {
        if let Some(i) = self
            .points
            .axis_iter(Axis(0))
            .position(|p| p == query)
        {
            return Assignment {
                label: self.labels[i],
                strength: self.strengths[i],
            };
        }

        let Some((nearest, mr)) =
            nearest_by_reachability(query, &self.points, &self.core, self.params.min_samples)
        else {
            return Assignment::noise();
        };
        match self.labels[nearest] {
            NOISE => Assignment::noise(),
            label => {
                let cluster = &self.clusters[label as usize];
                if mr > cluster.reach {
                    Assignment::noise()
                } else {
                    Assignment {
                        label,
                        strength: strength(cluster.min_core, mr),
                    }
                }
            }
        }
    }

    pub fn params(&self) -> &ClustererParams {
        &self.params
    }

    pub fn n_clusters(&self) -> usize {
        self.clusters.len()
    }

    pub fn training_labels(&self) -> &[i32] {
        &self.labels
    }

    /// Width of the points this clusterer accepts.
    pub fn input_dim(&self) -> usize {
        self.points.ncols()
    }

    /// Fingerprint of the reducer whose output this clusterer was fit on.
    pub fn reducer_fingerprint(&self) -> u128 {
        self.reducer_fingerprint
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        self.clusters.iter().map(|c| c.size).collect()
    }
}
