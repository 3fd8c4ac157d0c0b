//! Manifold reducer: a fitted neighbour-embedding transform from the D-dimensional embedding
//! space to a small number of components.
//!
//! The same type backs both trained reducers. The clustering reducer packs points tightly
//! (`min_dist = 0`) into 20 components so that density-based clustering sees well separated
//! blobs; the visualization reducer spreads points out in 2 components for plotting and is
//! never used for assignment.

pub(crate) mod fuzzy;
pub(crate) mod knn;
pub(crate) mod layout;
pub(crate) mod pca;

use std::fmt::Display;
use std::io::Cursor;

use clap::ValueEnum;
use murmur3::murmur3_x86_128;
use ndarray::prelude::*;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::linalg::{ensure_dim, ensure_finite, normalize_rows, row_bytes};
use crate::logging::progress_bar_style;
use crate::reduce::fuzzy::{Edge, fuzzy_union, membership, membership_strengths, smooth_knn_dist};
use crate::reduce::layout::{
    LayoutParams, find_ab_params, initial_layout, optimize_embedding, optimize_point, schedule,
};
use crate::{AppError, AppResult};

/// Distance used to build the neighbour graph in the input space.
#[derive(Serialize, Deserialize, ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    Euclidean,
}

impl Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Cosine => write!(f, "cosine"),
            Metric::Euclidean => write!(f, "euclidean"),
        }
    }
}

/// Hyperparameters of a reducer. Fixed for the lifetime of the fitted model.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReducerParams {
    pub n_neighbors: usize,
    pub n_components: usize,
    pub min_dist: f64,
    pub spread: f64,
    pub metric: Metric,
    /// Layout epochs; `None` picks 500 for corpora up to 10 000 points and 200 above.
    pub n_epochs: Option<usize>,
    pub learning_rate: f64,
    pub negative_sample_rate: usize,
    pub repulsion_strength: f64,
    pub local_connectivity: f64,
    /// Without a seed one is drawn at fit time and stored, so transforms stay deterministic
    /// but two training runs differ.
    pub seed: Option<u64>,
}

impl ReducerParams {
    /// Defaults of the reducer the clusterer works on.
    pub fn manifold() -> Self {
        Self {
            n_neighbors: 30,
            n_components: 20,
            min_dist: 0.0,
            ..Self::base()
        }
    }

    /// Defaults of the 2-D plotting reducer.
    pub fn visual() -> Self {
        Self {
            n_neighbors: 15,
            n_components: 2,
            min_dist: 0.1,
            ..Self::base()
        }
    }

    fn base() -> Self {
        Self {
            n_neighbors: 15,
            n_components: 2,
            min_dist: 0.1,
            spread: 1.0,
            metric: Metric::Cosine,
            n_epochs: None,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            repulsion_strength: 1.0,
            local_connectivity: 1.0,
            seed: None,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        let invalid =
            |msg: &str| Err(AppError::Other(format!("invalid reducer parameters: {msg}")));
        if self.n_neighbors < 2 {
            return invalid("n_neighbors must be at least 2");
        }
        if self.n_components == 0 {
            return invalid("n_components must be at least 1");
        }
        if self.spread <= 0.0 || self.min_dist < 0.0 || self.min_dist > self.spread {
            return invalid("min_dist must lie in [0, spread] and spread must be positive");
        }
        if self.negative_sample_rate == 0 || self.learning_rate <= 0.0 {
            return invalid("negative_sample_rate and learning_rate must be positive");
        }
        Ok(())
    }

    fn fit_epochs(&self, n_samples: usize) -> usize {
        self.n_epochs
            .unwrap_or(if n_samples <= 10_000 { 500 } else { 200 })
    }

    fn transform_epochs(&self, n_samples: usize) -> usize {
        match self.n_epochs {
            Some(epochs) => epochs / 3,
            None if n_samples <= 10_000 => 100,
            None => 30,
        }
    }
}

impl Default for ReducerParams {
    fn default() -> Self {
        Self::manifold()
    }
}

/// A fitted reducer. Keeps the (metric-prepared) training vectors and their layout, which
/// new points are positioned against.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ManifoldReducer {
    params: ReducerParams,
    seed: u64,
    a: f64,
    b: f64,
    input_dim: usize,
    mean_knn_distance: f64,
    training: Array2<f64>,  // training = (n_samples, input_dim)
    embedding: Array2<f64>, // embedding = (n_samples, n_components)
    fingerprint: u128,
}

/// Rows as the metric expects them: unit length for cosine, untouched for euclidean.
fn prepare(data: &Array2<f64>, metric: Metric) -> Array2<f64> {
    match metric {
        Metric::Cosine => normalize_rows(data.clone()),
        Metric::Euclidean => data.clone(),
    }
}

impl ManifoldReducer {
    /// Fit on the corpus `(n_samples, dim)`.
    #[tracing::instrument(
        name = "Fitting reducer",
        level = "info",
        skip(data, params),
        fields(
            n = data.nrows(),
            dim = data.ncols(),
            components = params.n_components,
            neighbors = params.n_neighbors
        )
    )]
    pub fn fit(data: &Array2<f64>, params: &ReducerParams) -> AppResult<Self> {
        if data.nrows() == 0 {
            return Err(AppError::EmptyCorpus);
        }
        params.validate()?;
        ensure_finite(data)?;

        let seed = params
            .seed
            .unwrap_or_else(|| ndarray_rand::rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);
        let training = prepare(data, params.metric);
        let n = training.nrows();
        let k = params.n_neighbors.min(n);

        let graph = knn::nearest_neighbors(&training, &training, k, params.metric);
        let mean_knn_distance = graph.distances.mean().unwrap_or(0.0);
        let (sigmas, rhos) = smooth_knn_dist(
            &graph.distances,
            k as f64,
            params.local_connectivity,
            mean_knn_distance,
        );
        let edges = fuzzy_union(&membership_strengths(&graph, &sigmas, &rhos));
        debug!("Fuzzy neighbour graph has {} edges", edges.len());

        let (a, b) = find_ab_params(params.spread, params.min_dist);
        let layout_params = LayoutParams {
            a,
            b,
            repulsion_strength: params.repulsion_strength,
            learning_rate: params.learning_rate,
            negative_sample_rate: params.negative_sample_rate as f64,
            n_epochs: params.fit_epochs(n),
        };
        let mut embedding = initial_layout(&training, params.n_components, &mut rng)?;
        optimize_embedding(
            &mut embedding,
            &schedule(&edges, layout_params.n_epochs),
            &layout_params,
            &mut rng,
        );

        let fingerprint = fingerprint(params, seed, &embedding)?;
        info!(
            "Fitted {}-component reducer on {} points (seed {})",
            params.n_components, n, seed
        );
        Ok(Self {
            params: params.clone(),
            seed,
            a,
            b,
            input_dim: data.ncols(),
            mean_knn_distance,
            training,
            embedding,
            fingerprint,
        })
    }

    /// Position new points `(n_points, input_dim)` in the fitted layout. Never refits.
    ///
    /// Each row is placed independently with an RNG seeded from the model seed and the row
    /// itself, so the output for a row is the same whichever batch it arrives in.
    #[tracing::instrument(
        name = "Transforming batch",
        level = "debug",
        skip(self, data),
        fields(n = data.nrows(), components = self.params.n_components)
    )]
    pub fn transform(&self, data: &Array2<f64>) -> AppResult<Array2<f64>> {
        ensure_dim(data, self.input_dim)?;
        ensure_finite(data)?;
        let queries = prepare(data, self.params.metric);
        let n_components = self.params.n_components;
        let mut out = Array2::<f64>::zeros((queries.nrows(), n_components));
        if queries.nrows() == 0 {
            return Ok(out);
        }

        let k = self.params.n_neighbors.min(self.training.nrows());
        let neighbors = knn::nearest_neighbors(&queries, &self.training, k, self.params.metric);
        let (sigmas, rhos) = smooth_knn_dist(
            &neighbors.distances,
            k as f64,
            (self.params.local_connectivity - 1.0).max(0.0),
            self.mean_knn_distance,
        );
        let layout_params = LayoutParams {
            a: self.a,
            b: self.b,
            repulsion_strength: self.params.repulsion_strength,
            learning_rate: self.params.learning_rate,
            negative_sample_rate: self.params.negative_sample_rate as f64,
            n_epochs: self.params.transform_epochs(self.training.nrows()),
        };

        let span = info_span!("Placing new points");
        span.pb_set_style(&progress_bar_style());
        span.pb_set_length(queries.nrows() as u64);
        let _enter = span.enter();

        for (i, mut out_row) in out.axis_iter_mut(Axis(0)).enumerate() {
            let mut edges: Vec<Edge> = (0..k)
                .map(|slot| Edge {
                    head: i,
                    tail: neighbors.indices[(i, slot)],
                    weight: membership(neighbors.distances[(i, slot)], sigmas[i], rhos[i]),
                })
                .collect();
            let total: f64 = edges.iter().map(|e| e.weight).sum();
            for edge in edges.iter_mut() {
                edge.weight = if total > 0.0 { edge.weight / total } else { 1.0 / k as f64 };
            }

            let mut point = Array1::<f64>::zeros(n_components);
            for edge in &edges {
                point.scaled_add(edge.weight, &self.embedding.row(edge.tail));
            }

            let mut rng = StdRng::seed_from_u64(self.point_seed(queries.row(i))?);
            optimize_point(
                &mut point,
                &schedule(&edges, layout_params.n_epochs),
                &self.embedding,
                &layout_params,
                &mut rng,
            );
            out_row.assign(&point);
            span.pb_inc(1);
        }
        Ok(out)
    }

    fn point_seed(&self, row: ArrayView1<f64>) -> AppResult<u64> {
        let hash = murmur3_x86_128(&mut Cursor::new(row_bytes(row)), self.seed as u32)?;
        Ok((hash as u64) ^ self.seed)
    }

    pub fn params(&self) -> &ReducerParams {
        &self.params
    }

    /// Seed actually used for fitting (configured or drawn).
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Dimensionality D every input must have.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn n_components(&self) -> usize {
        self.params.n_components
    }

    pub fn n_samples(&self) -> usize {
        self.training.nrows()
    }

    /// Layout of the training points found during fitting.
    pub fn embedding(&self) -> &Array2<f64> {
        &self.embedding
    }

    /// Curve parameters `(a, b)`.
    pub fn curve_params(&self) -> (f64, f64) {
        (self.a, self.b)
    }

    /// Identity of this fitted reducer; a clusterer records it at fit time.
    pub fn fingerprint(&self) -> u128 {
        self.fingerprint
    }
}

fn fingerprint(params: &ReducerParams, seed: u64, embedding: &Array2<f64>) -> AppResult<u128> {
    let mut bytes = serde_json::to_vec(params)?;
    bytes.extend(seed.to_le_bytes());
    bytes.extend(embedding.iter().flat_map(|v| v.to_le_bytes()));
    Ok(murmur3_x86_128(&mut Cursor::new(bytes), 0)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray_rand::RandomExt;
    use ndarray_rand::rand_distr::Normal;

    /// `per_blob` points around each of `n_blobs` random centres far from the origin.
    pub(crate) fn blobs(
        n_blobs: usize,
        per_blob: usize,
        dim: usize,
        seed: u64,
    ) -> (Array2<f64>, Vec<usize>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let spread = Normal::new(0.0, 10.0).unwrap();
        let centres = Array2::<f64>::random_using((n_blobs, dim), spread, &mut rng);
        let noise = Normal::new(0.0, 0.5).unwrap();
        let mut data = Array2::<f64>::zeros((n_blobs * per_blob, dim));
        let mut truth = Vec::with_capacity(n_blobs * per_blob);
        for (i, mut row) in data.axis_iter_mut(Axis(0)).enumerate() {
            let blob = i % n_blobs;
            let jitter = Array1::<f64>::random_using(dim, noise, &mut rng);
            row.assign(&(&centres.row(blob) + &jitter));
            truth.push(blob);
        }
        (data, truth)
    }

    pub(crate) fn quick_params(n_components: usize) -> ReducerParams {
        ReducerParams {
            n_neighbors: 10,
            n_components,
            n_epochs: Some(60),
            seed: Some(42),
            ..ReducerParams::manifold()
        }
    }

    #[test]
    fn defaults_match_the_two_reducer_roles() {
        let m = ReducerParams::manifold();
        assert_eq!(
            (m.n_neighbors, m.n_components, m.min_dist, m.metric),
            (30, 20, 0.0, Metric::Cosine)
        );
        let v = ReducerParams::visual();
        assert_eq!(
            (v.n_neighbors, v.n_components, v.min_dist, v.metric),
            (15, 2, 0.1, Metric::Cosine)
        );
    }

    #[test]
    fn empty_corpus_is_rejected() {
        let data = Array2::<f64>::zeros((0, 8));
        assert!(matches!(
            ManifoldReducer::fit(&data, &quick_params(2)),
            Err(AppError::EmptyCorpus)
        ));
    }

    #[test]
    fn transform_rejects_wrong_dimension() {
        let (data, _) = blobs(2, 15, 6, 3);
        let reducer = ManifoldReducer::fit(&data, &quick_params(3)).unwrap();
        for bad_dim in [1, 5, 7] {
            let batch = Array2::<f64>::zeros((2, bad_dim));
            assert!(matches!(
                reducer.transform(&batch),
                Err(AppError::DimensionMismatch { expected: 6, found, .. }) if found == bad_dim
            ));
        }
    }

    #[test]
    fn fit_is_reproducible_with_a_seed() {
        let (data, _) = blobs(2, 15, 6, 5);
        let a = ManifoldReducer::fit(&data, &quick_params(2)).unwrap();
        let b = ManifoldReducer::fit(&data, &quick_params(2)).unwrap();
        assert_eq!(a.embedding(), b.embedding());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.embedding().dim(), (30, 2));
    }

    #[test]
    fn unseeded_fit_stores_the_drawn_seed() {
        let (data, _) = blobs(2, 10, 4, 9);
        let params = ReducerParams {
            seed: None,
            ..quick_params(2)
        };
        let reducer = ManifoldReducer::fit(&data, &params).unwrap();
        let first = reducer.transform(&data).unwrap();
        let second = reducer.transform(&data).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn transform_of_a_row_is_independent_of_its_batch() {
        let (data, _) = blobs(3, 12, 8, 11);
        let reducer = ManifoldReducer::fit(&data, &quick_params(4)).unwrap();
        let full = reducer.transform(&data).unwrap();
        let single = reducer.transform(&data.slice(s![5..6, ..]).to_owned()).unwrap();
        assert_eq!(full.row(5), single.row(0));
        assert_eq!(full.dim(), (36, 4));
    }

    #[test]
    fn empty_batch_keeps_output_width() {
        let (data, _) = blobs(2, 10, 4, 13);
        let reducer = ManifoldReducer::fit(&data, &quick_params(3)).unwrap();
        let out = reducer.transform(&Array2::<f64>::zeros((0, 4))).unwrap();
        assert_eq!(out.dim(), (0, 3));
    }

    #[test]
    fn separated_blobs_stay_separated() {
        let (data, truth) = blobs(2, 20, 10, 17);
        let reducer = ManifoldReducer::fit(&data, &quick_params(2)).unwrap();
        let emb = reducer.transform(&data).unwrap();
        let centroid = |blob: usize| {
            let rows: Vec<usize> = (0..truth.len()).filter(|&i| truth[i] == blob).collect();
            emb.select(Axis(0), &rows).mean_axis(Axis(0)).unwrap()
        };
        let (c0, c1) = (centroid(0), centroid(1));
        let between = (&c0 - &c1).mapv(|v| v * v).sum().sqrt();
        let within: f64 = (0..truth.len())
            .map(|i| {
                let c = if truth[i] == 0 { &c0 } else { &c1 };
                (&emb.row(i) - c).mapv(|v| v * v).sum().sqrt()
            })
            .sum::<f64>()
            / truth.len() as f64;
        assert!(between > within, "between {between} within {within}");
    }
}
