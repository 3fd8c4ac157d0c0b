//! Low-dimensional layout: the `1 / (1 + a d^2b)` curve, initialisation and stochastic
//! gradient optimisation with negative sampling.

use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use ndarray_rand::rand::Rng;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand_distr::Uniform;
use tracing::{debug, info_span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::linalg::squared_euclidean;
use crate::logging::progress_bar_style;
use crate::reduce::fuzzy::Edge;
use crate::reduce::pca::pca_reduce;
use crate::{AppError, AppResult};

const GRADIENT_CLIP: f64 = 4.0;
const CURVE_SAMPLES: usize = 300;
const INIT_SCALE: f64 = 10.0;
const INIT_NOISE: f64 = 1e-4;

/// Fit `a` and `b` of `1 / (1 + a x^2b)` to the target curve implied by `spread` and
/// `min_dist` (flat at 1 up to `min_dist`, then exponential decay), with Levenberg-Marquardt.
pub fn find_ab_params(spread: f64, min_dist: f64) -> (f64, f64) {
    let xs: Vec<f64> = (0..CURVE_SAMPLES)
        .map(|i| i as f64 * 3.0 * spread / (CURVE_SAMPLES - 1) as f64)
        .collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|&x| {
            if x < min_dist {
                1.0
            } else {
                (-(x - min_dist) / spread).exp()
            }
        })
        .collect();

    let cost = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(&ys)
            .map(|(&x, &y)| {
                let r = 1.0 / (1.0 + a * x.powf(2.0 * b)) - y;
                r * r
            })
            .sum()
    };

    let (mut a, mut b) = (1.0_f64, 1.0_f64);
    let mut current = cost(a, b);
    let mut lambda = 1e-3;
    for _ in 0..500 {
        // normal equations of the Gauss-Newton step: J^T J delta = -J^T r
        let (mut jaa, mut jab, mut jbb, mut ra, mut rb) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (&x, &y) in xs.iter().zip(&ys) {
            let u = if x > 0.0 { x.powf(2.0 * b) } else { 0.0 };
            let denom = 1.0 + a * u;
            let r = 1.0 / denom - y;
            let da = -u / (denom * denom);
            let db = if x > 0.0 {
                -a * u * 2.0 * x.ln() / (denom * denom)
            } else {
                0.0
            };
            jaa += da * da;
            jab += da * db;
            jbb += db * db;
            ra += da * r;
            rb += db * r;
        }
        let (maa, mbb) = (jaa * (1.0 + lambda), jbb * (1.0 + lambda));
        let det = maa * mbb - jab * jab;
        if det.abs() < f64::MIN_POSITIVE {
            lambda *= 10.0;
            continue;
        }
        let step_a = -(mbb * ra - jab * rb) / det;
        let step_b = -(maa * rb - jab * ra) / det;
        let (next_a, next_b) = (a + step_a, b + step_b);
        let next = if next_a > 0.0 && next_b > 0.0 {
            cost(next_a, next_b)
        } else {
            f64::INFINITY
        };
        if next < current {
            let improvement = current - next;
            (a, b, current) = (next_a, next_b, next);
            lambda = (lambda / 10.0).max(1e-12);
            if improvement < 1e-14 || (step_a.abs() < 1e-12 && step_b.abs() < 1e-12) {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e12 {
                break;
            }
        }
    }
    debug!("Fitted curve parameters a={a} b={b} (spread={spread}, min_dist={min_dist})");
    (a, b)
}

/// Optimisation settings shared by fitting and out-of-sample transforms.
#[derive(Debug, Clone, Copy)]
pub struct LayoutParams {
    pub a: f64,
    pub b: f64,
    pub repulsion_strength: f64,
    pub learning_rate: f64,
    pub negative_sample_rate: f64,
    pub n_epochs: usize,
}

/// An edge with its sampling period: an edge of weight `w` is sampled every `max_w / w`
/// epochs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEdge {
    pub head: usize,
    pub tail: usize,
    pub epochs_per_sample: f64,
}

/// Drop edges too weak to be sampled even once in `n_epochs` and compute sampling periods.
pub fn schedule(edges: &[Edge], n_epochs: usize) -> Vec<ScheduledEdge> {
    let max = edges.iter().map(|e| e.weight).fold(0.0, f64::max);
    if max <= 0.0 || n_epochs == 0 {
        return Vec::new();
    }
    let threshold = max / n_epochs as f64;
    edges
        .iter()
        .filter(|e| e.weight >= threshold)
        .map(|e| ScheduledEdge {
            head: e.head,
            tail: e.tail,
            epochs_per_sample: max / e.weight,
        })
        .collect()
}

fn clip(v: f64) -> f64 {
    v.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

fn attractive_coeff(dist_sq: f64, p: &LayoutParams) -> f64 {
    if dist_sq > 0.0 {
        -2.0 * p.a * p.b * dist_sq.powf(p.b - 1.0) / (p.a * dist_sq.powf(p.b) + 1.0)
    } else {
        0.0
    }
}

fn repulsive_coeff(dist_sq: f64, p: &LayoutParams) -> f64 {
    if dist_sq > 0.0 {
        2.0 * p.repulsion_strength * p.b / ((0.001 + dist_sq) * (p.a * dist_sq.powf(p.b) + 1.0))
    } else {
        0.0
    }
}

/// Sampling state of one edge across epochs.
struct Sampler {
    period: f64,
    negative_period: f64,
    next: f64,
    next_negative: f64,
}

impl Sampler {
    fn new(period: f64, negative_sample_rate: f64) -> Self {
        let negative_period = period / negative_sample_rate;
        Self {
            period,
            negative_period,
            next: period,
            next_negative: negative_period,
        }
    }

    fn due(&self, epoch: usize) -> bool {
        self.next <= epoch as f64
    }

    /// Advance past this epoch's sample, returning how many negative samples to draw.
    fn advance(&mut self, epoch: usize) -> usize {
        self.next += self.period;
        let n_neg = ((epoch as f64 - self.next_negative) / self.negative_period).max(0.0) as usize;
        self.next_negative += n_neg as f64 * self.negative_period;
        n_neg
    }
}

/// Optimise a fitted layout in place: both ends of every edge move.
#[tracing::instrument(
    name = "Optimizing layout",
    level = "debug",
    skip_all,
    fields(points = embedding.nrows(), edges = edges.len(), epochs = params.n_epochs)
)]
pub fn optimize_embedding(
    embedding: &mut Array2<f64>, // embedding = (n_points, n_components)
    edges: &[ScheduledEdge],
    params: &LayoutParams,
    rng: &mut StdRng,
) {
    let n_vertices = embedding.nrows();
    let dim = embedding.ncols();
    let mut samplers: Vec<Sampler> = edges
        .iter()
        .map(|e| Sampler::new(e.epochs_per_sample, params.negative_sample_rate))
        .collect();

    let span = info_span!("Optimizing layout");
    span.pb_set_style(&progress_bar_style());
    span.pb_set_length(params.n_epochs as u64);
    span.pb_set_message("epochs");
    let _enter = span.enter();

    for epoch in 0..params.n_epochs {
        let alpha = params.learning_rate * (1.0 - epoch as f64 / params.n_epochs as f64);
        for (edge, sampler) in edges.iter().zip(samplers.iter_mut()) {
            if !sampler.due(epoch) {
                continue;
            }
            let (j, k) = (edge.head, edge.tail);
            let dist_sq = squared_euclidean(embedding.row(j), embedding.row(k));
            let coeff = attractive_coeff(dist_sq, params);
            for d in 0..dim {
                let grad = clip(coeff * (embedding[(j, d)] - embedding[(k, d)]));
                embedding[(j, d)] += grad * alpha;
                embedding[(k, d)] -= grad * alpha;
            }

            for _ in 0..sampler.advance(epoch) {
                let k = rng.random_range(0..n_vertices);
                if k == j {
                    continue;
                }
                let dist_sq = squared_euclidean(embedding.row(j), embedding.row(k));
                let coeff = repulsive_coeff(dist_sq, params);
                for d in 0..dim {
                    let grad = if coeff > 0.0 {
                        clip(coeff * (embedding[(j, d)] - embedding[(k, d)]))
                    } else {
                        GRADIENT_CLIP
                    };
                    embedding[(j, d)] += grad * alpha;
                }
            }
        }
        span.pb_inc(1);
    }
}

/// Optimise one new point against a frozen reference layout. `edges[..].tail` index rows of
/// `reference`; only `point` moves.
pub fn optimize_point(
    point: &mut Array1<f64>,
    edges: &[ScheduledEdge],
    reference: &Array2<f64>, // reference = (n_training, n_components)
    params: &LayoutParams,
    rng: &mut StdRng,
) {
    let n_vertices = reference.nrows();
    let mut samplers: Vec<Sampler> = edges
        .iter()
        .map(|e| Sampler::new(e.epochs_per_sample, params.negative_sample_rate))
        .collect();

    for epoch in 0..params.n_epochs {
        let alpha = params.learning_rate * (1.0 - epoch as f64 / params.n_epochs as f64);
        for (edge, sampler) in edges.iter().zip(samplers.iter_mut()) {
            if !sampler.due(epoch) {
                continue;
            }
            let other = reference.row(edge.tail);
            let coeff = attractive_coeff(squared_euclidean(point.view(), other), params);
            for (p, o) in point.iter_mut().zip(other.iter()) {
                *p += clip(coeff * (*p - o)) * alpha;
            }

            for _ in 0..sampler.advance(epoch) {
                let other = reference.row(rng.random_range(0..n_vertices));
                let coeff = repulsive_coeff(squared_euclidean(point.view(), other), params);
                for (p, o) in point.iter_mut().zip(other.iter()) {
                    let grad = if coeff > 0.0 {
                        clip(coeff * (*p - o))
                    } else {
                        GRADIENT_CLIP
                    };
                    *p += grad * alpha;
                }
            }
        }
    }
}

/// Initial layout: principal components scaled into `[0, 10]` per column plus a little seeded
/// jitter. Columns beyond the available rank are uniform noise.
#[tracing::instrument(name = "Initializing layout", level = "debug", skip(data, rng))]
pub fn initial_layout(
    data: &Array2<f64>, // data = (n_points, dim)
    n_components: usize,
    rng: &mut StdRng,
) -> AppResult<Array2<f64>> {
    let n = data.nrows();
    let rank = n_components.min(n).min(data.ncols());
    let uniform =
        Uniform::new(0.0, INIT_SCALE).map_err(|e| AppError::Other(format!("layout init: {e}")))?;
    let mut layout = Array2::<f64>::random_using((n, n_components), uniform, rng);
    if rank == 0 {
        return Ok(layout);
    }

    let pcs = pca_reduce(data, rank)?;
    for (c, column) in pcs.axis_iter(Axis(1)).enumerate() {
        let min = column.iter().copied().fold(f64::INFINITY, f64::min);
        let max = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        if range <= f64::EPSILON {
            continue;
        }
        for (i, &v) in column.iter().enumerate() {
            let jitter = rng.random_range(-INIT_NOISE..INIT_NOISE);
            layout[(i, c)] = INIT_SCALE * (v - min) / range + jitter;
        }
    }
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand::SeedableRng;

    #[test]
    fn ab_params_match_reference_values() {
        let (a, b) = find_ab_params(1.0, 0.1);
        assert!((a - 1.577).abs() < 0.02, "a = {a}");
        assert!((b - 0.895).abs() < 0.02, "b = {b}");
    }

    #[test]
    fn tighter_packing_steepens_the_curve() {
        let (a_tight, _) = find_ab_params(1.0, 0.0);
        let (a_loose, _) = find_ab_params(1.0, 0.5);
        assert!(a_tight > a_loose);
    }

    #[test]
    fn schedule_drops_edges_never_sampled() {
        let edges = vec![
            Edge { head: 0, tail: 1, weight: 1.0 },
            Edge { head: 1, tail: 2, weight: 0.5 },
            Edge { head: 2, tail: 3, weight: 0.001 },
        ];
        let scheduled = schedule(&edges, 10);
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[0].epochs_per_sample, 1.0);
        assert_eq!(scheduled[1].epochs_per_sample, 2.0);
    }

    #[test]
    fn attraction_pulls_connected_points_together() {
        let mut embedding = array![[0.0, 0.0], [5.0, 5.0], [20.0, 20.0]];
        let before = squared_euclidean(embedding.row(0), embedding.row(1));
        let edges = vec![
            ScheduledEdge { head: 0, tail: 1, epochs_per_sample: 1.0 },
            ScheduledEdge { head: 1, tail: 0, epochs_per_sample: 1.0 },
        ];
        let params = LayoutParams {
            a: 1.577,
            b: 0.895,
            repulsion_strength: 1.0,
            learning_rate: 1.0,
            negative_sample_rate: 1.0,
            n_epochs: 50,
        };
        let mut rng = StdRng::seed_from_u64(7);
        optimize_embedding(&mut embedding, &edges, &params, &mut rng);
        let after = squared_euclidean(embedding.row(0), embedding.row(1));
        assert!(after < before, "{after} >= {before}");
    }

    #[test]
    fn initial_layout_is_scaled_and_padded() {
        let data = array![[0.0, 1.0], [1.0, 0.0], [2.0, 2.0], [3.0, 1.0]];
        let mut rng = StdRng::seed_from_u64(1);
        let layout = initial_layout(&data, 3, &mut rng).unwrap();
        assert_eq!(layout.dim(), (4, 3));
        for v in layout.iter() {
            assert!((-0.01..=10.01).contains(v), "{v}");
        }
    }
}
