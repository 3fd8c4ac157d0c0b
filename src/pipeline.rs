//! Training and inference over whole model sets.

use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::cluster::{Assignment, Clusterer, ClustererParams, NOISE};
use crate::corpus::{Corpus, Record};
use crate::linalg::embeddings_to_ndarray;
use crate::plot::DescriptionMap;
use crate::reduce::{ManifoldReducer, ReducerParams};
use crate::store::{ModelSet, ModelStore, version_id};
use crate::{AppError, AppResult};

/// Every hyperparameter a training run uses. Stored in the manifest of the set it produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainingConfig {
    pub manifold: ReducerParams,
    pub visual: ReducerParams,
    pub clusterer: ClustererParams,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            manifold: ReducerParams::manifold(),
            visual: ReducerParams::visual(),
            clusterer: ClustererParams::default(),
        }
    }
}

/// Outcome of a committed training run.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// One label per corpus point, in corpus order.
    pub labels: Vec<i32>,
    pub observations: usize,
    pub noise: usize,
    pub clusters: usize,
    pub version: String,
}

/// Fit the manifold reducer, the clusterer on its output and the visualization reducer.
///
/// Returns the set with the training labels. Nothing touches the disk.
#[tracing::instrument(
    name = "Fitting model set",
    level = "info",
    skip_all,
    fields(n = corpus.len(), dim = corpus.dim())
)]
pub fn fit_models(corpus: &Corpus, config: &TrainingConfig) -> AppResult<(ModelSet, Vec<i32>)> {
    config.clusterer.validate()?;
    if corpus.len() < config.clusterer.min_points() {
        return Err(config.clusterer.insufficient(corpus.len()));
    }

    let manifold = ManifoldReducer::fit(corpus.data(), &config.manifold)?;
    // Clustering works on the transform of the corpus, the same path new points take, so a
    // training point fed back through `assign` lands exactly on its own reduced position.
    let reduced = manifold.transform(corpus.data())?;
    let (clusterer, labels) = Clusterer::fit(&reduced, &config.clusterer, manifold.fingerprint())?;
    let visual = ManifoldReducer::fit(corpus.data(), &config.visual)?;

    let trained_at = OffsetDateTime::now_utc();
    let set = ModelSet {
        version: version_id(trained_at, manifold.fingerprint())?,
        trained_at,
        config: config.clone(),
        manifold,
        visual,
        clusterer,
    };
    Ok((set, labels))
}

/// Train on every daily file in `data_dir` and commit the result as `name`.
///
/// The previously committed set stays current unless every step succeeds.
#[tracing::instrument(name = "Training", level = "info", skip(store, config))]
pub fn train(
    data_dir: &Path,
    store: &ModelStore,
    name: &str,
    config: &TrainingConfig,
) -> AppResult<TrainingReport> {
    let corpus = Corpus::load(data_dir)?;
    let (set, labels) = fit_models(&corpus, config)?;
    store.save(&set, name)?;

    let noise = labels.iter().filter(|&&l| l == NOISE).count();
    let report = TrainingReport {
        observations: labels.len(),
        noise,
        clusters: set.clusterer.n_clusters(),
        version: set.version.clone(),
        labels,
    };
    if report.clusters == 0 {
        warn!("Training found no clusters; every point is noise");
    }
    info!(
        "Trained version {}: {} observations, {} clusters, {} noise",
        report.version, report.observations, report.clusters, report.noise
    );
    Ok(report)
}

impl ModelSet {
    /// Cluster a batch of embeddings against the frozen models.
    ///
    /// The whole batch is validated before any work, so a bad vector yields an error and no
    /// partial output.
    #[tracing::instrument(
        name = "Assigning batch",
        level = "info",
        skip_all,
        fields(n = batch.len(), version = %self.version)
    )]
    pub fn assign(&self, batch: &[Vec<f32>]) -> AppResult<Vec<Assignment>> {
        let data = embeddings_to_ndarray(batch, Some(self.manifold.input_dim()))?;
        if self.clusterer.reducer_fingerprint() != self.manifold.fingerprint() {
            return Err(AppError::StaleModel(format!(
                "clusterer of {} was fit on a different manifold reducer",
                self.version
            )));
        }
        if self.clusterer.input_dim() != self.manifold.n_components() {
            return Err(AppError::StaleModel(format!(
                "clusterer expects {} components, manifold reducer produces {}",
                self.clusterer.input_dim(),
                self.manifold.n_components()
            )));
        }
        let reduced = self.manifold.transform(&data)?;
        self.clusterer.approximate_predict(&reduced)
    }
}

/// [`ModelSet::assign`] over the embeddings of `records`.
pub fn assign_records(set: &ModelSet, records: &[Record]) -> AppResult<Vec<Assignment>> {
    let batch: Vec<Vec<f32>> = records.iter().map(|r| r.embedding.clone()).collect();
    set.assign(&batch)
}

/// Write `cluster`, `cluster_strength` and `cluster_description` into each record.
pub fn annotate_records(
    records: &mut [Record],
    assignments: &[Assignment],
    descriptions: &DescriptionMap,
) -> AppResult<()> {
    if records.len() != assignments.len() {
        return Err(AppError::DimensionMismatch {
            expected: records.len(),
            found: assignments.len(),
            row: 0,
        });
    }
    for (record, assignment) in records.iter_mut().zip(assignments) {
        record
            .metadata
            .insert("cluster".into(), assignment.label.into());
        record
            .metadata
            .insert("cluster_strength".into(), assignment.strength.into());
        record.metadata.insert(
            "cluster_description".into(),
            descriptions.describe(assignment.label).into(),
        );
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::reduce::tests::blobs;
    use tempfile::tempdir;

    pub(crate) fn small_config(seed: u64) -> TrainingConfig {
        let reducer = |n_components| ReducerParams {
            n_neighbors: 10,
            n_components,
            n_epochs: Some(60),
            seed: Some(seed),
            ..ReducerParams::manifold()
        };
        TrainingConfig {
            manifold: reducer(5),
            visual: ReducerParams {
                min_dist: 0.1,
                ..reducer(2)
            },
            clusterer: ClustererParams {
                min_cluster_size: 15,
                min_samples: 5,
                cluster_selection_epsilon: 0.0,
            },
        }
    }

    /// Three blobs of 40 points in 16 dimensions, as `f32` embeddings.
    pub(crate) fn blob_embeddings(seed: u64) -> Vec<Vec<f32>> {
        let (data, _) = blobs(3, 40, 16, seed);
        data.rows()
            .into_iter()
            .map(|row| row.iter().map(|&v| v as f32).collect())
            .collect()
    }

    pub(crate) fn small_models(seed: u64) -> (ModelSet, Vec<Vec<f32>>) {
        let embeddings = blob_embeddings(seed);
        let corpus = Corpus::from_embeddings(&embeddings).unwrap();
        let (set, _) = fit_models(&corpus, &small_config(seed)).unwrap();
        (set, embeddings)
    }

    fn write_corpus(dir: &Path, embeddings: &[Vec<f32>]) {
        let records: Vec<Record> = embeddings.iter().cloned().map(Record::new).collect();
        crate::corpus::write_records(&dir.join("2024_05_01_cs.json.gz"), &records).unwrap();
    }

    #[test]
    fn every_training_point_gets_one_label() {
        let embeddings = blob_embeddings(3);
        let corpus = Corpus::from_embeddings(&embeddings).unwrap();
        let (set, labels) = fit_models(&corpus, &small_config(3)).unwrap();
        assert_eq!(labels.len(), corpus.len());
        let n = set.clusterer.n_clusters() as i32;
        assert!(n >= 2, "found {n} clusters");
        assert!(labels.iter().all(|&l| l == NOISE || (0..n).contains(&l)));
        let noise = labels.iter().filter(|&&l| l == NOISE).count();
        let clustered = labels.iter().filter(|&&l| l >= 0).count();
        assert_eq!(noise + clustered, corpus.len());
        assert_eq!(set.clusterer.training_labels(), labels.as_slice());
    }

    #[test]
    fn training_points_keep_their_labels_through_assign() {
        let (set, embeddings) = small_models(5);
        let picks: Vec<usize> = (0..10).map(|i| i * 11).collect();
        let batch: Vec<Vec<f32>> = picks.iter().map(|&i| embeddings[i].clone()).collect();
        let assigned = set.assign(&batch).unwrap();
        for (&i, a) in picks.iter().zip(&assigned) {
            assert_eq!(a.label, set.clusterer.training_labels()[i], "training point {i}");
        }
    }

    #[test]
    fn assign_is_idempotent() {
        let (set, embeddings) = small_models(7);
        let batch = &embeddings[..25];
        let first = set.assign(batch).unwrap();
        let second = set.assign(batch).unwrap();
        assert_eq!(first, second);
        assert!(first.iter().all(|a| (0.0..=1.0).contains(&a.strength)));
    }

    #[test]
    fn wrong_dimension_fails_the_whole_batch() {
        let (set, embeddings) = small_models(9);
        let mut batch = embeddings[..4].to_vec();
        batch.push(vec![0.0; 15]);
        assert!(matches!(
            set.assign(&batch),
            Err(AppError::DimensionMismatch { expected: 16, found: 15, row: 4 })
        ));
        for dim in [1, 17, 64] {
            assert!(matches!(
                set.assign(&[vec![1.0; dim]]),
                Err(AppError::DimensionMismatch { expected: 16, .. })
            ));
        }
    }

    #[test]
    fn mismatched_clusterer_is_stale() {
        let (mut set, _) = small_models(11);
        let (other, embeddings) = small_models(12);
        set.clusterer = other.clusterer;
        assert!(matches!(set.assign(&embeddings[..2]), Err(AppError::StaleModel(_))));
    }

    #[test]
    fn thousand_points_in_fifty_dimensions() {
        let (data, _) = blobs(4, 250, 50, 21);
        // embeddings arrive as f32
        let data = data.mapv(|v| v as f32 as f64);
        let corpus = Corpus::from_array(data.clone());
        let (set, labels) = fit_models(&corpus, &TrainingConfig::default()).unwrap();
        assert_eq!(labels.len(), 1000);
        let n = set.clusterer.n_clusters() as i32;
        assert!(labels.iter().all(|&l| l == NOISE || (0..n).contains(&l)));
        let mut seen: Vec<i32> = labels.iter().copied().filter(|&l| l >= 0).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, (0..n).collect::<Vec<_>>());

        let picks: Vec<usize> = (0..10).map(|i| i * 97).collect();
        let batch: Vec<Vec<f32>> = picks
            .iter()
            .map(|&i| data.row(i).iter().map(|&v| v as f32).collect())
            .collect();
        let assigned = set.assign(&batch).unwrap();
        for (&i, a) in picks.iter().zip(&assigned) {
            assert_eq!(a.label, labels[i], "training point {i}");
        }
    }

    #[test]
    fn empty_corpus_fails_and_writes_nothing() {
        let data_dir = tempdir().unwrap();
        let store_dir = tempdir().unwrap();
        write_corpus(data_dir.path(), &[]);
        let store = ModelStore::new(store_dir.path());
        let result = train(data_dir.path(), &store, "daily", &small_config(1));
        assert!(matches!(
            result,
            Err(AppError::InsufficientData { points: 0, min_cluster_size: 15, .. })
        ));
        assert!(!store_dir.path().join("daily").exists());
    }

    #[test]
    fn failed_training_keeps_the_previous_set() {
        let data_dir = tempdir().unwrap();
        let store_dir = tempdir().unwrap();
        let store = ModelStore::new(store_dir.path());
        write_corpus(data_dir.path(), &blob_embeddings(13));
        let report = train(data_dir.path(), &store, "daily", &small_config(13)).unwrap();
        assert_eq!(report.observations, 120);
        assert_eq!(report.labels.len(), 120);
        assert_eq!(store.current_version("daily").unwrap(), Some(report.version.clone()));

        let too_strict = TrainingConfig {
            clusterer: ClustererParams {
                min_cluster_size: 500,
                ..small_config(13).clusterer
            },
            ..small_config(13)
        };
        assert!(matches!(
            train(data_dir.path(), &store, "daily", &too_strict),
            Err(AppError::InsufficientData { points: 120, .. })
        ));
        assert_eq!(store.current_version("daily").unwrap(), Some(report.version));
        assert!(store.load("daily").is_ok());
    }

    #[test]
    fn annotation_writes_three_fields() {
        let mut records = vec![Record::new(vec![1.0]), Record::new(vec![2.0])];
        let assignments = [
            Assignment { label: 0, strength: 0.5 },
            Assignment::noise(),
        ];
        let descriptions = DescriptionMap::default();
        annotate_records(&mut records, &assignments, &descriptions).unwrap();
        assert_eq!(records[0].metadata["cluster"], 0);
        assert_eq!(records[0].metadata["cluster_strength"], 0.5);
        assert_eq!(records[0].field("cluster_description"), Some("Cluster 0"));
        assert_eq!(records[1].metadata["cluster"], -1);
        assert_eq!(records[1].field("cluster_description"), Some("Noise"));
    }
}
