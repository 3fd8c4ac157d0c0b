//! Versioned on-disk model sets.
//!
//! ```text
//! <root>/<name>/
//!   CURRENT                     committed version id
//!   <version>/manifest.json
//!   <version>/manifold.bin.zst
//!   <version>/visual.bin.zst
//!   <version>/clusterer.bin.zst
//! ```
//!
//! A set is written to a hidden staging directory, renamed into place and only then made
//! current by atomically replacing `CURRENT`. Readers follow `CURRENT`, so they see either the
//! previous complete set or the new complete set.

use std::fmt::Display;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray_rand::rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, info, warn};

use crate::cluster::Clusterer;
use crate::corpus::{read_json_file, write_json_file};
use crate::pipeline::TrainingConfig;
use crate::reduce::ManifoldReducer;
use crate::serde_helpers::{hex_u128, rfc3339};
use crate::{AppError, AppResult};

const CURRENT_FILE: &str = "CURRENT";
const MANIFEST_FILE: &str = "manifest.json";
const STAGING_PREFIX: &str = ".staging-";
const ZSTD_LEVEL: i32 = 3;

/// The three fitted artifacts that are only valid together, plus their shared identity.
#[derive(Debug, Clone)]
pub struct ModelSet {
    pub version: String,
    pub trained_at: OffsetDateTime,
    pub config: TrainingConfig,
    pub manifold: ManifoldReducer,
    pub visual: ManifoldReducer,
    pub clusterer: Clusterer,
}

/// Version id `<UTC timestamp>-<8 hex digits of the fingerprint>`.
pub fn version_id(trained_at: OffsetDateTime, fingerprint: u128) -> AppResult<String> {
    let stamp = trained_at.to_offset(time::UtcOffset::UTC).format(format_description!(
        "[year][month][day]T[hour][minute][second].[subsecond digits:3]Z"
    ))?;
    Ok(format!("{stamp}-{:08x}", (fingerprint >> 96) as u32))
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ArtifactKind {
    Manifold,
    Visual,
    Clusterer,
}

impl ArtifactKind {
    fn file_name(&self) -> String {
        format!("{self}.bin.zst")
    }
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Manifold => write!(f, "manifold"),
            ArtifactKind::Visual => write!(f, "visual"),
            ArtifactKind::Clusterer => write!(f, "clusterer"),
        }
    }
}

/// Written ahead of every blob payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct EnvelopeHeader {
    version: String,
    kind: ArtifactKind,
}

/// Human readable summary of a committed set.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Manifest {
    pub version: String,
    #[serde(with = "rfc3339")]
    pub trained_at: OffsetDateTime,
    pub config: TrainingConfig,
    pub observations: usize,
    pub input_dim: usize,
    pub n_clusters: usize,
    pub cluster_sizes: Vec<usize>,
    #[serde(with = "hex_u128")]
    pub reducer_fingerprint: u128,
    pub seeds: Seeds,
    pub crate_version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Seeds {
    pub manifold: u64,
    pub visual: u64,
}

impl Manifest {
    fn of(set: &ModelSet) -> Self {
        Self {
            version: set.version.clone(),
            trained_at: set.trained_at,
            config: set.config.clone(),
            observations: set.manifold.n_samples(),
            input_dim: set.manifold.input_dim(),
            n_clusters: set.clusterer.n_clusters(),
            cluster_sizes: set.clusterer.cluster_sizes(),
            reducer_fingerprint: set.manifold.fingerprint(),
            seeds: Seeds {
                manifold: set.manifold.seed(),
                visual: set.visual.seed(),
            },
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

fn write_blob<T: Serialize>(path: &Path, header: &EnvelopeHeader, payload: &T) -> AppResult<()> {
    let file = fs::File::create(path)?;
    let mut enc = zstd::stream::Encoder::new(BufWriter::new(file), ZSTD_LEVEL)?;
    bincode::serde::encode_into_std_write(header, &mut enc, bincode_config())?;
    bincode::serde::encode_into_std_write(payload, &mut enc, bincode_config())?;
    let mut writer = enc.finish()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn read_blob<T: DeserializeOwned>(path: &Path, version: &str, kind: ArtifactKind) -> AppResult<T> {
    let file = fs::File::open(path).map_err(|e| {
        AppError::StaleModel(format!("missing {kind} artifact {}: {e}", path.display()))
    })?;
    let mut dec = zstd::stream::Decoder::new(BufReader::new(file))?;
    let header: EnvelopeHeader = bincode::serde::decode_from_std_read(&mut dec, bincode_config())?;
    if header.kind != kind {
        return Err(AppError::StaleModel(format!(
            "{} holds a {} artifact, expected {kind}",
            path.display(),
            header.kind
        )));
    }
    if header.version != version {
        return Err(AppError::StaleModel(format!(
            "{kind} artifact belongs to version {}, manifest is {version}",
            header.version
        )));
    }
    Ok(bincode::serde::decode_from_std_read(&mut dec, bincode_config())?)
}

fn sync_dir(path: &Path) -> AppResult<()> {
    fs::File::open(path)?.sync_all()?;
    Ok(())
}

/// Root directory holding any number of named model sets.
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn set_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Version `CURRENT` points at, if the set was ever committed.
    pub fn current_version(&self, name: &str) -> AppResult<Option<String>> {
        match fs::read_to_string(self.set_dir(name).join(CURRENT_FILE)) {
            Ok(raw) => Ok(Some(raw.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Manifest of the committed set.
    pub fn manifest(&self, name: &str) -> AppResult<Manifest> {
        let version = self
            .current_version(name)?
            .ok_or_else(|| AppError::ModelNotFound(self.set_dir(name)))?;
        self.read_manifest(name, &version)
    }

    fn read_manifest(&self, name: &str, version: &str) -> AppResult<Manifest> {
        let path = self.set_dir(name).join(version).join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(AppError::StaleModel(format!(
                "CURRENT names version {version} but {} does not exist",
                path.display()
            )));
        }
        let manifest: Manifest = read_json_file(&path)?;
        if manifest.version != version {
            return Err(AppError::StaleModel(format!(
                "manifest describes version {}, CURRENT is {version}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Persist `set` under `name` and make it current.
    #[tracing::instrument(
        name = "Saving model set",
        level = "info",
        skip(self, set),
        fields(version = %set.version)
    )]
    pub fn save(&self, set: &ModelSet, name: &str) -> AppResult<PathBuf> {
        if set.clusterer.reducer_fingerprint() != set.manifold.fingerprint() {
            return Err(AppError::StaleModel(
                "clusterer was not fit on this manifold reducer".into(),
            ));
        }
        let set_dir = self.set_dir(name);
        fs::create_dir_all(&set_dir)?;
        let target = set_dir.join(&set.version);
        if target.exists() {
            if self.current_version(name)?.as_deref() == Some(set.version.as_str()) {
                return Err(AppError::Other(format!(
                    "version {} is already committed",
                    set.version
                )));
            }
            fs::remove_dir_all(&target)?;
        }

        let token: u32 = ndarray_rand::rand::rng().random();
        let staging = set_dir.join(format!("{STAGING_PREFIX}{}-{token:08x}", set.version));
        fs::create_dir_all(&staging)?;
        if let Err(e) = self.write_staging(&staging, set) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        fs::rename(&staging, &target)?;
        sync_dir(&set_dir)?;
        debug!("Moved staged artifacts to {}", target.display());

        self.commit(&set_dir, &set.version)?;
        info!("Committed model set {name} version {}", set.version);
        self.prune(&set_dir, &set.version);
        Ok(target)
    }

    fn write_staging(&self, staging: &Path, set: &ModelSet) -> AppResult<()> {
        write_json_file(&staging.join(MANIFEST_FILE), &Manifest::of(set))?;
        let blob = |kind: ArtifactKind| {
            (
                staging.join(kind.file_name()),
                EnvelopeHeader {
                    version: set.version.clone(),
                    kind,
                },
            )
        };
        let (path, header) = blob(ArtifactKind::Manifold);
        write_blob(&path, &header, &set.manifold)?;
        let (path, header) = blob(ArtifactKind::Visual);
        write_blob(&path, &header, &set.visual)?;
        let (path, header) = blob(ArtifactKind::Clusterer);
        write_blob(&path, &header, &set.clusterer)?;
        sync_dir(staging)
    }

    /// Atomically point `CURRENT` at `version`.
    fn commit(&self, set_dir: &Path, version: &str) -> AppResult<()> {
        let tmp = set_dir.join(format!(".{CURRENT_FILE}.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            writeln!(file, "{version}")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, set_dir.join(CURRENT_FILE))?;
        sync_dir(set_dir)
    }

    /// Remove every version directory but `keep`, and leftover staging directories.
    fn prune(&self, set_dir: &Path, keep: &str) {
        let entries = match fs::read_dir(set_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Could not list {} for pruning: {e}", set_dir.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir || entry.file_name().to_string_lossy() == keep {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => debug!("Pruned {}", entry.path().display()),
                Err(e) => warn!("Could not prune {}: {e}", entry.path().display()),
            }
        }
    }

    /// Load the committed set `name`, checking that its artifacts belong together.
    #[tracing::instrument(name = "Loading model set", level = "info", skip(self))]
    pub fn load(&self, name: &str) -> AppResult<ModelSet> {
        let version = self
            .current_version(name)?
            .ok_or_else(|| AppError::ModelNotFound(self.set_dir(name)))?;
        let manifest = self.read_manifest(name, &version)?;
        let dir = self.set_dir(name).join(&version);

        let manifold: ManifoldReducer = read_blob(
            &dir.join(ArtifactKind::Manifold.file_name()),
            &version,
            ArtifactKind::Manifold,
        )?;
        let visual: ManifoldReducer = read_blob(
            &dir.join(ArtifactKind::Visual.file_name()),
            &version,
            ArtifactKind::Visual,
        )?;
        let clusterer: Clusterer = read_blob(
            &dir.join(ArtifactKind::Clusterer.file_name()),
            &version,
            ArtifactKind::Clusterer,
        )?;

        if manifold.fingerprint() != manifest.reducer_fingerprint {
            return Err(AppError::StaleModel(format!(
                "manifold reducer does not match the manifest of {version}"
            )));
        }
        if clusterer.reducer_fingerprint() != manifold.fingerprint() {
            return Err(AppError::StaleModel(format!(
                "clusterer of {version} was fit on a different manifold reducer"
            )));
        }
        info!(
            "Loaded model set {name} version {version} ({} clusters)",
            clusterer.n_clusters()
        );
        Ok(ModelSet {
            version,
            trained_at: manifest.trained_at,
            config: manifest.config,
            manifold,
            visual,
            clusterer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::small_models;
    use tempfile::tempdir;
    use time::macros::datetime;

    #[test]
    fn version_id_has_timestamp_and_fingerprint() {
        let id = version_id(datetime!(2025-03-04 05:06:07.089 UTC), 0xabcdef01_u128 << 96).unwrap();
        assert_eq!(id, "20250304T050607.089Z-abcdef01");
    }

    #[test]
    fn missing_set_is_model_not_found() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        assert_eq!(store.current_version("daily").unwrap(), None);
        assert!(matches!(store.load("daily"), Err(AppError::ModelNotFound(_))));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (set, _) = small_models(1);
        store.save(&set, "daily").unwrap();

        assert_eq!(store.current_version("daily").unwrap(), Some(set.version.clone()));
        let loaded = store.load("daily").unwrap();
        assert_eq!(loaded.version, set.version);
        assert_eq!(loaded.trained_at, set.trained_at);
        assert_eq!(loaded.config, set.config);
        assert_eq!(loaded.manifold.fingerprint(), set.manifold.fingerprint());
        assert_eq!(loaded.manifold.embedding(), set.manifold.embedding());
        assert_eq!(loaded.visual.embedding(), set.visual.embedding());
        assert_eq!(loaded.clusterer.training_labels(), set.clusterer.training_labels());

        let manifest = store.manifest("daily").unwrap();
        assert_eq!(manifest.n_clusters, set.clusterer.n_clusters());
        assert_eq!(manifest.observations, set.manifold.n_samples());
    }

    #[test]
    fn second_save_replaces_and_prunes_the_first() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (first, _) = small_models(1);
        let (mut second, _) = small_models(2);
        second.version = format!("{}-b", first.version);
        store.save(&first, "daily").unwrap();
        store.save(&second, "daily").unwrap();

        assert_eq!(store.current_version("daily").unwrap(), Some(second.version.clone()));
        assert!(!dir.path().join("daily").join(&first.version).exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("daily"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn interrupted_save_leaves_the_committed_set_loadable() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (first, _) = small_models(1);
        let (mut second, _) = small_models(2);
        second.version = format!("{}-b", first.version);
        store.save(&first, "daily").unwrap();

        // staging directory abandoned halfway through writing
        let set_dir = dir.path().join("daily");
        let staging = set_dir.join(format!("{STAGING_PREFIX}{}-0badf00d", second.version));
        fs::create_dir_all(&staging).unwrap();
        write_json_file(&staging.join(MANIFEST_FILE), &Manifest::of(&second)).unwrap();

        // renamed into place but never made current, missing its clusterer
        let orphan = set_dir.join(format!("{}-orphan", second.version));
        fs::create_dir_all(&orphan).unwrap();
        write_json_file(&orphan.join(MANIFEST_FILE), &Manifest::of(&second)).unwrap();
        let header = EnvelopeHeader {
            version: second.version.clone(),
            kind: ArtifactKind::Manifold,
        };
        let manifold = orphan.join(ArtifactKind::Manifold.file_name());
        write_blob(&manifold, &header, &second.manifold).unwrap();

        assert_eq!(store.current_version("daily").unwrap(), Some(first.version.clone()));
        let loaded = store.load("daily").unwrap();
        assert_eq!(loaded.version, first.version);
        assert_eq!(loaded.manifold.fingerprint(), first.manifold.fingerprint());
        assert_eq!(loaded.clusterer.training_labels(), first.clusterer.training_labels());

        store.save(&second, "daily").unwrap();
        assert!(!staging.exists());
        assert!(!orphan.exists());
        assert!(!set_dir.join(&first.version).exists());
        assert_eq!(store.load("daily").unwrap().version, second.version);
    }

    #[test]
    fn mixed_artifacts_are_stale() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (first, _) = small_models(1);
        let (mut second, _) = small_models(2);
        second.version = format!("{}-b", first.version);
        store.save(&first, "a").unwrap();
        store.save(&second, "b").unwrap();

        let file = ArtifactKind::Clusterer.file_name();
        fs::copy(
            dir.path().join("b").join(&second.version).join(&file),
            dir.path().join("a").join(&first.version).join(&file),
        )
        .unwrap();
        assert!(matches!(store.load("a"), Err(AppError::StaleModel(_))));
    }

    #[test]
    fn swapped_artifact_kinds_are_stale() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (set, _) = small_models(1);
        let target = store.save(&set, "daily").unwrap();
        fs::copy(
            target.join(ArtifactKind::Visual.file_name()),
            target.join(ArtifactKind::Manifold.file_name()),
        )
        .unwrap();
        assert!(matches!(store.load("daily"), Err(AppError::StaleModel(_))));
    }

    #[test]
    fn dangling_current_is_stale() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        fs::create_dir_all(dir.path().join("daily")).unwrap();
        fs::write(dir.path().join("daily").join(CURRENT_FILE), "nope\n").unwrap();
        assert!(matches!(store.load("daily"), Err(AppError::StaleModel(_))));
    }
}
