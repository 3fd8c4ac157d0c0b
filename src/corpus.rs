//! Daily record files and the training corpus built from them.

use std::fs;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::linalg::embeddings_to_ndarray;
use crate::{AppError, AppResult};

/// One document of a daily batch.
///
/// Only `embedding` is required; title, abstract, link and whatever else the fetcher stored
/// is carried through untouched in `metadata`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    pub embedding: Vec<f32>,
    #[serde(flatten)]
    pub metadata: Map<String, Value>,
}

impl Record {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            metadata: Map::new(),
        }
    }

    /// String metadata field, if present.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Compression of a record file, picked from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Plain,
    Gzip,
    Zstd,
}

impl Codec {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Codec::Gzip,
            Some("zst") => Codec::Zstd,
            _ => Codec::Plain,
        }
    }
}

fn open_reader(path: &Path) -> AppResult<Box<dyn Read>> {
    let file = fs::File::open(path)?;
    Ok(match Codec::for_path(path) {
        Codec::Plain => Box::new(BufReader::new(file)),
        Codec::Gzip => Box::new(GzDecoder::new(BufReader::new(file))),
        Codec::Zstd => Box::new(zstd::stream::Decoder::new(file)?),
    })
}

/// Deserialize a (possibly compressed) JSON file, reporting the path of any invalid field.
#[tracing::instrument(name = "Reading JSON file", level = "trace")]
pub fn read_json_file<T: DeserializeOwned>(path: &Path) -> AppResult<T> {
    let reader = open_reader(path)?;
    let mut de = serde_json::Deserializer::from_reader(reader);
    Ok(serde_path_to_error::deserialize(&mut de)?)
}

/// Serialize to a (possibly compressed) JSON file through a temporary sibling and a rename,
/// so readers never observe a half-written file.
#[tracing::instrument(name = "Writing JSON file", level = "trace", skip(value))]
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::Other(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    {
        let file = fs::File::create(&tmp)?;
        let writer = BufWriter::new(file);
        let writer = match Codec::for_path(path) {
            Codec::Plain => {
                let mut writer = writer;
                serde_json::to_writer(&mut writer, value)?;
                writer
            }
            Codec::Gzip => {
                let mut enc = GzEncoder::new(writer, Compression::default());
                serde_json::to_writer(&mut enc, value)?;
                enc.finish()?
            }
            Codec::Zstd => {
                let mut enc = zstd::stream::Encoder::new(writer, 3)?;
                serde_json::to_writer(&mut enc, value)?;
                enc.finish()?
            }
        };
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_records(path: &Path) -> AppResult<Vec<Record>> {
    read_json_file(path)
}

pub fn write_records(path: &Path, records: &[Record]) -> AppResult<()> {
    write_json_file(path, &records)
}

/// Regular, non-hidden files of `directory`, sorted by name.
fn record_files(directory: &Path) -> AppResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if entry.file_type()?.is_file() && !hidden {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Read and concatenate the records of every daily file in `directory`.
#[tracing::instrument(name = "Loading daily records", level = "info")]
pub fn list_daily_records(directory: &Path) -> AppResult<Vec<Record>> {
    let mut records = Vec::new();
    for file in record_files(directory)? {
        let day = read_records(&file)?;
        debug!("Loaded {} records from {}", day.len(), file.display());
        records.extend(day);
    }
    info!("Loaded {} records from {}", records.len(), directory.display());
    Ok(records)
}

/// The most recently modified daily file, i.e. the batch inference should run on.
pub fn most_recent_file(directory: &Path) -> AppResult<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for file in record_files(directory)? {
        let modified = fs::metadata(&file)?.modified()?;
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, file));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// The historical embeddings a training run is fit on. Never persisted.
#[derive(Debug, Clone)]
pub struct Corpus {
    data: Array2<f64>, // data = (n_samples, dim)
}

impl Corpus {
    pub fn from_embeddings(embs: &[Vec<f32>]) -> AppResult<Self> {
        Ok(Self {
            data: embeddings_to_ndarray(embs, None)?,
        })
    }

    pub fn from_records(records: &[Record]) -> AppResult<Self> {
        let embs: Vec<Vec<f32>> = records.iter().map(|r| r.embedding.clone()).collect();
        Self::from_embeddings(&embs)
    }

    pub fn from_array(data: Array2<f64>) -> Self {
        Self { data }
    }

    /// Load every daily record file below `directory`.
    pub fn load(directory: &Path) -> AppResult<Self> {
        let records = list_daily_records(directory)?;
        if records.is_empty() {
            warn!("No records found in {}", directory.display());
        }
        Self::from_records(&records)
    }

    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.data.nrows() == 0
    }

    pub fn dim(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(embedding: Vec<f32>, title: &str) -> Record {
        let mut r = Record::new(embedding);
        r.metadata.insert("title".into(), json!(title));
        r
    }

    #[test]
    fn records_roundtrip_through_every_codec() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![record(vec![0.5, 1.5], "a"), record(vec![2.0, -1.0], "b")];
        for name in ["day.json", "day.json.gz", "day.json.zst"] {
            let path = dir.path().join(name);
            write_records(&path, &records).unwrap();
            let back = read_records(&path).unwrap();
            assert_eq!(back, records, "codec for {name}");
        }
    }

    #[test]
    fn metadata_passes_through_and_embedding_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.json");
        fs::write(
            &path,
            r#"[{"title": "t", "guid": "oai:1", "embedding": [1.0, 2.0], "embedding_model": "m"}]"#,
        )
        .unwrap();
        let records = read_records(&path).unwrap();
        assert_eq!(records[0].field("guid"), Some("oai:1"));
        assert_eq!(records[0].field("embedding_model"), Some("m"));

        fs::write(&path, r#"[{"title": "t"}]"#).unwrap();
        assert!(matches!(read_records(&path), Err(AppError::RecordFormat(_))));
    }

    #[test]
    fn list_daily_records_concatenates_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let day2 = dir.path().join("2024_05_02_cs.json.gz");
        let day1 = dir.path().join("2024_05_01_cs.json.gz");
        write_records(&day2, &[record(vec![2.0], "b")]).unwrap();
        write_records(&day1, &[record(vec![1.0], "a")]).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let records = list_daily_records(dir.path()).unwrap();
        let titles: Vec<_> = records.iter().filter_map(|r| r.field("title")).collect();
        assert_eq!(titles, vec!["a", "b"]);

        let corpus = Corpus::from_records(&records).unwrap();
        assert_eq!((corpus.len(), corpus.dim()), (2, 1));
    }

    #[test]
    fn corpus_rejects_mixed_dimensions() {
        let records = vec![record(vec![1.0, 2.0], "a"), record(vec![1.0], "b")];
        assert!(matches!(
            Corpus::from_records(&records),
            Err(AppError::DimensionMismatch { expected: 2, found: 1, row: 1 })
        ));
    }

    #[test]
    fn most_recent_file_of_empty_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(most_recent_file(dir.path()).unwrap(), None);
        write_records(&dir.path().join("only.json"), &[record(vec![1.0], "a")]).unwrap();
        assert_eq!(
            most_recent_file(dir.path()).unwrap(),
            Some(dir.path().join("only.json"))
        );
    }
}
