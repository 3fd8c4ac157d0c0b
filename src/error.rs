use std::path::PathBuf;

use thiserror::Error;

/// Unified application error type shared by training, inference and the CLI.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Errored while handling a file. {0}")]
    Io(#[from] std::io::Error),
    #[error("Error serializing json. {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Invalid record file. {0}")]
    RecordFormat(#[from] serde_path_to_error::Error<serde_json::Error>),
    #[error("Error encoding a model artifact. {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),
    #[error("Error decoding a model artifact. {0}")]
    BincodeDecode(#[from] bincode::error::DecodeError),
    #[error("Error while clustering. {0}")]
    Hdbscan(#[from] hdbscan::HdbscanError),
    #[error("Linear algebra error. {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
    #[error("Array shape error. {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Error accessing a remote server. {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid RSS feed. {0}")]
    Feed(#[from] rss::Error),
    #[error("Error parsing the duration string. {0}")]
    DurationParse(#[from] humantime::DurationError),
    #[error("Error formatting a timestamp. {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("{0}")]
    Dir(#[from] arxiv_daily_dirs::DirError),
    #[error("Expected vectors of dimension {expected}, row {row} has {found}")]
    DimensionMismatch {
        expected: usize,
        found: usize,
        row: usize,
    },
    #[error("Cannot fit a reducer on an empty corpus")]
    EmptyCorpus,
    #[error(
        "Found {points} points, clustering needs at least min_cluster_size = {min_cluster_size} and min_samples = {min_samples}"
    )]
    InsufficientData {
        points: usize,
        min_cluster_size: usize,
        min_samples: usize,
    },
    #[error("Model artifacts were not fit together. {0}")]
    StaleModel(String),
    #[error("No model set found at {0}")]
    ModelNotFound(PathBuf),
    #[error("Row {row} contains a NaN or infinite value")]
    NonFinite { row: usize },
    #[error("Embedding chunk {chunk} failed after {attempts} attempts. {last_error}")]
    RetriesExhausted {
        chunk: usize,
        attempts: usize,
        last_error: String,
    },
    #[error("Error while rendering the plot. {0}")]
    Plot(String),
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for results that bubble `AppError`.
pub type AppResult<T> = Result<T, AppError>;
