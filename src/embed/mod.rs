//! Boundary to the service that turns documents into embedding vectors.

pub(crate) mod http;

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{Instrument, info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::corpus::Record;
use crate::logging::progress_bar_style;
use crate::{AppError, AppResult};

pub use http::HttpEmbedder;

/// Trait for converting text into vector embeddings.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per text in input order.
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>>;
}

/// How a batch is split up and how hard each piece is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub chunk_size: usize,
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

/// Wraps an embedder so that inputs are sent in fixed-size chunks, each retried with a fixed
/// delay up to `max_attempts` times. Dropping the returned future cancels any pending request
/// or sleep.
pub struct ChunkedEmbedder<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E: Embedder> ChunkedEmbedder<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn embed_chunk(&self, index: usize, chunk: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.inner.embed(chunk).await {
                Ok(embeddings) if embeddings.len() == chunk.len() => return Ok(embeddings),
                Ok(embeddings) => {
                    last_error = format!(
                        "expected {} embeddings, received {}",
                        chunk.len(),
                        embeddings.len()
                    );
                }
                Err(e) => last_error = e.to_string(),
            }
            warn!("Chunk {index} attempt {attempt}/{attempts} failed: {last_error}");
            if attempt < attempts {
                tokio::time::sleep(self.policy.delay).await;
            }
        }
        Err(AppError::RetriesExhausted {
            chunk: index,
            attempts,
            last_error,
        })
    }
}

impl<E: Embedder> Embedder for ChunkedEmbedder<E> {
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>> {
        let span = info_span!("Embedding chunks");
        span.pb_set_style(&progress_bar_style());
        span.pb_set_length(texts.len() as u64);
        let progress = span.clone();

        async move {
            let mut embeddings = Vec::with_capacity(texts.len());
            for (index, chunk) in texts.chunks(self.policy.chunk_size.max(1)).enumerate() {
                embeddings.extend(self.embed_chunk(index, chunk).await?);
                progress.pb_inc(chunk.len() as u64);
            }
            Ok(embeddings)
        }
        .instrument(span)
        .boxed()
    }
}

/// The text a document is embedded from: its abstract, or its title when it has none.
fn document_text(doc: &Map<String, Value>) -> Option<String> {
    ["abstract", "title"]
        .iter()
        .filter_map(|key| doc.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

/// Embed raw documents and turn them into records carrying `embedding` and `embedding_model`.
#[tracing::instrument(
    name = "Embedding documents",
    level = "info",
    skip(embedder, documents),
    fields(n = documents.len())
)]
pub async fn embed_records<E: Embedder>(
    embedder: &E,
    documents: Vec<Map<String, Value>>,
    model_name: &str,
) -> AppResult<Vec<Record>> {
    let texts = documents
        .iter()
        .enumerate()
        .map(|(row, doc)| {
            document_text(doc).ok_or_else(|| {
                AppError::Other(format!("document {row} has neither an abstract nor a title"))
            })
        })
        .collect::<AppResult<Vec<String>>>()?;

    let embeddings = embedder.embed(&texts).await?;
    if embeddings.len() != documents.len() {
        return Err(AppError::Other(format!(
            "embedder returned {} vectors for {} documents",
            embeddings.len(),
            documents.len()
        )));
    }

    let records = documents
        .into_iter()
        .zip(embeddings)
        .map(|(mut metadata, embedding)| {
            metadata.remove("embedding");
            metadata.insert("embedding_model".into(), model_name.into());
            Record {
                embedding,
                metadata,
            }
        })
        .collect::<Vec<_>>();
    info!("Embedded {} documents with {model_name}", records.len());
    Ok(records)
}
