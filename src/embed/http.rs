use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embed::Embedder;
use crate::{AppError, AppResult};

/// Environment variable holding an optional bearer token for the embedding server.
pub const API_KEY_ENV_VAR: &str = "EMBEDDING_API_KEY";

#[derive(Serialize, Debug)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Embedding implementation that talks to an OpenAI-compatible `/embeddings` endpoint.
#[derive(Clone, Debug)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: std::env::var(API_KEY_ENV_VAR).ok().filter(|k| !k.is_empty()),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }
}

impl Embedder for HttpEmbedder {
    fn embed<'a>(&'a self, texts: &'a [String]) -> BoxFuture<'a, AppResult<Vec<Vec<f32>>>> {
        async move {
            let body = serde_json::to_vec(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })?;
            let mut request = self
                .client
                .post(self.endpoint())
                .header(CONTENT_TYPE, "application/json")
                .body(body);
            if let Some(key) = &self.api_key {
                request = request.header(AUTHORIZATION, format!("Bearer {key}"));
            }
            debug!("Requesting {} embeddings from {}", texts.len(), self.endpoint());
            let bytes = request.send().await?.error_for_status()?.bytes().await?;

            let mut response: EmbeddingResponse = serde_json::from_slice(&bytes)?;
            response.data.sort_by_key(|d| d.index);
            if response.data.len() != texts.len() {
                return Err(AppError::Other(format!(
                    "embedding server returned {} vectors for {} inputs",
                    response.data.len(),
                    texts.len()
                )));
            }
            Ok(response.data.into_iter().map(|d| d.embedding).collect())
        }
        .boxed()
    }
}
