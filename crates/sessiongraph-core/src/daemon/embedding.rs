//! Embedding provider contract
//!
//! Embeddings are computed elsewhere; the daemon only sends text and stores
//! the fixed-dimension vectors it gets back.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Turns text into fixed-dimension vectors
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model(&self) -> &str;

    fn dimensions(&self) -> usize;

    /// One vector per input text, in input order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Client for an OpenAI-compatible `/embeddings` endpoint
#[derive(Clone)]
pub struct HttpEmbeddingProvider {
    http_client: HttpClient,
    base_url: String,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
}

impl std::fmt::Debug for HttpEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmbeddingProvider")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("api_key", &self.api_key.is_some())
            .finish()
    }
}

impl HttpEmbeddingProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        timeout_secs: u64,
    ) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(Error::Network)?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            dimensions,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let provider = Self::new(
            config.base_url.clone(),
            config.model.clone(),
            config.dimensions,
            config.timeout_secs,
        )?;
        Ok(match config.resolved_api_key() {
            Some(key) => provider.with_api_key(key),
            None => provider,
        })
    }

    async fn handle_error_response<T>(
        &self,
        status: reqwest::StatusCode,
        response: reqwest::Response,
    ) -> Result<T> {
        let body = response.text().await.unwrap_or_default();

        match status.as_u16() {
            401 | 403 => Err(Error::Configuration(format!(
                "embedding endpoint rejected the API key ({status}); check embedding.api_key_env"
            ))),
            404 => Err(Error::Configuration(format!(
                "embedding model '{}' or endpoint not found: {body}",
                self.model
            ))),
            _ => Err(Error::Embedding(format!("HTTP error {status}: {body}"))),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        debug!(model = %self.model, inputs = texts.len(), "Sending embedding request");

        let mut request = self.http_client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(Error::Network)?;
        let status = response.status();
        if !status.is_success() {
            return self.handle_error_response(status, response).await;
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("Failed to parse response: {e}")))?;

        vectors_in_order(parsed.data, texts.len(), self.dimensions)
    }
}

/// Order response vectors by index and check their count and dimensionality
fn vectors_in_order(mut data: Vec<EmbeddingData>, expected: usize, dimensions: usize) -> Result<Vec<Vec<f32>>> {
    if data.len() != expected {
        return Err(Error::Embedding(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    data.sort_by_key(|d| d.index);

    data.into_iter()
        .map(|d| {
            if d.embedding.len() != dimensions {
                return Err(Error::Configuration(format!(
                    "embedding model returned {} dimensions but embedding.dimensions is {dimensions}",
                    d.embedding.len()
                )));
            }
            Ok(d.embedding)
        })
        .collect()
}
