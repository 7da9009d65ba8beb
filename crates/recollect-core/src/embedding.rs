//! Embedding generation against a remote model service.
//!
//! One chunk (or query) in, one fixed-dimension vector out. Transport
//! failures are retried; anything still wrong after retries is reported as
//! [`EmbedOutcome::Skipped`], never an error; the indexing path drops the
//! chunk and moves on, while the query path treats a missing vector as fatal
//! because no answer can be grounded without it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::with_retry;

/// Vector dimension produced by the embedding model, fixed pipeline-wide.
/// Any response of a different length is rejected.
pub const EMBEDDING_DIMENSIONS: usize = 3072;

const DEFAULT_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-embedding-001:embedContent";

/// How the embedding service should weight the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// Text being stored for later retrieval.
    Document,
    /// Text being used to retrieve stored documents.
    Query,
}

impl TaskType {
    fn wire(self) -> &'static str {
        match self {
            TaskType::Document => "RETRIEVAL_DOCUMENT",
            TaskType::Query => "RETRIEVAL_QUERY",
        }
    }
}

/// Result of an embedding attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedOutcome {
    /// A validated vector of [`EMBEDDING_DIMENSIONS`] length.
    Vector(Vec<f32>),
    /// The service failed after retries or returned an unusable response.
    /// Callers on the indexing path skip the unit; the query path escalates.
    Skipped,
}

/// Non-retryable embedding failures. Transport problems never surface here.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding API key is required")]
    ApiKeyMissing,
}

/// Seam for the embedding service, so the gateway and tests can substitute
/// their own implementation.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text with the given task weighting.
    async fn embed(
        &self,
        text: &str,
        api_key: &str,
        task: TaskType,
    ) -> Result<EmbedOutcome, EmbedError>;

    /// Dimension of vectors this provider produces.
    fn dimensions(&self) -> usize;
}

/// Embedding client for the Gemini `embedContent` endpoint.
pub struct GeminiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    dimensions: usize,
    max_retries: u32,
    initial_delay: Duration,
}

impl GeminiEmbedder {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            dimensions: EMBEDDING_DIMENSIONS,
            max_retries,
            initial_delay,
        }
    }

    /// Override the service endpoint (for self-hosted gateways).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// One request attempt. Transport and HTTP-status failures are `Err` so
    /// the retry wrapper sees them; a 2xx response that lacks a usable vector
    /// is `Ok(None)`, a validation problem retrying will not fix.
    async fn request_once(
        &self,
        text: &str,
        api_key: &str,
        task: TaskType,
    ) -> anyhow::Result<Option<Vec<f32>>> {
        let request = EmbedContentRequest {
            content: Content {
                parts: vec![Part { text }],
            },
            task_type: task.wire(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("embedding request failed ({status}): {body}");
        }

        let payload: EmbedContentResponse = response.json().await?;
        Ok(payload.embedding.map(|e| e.values))
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedder {
    async fn embed(
        &self,
        text: &str,
        api_key: &str,
        task: TaskType,
    ) -> Result<EmbedOutcome, EmbedError> {
        if api_key.trim().is_empty() {
            return Err(EmbedError::ApiKeyMissing);
        }

        let result = with_retry(
            || self.request_once(text, api_key, task),
            self.max_retries,
            self.initial_delay,
        )
        .await;

        let values = match result {
            Ok(Some(values)) => values,
            Ok(None) => {
                tracing::warn!(text_len = text.len(), "Embedding response missing vector");
                return Ok(EmbedOutcome::Skipped);
            }
            Err(e) => {
                tracing::error!(text_len = text.len(), error = %e, "Embedding failed after retries");
                return Ok(EmbedOutcome::Skipped);
            }
        };

        Ok(validate_dimensions(values, self.dimensions))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Reject vectors whose length does not match the pipeline dimension.
fn validate_dimensions(values: Vec<f32>, expected: usize) -> EmbedOutcome {
    if values.len() == expected {
        EmbedOutcome::Vector(values)
    } else {
        tracing::warn!(
            got = values.len(),
            expected,
            "Embedding dimension mismatch, dropping vector"
        );
        EmbedOutcome::Skipped
    }
}

#[derive(Serialize)]
struct EmbedContentRequest<'a> {
    content: Content<'a>,
    #[serde(rename = "taskType")]
    task_type: &'static str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedContentResponse {
    #[serde(default)]
    embedding: Option<EmbeddingValues>,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    #[serde(default)]
    values: Vec<f32>,
}
