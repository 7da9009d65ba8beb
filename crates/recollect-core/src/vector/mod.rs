//! Vector index gateway.
//!
//! Owns the lifecycle of a capture's vectors: collection creation, batch
//! upsert during indexing, filtered delete on capture removal, and filtered
//! top-k search at query time. The store behind it is an external capability
//! reached through the [`VectorStore`] trait; [`QdrantStore`] talks to a real
//! cluster and [`MemoryVectorStore`] backs tests.

mod memory;
mod qdrant;

pub use memory::MemoryVectorStore;
pub use qdrant::QdrantStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::chunker;
use crate::config::PipelineConfig;
use crate::embedding::{EmbedError, EmbedOutcome, EmbeddingProvider, TaskType};
use crate::retry::with_retry;

/// Scopes an operation to one user's capture. Every delete and search carries
/// this filter so no operation can touch another owner's points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerFilter {
    pub user_id: String,
    pub document_id: String,
}

/// Payload stored alongside each vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPayload {
    pub text: String,
    pub user_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub created_at: String,
}

/// One entry in the vector store.
#[derive(Debug, Clone)]
pub struct IndexPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// A search result with its similarity score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub score: f32,
    pub payload: PointPayload,
}

/// External vector database contract.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create the collection if it does not exist. Idempotent.
    async fn ensure_collection(&self, name: &str, dimensions: usize) -> anyhow::Result<()>;

    /// Upsert a batch of points. At-least-once; not transactional.
    async fn upsert(&self, collection: &str, points: Vec<IndexPoint>) -> anyhow::Result<()>;

    /// Delete every point whose payload matches the owner filter.
    async fn delete_by_owner(&self, collection: &str, filter: &OwnerFilter) -> anyhow::Result<()>;

    /// Top-`limit` similarity search scoped to the owner filter.
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        filter: &OwnerFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<SearchHit>>;
}

/// Request to index one capture's clean text.
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub text: String,
    pub document_id: String,
    pub user_id: String,
    pub api_key: String,
}

/// Failures on the query path. A missing query vector is fatal here; unlike
/// the indexing path, there is nothing to skip and continue with.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("embedding API key is required")]
    ApiKeyMissing,
    #[error("could not embed the query; no answer can be grounded")]
    NoQueryVector,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl From<EmbedError> for QueryError {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::ApiKeyMissing => QueryError::ApiKeyMissing,
        }
    }
}

/// Gateway tying the chunker, embedder, and vector store together.
pub struct VectorIndex {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    collection: String,
    max_chunk_chars: usize,
    top_k: usize,
    store_max_retries: u32,
    store_retry_delay: std::time::Duration,
}

impl VectorIndex {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            collection: config.collection.clone(),
            max_chunk_chars: config.max_chunk_chars,
            top_k: config.top_k,
            store_max_retries: config.store_max_retries,
            store_retry_delay: config.store_retry_delay,
        }
    }

    /// Chunk, embed, and upsert one capture's text.
    ///
    /// Chunks whose embedding is unavailable are dropped with a warning. If
    /// no chunk embeds at all the call is a no-op, logged but not an error.
    /// Existing points for the capture are deleted first so re-indexing
    /// converges instead of accumulating duplicates.
    ///
    /// Returns the number of points written.
    pub async fn index_document(&self, req: IndexRequest) -> anyhow::Result<usize> {
        self.store
            .ensure_collection(&self.collection, self.embedder.dimensions())
            .await?;

        let chunks = chunker::chunk(&req.text, self.max_chunk_chars);
        let created_at = chrono::Utc::now().to_rfc3339();
        let mut points = Vec::with_capacity(chunks.len());

        for (chunk_index, text) in chunks.iter().enumerate() {
            match self
                .embedder
                .embed(text, &req.api_key, TaskType::Document)
                .await?
            {
                EmbedOutcome::Vector(vector) => points.push(IndexPoint {
                    id: Uuid::new_v4(),
                    vector,
                    payload: PointPayload {
                        text: text.clone(),
                        user_id: req.user_id.clone(),
                        document_id: req.document_id.clone(),
                        chunk_index,
                        created_at: created_at.clone(),
                    },
                }),
                EmbedOutcome::Skipped => {
                    tracing::warn!(
                        doc_id = %req.document_id,
                        chunk_index,
                        "Chunk embedding unavailable, dropping chunk"
                    );
                }
            }
        }

        if points.is_empty() {
            tracing::info!(doc_id = %req.document_id, "No chunks embedded, nothing to index");
            return Ok(0);
        }

        let filter = OwnerFilter {
            user_id: req.user_id.clone(),
            document_id: req.document_id.clone(),
        };
        // Clear any previous generation of this capture before writing.
        with_retry(
            || self.store.delete_by_owner(&self.collection, &filter),
            self.store_max_retries,
            self.store_retry_delay,
        )
        .await?;

        let written = points.len();
        with_retry(
            || self.store.upsert(&self.collection, points.clone()),
            self.store_max_retries,
            self.store_retry_delay,
        )
        .await?;

        tracing::info!(
            doc_id = %req.document_id,
            chunk_count = chunks.len(),
            point_count = written,
            "Capture indexed"
        );
        Ok(written)
    }

    /// Remove every point belonging to `(user_id, document_id)`.
    pub async fn delete_document(&self, document_id: &str, user_id: &str) -> anyhow::Result<()> {
        let filter = OwnerFilter {
            user_id: user_id.to_string(),
            document_id: document_id.to_string(),
        };
        with_retry(
            || self.store.delete_by_owner(&self.collection, &filter),
            self.store_max_retries,
            self.store_retry_delay,
        )
        .await?;
        tracing::info!(doc_id = %document_id, "Capture vectors deleted");
        Ok(())
    }

    /// Embed `query` and return the most relevant stored chunks for the
    /// capture. An empty result set is normal; a query that cannot be
    /// embedded is [`QueryError::NoQueryVector`].
    pub async fn search(
        &self,
        query: &str,
        document_id: &str,
        user_id: &str,
        api_key: &str,
    ) -> Result<Vec<SearchHit>, QueryError> {
        let vector = match self.embedder.embed(query, api_key, TaskType::Query).await? {
            EmbedOutcome::Vector(v) => v,
            EmbedOutcome::Skipped => return Err(QueryError::NoQueryVector),
        };

        let filter = OwnerFilter {
            user_id: user_id.to_string(),
            document_id: document_id.to_string(),
        };
        let hits = with_retry(
            || self.store.search(&self.collection, &vector, &filter, self.top_k),
            self.store_max_retries,
            self.store_retry_delay,
        )
        .await?;

        tracing::debug!(doc_id = %document_id, hit_count = hits.len(), "Retrieval complete");
        Ok(hits)
    }
}
