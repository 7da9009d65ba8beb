//! Recollect Core - Capture ingestion and retrieval-grounded chat
//!
//! This crate contains the processing pipeline behind a personal reading
//! archive, including:
//! - Background ingestion jobs (PDF fetch, summarization, embedding)
//! - PDF text extraction (lopdf)
//! - Sentence-aware chunking and remote embedding generation
//! - Vector index gateway (Qdrant-compatible REST)
//! - Prompt assembly and streamed, retrieval-grounded answers

pub mod chat;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod jobs;
pub mod pdf;
pub mod prompt;
pub mod provider;
pub mod retry;
pub mod storage;
pub mod vector;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use chat::{ChatErrorCode, ChatEvent, ChatRequest};
pub use config::PipelineConfig;
pub use embedding::{EmbeddingProvider, GeminiEmbedder};
pub use jobs::{JobContext, JobQueueHandle, QueueConfig};
pub use provider::{GeminiGenerator, GenerativeProvider};
pub use storage::{BlobStore, DocumentStore, ProcessingStatus};
pub use vector::{QdrantStore, VectorIndex, VectorStore};

/// The assembled pipeline: worker pools running plus everything a caller
/// needs to submit captures and ask questions about them.
pub struct Pipeline {
    ctx: Arc<JobContext>,
    queue: JobQueueHandle,
}

impl Pipeline {
    /// Start the worker pools over the given collaborators.
    pub fn start(ctx: JobContext) -> Self {
        let ctx = Arc::new(ctx);
        let queue = jobs::queue::spawn(ctx.clone());
        Self { ctx, queue }
    }

    /// Begin ingesting a capture that already has a document record.
    pub async fn start_capture(
        &self,
        document_id: &str,
        user_id: &str,
        api_key: &str,
    ) -> anyhow::Result<()> {
        jobs::start_capture(&self.ctx, &self.queue, document_id, user_id, api_key).await
    }

    /// Re-run ingestion for a failed capture.
    pub async fn reprocess(
        &self,
        document_id: &str,
        user_id: &str,
        api_key: &str,
    ) -> anyhow::Result<()> {
        jobs::reprocess(&self.ctx, &self.queue, document_id, user_id, api_key).await
    }

    /// Schedule removal of a capture's vectors.
    pub fn delete_capture(&self, document_id: &str, user_id: &str) -> anyhow::Result<()> {
        jobs::delete_capture(&self.queue, document_id, user_id)
    }

    /// Stream a grounded answer, emitting [`ChatEvent`]s on `event_tx`.
    pub async fn answer(
        &self,
        req: ChatRequest,
        event_tx: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) {
        chat::stream_answer(
            &self.ctx.index,
            self.ctx.generator.clone(),
            &self.ctx.config,
            req,
            event_tx,
            cancel,
        )
        .await;
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Stop the worker pools. In-flight jobs finish; queued work is dropped.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}
