//! Background ingestion jobs.
//!
//! Each capture flows through a small set of jobs: PDF captures start with a
//! fetch-and-extract job, then every capture gets a summarization job and an
//! embedding job. Jobs are retried with exponential backoff at the queue
//! level; a job that keeps failing marks the document `error` (embedding
//! failures are soft and only logged, since the capture itself is intact).

pub mod queue;
mod types;

pub use queue::{JobQueueHandle, QueueConfig};
pub use types::{EmbedTask, Job, JobKind, WorkerPool};

use std::sync::Arc;

use anyhow::{anyhow, Context};

use crate::config::PipelineConfig;
use crate::pdf;
use crate::provider::GenerativeProvider;
use crate::storage::{BlobStore, DocumentStore, PdfMetadata, ProcessingStatus};
use crate::vector::{IndexRequest, VectorIndex};

/// Shared collaborators handed to every job handler.
pub struct JobContext {
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub index: Arc<VectorIndex>,
    pub generator: Arc<dyn GenerativeProvider>,
    pub http: reqwest::Client,
    pub config: PipelineConfig,
}

/// How a handler failed. Retryable failures go back on the queue with
/// backoff; fatal ones fail the document immediately.
enum JobError {
    Fatal(anyhow::Error),
    Retryable(anyhow::Error),
}

impl JobError {
    fn inner(&self) -> &anyhow::Error {
        match self {
            JobError::Fatal(e) | JobError::Retryable(e) => e,
        }
    }
}

/// Run one job to completion, scheduling retries and follow-up jobs.
pub(crate) async fn run_job(ctx: &JobContext, queue: &JobQueueHandle, job: Job) {
    tracing::info!(
        job = job.kind.name(),
        doc_id = %job.document_id,
        attempt = job.attempt,
        "Running job"
    );

    let result = match &job.kind {
        JobKind::PdfFetch { url } => run_pdf_fetch(ctx, queue, &job, url).await,
        JobKind::Summarize => run_summarize(ctx, &job).await,
        JobKind::Embed(EmbedTask::Index) => run_embed_index(ctx, &job).await,
        JobKind::Embed(EmbedTask::Delete) => run_embed_delete(ctx, &job).await,
    };

    let error = match result {
        Ok(()) => return,
        Err(e) => e,
    };

    if let JobError::Retryable(_) = &error {
        let next_attempt = job.attempt + 1;
        if next_attempt < ctx.config.queue.max_attempts {
            let backoff = ctx.config.queue.backoff_base * 2u32.pow(job.attempt);
            tracing::warn!(
                job = job.kind.name(),
                doc_id = %job.document_id,
                attempt = job.attempt,
                error = %error.inner(),
                backoff_ms = backoff.as_millis() as u64,
                "Job failed, retrying"
            );
            let mut retry = job;
            retry.attempt = next_attempt;
            queue.enqueue_after(retry, backoff);
            return;
        }
    }

    mark_failed(ctx, &job, error.inner()).await;
}

/// Terminal failure handling. Embedding jobs fail soft because the capture's
/// text and summary are still usable without vectors.
async fn mark_failed(ctx: &JobContext, job: &Job, error: &anyhow::Error) {
    match job.kind {
        JobKind::Embed(_) => {
            tracing::warn!(
                job = job.kind.name(),
                doc_id = %job.document_id,
                error = %error,
                "Embedding job gave up; capture left unindexed"
            );
        }
        _ => {
            tracing::error!(
                job = job.kind.name(),
                doc_id = %job.document_id,
                error = %error,
                "Job gave up; marking document failed"
            );
            if let Err(e) = ctx
                .documents
                .set_status(&job.document_id, ProcessingStatus::Error, Some(&error.to_string()))
                .await
            {
                tracing::error!(doc_id = %job.document_id, error = %e, "Failed to record job failure");
            }
        }
    }
}

async fn run_pdf_fetch(
    ctx: &JobContext,
    queue: &JobQueueHandle,
    job: &Job,
    url: &str,
) -> Result<(), JobError> {
    ctx.documents
        .set_status(&job.document_id, ProcessingStatus::Processing, None)
        .await
        .map_err(JobError::Retryable)?;

    let response = ctx
        .http
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("Failed to fetch PDF from {url}"))
        .map_err(JobError::Retryable)?;

    // Check the declared size before pulling the body, and the actual size
    // after; the header is advisory.
    let cap = ctx.config.max_pdf_bytes;
    if let Some(len) = response.content_length() {
        if len > cap {
            return Err(JobError::Fatal(anyhow!(
                "PDF is {len} bytes, over the {cap} byte limit"
            )));
        }
    }
    let bytes = response
        .bytes()
        .await
        .context("Failed to download PDF body")
        .map_err(JobError::Retryable)?
        .to_vec();
    if bytes.len() as u64 > cap {
        return Err(JobError::Fatal(anyhow!(
            "PDF is {} bytes, over the {cap} byte limit",
            bytes.len()
        )));
    }

    let content_hash = blake3::hash(&bytes).to_hex().to_string();
    let byte_size = bytes.len();
    let blob_key = format!("{}.pdf", job.document_id);

    // Extraction is CPU-bound; run it off the async runtime while the bytes
    // upload to the blob store.
    let extraction = tokio::task::spawn_blocking({
        let bytes = bytes.clone();
        move || pdf::extract_text(&bytes)
    });
    let (extracted, stored) = tokio::join!(extraction, ctx.blobs.put(&blob_key, bytes));
    stored.map_err(JobError::Retryable)?;
    let extracted = extracted
        .map_err(|e| JobError::Retryable(anyhow!(e)))?
        .map_err(JobError::Fatal)?;

    ctx.documents
        .set_pdf_metadata(
            &job.document_id,
            PdfMetadata {
                content_hash,
                page_count: extracted.page_count,
                byte_size,
            },
        )
        .await
        .map_err(JobError::Retryable)?;
    ctx.documents
        .set_clean_text(&job.document_id, &extracted.text)
        .await
        .map_err(JobError::Retryable)?;
    ctx.documents
        .set_status(&job.document_id, ProcessingStatus::Ready, None)
        .await
        .map_err(JobError::Retryable)?;

    tracing::info!(
        doc_id = %job.document_id,
        pages = extracted.page_count,
        bytes = byte_size,
        "PDF extracted"
    );

    let api_key = job.api_key.as_deref();
    queue
        .enqueue(Job::new(
            JobKind::Summarize,
            &job.document_id,
            &job.user_id,
            api_key,
        ))
        .map_err(JobError::Retryable)?;
    queue
        .enqueue(Job::new(
            JobKind::Embed(EmbedTask::Index),
            &job.document_id,
            &job.user_id,
            api_key,
        ))
        .map_err(JobError::Retryable)?;
    Ok(())
}

fn summary_prompt(text: &str) -> String {
    format!(
        "Summarize the following document in a few short paragraphs. \
         Cover the main points and key details; do not add commentary.\n\n{text}"
    )
}

async fn run_summarize(ctx: &JobContext, job: &Job) -> Result<(), JobError> {
    let record = ctx
        .documents
        .get(&job.document_id)
        .await
        .map_err(JobError::Retryable)?
        .ok_or_else(|| JobError::Fatal(anyhow!("document {} not found", job.document_id)))?;
    let text = record
        .clean_text
        .ok_or_else(|| JobError::Fatal(anyhow!("document has no text to summarize")))?;

    // Too short to be worth a model call. Skipped before any status change,
    // so the document keeps its current state instead of looking failed.
    if text.chars().count() < ctx.config.min_summary_chars {
        tracing::debug!(
            doc_id = %job.document_id,
            chars = text.chars().count(),
            "Text too short to summarize, skipping"
        );
        return Ok(());
    }

    let api_key = job
        .api_key
        .as_deref()
        .ok_or_else(|| JobError::Fatal(anyhow!("summarization requires a model API key")))?;

    ctx.documents
        .set_status(&job.document_id, ProcessingStatus::Processing, None)
        .await
        .map_err(JobError::Retryable)?;

    let prompt = summary_prompt(&text);
    let summary = tokio::time::timeout(
        ctx.config.generation_timeout,
        ctx.generator.generate(&prompt, api_key),
    )
    .await
    .map_err(|_| JobError::Retryable(anyhow!("summarization timed out")))?
    .map_err(JobError::Retryable)?;

    ctx.documents
        .set_summary(&job.document_id, &summary)
        .await
        .map_err(JobError::Retryable)?;
    ctx.documents
        .set_status(&job.document_id, ProcessingStatus::Complete, None)
        .await
        .map_err(JobError::Retryable)?;

    tracing::info!(doc_id = %job.document_id, chars = summary.len(), "Summary stored");
    Ok(())
}

async fn run_embed_index(ctx: &JobContext, job: &Job) -> Result<(), JobError> {
    let record = ctx
        .documents
        .get(&job.document_id)
        .await
        .map_err(JobError::Retryable)?
        .ok_or_else(|| JobError::Fatal(anyhow!("document {} not found", job.document_id)))?;
    let text = record
        .clean_text
        .ok_or_else(|| JobError::Fatal(anyhow!("document has no text to index")))?;
    let api_key = job
        .api_key
        .as_deref()
        .ok_or_else(|| JobError::Fatal(anyhow!("indexing requires a model API key")))?;

    let indexed = ctx
        .index
        .index_document(IndexRequest {
            text,
            document_id: job.document_id.clone(),
            user_id: job.user_id.clone(),
            api_key: api_key.to_string(),
        })
        .await
        .map_err(JobError::Retryable)?;

    tracing::debug!(doc_id = %job.document_id, points = indexed, "Embed job finished");
    Ok(())
}

async fn run_embed_delete(ctx: &JobContext, job: &Job) -> Result<(), JobError> {
    ctx.index
        .delete_document(&job.document_id, &job.user_id)
        .await
        .map_err(JobError::Retryable)?;
    tracing::debug!(doc_id = %job.document_id, "Delete job finished");
    Ok(())
}

/// Kick off ingestion for a newly captured document. PDF captures start with
/// a fetch job; text captures already have their clean text and go straight
/// to summarization and indexing.
pub async fn start_capture(
    ctx: &JobContext,
    queue: &JobQueueHandle,
    document_id: &str,
    user_id: &str,
    api_key: &str,
) -> anyhow::Result<()> {
    let record = ctx
        .documents
        .get(document_id)
        .await?
        .ok_or_else(|| anyhow!("document {document_id} not found"))?;

    if record.is_pdf {
        let url = record
            .source_url
            .ok_or_else(|| anyhow!("PDF capture {document_id} has no source URL"))?;
        queue.enqueue(Job::new(
            JobKind::PdfFetch { url },
            document_id,
            user_id,
            Some(api_key),
        ))?;
    } else {
        queue.enqueue(Job::new(
            JobKind::Summarize,
            document_id,
            user_id,
            Some(api_key),
        ))?;
        queue.enqueue(Job::new(
            JobKind::Embed(EmbedTask::Index),
            document_id,
            user_id,
            Some(api_key),
        ))?;
    }
    Ok(())
}

/// Re-run ingestion for a document that previously failed. Clears the error
/// state, then follows the same routing as a fresh capture.
pub async fn reprocess(
    ctx: &JobContext,
    queue: &JobQueueHandle,
    document_id: &str,
    user_id: &str,
    api_key: &str,
) -> anyhow::Result<()> {
    ctx.documents
        .set_status(document_id, ProcessingStatus::Processing, None)
        .await?;
    start_capture(ctx, queue, document_id, user_id, api_key).await
}

/// Remove a capture's vectors. The document record itself is deleted by the
/// caller; this only schedules the index cleanup.
pub fn delete_capture(
    queue: &JobQueueHandle,
    document_id: &str,
    user_id: &str,
) -> anyhow::Result<()> {
    queue.enqueue(Job::new(
        JobKind::Embed(EmbedTask::Delete),
        document_id,
        user_id,
        None,
    ))
}
