use std::time::Duration;

use crate::jobs::QueueConfig;

/// Pipeline configuration shared by the gateway, streamer, and job handlers.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Vector-store collection holding all capture chunks.
    pub collection: String,
    /// Maximum characters per text chunk.
    pub max_chunk_chars: usize,
    /// Number of passages retrieved to ground an answer.
    pub top_k: usize,
    /// Character cap applied to the document summary inside the prompt.
    pub summary_max_chars: usize,
    /// Minimum clean-text length worth summarizing. Shorter documents are
    /// skipped silently rather than failed.
    pub min_summary_chars: usize,
    /// How many of the most recent conversation turns go into the prompt.
    pub prompt_window: usize,
    /// Retries for a single embedding request.
    pub embed_max_retries: u32,
    /// Initial delay before the first embedding retry (grows linearly).
    pub embed_retry_delay: Duration,
    /// Retries for vector-store upsert/delete/search calls.
    pub store_max_retries: u32,
    /// Initial delay before the first vector-store retry.
    pub store_retry_delay: Duration,
    /// Wall-clock cap on a generative-model call (summary or answer).
    pub generation_timeout: Duration,
    /// Size cap checked before downloading a remote PDF.
    pub max_pdf_bytes: u64,
    /// Worker pool sizes and queue-level retry policy.
    pub queue: QueueConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            collection: "captures".to_string(),
            max_chunk_chars: 500,
            top_k: 5,
            summary_max_chars: 1500,
            min_summary_chars: 100,
            prompt_window: 6,
            embed_max_retries: 3,
            embed_retry_delay: Duration::from_millis(2000),
            store_max_retries: 3,
            store_retry_delay: Duration::from_millis(1000),
            generation_timeout: Duration::from_secs(60),
            max_pdf_bytes: 20 * 1024 * 1024,
            queue: QueueConfig::default(),
        }
    }
}
