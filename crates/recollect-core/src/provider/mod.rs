//! Generative model providers.
//!
//! A provider turns an assembled prompt into text, either streamed segment by
//! segment (conversation path) or collected in one call (summarization path).
//! The trait is the seam that lets tests substitute scripted models.

mod gemini;

pub use gemini::GeminiGenerator;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Unified interface to a generative model service.
#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    /// Stream a completion for `prompt`, sending each text segment on
    /// `delta_tx` in arrival order. Stops promptly when `cancel` fires or
    /// the receiver is dropped, releasing the underlying network stream.
    /// Returns the accumulated text.
    async fn stream_generate(
        &self,
        prompt: &str,
        api_key: &str,
        delta_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> anyhow::Result<String>;

    /// Non-streaming completion, used for summarization.
    async fn generate(&self, prompt: &str, api_key: &str) -> anyhow::Result<String>;
}
