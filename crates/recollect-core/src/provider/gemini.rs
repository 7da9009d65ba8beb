//! Gemini API provider.
//!
//! Uses reqwest for streaming completions via SSE (`alt=sse`), parsing
//! `data:` events into text segments.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::GenerativeProvider;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Streaming client for the Gemini `generateContent` endpoints.
pub struct GeminiGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl GeminiGenerator {
    pub fn new(model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: GEMINI_BASE_URL.to_string(),
            model: model.to_string(),
        }
    }

    /// Override the API base URL (for self-hosted gateways).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn request_body(prompt: &str) -> GenerateRequest<'_> {
        GenerateRequest {
            contents: vec![WireContent {
                role: "user",
                parts: vec![WirePart { text: prompt }],
            }],
        }
    }
}

#[async_trait]
impl GenerativeProvider for GeminiGenerator {
    async fn stream_generate(
        &self,
        prompt: &str,
        api_key: &str,
        delta_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        let url = format!(
            "{}/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&Self::request_body(prompt))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("generation request failed ({status}): {body}");
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut accumulated = String::new();

        while let Some(chunk_result) = stream.next().await {
            if cancel.is_cancelled() {
                break;
            }

            let chunk = chunk_result?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE events.
            while let Some(event_end) = buffer.find("\n\n") {
                let event_data = buffer[..event_end].to_string();
                buffer = buffer[event_end + 2..].to_string();

                for line in event_data.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        continue;
                    }
                    let Ok(event) = serde_json::from_str::<GenerateResponse>(data) else {
                        continue;
                    };
                    for text in event.text_segments() {
                        accumulated.push_str(&text);
                        if delta_tx.send(text).await.is_err() {
                            // Receiver gone; stop pulling from the network.
                            return Ok(accumulated);
                        }
                    }
                }
            }
        }

        Ok(accumulated)
    }

    async fn generate(&self, prompt: &str, api_key: &str) -> anyhow::Result<String> {
        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&Self::request_body(prompt))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("generation request failed ({status}): {body}");
        }

        let payload: GenerateResponse = response.json().await?;
        let text = payload.text_segments().concat();
        anyhow::ensure!(!text.is_empty(), "generation response contained no text");
        Ok(text)
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<WireContent<'a>>,
}

#[derive(Serialize)]
struct WireContent<'a> {
    role: &'static str,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GenerateResponse {
    fn text_segments(&self) -> Vec<String> {
        self.candidates
            .iter()
            .flat_map(|c| c.content.parts.iter())
            .filter_map(|p| p.text.clone())
            .collect()
    }
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: CandidateContent,
}

#[derive(Deserialize, Default)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}
