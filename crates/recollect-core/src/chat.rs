//! Conversation streaming.
//!
//! One request = one logical operation: retrieve the most relevant chunks for
//! the latest user message, assemble the grounded prompt, and stream the
//! model's answer segment by segment. Events flow over an mpsc channel and
//! the channel always terminates with either `Done` or an `Error` carrying a
//! stable code, so the transport is never left open indefinitely.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::prompt::{self, ConversationTurn, PromptInputs};
use crate::provider::GenerativeProvider;
use crate::vector::{QueryError, VectorIndex};

/// Separator between retrieved passages in the prompt.
const PASSAGE_SEPARATOR: &str = "\n\n---\n\n";

/// Substituted when retrieval finds nothing to ground the answer on.
const NO_CONTEXT_SENTINEL: &str = "No relevant passages were found in this document.";

/// A question about one capture, with conversation history.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user_name: String,
    pub user_id: String,
    pub document_id: String,
    pub document_summary: String,
    pub turns: Vec<ConversationTurn>,
    pub api_key: String,
}

/// Events emitted over the answer channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// One streamed text segment, in arrival order.
    Delta { text: String },
    /// The answer finished normally.
    Done,
    /// The answer terminated abnormally.
    Error { code: ChatErrorCode, message: String },
}

/// Stable error codes surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatErrorCode {
    ApiKeyRequired,
    InvalidRequest,
    NoQueryVector,
    RequestTimeout,
    Cancelled,
    UpstreamError,
}

enum ForwardOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Stream a grounded answer for `req`, emitting [`ChatEvent`]s on `event_tx`.
///
/// Cancellation stops forwarding immediately and aborts the underlying model
/// stream; the terminal event is then `Error { code: CANCELLED }`. The whole
/// model call runs under the configured wall-clock timeout.
pub async fn stream_answer(
    index: &VectorIndex,
    provider: Arc<dyn GenerativeProvider>,
    config: &PipelineConfig,
    req: ChatRequest,
    event_tx: mpsc::Sender<ChatEvent>,
    cancel: CancellationToken,
) {
    let fail = |code: ChatErrorCode, message: String| {
        let event_tx = event_tx.clone();
        async move {
            let _ = event_tx.send(ChatEvent::Error { code, message }).await;
        }
    };

    if req.api_key.trim().is_empty() {
        fail(
            ChatErrorCode::ApiKeyRequired,
            "a model API key is required to answer questions".to_string(),
        )
        .await;
        return;
    }

    if let Err(e) = prompt::validate_turns(&req.turns) {
        fail(ChatErrorCode::InvalidRequest, e.to_string()).await;
        return;
    }

    let Some(latest) = prompt::latest_user_turn(&req.turns) else {
        fail(
            ChatErrorCode::InvalidRequest,
            "conversation has no user message".to_string(),
        )
        .await;
        return;
    };
    let question = latest.content.clone();

    let hits = match index
        .search(&question, &req.document_id, &req.user_id, &req.api_key)
        .await
    {
        Ok(hits) => hits,
        Err(QueryError::ApiKeyMissing) => {
            fail(
                ChatErrorCode::ApiKeyRequired,
                "a model API key is required to answer questions".to_string(),
            )
            .await;
            return;
        }
        Err(e @ QueryError::NoQueryVector) => {
            fail(ChatErrorCode::NoQueryVector, e.to_string()).await;
            return;
        }
        Err(QueryError::Store(e)) => {
            tracing::error!(doc_id = %req.document_id, error = %e, "Retrieval failed");
            fail(ChatErrorCode::UpstreamError, "retrieval failed".to_string()).await;
            return;
        }
    };

    let retrieved = if hits.is_empty() {
        NO_CONTEXT_SENTINEL.to_string()
    } else {
        hits.iter()
            .map(|h| h.payload.text.as_str())
            .collect::<Vec<_>>()
            .join(PASSAGE_SEPARATOR)
    };

    let full_prompt = prompt::build_prompt(
        &PromptInputs {
            user_name: &req.user_name,
            document_summary: &req.document_summary,
            turns: &req.turns,
            retrieved_context: &retrieved,
        },
        config.summary_max_chars,
        config.prompt_window,
    );

    // One-slot channel: at most one segment in flight between the model
    // stream and the caller.
    let (delta_tx, mut delta_rx) = mpsc::channel::<String>(1);
    let mut generation = tokio::spawn({
        let provider = provider.clone();
        let cancel = cancel.clone();
        let api_key = req.api_key.clone();
        async move {
            provider
                .stream_generate(&full_prompt, &api_key, delta_tx, cancel)
                .await
        }
    });

    let forwarded = tokio::time::timeout(config.generation_timeout, async {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return ForwardOutcome::Cancelled,

                segment = delta_rx.recv() => {
                    match segment {
                        Some(text) => {
                            if event_tx.send(ChatEvent::Delta { text }).await.is_err() {
                                // Caller went away; treat like cancellation.
                                return ForwardOutcome::Cancelled;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        match (&mut generation).await {
            Ok(Ok(_)) => ForwardOutcome::Completed,
            Ok(Err(e)) => ForwardOutcome::Failed(e.to_string()),
            Err(e) => ForwardOutcome::Failed(e.to_string()),
        }
    })
    .await;

    match forwarded {
        Err(_elapsed) => {
            generation.abort();
            tracing::warn!(doc_id = %req.document_id, "Answer generation timed out");
            fail(
                ChatErrorCode::RequestTimeout,
                "the model did not respond in time".to_string(),
            )
            .await;
        }
        Ok(ForwardOutcome::Cancelled) => {
            generation.abort();
            tracing::debug!(doc_id = %req.document_id, "Answer stream cancelled");
            fail(
                ChatErrorCode::Cancelled,
                "the request was cancelled".to_string(),
            )
            .await;
        }
        Ok(ForwardOutcome::Failed(message)) => {
            tracing::error!(doc_id = %req.document_id, error = %message, "Answer generation failed");
            fail(ChatErrorCode::UpstreamError, message).await;
        }
        Ok(ForwardOutcome::Completed) => {
            if cancel.is_cancelled() {
                fail(
                    ChatErrorCode::Cancelled,
                    "the request was cancelled".to_string(),
                )
                .await;
            } else {
                let _ = event_tx.send(ChatEvent::Done).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::embedding::{EmbedError, EmbedOutcome, EmbeddingProvider, TaskType};
    use crate::prompt::TurnRole;
    use crate::vector::{IndexRequest, MemoryVectorStore};

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        async fn embed(
            &self,
            text: &str,
            _api_key: &str,
            _task: TaskType,
        ) -> Result<EmbedOutcome, EmbedError> {
            if text.contains("unembeddable") {
                return Ok(EmbedOutcome::Skipped);
            }
            Ok(EmbedOutcome::Vector(vec![1.0, 0.0]))
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    /// Scripted model: records the prompt, emits fixed segments, then either
    /// finishes or stalls until cancelled.
    struct ScriptedGenerator {
        segments: Vec<&'static str>,
        stall_after: bool,
        seen_prompt: Mutex<Option<String>>,
    }

    impl ScriptedGenerator {
        fn finishing(segments: Vec<&'static str>) -> Self {
            Self {
                segments,
                stall_after: false,
                seen_prompt: Mutex::new(None),
            }
        }

        fn stalling(segments: Vec<&'static str>) -> Self {
            Self {
                segments,
                stall_after: true,
                seen_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl GenerativeProvider for ScriptedGenerator {
        async fn stream_generate(
            &self,
            prompt: &str,
            _api_key: &str,
            delta_tx: mpsc::Sender<String>,
            cancel: CancellationToken,
        ) -> anyhow::Result<String> {
            *self.seen_prompt.lock().await = Some(prompt.to_string());
            let mut accumulated = String::new();
            for segment in &self.segments {
                if cancel.is_cancelled() {
                    break;
                }
                accumulated.push_str(segment);
                if delta_tx.send(segment.to_string()).await.is_err() {
                    break;
                }
            }
            if self.stall_after {
                cancel.cancelled().await;
            }
            Ok(accumulated)
        }

        async fn generate(&self, _prompt: &str, _api_key: &str) -> anyhow::Result<String> {
            Ok("summary".to_string())
        }
    }

    fn test_setup(provider: Arc<ScriptedGenerator>) -> (VectorIndex, Arc<ScriptedGenerator>, PipelineConfig) {
        let config = PipelineConfig {
            store_retry_delay: Duration::from_millis(1),
            generation_timeout: Duration::from_secs(5),
            ..PipelineConfig::default()
        };
        let index = VectorIndex::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(FixedEmbedder),
            &config,
        );
        (index, provider, config)
    }

    fn request(question: &str) -> ChatRequest {
        ChatRequest {
            user_name: "Ada".to_string(),
            user_id: "u1".to_string(),
            document_id: "d1".to_string(),
            document_summary: "A saved article.".to_string(),
            turns: vec![ConversationTurn {
                role: TurnRole::User,
                content: question.to_string(),
            }],
            api_key: "key".to_string(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn streams_segments_then_done() {
        let provider = Arc::new(ScriptedGenerator::finishing(vec!["Hello ", "world"]));
        let (index, provider, config) = test_setup(provider);
        index
            .index_document(IndexRequest {
                text: "Some stored text.".to_string(),
                document_id: "d1".to_string(),
                user_id: "u1".to_string(),
                api_key: "key".to_string(),
            })
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(16);
        stream_answer(
            &index,
            provider,
            &config,
            request("what is this?"),
            tx,
            CancellationToken::new(),
        )
        .await;

        let events = collect(rx).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ChatEvent::Delta { text } if text == "Hello "));
        assert!(matches!(&events[1], ChatEvent::Delta { text } if text == "world"));
        assert!(matches!(events[2], ChatEvent::Done));
    }

    #[tokio::test]
    async fn empty_retrieval_uses_sentinel_context() {
        let provider = Arc::new(ScriptedGenerator::finishing(vec!["ok"]));
        let (index, provider, config) = test_setup(provider.clone());
        // Nothing indexed for d1.

        let (tx, rx) = mpsc::channel(16);
        stream_answer(
            &index,
            provider.clone(),
            &config,
            request("anything?"),
            tx,
            CancellationToken::new(),
        )
        .await;
        collect(rx).await;

        let prompt = provider.seen_prompt.lock().await.clone().unwrap();
        assert!(prompt.contains("No relevant passages were found"));
    }

    #[tokio::test]
    async fn cancellation_after_first_segment_stops_forwarding() {
        let provider = Arc::new(ScriptedGenerator::stalling(vec!["first"]));
        let (index, provider, config) = test_setup(provider);

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                stream_answer(&index, provider, &config, request("q?"), tx, cancel).await;
            }
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(&first, ChatEvent::Delta { text } if text == "first"));

        cancel.cancel();
        let terminal = rx.recv().await.unwrap();
        assert!(
            matches!(&terminal, ChatEvent::Error { code: ChatErrorCode::Cancelled, .. }),
            "got: {terminal:?}"
        );
        assert!(rx.recv().await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_receiver_stops_the_stream() {
        let provider = Arc::new(ScriptedGenerator::stalling(vec!["first", "second"]));
        let (index, provider, config) = test_setup(provider);

        let (tx, mut rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            stream_answer(
                &index,
                provider,
                &config,
                request("q?"),
                tx,
                CancellationToken::new(),
            )
            .await;
        });

        let first = rx.recv().await.unwrap();
        assert!(matches!(&first, ChatEvent::Delta { text } if text == "first"));
        drop(rx);

        // With no receiver the forward loop must tear the stream down rather
        // than run until the timeout.
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("stream did not stop after the receiver was dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn missing_api_key_terminates_with_stable_code() {
        let provider = Arc::new(ScriptedGenerator::finishing(vec![]));
        let (index, provider, config) = test_setup(provider);

        let mut req = request("q?");
        req.api_key = String::new();
        let (tx, rx) = mpsc::channel(16);
        stream_answer(&index, provider, &config, req, tx, CancellationToken::new()).await;

        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ChatEvent::Error { code: ChatErrorCode::ApiKeyRequired, .. }
        ));
    }

    #[tokio::test]
    async fn unembeddable_question_is_fatal() {
        let provider = Arc::new(ScriptedGenerator::finishing(vec!["never sent"]));
        let (index, provider, config) = test_setup(provider);

        let (tx, rx) = mpsc::channel(16);
        stream_answer(
            &index,
            provider,
            &config,
            request("unembeddable?"),
            tx,
            CancellationToken::new(),
        )
        .await;

        let events = collect(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ChatEvent::Error { code: ChatErrorCode::NoQueryVector, .. }
        ));
    }

    #[tokio::test]
    async fn stalled_model_hits_the_timeout() {
        let provider = Arc::new(ScriptedGenerator::stalling(vec!["partial"]));
        let (index, provider, _) = test_setup(provider);
        let config = PipelineConfig {
            generation_timeout: Duration::from_millis(100),
            store_retry_delay: Duration::from_millis(1),
            ..PipelineConfig::default()
        };

        let (tx, rx) = mpsc::channel(16);
        stream_answer(&index, provider, &config, request("q?"), tx, CancellationToken::new())
            .await;

        let events = collect(rx).await;
        let last = events.last().unwrap();
        assert!(
            matches!(last, ChatEvent::Error { code: ChatErrorCode::RequestTimeout, .. }),
            "got: {last:?}"
        );
    }

    #[tokio::test]
    async fn conversation_without_user_turn_is_invalid() {
        let provider = Arc::new(ScriptedGenerator::finishing(vec![]));
        let (index, provider, config) = test_setup(provider);

        let mut req = request("q?");
        req.turns = vec![ConversationTurn {
            role: TurnRole::Assistant,
            content: "only me".to_string(),
        }];
        let (tx, rx) = mpsc::channel(16);
        stream_answer(&index, provider, &config, req, tx, CancellationToken::new()).await;

        let events = collect(rx).await;
        assert!(matches!(
            &events[0],
            ChatEvent::Error { code: ChatErrorCode::InvalidRequest, .. }
        ));
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ChatErrorCode::ApiKeyRequired).unwrap();
        assert_eq!(json, "\"API_KEY_REQUIRED\"");
        let json = serde_json::to_string(&ChatErrorCode::RequestTimeout).unwrap();
        assert_eq!(json, "\"REQUEST_TIMEOUT\"");
    }
}
