//! End-to-end pipeline test: capture some text, wait for ingestion, then ask
//! a question about it and check the streamed answer is grounded in the
//! retrieved passages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use recollect_core::chat::{ChatEvent, ChatRequest};
use recollect_core::embedding::{EmbedError, EmbedOutcome, EmbeddingProvider, TaskType};
use recollect_core::jobs::JobContext;
use recollect_core::prompt::{ConversationTurn, TurnRole};
use recollect_core::provider::GenerativeProvider;
use recollect_core::storage::{
    DocumentRecord, DocumentStore, MemoryBlobStore, MemoryDocumentStore, ProcessingStatus,
};
use recollect_core::vector::{MemoryVectorStore, VectorIndex};
use recollect_core::{Pipeline, PipelineConfig, QueueConfig};

const DIMS: usize = 32;

/// Bag-of-words embedder: hashes each word into a bucket so texts sharing
/// vocabulary land near each other under cosine similarity.
struct WordBagEmbedder;

#[async_trait]
impl EmbeddingProvider for WordBagEmbedder {
    async fn embed(
        &self,
        text: &str,
        api_key: &str,
        _task: TaskType,
    ) -> Result<EmbedOutcome, EmbedError> {
        if api_key.is_empty() {
            return Err(EmbedError::ApiKeyMissing);
        }
        let mut vector = vec![0.0f32; DIMS];
        for word in text.split_whitespace() {
            let word: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            let bucket = word.bytes().fold(0usize, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(b as usize)
            }) % DIMS;
            vector[bucket] += 1.0;
        }
        Ok(EmbedOutcome::Vector(vector))
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

/// Answers with a canned line when the prompt carries fox passages, and
/// records every prompt it sees.
struct GroundedGenerator {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl GenerativeProvider for GroundedGenerator {
    async fn stream_generate(
        &self,
        prompt: &str,
        _api_key: &str,
        delta_tx: mpsc::Sender<String>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        self.prompts.lock().await.push(prompt.to_string());
        let answer = if prompt.contains("fox") {
            "The document mentions a fox."
        } else {
            "I could not find that in the document."
        };
        for segment in answer.split_inclusive(' ') {
            if delta_tx.send(segment.to_string()).await.is_err() {
                break;
            }
        }
        Ok(answer.to_string())
    }

    async fn generate(&self, prompt: &str, _api_key: &str) -> anyhow::Result<String> {
        self.prompts.lock().await.push(prompt.to_string());
        Ok("An article about a fox and a dog.".to_string())
    }
}

struct TestPipeline {
    pipeline: Pipeline,
    documents: Arc<MemoryDocumentStore>,
    vectors: Arc<MemoryVectorStore>,
    generator: Arc<GroundedGenerator>,
}

fn build_pipeline() -> TestPipeline {
    let config = PipelineConfig {
        embed_retry_delay: Duration::from_millis(1),
        store_retry_delay: Duration::from_millis(1),
        queue: QueueConfig {
            backoff_base: Duration::from_millis(1),
            ..QueueConfig::default()
        },
        ..PipelineConfig::default()
    };
    let documents = Arc::new(MemoryDocumentStore::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let generator = Arc::new(GroundedGenerator {
        prompts: Mutex::new(Vec::new()),
    });
    let index = Arc::new(VectorIndex::new(
        vectors.clone(),
        Arc::new(WordBagEmbedder),
        &config,
    ));
    let pipeline = Pipeline::start(JobContext {
        documents: documents.clone(),
        blobs: Arc::new(MemoryBlobStore::new()),
        index,
        generator: generator.clone(),
        http: reqwest::Client::new(),
        config,
    });
    TestPipeline {
        pipeline,
        documents,
        vectors,
        generator,
    }
}

fn article_text() -> String {
    let mut text = String::new();
    for i in 0..6 {
        text.push_str(&format!(
            "Chapter {i} describes how the quick brown fox crossed the orchard \
             wall at dawn and slipped past the sleeping dog without a sound. "
        ));
    }
    text
}

async fn wait_for_complete(documents: &MemoryDocumentStore, id: &str) -> DocumentRecord {
    for _ in 0..500 {
        if let Some(record) = documents.get(id).await.unwrap() {
            if record.status == ProcessingStatus::Complete {
                return record;
            }
            assert_ne!(
                record.status,
                ProcessingStatus::Error,
                "ingestion failed: {:?}",
                record.status_message
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("capture never completed");
}

#[tokio::test]
async fn capture_then_ask_streams_a_grounded_answer() {
    let t = build_pipeline();

    let mut record = DocumentRecord::new("doc-fox", "user-1");
    record.clean_text = Some(article_text());
    t.documents.insert(record).await;

    t.pipeline
        .start_capture("doc-fox", "user-1", "test-key")
        .await
        .unwrap();

    let record = wait_for_complete(&t.documents, "doc-fox").await;
    assert_eq!(
        record.summary.as_deref(),
        Some("An article about a fox and a dog.")
    );

    // The ~900-char article must have split into multiple bounded chunks,
    // each its own point scoped to this user and document.
    let points = t.vectors.points("captures").await;
    assert!(points.len() >= 2, "expected multiple chunks, got {}", points.len());
    for point in &points {
        assert!(point.payload.text.chars().count() <= 500);
        assert_eq!(point.payload.user_id, "user-1");
        assert_eq!(point.payload.document_id, "doc-fox");
    }

    let request = ChatRequest {
        user_name: "Sam".to_string(),
        user_id: "user-1".to_string(),
        document_id: "doc-fox".to_string(),
        document_summary: record.summary.clone().unwrap(),
        turns: vec![ConversationTurn {
            role: TurnRole::User,
            content: "What animal is mentioned in this article?".to_string(),
        }],
        api_key: "test-key".to_string(),
    };

    let (tx, mut rx) = mpsc::channel(32);
    t.pipeline
        .answer(request, tx, CancellationToken::new())
        .await;

    let mut answer = String::new();
    let mut saw_done = false;
    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::Delta { text } => answer.push_str(&text),
            ChatEvent::Done => saw_done = true,
            ChatEvent::Error { code, message } => panic!("answer failed: {code:?} {message}"),
        }
    }
    assert!(saw_done);
    assert!(answer.contains("fox"), "answer was: {answer}");

    // The generation prompt must have been grounded in retrieved passages,
    // not just the summary.
    let prompts = t.generator.prompts.lock().await;
    let chat_prompt = prompts.last().unwrap();
    assert!(chat_prompt.contains("orchard"));
    assert!(chat_prompt.contains("What animal is mentioned in this article?"));

    t.pipeline.shutdown();
}

#[tokio::test]
async fn deleting_a_capture_empties_retrieval_for_it() {
    let t = build_pipeline();

    let mut record = DocumentRecord::new("doc-gone", "user-1");
    record.clean_text = Some(article_text());
    t.documents.insert(record).await;

    t.pipeline
        .start_capture("doc-gone", "user-1", "test-key")
        .await
        .unwrap();
    wait_for_complete(&t.documents, "doc-gone").await;
    assert!(!t.vectors.points("captures").await.is_empty());

    t.pipeline.delete_capture("doc-gone", "user-1").unwrap();
    for _ in 0..500 {
        if t.vectors.points("captures").await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(t.vectors.points("captures").await.is_empty());

    t.pipeline.shutdown();
}
