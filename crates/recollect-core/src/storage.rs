//! External storage seams.
//!
//! The primary document database and the blob store are external
//! collaborators; this crate only reads and writes the handful of fields the
//! ingestion pipeline owns, through these traits. In-memory implementations
//! back tests and local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// User-visible lifecycle of a capture.
///
/// `pending -> processing -> {complete | error}`, with `ready` marking a PDF
/// whose text has been extracted but not yet summarized. An explicit
/// re-process moves `error` back to `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Ready,
    Complete,
    Error,
}

/// Metadata recorded after a PDF download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfMetadata {
    /// blake3 hash of the downloaded bytes.
    pub content_hash: String,
    pub page_count: usize,
    pub byte_size: usize,
}

/// The slice of a capture record this pipeline reads and writes.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub user_id: String,
    /// Extracted, cleaned text. Present once capture or PDF extraction ran.
    pub clean_text: Option<String>,
    pub summary: Option<String>,
    pub status: ProcessingStatus,
    pub status_message: Option<String>,
    /// Remote source for PDF captures.
    pub source_url: Option<String>,
    pub is_pdf: bool,
    pub pdf_metadata: Option<PdfMetadata>,
}

impl DocumentRecord {
    pub fn new(id: &str, user_id: &str) -> Self {
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            clean_text: None,
            summary: None,
            status: ProcessingStatus::Pending,
            status_message: None,
            source_url: None,
            is_pdf: false,
            pdf_metadata: None,
        }
    }
}

/// Read/write access to capture records, keyed by document id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &str) -> anyhow::Result<Option<DocumentRecord>>;
    async fn set_clean_text(&self, id: &str, text: &str) -> anyhow::Result<()>;
    async fn set_summary(&self, id: &str, summary: &str) -> anyhow::Result<()>;
    async fn set_status(
        &self,
        id: &str,
        status: ProcessingStatus,
        message: Option<&str>,
    ) -> anyhow::Result<()>;
    async fn set_pdf_metadata(&self, id: &str, metadata: PdfMetadata) -> anyhow::Result<()>;
}

/// Binary object storage for downloaded PDFs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()>;
}

/// In-memory document store.
#[derive(Default)]
pub struct MemoryDocumentStore {
    records: Arc<RwLock<HashMap<String, DocumentRecord>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: DocumentRecord) {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record);
    }

    async fn update<F>(&self, id: &str, apply: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut DocumentRecord),
    {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("document {id} not found"))?;
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<DocumentRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn set_clean_text(&self, id: &str, text: &str) -> anyhow::Result<()> {
        self.update(id, |r| r.clean_text = Some(text.to_string()))
            .await
    }

    async fn set_summary(&self, id: &str, summary: &str) -> anyhow::Result<()> {
        self.update(id, |r| r.summary = Some(summary.to_string()))
            .await
    }

    async fn set_status(
        &self,
        id: &str,
        status: ProcessingStatus,
        message: Option<&str>,
    ) -> anyhow::Result<()> {
        self.update(id, |r| {
            r.status = status;
            r.status_message = message.map(|m| m.to_string());
        })
        .await
    }

    async fn set_pdf_metadata(&self, id: &str, metadata: PdfMetadata) -> anyhow::Result<()> {
        self.update(id, |r| r.pdf_metadata = Some(metadata)).await
    }
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.read().await.get(key).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.blobs.write().await.insert(key.to_string(), bytes);
        Ok(())
    }
}
