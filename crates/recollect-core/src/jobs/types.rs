//! Job descriptions and pool routing.

/// The three worker pools. Routing is static per job kind so heavy PDF work
/// cannot starve model calls, and embedding traffic is throttled separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPool {
    Pdf,
    Ai,
    Embedding,
}

/// What an embedding job should do with the capture's vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedTask {
    Index,
    Delete,
}

/// The work a job performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    /// Download a remote PDF, extract its text, and persist both.
    PdfFetch { url: String },
    /// Generate and store a summary of the capture's clean text.
    Summarize,
    /// Index or delete the capture's vectors.
    Embed(EmbedTask),
}

impl JobKind {
    pub fn pool(&self) -> WorkerPool {
        match self {
            JobKind::PdfFetch { .. } => WorkerPool::Pdf,
            JobKind::Summarize => WorkerPool::Ai,
            JobKind::Embed(_) => WorkerPool::Embedding,
        }
    }

    /// Stable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::PdfFetch { .. } => "pdf_fetch",
            JobKind::Summarize => "summarize",
            JobKind::Embed(EmbedTask::Index) => "embed_index",
            JobKind::Embed(EmbedTask::Delete) => "embed_delete",
        }
    }
}

/// One unit of background work against a single capture.
#[derive(Debug, Clone)]
pub struct Job {
    pub kind: JobKind,
    pub document_id: String,
    pub user_id: String,
    /// Model API key, carried by jobs that call the embedding or generation
    /// services. Deletes do not need one.
    pub api_key: Option<String>,
    /// Zero-based delivery attempt, bumped on each queue-level retry.
    pub attempt: u32,
}

impl Job {
    pub fn new(kind: JobKind, document_id: &str, user_id: &str, api_key: Option<&str>) -> Self {
        Self {
            kind,
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            api_key: api_key.map(|k| k.to_string()),
            attempt: 0,
        }
    }
}
