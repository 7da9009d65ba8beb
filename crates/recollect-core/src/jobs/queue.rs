//! In-process job queue.
//!
//! Three mpsc channels, one per worker pool, each drained by a dispatcher
//! task. A dispatcher admits jobs up to its pool's concurrency limit via a
//! semaphore and runs each job on its own task, so a slow PDF download never
//! blocks the channel behind it. Delivery is at-least-once within the
//! process; nothing is persisted across restarts. Jobs touching the same
//! capture are not serialized against each other, so concurrent index and
//! delete work resolves as last-writer-wins.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use super::types::{Job, WorkerPool};
use super::{run_job, JobContext};

/// Worker pool sizes and queue-level retry policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Total delivery attempts per job, including the first.
    pub max_attempts: u32,
    /// Base delay for queue-level retries; doubles with each attempt.
    pub backoff_base: Duration,
    pub pdf_workers: usize,
    pub ai_workers: usize,
    pub embedding_workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(5000),
            pdf_workers: 5,
            ai_workers: 3,
            embedding_workers: 2,
        }
    }
}

/// Cloneable handle for submitting jobs and shutting the queue down.
#[derive(Clone)]
pub struct JobQueueHandle {
    pdf_tx: mpsc::UnboundedSender<Job>,
    ai_tx: mpsc::UnboundedSender<Job>,
    embedding_tx: mpsc::UnboundedSender<Job>,
    cancel: CancellationToken,
}

impl JobQueueHandle {
    /// Submit a job to its pool's channel.
    pub fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        let tx = match job.kind.pool() {
            WorkerPool::Pdf => &self.pdf_tx,
            WorkerPool::Ai => &self.ai_tx,
            WorkerPool::Embedding => &self.embedding_tx,
        };
        tx.send(job)
            .map_err(|_| anyhow::anyhow!("job queue is shut down"))
    }

    /// Submit a job after `delay`, unless the queue shuts down first.
    pub fn enqueue_after(&self, job: Job, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = queue.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = queue.enqueue(job) {
                        tracing::warn!(error = %e, "Dropped delayed job");
                    }
                }
            }
        });
    }

    /// Stop all dispatchers. In-flight jobs run to completion; queued and
    /// delayed jobs are dropped.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Start the three worker pools and return the submission handle.
pub fn spawn(ctx: Arc<JobContext>) -> JobQueueHandle {
    let (pdf_tx, pdf_rx) = mpsc::unbounded_channel();
    let (ai_tx, ai_rx) = mpsc::unbounded_channel();
    let (embedding_tx, embedding_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let handle = JobQueueHandle {
        pdf_tx,
        ai_tx,
        embedding_tx,
        cancel: cancel.clone(),
    };

    let pools = [
        (WorkerPool::Pdf, pdf_rx, ctx.config.queue.pdf_workers),
        (WorkerPool::Ai, ai_rx, ctx.config.queue.ai_workers),
        (
            WorkerPool::Embedding,
            embedding_rx,
            ctx.config.queue.embedding_workers,
        ),
    ];
    for (pool, rx, workers) in pools {
        tokio::spawn(dispatch(
            pool,
            rx,
            workers,
            ctx.clone(),
            handle.clone(),
            cancel.clone(),
        ));
    }

    handle
}

async fn dispatch(
    pool: WorkerPool,
    mut rx: mpsc::UnboundedReceiver<Job>,
    workers: usize,
    ctx: Arc<JobContext>,
    queue: JobQueueHandle,
    cancel: CancellationToken,
) {
    tracing::debug!(?pool, workers, "Worker pool started");
    let semaphore = Arc::new(Semaphore::new(workers));

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            job = rx.recv() => {
                let Some(job) = job else { break };
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let ctx = ctx.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    run_job(&ctx, &queue, job).await;
                    drop(permit);
                });
            }
        }
    }
    tracing::debug!(?pool, "Worker pool stopped");
}
