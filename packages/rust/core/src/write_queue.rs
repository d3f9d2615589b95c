//! Single-writer persistence queue.
//!
//! The storage engine tolerates exactly one writer, so every mutation in the
//! pipeline is submitted here and applied in FIFO order by one dedicated
//! task. The channel is bounded: when it is full, `submit` waits, which
//! slows producers down instead of growing memory.
//!
//! ```text
//! entity tasks ──submit──▶ [bounded mpsc] ──▶ writer task ──▶ WriteTarget
//!      ▲                                          │
//!      └──────────────── oneshot ack ◀────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lienflow_shared::{
    DocumentMetadata, DownloadedDocument, Entity, ExtractedDocument, JudgmentRecord,
    PipelineError, PipelineState, Result, SourceResult, TitleChainResult, WriteQueueConfig,
};
use lienflow_storage::{RecoveryScope, Storage};

// ---------------------------------------------------------------------------
// Requests and acks
// ---------------------------------------------------------------------------

/// The change a write request carries.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Insert the property and its `pending` status if absent.
    SeedEntity(Entity),
    Status(PipelineState),
    Enrichment(SourceResult),
    Document(DocumentMetadata),
    Download(DownloadedDocument),
    Extracted(ExtractedDocument),
    Judgment(JudgmentRecord),
    /// `chain` set: analyzed. `chain` unset: skipped with `skip_reason`.
    LegalAnalysis {
        chain: Option<TitleChainResult>,
        skip_reason: Option<String>,
    },
    /// Administrative recovery over every in-scope status row.
    Recover(RecoveryScope),
}

impl Mutation {
    /// Target collection name, for logs.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::SeedEntity(_) => "properties",
            Self::Status(_) | Self::Recover(_) => "pipeline_status",
            Self::Enrichment(_) => "enrichment_results",
            Self::Document(_) | Self::Download(_) => "documents",
            Self::Extracted(_) => "extracted_documents",
            Self::Judgment(_) => "judgments",
            Self::LegalAnalysis { .. } => "legal_analysis",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub id: Uuid,
    pub entity_id: String,
    pub mutation: Mutation,
}

impl WriteRequest {
    pub fn new(entity_id: impl Into<String>, mutation: Mutation) -> Self {
        Self {
            id: Uuid::now_v7(),
            entity_id: entity_id.into(),
            mutation,
        }
    }
}

/// Successful outcome of one write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteAck {
    Applied,
    /// Status row as stored after a seed insert.
    Status(PipelineState),
    /// Rows touched by a recovery.
    Recovered(u64),
}

/// Anything the writer task can apply requests to.
#[async_trait]
pub trait WriteTarget: Send + Sync + 'static {
    async fn apply(&self, request: &WriteRequest) -> Result<WriteAck>;
}

#[async_trait]
impl<T: WriteTarget> WriteTarget for Arc<T> {
    async fn apply(&self, request: &WriteRequest) -> Result<WriteAck> {
        (**self).apply(request).await
    }
}

#[async_trait]
impl WriteTarget for Storage {
    async fn apply(&self, request: &WriteRequest) -> Result<WriteAck> {
        let entity_id = request.entity_id.as_str();
        match &request.mutation {
            Mutation::SeedEntity(entity) => Ok(WriteAck::Status(self.seed_entity(entity).await?)),
            Mutation::Status(state) => self.upsert_status(state).await.map(|_| WriteAck::Applied),
            Mutation::Enrichment(result) => self
                .insert_enrichment(entity_id, result)
                .await
                .map(|_| WriteAck::Applied),
            Mutation::Document(doc) => self.upsert_document(doc).await.map(|_| WriteAck::Applied),
            Mutation::Download(file) => self.record_download(file).await.map(|_| WriteAck::Applied),
            Mutation::Extracted(doc) => self.upsert_extracted(doc).await.map(|_| WriteAck::Applied),
            Mutation::Judgment(judgment) => self
                .upsert_judgment(judgment)
                .await
                .map(|_| WriteAck::Applied),
            Mutation::LegalAnalysis { chain, skip_reason } => self
                .upsert_legal_analysis(entity_id, chain.as_ref(), skip_reason.as_deref())
                .await
                .map(|_| WriteAck::Applied),
            Mutation::Recover(scope) => Ok(WriteAck::Recovered(self.apply_recovery(scope).await?)),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue handle
// ---------------------------------------------------------------------------

struct Envelope {
    request: WriteRequest,
    reply: oneshot::Sender<Result<WriteAck>>,
}

/// Pending acknowledgement for a submitted write.
#[derive(Debug)]
pub struct WriteTicket {
    pub id: Uuid,
    rx: oneshot::Receiver<Result<WriteAck>>,
}

impl WriteTicket {
    /// Wait until the writer has applied (or given up on) the request.
    pub async fn wait(self) -> Result<WriteAck> {
        self.rx
            .await
            .map_err(|_| PipelineError::Storage("writer task stopped before acknowledging".into()))?
    }
}

/// Await every ticket and return the first failure, if any.
pub async fn settle(tickets: Vec<WriteTicket>) -> Result<()> {
    let mut first_error = None;
    for ticket in tickets {
        if let Err(e) = ticket.wait().await {
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Cloneable submit side of the queue.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<Envelope>,
}

/// Counts reported by the writer task when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub applied: u64,
    pub failed: u64,
    pub retries: u64,
}

/// Join handle for the writer task.
pub struct WriterHandle {
    join: JoinHandle<WriterStats>,
}

impl WriterHandle {
    /// Wait for the writer to drain. Completes once every [`WriteQueue`]
    /// clone has been dropped and all queued requests were applied.
    pub async fn finish(self) -> Result<WriterStats> {
        self.join
            .await
            .map_err(|e| PipelineError::Storage(format!("writer task failed: {e}")))
    }
}

impl WriteQueue {
    /// Start the writer task over `target`.
    pub fn spawn<T: WriteTarget>(
        target: T,
        config: &WriteQueueConfig,
    ) -> Result<(Self, WriterHandle)> {
        if config.capacity == 0 {
            return Err(PipelineError::config("write_queue.capacity must be > 0"));
        }
        if config.max_attempts == 0 {
            return Err(PipelineError::config("write_queue.max_attempts must be > 0"));
        }

        let (tx, rx) = mpsc::channel(config.capacity);
        let join = tokio::spawn(run_writer(
            target,
            rx,
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
        ));
        Ok((Self { tx }, WriterHandle { join }))
    }

    /// Enqueue a request. Waits while the queue is full.
    pub async fn submit(&self, request: WriteRequest) -> Result<WriteTicket> {
        let (reply, rx) = oneshot::channel();
        let id = request.id;
        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| PipelineError::Storage("write queue is closed".into()))?;
        Ok(WriteTicket { id, rx })
    }

    /// Submit and wait for the acknowledgement.
    pub async fn apply(&self, request: WriteRequest) -> Result<WriteAck> {
        self.submit(request).await?.wait().await
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

fn is_retryable(err: &PipelineError) -> bool {
    matches!(err, PipelineError::Storage(_)) || err.is_transient()
}

async fn run_writer<T: WriteTarget>(
    target: T,
    mut rx: mpsc::Receiver<Envelope>,
    max_attempts: u32,
    backoff_base: Duration,
) -> WriterStats {
    let mut stats = WriterStats::default();
    info!(max_attempts, "writer started");

    while let Some(Envelope { request, reply }) = rx.recv().await {
        let mut attempt = 1;
        let result = loop {
            match target.apply(&request).await {
                Ok(ack) => break Ok(ack),
                Err(e) if attempt < max_attempts && is_retryable(&e) => {
                    let delay = backoff_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        request = %request.id,
                        entity = %request.entity_id,
                        collection = request.mutation.collection(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "write failed, retrying"
                    );
                    stats.retries += 1;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if is_retryable(&e) => {
                    break Err(PipelineError::Persistence {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => break Err(e),
            }
        };

        match &result {
            Ok(_) => {
                stats.applied += 1;
                debug!(
                    request = %request.id,
                    entity = %request.entity_id,
                    collection = request.mutation.collection(),
                    "write applied"
                );
            }
            Err(e) => {
                stats.failed += 1;
                error!(
                    request = %request.id,
                    entity = %request.entity_id,
                    collection = request.mutation.collection(),
                    error = %e,
                    "write abandoned"
                );
            }
        }

        // The submitter may have stopped waiting; that is not the writer's concern.
        let _ = reply.send(result);
    }

    info!(
        applied = stats.applied,
        failed = stats.failed,
        retries = stats.retries,
        "writer drained"
    );
    stats
}
