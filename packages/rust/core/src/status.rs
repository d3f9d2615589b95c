//! Status tracking: state-machine transitions persisted through the write
//! queue.
//!
//! The transitions themselves are pure ([`PipelineState`]); this module
//! decides what happens after a failure and makes sure every transition is
//! stored before the caller moves on.

use tracing::{debug, info, warn};

use lienflow_shared::{FailureDisposition, PipelineState, PipelineStep, Result, RetryPolicy};

use crate::write_queue::{Mutation, WriteQueue, WriteRequest};

pub struct StatusTracker {
    queue: WriteQueue,
    policy: RetryPolicy,
}

impl StatusTracker {
    pub fn new(queue: WriteQueue, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// `pending|processing → processing`.
    pub async fn begin(&self, state: &PipelineState) -> Result<PipelineState> {
        let next = state.begin()?;
        self.persist(next).await
    }

    /// `processing → completed`.
    pub async fn complete(&self, state: &PipelineState) -> Result<PipelineState> {
        let next = state.complete()?;
        info!(entity = %next.entity_id, "entity completed");
        self.persist(next).await
    }

    /// `processing → failed`, then classify the failure.
    pub async fn fail(
        &self,
        state: &PipelineState,
        step: PipelineStep,
        error: &str,
    ) -> Result<(PipelineState, FailureDisposition)> {
        let failed = self.persist(state.fail(step, error)?).await?;
        let disposition = self.policy.disposition(&failed);
        match disposition {
            FailureDisposition::Retry => debug!(
                entity = %failed.entity_id,
                step = %step,
                retry_count = failed.retry_count,
                "failure will be retried"
            ),
            FailureDisposition::ManualReview => warn!(
                entity = %failed.entity_id,
                step = %step,
                retry_count = failed.retry_count,
                error,
                "critical failure flagged for manual review"
            ),
            FailureDisposition::RetriesExhausted => warn!(
                entity = %failed.entity_id,
                step = %step,
                retry_count = failed.retry_count,
                error,
                "retries exhausted"
            ),
        }
        Ok((failed, disposition))
    }

    /// `failed → pending` for another attempt in this run.
    pub async fn requeue(&self, failed: &PipelineState) -> Result<PipelineState> {
        let next = failed.requeue()?;
        self.persist(next).await
    }

    async fn persist(&self, state: PipelineState) -> Result<PipelineState> {
        self.queue
            .apply(WriteRequest::new(
                state.entity_id.clone(),
                Mutation::Status(state.clone()),
            ))
            .await?;
        Ok(state)
    }
}
