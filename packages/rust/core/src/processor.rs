//! One entity through phases 2 and 3.
//!
//! The processor owns the decision of how an entity ends: completed, failed
//! (and whether it goes back in the queue), or interrupted. Failure step
//! precedence is: a legal-analysis step, then persistence of enrichment
//! results, then the first failing non-verifier source. A verifier failure
//! alone never fails an entity; the seed identity stands in for it.
//!
//! A status write the queue gave up on is itself stored as a `persist`
//! failure. Only a failure that cannot be stored surfaces as `Err`.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use lienflow_shared::{
    EnrichmentResultSet, Entity, FailureDisposition, PipelineState, PipelineStep, Result,
};

use crate::fanout::EnrichmentFanOut;
use crate::legal::{LegalAnalysisChain, LegalOutcome};
use crate::progress::ProgressCounters;
use crate::shutdown::ShutdownSignal;
use crate::status::StatusTracker;
use crate::write_queue::{Mutation, WriteQueue, WriteRequest, settle};

/// How an entity left the processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { analyzed: bool },
    /// Failed with a retryable disposition; already stored as `pending`.
    Requeued { entity: Entity, state: PipelineState },
    Failed {
        step: PipelineStep,
        disposition: FailureDisposition,
    },
    /// Stopped by shutdown; left at `processing` for a later run.
    Interrupted,
}

pub struct EntityProcessor {
    fanout: EnrichmentFanOut,
    legal: LegalAnalysisChain,
    tracker: StatusTracker,
    queue: WriteQueue,
    counters: Arc<ProgressCounters>,
}

impl EntityProcessor {
    pub fn new(
        fanout: EnrichmentFanOut,
        legal: LegalAnalysisChain,
        tracker: StatusTracker,
        queue: WriteQueue,
        counters: Arc<ProgressCounters>,
    ) -> Self {
        Self {
            fanout,
            legal,
            tracker,
            queue,
            counters,
        }
    }

    #[instrument(skip_all, fields(entity = %entity.case_number, retry_count = state.retry_count))]
    pub async fn process(
        &self,
        entity: Entity,
        state: PipelineState,
        shutdown: &ShutdownSignal,
    ) -> Result<Outcome> {
        let state = match self.tracker.begin(&state).await {
            Ok(state) => state,
            Err(e) if e.is_persistence() => {
                warn!(error = %e, "start of processing not persisted");
                let processing = state.begin()?;
                return self
                    .conclude(entity, &processing, PipelineStep::Persist, e.to_string())
                    .await;
            }
            Err(e) => return Err(e),
        };

        // Phase 2
        let results = self.fanout.enrich(&entity).await;
        self.counters
            .source(results.verifier.source, results.verifier.is_success());
        for result in &results.results {
            self.counters.source(result.source, result.is_success());
        }
        let persist_error = self.persist_results(&results).await.err();

        if shutdown.is_triggered() {
            info!("interrupted after enrichment");
            return Ok(Outcome::Interrupted);
        }

        // Phase 3
        let legal = self.legal.analyze(&entity, &results, shutdown).await;
        let analyzed = matches!(legal, Ok(LegalOutcome::Analyzed(_)));

        let failure = match legal {
            Ok(LegalOutcome::Interrupted { .. }) => return Ok(Outcome::Interrupted),
            Err(failure) => Some((failure.step, failure.error.to_string())),
            Ok(_) if persist_error.is_some() => persist_error
                .map(|e| (PipelineStep::Persist, e.to_string())),
            Ok(_) => first_source_failure(&results),
        };

        let (step, error) = match failure {
            Some(failure) => failure,
            None => match self.tracker.complete(&state).await {
                Ok(_) => return Ok(Outcome::Completed { analyzed }),
                Err(e) if e.is_persistence() => {
                    warn!(error = %e, "completion not persisted");
                    (PipelineStep::Persist, e.to_string())
                }
                Err(e) => return Err(e),
            },
        };
        self.conclude(entity, &state, step, error).await
    }

    /// Store the failure and decide whether the entity goes back in the
    /// queue. `Err` only when the failure itself could not be stored.
    async fn conclude(
        &self,
        entity: Entity,
        state: &PipelineState,
        step: PipelineStep,
        error: String,
    ) -> Result<Outcome> {
        let (failed, disposition) = self.tracker.fail(state, step, &error).await?;
        if disposition != FailureDisposition::Retry {
            return Ok(Outcome::Failed { step, disposition });
        }
        match self.tracker.requeue(&failed).await {
            Ok(state) => Ok(Outcome::Requeued { entity, state }),
            Err(e) => {
                warn!(error = %e, "requeue not persisted, entity stays failed");
                Ok(Outcome::Failed { step, disposition })
            }
        }
    }

    async fn persist_results(&self, results: &EnrichmentResultSet) -> Result<()> {
        let mut tickets = Vec::with_capacity(results.results.len() + 1);
        for result in std::iter::once(&results.verifier).chain(&results.results) {
            tickets.push(
                self.queue
                    .submit(WriteRequest::new(
                        results.entity_id.clone(),
                        Mutation::Enrichment(result.clone()),
                    ))
                    .await?,
            );
        }
        settle(tickets).await.inspect_err(|e| {
            warn!(error = %e, "enrichment results not fully persisted");
        })
    }
}

fn first_source_failure(results: &EnrichmentResultSet) -> Option<(PipelineStep, String)> {
    results.failures().next().map(|r| {
        (
            r.source.step(),
            r.failure_reason().unwrap_or("source failed").to_string(),
        )
    })
}
