//! Run driver: seed ingestion, dispatch under the global limit, retries, and
//! shutdown.
//!
//! ```text
//! SeedSource ──page──▶ ingest (SeedEntity writes) ──▶ ready queue ─┐
//!                                                                  ├─▶ acquire global permit ─▶ spawn EntityProcessor
//!                       retry queue (requeued entities, first) ───┘
//! ```
//!
//! Dispatch stops when shutdown is triggered or the seed source fails; tasks
//! already running are drained before `run` returns. A seed whose write is
//! lost is counted and skipped.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use lienflow_shared::{
    AppConfig, DateRange, Entity, FailureDisposition, PipelineError, PipelineState, Result,
};

use crate::collaborators::{EnrichmentServices, LegalServices, SeedSource};
use crate::fanout::EnrichmentFanOut;
use crate::governor::{ConcurrencyGovernor, Permit, Scope};
use crate::legal::{AnalysisGate, EquityGate, LegalAnalysisChain};
use crate::processor::{EntityProcessor, Outcome};
use crate::progress::{ProgressCounters, ProgressSnapshot};
use crate::shutdown::ShutdownSignal;
use crate::status::StatusTracker;
use crate::write_queue::{Mutation, WriteAck, WriteQueue, WriteRequest};

/// Every external service a run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub enrichment: EnrichmentServices,
    pub legal: LegalServices,
    /// Defaults to [`EquityGate`] built from `[gate]`.
    pub gate: Option<Arc<dyn AnalysisGate>>,
}

/// Final counts for a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
    pub elapsed_ms: u64,
    /// The run stopped early on shutdown.
    pub interrupted: bool,
}

impl RunSummary {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

type Work = (Entity, PipelineState);
type Joined = std::result::Result<(String, Result<Outcome>), tokio::task::JoinError>;

pub struct Orchestrator {
    seed_page_size: usize,
    governor: Arc<ConcurrencyGovernor>,
    queue: WriteQueue,
    processor: Arc<EntityProcessor>,
    counters: Arc<ProgressCounters>,
    shutdown: ShutdownSignal,
}

impl Orchestrator {
    /// Wire up a run. Configuration problems are reported here, before any
    /// work starts.
    pub fn new(
        config: &AppConfig,
        collaborators: Collaborators,
        queue: WriteQueue,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        config.validate()?;
        let governor = Arc::new(ConcurrencyGovernor::from_config(config)?);
        let counters = Arc::new(ProgressCounters::default());

        let gate = collaborators
            .gate
            .unwrap_or_else(|| Arc::new(EquityGate::from_config(&config.gate)));
        let fanout = EnrichmentFanOut::new(
            collaborators.enrichment,
            governor.clone(),
            config.timeouts.clone(),
        );
        let legal = LegalAnalysisChain::new(
            collaborators.legal,
            gate,
            governor.clone(),
            queue.clone(),
            config.timeouts.clone(),
            config.extraction.batch_size,
        );
        let tracker = StatusTracker::new(queue.clone(), config.retry_policy()?);
        let processor = Arc::new(EntityProcessor::new(
            fanout,
            legal,
            tracker,
            queue.clone(),
            counters.clone(),
        ));

        Ok(Self {
            seed_page_size: config.orchestrator.seed_page_size,
            governor,
            queue,
            processor,
            counters,
            shutdown,
        })
    }

    /// Live counters, for progress displays.
    pub fn progress(&self) -> Arc<ProgressCounters> {
        self.counters.clone()
    }

    /// Process every seed in `range`, plus any entities requeued along the
    /// way, until both are exhausted or shutdown is requested.
    #[instrument(skip_all, fields(start = %range.start, end = %range.end))]
    pub async fn run(&self, seeds: &dyn SeedSource, range: DateRange) -> Result<RunSummary> {
        let started = Instant::now();
        let mut shutdown = self.shutdown.clone();

        let mut ready: VecDeque<Work> = VecDeque::new();
        let mut retries: VecDeque<Work> = VecDeque::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut seeds_exhausted = false;
        let mut tasks: JoinSet<(String, Result<Outcome>)> = JoinSet::new();
        let mut next: Option<Work> = None;
        let mut fatal: Option<PipelineError> = None;

        info!(page_size = self.seed_page_size, "run started");

        loop {
            if shutdown.is_triggered() {
                info!("shutdown requested, no further dispatch");
                break;
            }

            if next.is_none() {
                next = retries.pop_front().or_else(|| ready.pop_front());
            }

            if next.is_none() && !seeds_exhausted {
                let page = match seeds
                    .fetch(&range, cursor.take(), self.seed_page_size)
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        error!(error = %e, "seed source failed, no further dispatch");
                        fatal = Some(e);
                        break;
                    }
                };
                debug!(entities = page.entities.len(), "seed page fetched");
                self.ingest(page.entities, &range, &mut seen, &mut ready)
                    .await;
                cursor = page.next_cursor;
                seeds_exhausted = cursor.is_none();
                continue;
            }

            let Some(work) = next.take() else {
                // Nothing left to dispatch; wait for in-flight entities.
                match tasks.join_next().await {
                    Some(joined) => {
                        self.settle(joined, &mut retries);
                        continue;
                    }
                    None => break,
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    next = Some(work);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.settle(joined, &mut retries);
                    next = Some(work);
                }
                permit = self.governor.acquire(Scope::Global) => match permit {
                    Ok(permit) => self.dispatch(&mut tasks, work, permit),
                    Err(e) => {
                        error!(error = %e, "global limiter closed, no further dispatch");
                        next = Some(work);
                        fatal = Some(e);
                        break;
                    }
                },
            }
        }

        let interrupted = shutdown.is_triggered();
        if interrupted || fatal.is_some() {
            let undispatched = usize::from(next.is_some()) + ready.len() + retries.len();
            info!(
                in_flight = tasks.len(),
                undispatched, "draining in-flight entities"
            );
        }
        while let Some(joined) = tasks.join_next().await {
            self.settle(joined, &mut retries);
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let summary = RunSummary {
            progress: self.counters.snapshot(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            interrupted,
        };
        info!(
            completed = summary.progress.completed,
            failed = summary.progress.failed,
            requeued = summary.progress.requeued,
            elapsed_ms = summary.elapsed_ms,
            interrupted,
            "run finished"
        );
        Ok(summary)
    }

    /// Create status rows for a page of seeds and queue the ones that still
    /// need work. Completed and failed entities are left alone.
    async fn ingest(
        &self,
        entities: Vec<Entity>,
        range: &DateRange,
        seen: &mut HashSet<String>,
        ready: &mut VecDeque<Work>,
    ) {
        for entity in entities {
            if let Err(e) = entity.validate() {
                warn!(error = %e, "seed rejected");
                self.counters.rejected();
                continue;
            }
            if !range.contains(entity.auction_date) {
                debug!(entity = %entity.case_number, "seed outside date range");
                self.counters.rejected();
                continue;
            }
            if !seen.insert(entity.case_number.clone()) {
                continue;
            }

            let ack = match self
                .queue
                .apply(WriteRequest::new(
                    entity.case_number.clone(),
                    Mutation::SeedEntity(entity.clone()),
                ))
                .await
            {
                Ok(ack) => ack,
                Err(e) => {
                    error!(entity = %entity.case_number, error = %e, "seed not stored, skipping");
                    self.counters.seed_lost();
                    continue;
                }
            };
            let WriteAck::Status(state) = ack else {
                warn!(entity = %entity.case_number, "seed write returned no status");
                continue;
            };

            if state.status.is_terminal() {
                debug!(entity = %entity.case_number, status = %state.status, "already terminal, skipping");
                self.counters.skipped_existing();
                continue;
            }
            self.counters.seeded();
            ready.push_back((entity, state));
        }
    }

    fn dispatch(
        &self,
        tasks: &mut JoinSet<(String, Result<Outcome>)>,
        (entity, state): Work,
        permit: Permit,
    ) {
        let processor = self.processor.clone();
        let shutdown = self.shutdown.clone();
        let id = entity.case_number.clone();
        self.counters.started();
        tasks.spawn(async move {
            let outcome = processor.process(entity, state, &shutdown).await;
            drop(permit);
            (id, outcome)
        });
    }

    fn settle(&self, joined: Joined, retries: &mut VecDeque<Work>) {
        self.counters.stopped();
        let (id, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "entity task panicked");
                self.counters.error();
                return;
            }
        };

        match outcome {
            Ok(Outcome::Completed { analyzed }) => self.counters.completed(analyzed),
            Ok(Outcome::Requeued { entity, state }) => {
                debug!(entity = %id, retry_count = state.retry_count, "requeued");
                self.counters.requeued();
                retries.push_back((entity, state));
            }
            Ok(Outcome::Failed { disposition, .. }) => {
                self.counters.failed();
                match disposition {
                    FailureDisposition::ManualReview => self.counters.manual_review(),
                    FailureDisposition::RetriesExhausted => self.counters.retries_exhausted(),
                    FailureDisposition::Retry => {}
                }
            }
            Ok(Outcome::Interrupted) => self.counters.interrupted(),
            Err(e) => {
                error!(entity = %id, error = %e, "entity processing aborted");
                self.counters.error();
            }
        }
    }
}
