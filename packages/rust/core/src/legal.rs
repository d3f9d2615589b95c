//! Phase 3: gated legal analysis.
//!
//! A gate decides from the phase-2 results whether the property is worth
//! analyzing. If so, five steps run in order, each only when the previous
//! one produced its output:
//!
//! 1. document search (needs owner names or a legal description)
//! 2. document download
//! 3. batched extraction
//! 4. final-judgment validation
//! 5. title-chain build
//!
//! A failing step stops the chain and is reported with its step code. The
//! shutdown signal is checked between steps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use lienflow_shared::{
    DocumentMetadata, DocumentType, DownloadedDocument, EnrichmentResultSet, Entity,
    ExtractedDocument, GateConfig, JudgmentRecord, LIMITER_CHAIN_BUILDER, LIMITER_DOCUMENT_INDEX,
    LIMITER_DOCUMENT_STORE, LIMITER_EXTRACTION, PipelineError, PipelineStep, Result,
    TimeoutConfig, TitleChainResult, normalize_identifier,
};

use crate::collaborators::LegalServices;
use crate::governor::{ConcurrencyGovernor, Scope};
use crate::shutdown::ShutdownSignal;
use crate::write_queue::{Mutation, WriteQueue, WriteRequest, settle};

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Analyze,
    Skip(String),
}

/// Decides whether phase 3 runs for an entity.
pub trait AnalysisGate: Send + Sync {
    fn evaluate(&self, entity: &Entity, results: &EnrichmentResultSet) -> GateDecision;
}

/// Skips properties whose value or equity over the judgment is too low.
/// Anything the results cannot tell (no value, no judgment amount) is
/// analyzed.
#[derive(Debug, Clone)]
pub struct EquityGate {
    pub min_market_value: f64,
    pub min_equity: f64,
}

impl EquityGate {
    pub fn from_config(config: &GateConfig) -> Self {
        Self {
            min_market_value: config.min_market_value,
            min_equity: config.min_equity,
        }
    }
}

impl AnalysisGate for EquityGate {
    fn evaluate(&self, entity: &Entity, results: &EnrichmentResultSet) -> GateDecision {
        let Some(value) = results.estimated_value() else {
            return GateDecision::Analyze;
        };
        if value < self.min_market_value {
            return GateDecision::Skip(format!(
                "estimated value {value:.2} below minimum {:.2}",
                self.min_market_value
            ));
        }
        let Some(judgment) = entity.judgment_amount else {
            return GateDecision::Analyze;
        };
        let equity = value - judgment;
        if equity < self.min_equity {
            return GateDecision::Skip(format!(
                "equity {equity:.2} below minimum {:.2}",
                self.min_equity
            ));
        }
        GateDecision::Analyze
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum LegalOutcome {
    /// The gate said no; nothing beyond the skip record was written.
    Skipped { reason: String },
    Analyzed(TitleChainResult),
    /// Shutdown arrived before `next_step` started.
    Interrupted { next_step: PipelineStep },
}

/// The step that stopped the chain and why.
#[derive(Debug)]
pub struct LegalFailure {
    pub step: PipelineStep,
    pub error: PipelineError,
}

impl LegalFailure {
    fn at(step: PipelineStep) -> impl FnOnce(PipelineError) -> Self {
        move |error| Self { step, error }
    }

    /// Position of the failing step in the chain, 0 (search) to 4 (chain
    /// build). `None` when persisting an intermediate failed.
    pub fn index(&self) -> Option<usize> {
        match self.step {
            PipelineStep::DocumentSearch => Some(0),
            PipelineStep::DocumentDownload => Some(1),
            PipelineStep::Extraction => Some(2),
            PipelineStep::JudgmentValidation => Some(3),
            PipelineStep::ChainBuild => Some(4),
            _ => None,
        }
    }
}

impl std::fmt::Display for LegalFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.step, self.error)
    }
}

type StepResult<T> = std::result::Result<T, LegalFailure>;

// ---------------------------------------------------------------------------
// Judgment validation
// ---------------------------------------------------------------------------

/// Find the final judgment for `entity` among extracted documents. The
/// judgment's case number must match the entity's after normalization and
/// its amount must be positive.
pub fn validate_judgment(entity: &Entity, extracted: &[ExtractedDocument]) -> Result<JudgmentRecord> {
    let judgments: Vec<&ExtractedDocument> = extracted
        .iter()
        .filter(|d| d.doc_type == DocumentType::Judgment)
        .collect();
    if judgments.is_empty() {
        return Err(PipelineError::validation(format!(
            "no final judgment among {} extracted documents",
            extracted.len()
        )));
    }

    let expected = normalize_identifier(&entity.case_number);
    let Some(doc) = judgments.iter().find(|d| {
        d.case_number
            .as_deref()
            .is_some_and(|c| normalize_identifier(c) == expected)
    }) else {
        let found: Vec<&str> = judgments
            .iter()
            .filter_map(|d| d.case_number.as_deref())
            .collect();
        return Err(PipelineError::validation(format!(
            "judgment case number {found:?} does not match {}",
            entity.case_number
        )));
    };

    let amount = doc
        .amount
        .filter(|a| a.is_finite() && *a > 0.0)
        .ok_or_else(|| {
            PipelineError::validation(format!(
                "judgment {} has no positive amount",
                doc.document_id
            ))
        })?;

    if let Some(listed) = entity.judgment_amount {
        if (listed - amount).abs() > listed.abs() * 0.01 {
            warn!(
                entity = %entity.case_number,
                listed,
                extracted = amount,
                "judgment amount differs from auction listing"
            );
        }
    }

    Ok(JudgmentRecord {
        entity_id: entity.case_number.clone(),
        document_id: doc.document_id.clone(),
        case_number: entity.case_number.clone(),
        amount,
        plaintiff: entity
            .plaintiff
            .clone()
            .or_else(|| doc.parties.first().cloned()),
        judgment_date: doc.recorded_date,
    })
}

// ---------------------------------------------------------------------------
// Chain
// ---------------------------------------------------------------------------

pub struct LegalAnalysisChain {
    services: LegalServices,
    gate: Arc<dyn AnalysisGate>,
    governor: Arc<ConcurrencyGovernor>,
    queue: WriteQueue,
    timeouts: TimeoutConfig,
    batch_size: usize,
}

impl LegalAnalysisChain {
    pub fn new(
        services: LegalServices,
        gate: Arc<dyn AnalysisGate>,
        governor: Arc<ConcurrencyGovernor>,
        queue: WriteQueue,
        timeouts: TimeoutConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            services,
            gate,
            governor,
            queue,
            timeouts,
            batch_size: batch_size.max(1),
        }
    }

    /// Gate, then run the steps in order.
    #[instrument(skip_all, fields(entity = %entity.case_number))]
    pub async fn analyze(
        &self,
        entity: &Entity,
        results: &EnrichmentResultSet,
        shutdown: &ShutdownSignal,
    ) -> StepResult<LegalOutcome> {
        let entity_id = entity.case_number.as_str();

        if let GateDecision::Skip(reason) = self.gate.evaluate(entity, results) {
            info!(%reason, "legal analysis skipped by gate");
            self.persist(
                entity_id,
                vec![Mutation::LegalAnalysis {
                    chain: None,
                    skip_reason: Some(reason.clone()),
                }],
            )
            .await?;
            return Ok(LegalOutcome::Skipped { reason });
        }

        macro_rules! checkpoint {
            ($step:expr) => {
                if shutdown.is_triggered() {
                    info!(next_step = %$step, "legal analysis interrupted");
                    return Ok(LegalOutcome::Interrupted { next_step: $step });
                }
            };
        }

        checkpoint!(PipelineStep::DocumentSearch);
        let docs = self.search(entity_id, results).await?;

        checkpoint!(PipelineStep::DocumentDownload);
        let downloads = self.download(entity_id, &docs).await?;

        checkpoint!(PipelineStep::Extraction);
        let extracted = self.extract(entity_id, &downloads).await?;

        checkpoint!(PipelineStep::JudgmentValidation);
        let judgment = validate_judgment(entity, &extracted)
            .map_err(LegalFailure::at(PipelineStep::JudgmentValidation))?;
        self.persist(entity_id, vec![Mutation::Judgment(judgment)])
            .await?;

        checkpoint!(PipelineStep::ChainBuild);
        let chain = self.build_chain(entity_id, &extracted).await?;
        info!(
            encumbrances = chain.ledger.len(),
            open = chain.ledger.open().count(),
            warnings = chain.warnings.len(),
            "title chain built"
        );
        self.persist(
            entity_id,
            vec![Mutation::LegalAnalysis {
                chain: Some(chain.clone()),
                skip_reason: None,
            }],
        )
        .await?;

        Ok(LegalOutcome::Analyzed(chain))
    }

    async fn search(
        &self,
        entity_id: &str,
        results: &EnrichmentResultSet,
    ) -> StepResult<Vec<DocumentMetadata>> {
        let step = PipelineStep::DocumentSearch;
        let owners = results.owner_names();
        let legal_description = results.legal_description();
        if owners.is_empty() && legal_description.is_none() {
            return Err(LegalFailure {
                step,
                error: PipelineError::validation("no owner names or legal description to search by"),
            });
        }

        let docs = self
            .limited(
                LIMITER_DOCUMENT_INDEX,
                self.timeouts.document_search(),
                step,
                self.services
                    .index
                    .search(entity_id, &owners, legal_description.as_deref()),
            )
            .await?;
        if docs.is_empty() {
            return Err(LegalFailure {
                step,
                error: PipelineError::validation("records index returned no documents"),
            });
        }
        debug!(documents = docs.len(), "documents found");

        self.persist(entity_id, docs.iter().cloned().map(Mutation::Document).collect())
            .await?;
        Ok(docs)
    }

    async fn download(
        &self,
        entity_id: &str,
        docs: &[DocumentMetadata],
    ) -> StepResult<Vec<DownloadedDocument>> {
        let mut downloads = Vec::with_capacity(docs.len());
        for doc in docs {
            let file = self
                .limited(
                    LIMITER_DOCUMENT_STORE,
                    self.timeouts.download(),
                    PipelineStep::DocumentDownload,
                    self.services.store.download(doc),
                )
                .await?;
            downloads.push(file);
        }
        self.persist(
            entity_id,
            downloads.iter().cloned().map(Mutation::Download).collect(),
        )
        .await?;
        Ok(downloads)
    }

    async fn extract(
        &self,
        entity_id: &str,
        downloads: &[DownloadedDocument],
    ) -> StepResult<Vec<ExtractedDocument>> {
        let batch = self
            .batch_size
            .min(self.services.extraction.capacity())
            .max(1);
        let mut extracted = Vec::with_capacity(downloads.len());
        for chunk in downloads.chunks(batch) {
            let out = self
                .limited(
                    LIMITER_EXTRACTION,
                    self.timeouts.extraction(),
                    PipelineStep::Extraction,
                    self.services.extraction.extract_batch(chunk),
                )
                .await?;
            extracted.extend(out);
        }
        debug!(batch, extracted = extracted.len(), "extraction finished");

        self.persist(
            entity_id,
            extracted.iter().cloned().map(Mutation::Extracted).collect(),
        )
        .await?;
        Ok(extracted)
    }

    async fn build_chain(
        &self,
        entity_id: &str,
        extracted: &[ExtractedDocument],
    ) -> StepResult<TitleChainResult> {
        self.limited(
            LIMITER_CHAIN_BUILDER,
            self.timeouts.chain_build(),
            PipelineStep::ChainBuild,
            self.services.chain_builder.analyze(entity_id, extracted),
        )
        .await
    }

    /// Run `call` under `limiter` with `timeout`, attributing errors to `step`.
    async fn limited<T>(
        &self,
        limiter: &str,
        timeout: Duration,
        step: PipelineStep,
        call: impl Future<Output = Result<T>>,
    ) -> StepResult<T> {
        let outcome = async {
            let _permit = self.governor.acquire(Scope::Limiter(limiter)).await?;
            tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| PipelineError::timeout(step.as_str(), timeout))?
        }
        .await;
        outcome.map_err(LegalFailure::at(step))
    }

    async fn persist(&self, entity_id: &str, mutations: Vec<Mutation>) -> StepResult<()> {
        let mut tickets = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            let ticket = self
                .queue
                .submit(WriteRequest::new(entity_id, mutation))
                .await
                .map_err(LegalFailure::at(PipelineStep::Persist))?;
            tickets.push(ticket);
        }
        settle(tickets)
            .await
            .map_err(LegalFailure::at(PipelineStep::Persist))
    }
}
