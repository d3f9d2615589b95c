//! Per-entity pipeline state, step codes, and the retry/recovery policy.
//!
//! Transitions are pure functions over [`PipelineState`]; persisting the
//! resulting state is the caller's job (the status tracker in `lienflow-core`
//! routes it through the single-writer queue).
//!
//! ```text
//! pending ──begin──▶ processing ──complete──▶ completed
//!    ▲                   │
//!    │ requeue           │ fail
//!    └──────────────── failed ──recover──▶ processing
//! ```

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Upper bound on stored `last_error` text.
const MAX_ERROR_LEN: usize = 2_000;

// ---------------------------------------------------------------------------
// PipelineStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PipelineStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(PipelineError::validation(format!(
                "unknown pipeline status: {other}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineStep
// ---------------------------------------------------------------------------

/// Pipeline steps. The integer code is the persisted `error_step` value and
/// must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Verify,
    TaxLookup,
    PermitLookup,
    MarketLookup,
    FloodLookup,
    DocumentSearch,
    DocumentDownload,
    Extraction,
    JudgmentValidation,
    ChainBuild,
    Persist,
}

impl PipelineStep {
    /// Every step, in code order.
    pub const ALL: [PipelineStep; 11] = [
        Self::Verify,
        Self::TaxLookup,
        Self::PermitLookup,
        Self::MarketLookup,
        Self::FloodLookup,
        Self::DocumentSearch,
        Self::DocumentDownload,
        Self::Extraction,
        Self::JudgmentValidation,
        Self::ChainBuild,
        Self::Persist,
    ];

    /// Persisted integer code.
    pub fn code(&self) -> i64 {
        match self {
            Self::Verify => 1,
            Self::TaxLookup => 2,
            Self::PermitLookup => 3,
            Self::MarketLookup => 4,
            Self::FloodLookup => 5,
            Self::DocumentSearch => 6,
            Self::DocumentDownload => 7,
            Self::Extraction => 8,
            Self::JudgmentValidation => 9,
            Self::ChainBuild => 10,
            Self::Persist => 11,
        }
    }

    /// Inverse of [`PipelineStep::code`].
    pub fn from_code(code: i64) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.code() == code)
            .ok_or_else(|| PipelineError::validation(format!("unknown error_step code: {code}")))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::TaxLookup => "tax_lookup",
            Self::PermitLookup => "permit_lookup",
            Self::MarketLookup => "market_lookup",
            Self::FloodLookup => "flood_lookup",
            Self::DocumentSearch => "document_search",
            Self::DocumentDownload => "document_download",
            Self::Extraction => "extraction",
            Self::JudgmentValidation => "judgment_validation",
            Self::ChainBuild => "chain_build",
            Self::Persist => "persist",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

/// One `pipeline_status` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub entity_id: String,
    pub status: PipelineStatus,
    pub error_step: Option<PipelineStep>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineState {
    /// Fresh state created at seed ingestion.
    pub fn pending(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            status: PipelineStatus::Pending,
            error_step: None,
            retry_count: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// `pending → processing`. Also accepts `processing` so that entities
    /// interrupted mid-run (or released by recovery) can be resumed.
    pub fn begin(&self) -> Result<Self> {
        match self.status {
            PipelineStatus::Pending | PipelineStatus::Processing => Ok(Self {
                status: PipelineStatus::Processing,
                updated_at: Utc::now(),
                ..self.clone()
            }),
            _ => Err(self.invalid("begin")),
        }
    }

    /// `processing → completed`. Resets the retry counter.
    pub fn complete(&self) -> Result<Self> {
        match self.status {
            PipelineStatus::Processing => Ok(Self {
                status: PipelineStatus::Completed,
                error_step: None,
                retry_count: 0,
                last_error: None,
                updated_at: Utc::now(),
                ..self.clone()
            }),
            _ => Err(self.invalid("complete")),
        }
    }

    /// `processing → failed`, recording the failing step and incrementing the
    /// retry counter.
    pub fn fail(&self, step: PipelineStep, error: &str) -> Result<Self> {
        match self.status {
            PipelineStatus::Processing => Ok(Self {
                status: PipelineStatus::Failed,
                error_step: Some(step),
                retry_count: self.retry_count.saturating_add(1),
                last_error: Some(truncate_error(error)),
                updated_at: Utc::now(),
                ..self.clone()
            }),
            _ => Err(self.invalid("fail")),
        }
    }

    /// `failed → pending` for an automatic re-enqueue. The retry counter is
    /// kept so the bound accumulates across attempts.
    pub fn requeue(&self) -> Result<Self> {
        match self.status {
            PipelineStatus::Failed => Ok(Self {
                status: PipelineStatus::Pending,
                error_step: None,
                last_error: None,
                updated_at: Utc::now(),
                ..self.clone()
            }),
            _ => Err(self.invalid("requeue")),
        }
    }

    /// Scoped recovery: `failed|processing → processing` with a cleared
    /// error and a zeroed retry counter. Only rows the policy marks as
    /// recoverable may pass.
    pub fn recover(&self, policy: &RetryPolicy) -> Result<Self> {
        if !policy.is_recoverable(self) {
            return Err(self.invalid("recover"));
        }
        Ok(Self {
            status: PipelineStatus::Processing,
            error_step: None,
            retry_count: 0,
            last_error: None,
            updated_at: Utc::now(),
            ..self.clone()
        })
    }

    /// `error_step`/`last_error` are set only while failed.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            PipelineStatus::Failed => self.error_step.is_some(),
            _ => self.error_step.is_none() && self.last_error.is_none(),
        }
    }

    fn invalid(&self, action: &'static str) -> PipelineError {
        PipelineError::InvalidTransition {
            entity_id: self.entity_id.clone(),
            from: self.status,
            action,
        }
    }
}

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Failure class of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    /// Structural or legal-data problem; needs manual review.
    Critical,
    /// Auto-retried up to the configured maximum.
    NonCritical,
}

/// What happens to an entity after a failure transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-enqueue for another attempt.
    Retry,
    /// Critical failure past its small bound; flagged for legal review.
    ManualReview,
    /// Non-critical failure past `max_retries`; waits for the recovery action.
    RetriesExhausted,
}

/// Classification and retry bounds, built from `[retry]` configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    critical: BTreeSet<PipelineStep>,
    non_critical: BTreeSet<PipelineStep>,
    max_retries: u32,
    critical_max_retries: u32,
}

impl RetryPolicy {
    /// Build a policy. Every step must be classified exactly once.
    pub fn new(
        critical: impl IntoIterator<Item = PipelineStep>,
        non_critical: impl IntoIterator<Item = PipelineStep>,
        max_retries: u32,
        critical_max_retries: u32,
    ) -> Result<Self> {
        let critical: BTreeSet<_> = critical.into_iter().collect();
        let non_critical: BTreeSet<_> = non_critical.into_iter().collect();

        if let Some(step) = critical.intersection(&non_critical).next() {
            return Err(PipelineError::config(format!(
                "step {step} is listed as both critical and non-critical"
            )));
        }
        let unclassified: Vec<_> = PipelineStep::ALL
            .iter()
            .filter(|s| !critical.contains(s) && !non_critical.contains(s))
            .map(|s| s.as_str())
            .collect();
        if !unclassified.is_empty() {
            return Err(PipelineError::config(format!(
                "unclassified pipeline steps: {}",
                unclassified.join(", ")
            )));
        }
        if max_retries == 0 {
            return Err(PipelineError::config("retry.max_retries must be > 0"));
        }

        Ok(Self {
            critical,
            non_critical,
            max_retries,
            critical_max_retries,
        })
    }

    pub fn criticality(&self, step: PipelineStep) -> Criticality {
        if self.critical.contains(&step) {
            Criticality::Critical
        } else {
            Criticality::NonCritical
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Non-critical steps, ascending by code.
    pub fn non_critical_steps(&self) -> impl Iterator<Item = PipelineStep> + '_ {
        self.non_critical.iter().copied()
    }

    /// Decide what to do with a state that has just transitioned to failed.
    pub fn disposition(&self, failed: &PipelineState) -> FailureDisposition {
        let Some(step) = failed.error_step else {
            return FailureDisposition::ManualReview;
        };
        match self.criticality(step) {
            Criticality::Critical if failed.retry_count < self.critical_max_retries => {
                FailureDisposition::Retry
            }
            Criticality::Critical => FailureDisposition::ManualReview,
            Criticality::NonCritical if failed.retry_count < self.max_retries => {
                FailureDisposition::Retry
            }
            Criticality::NonCritical => FailureDisposition::RetriesExhausted,
        }
    }

    /// Recovery scope: `status ∈ {processing, failed}`, `retry_count ≥ max`,
    /// and `error_step` non-critical.
    pub fn is_recoverable(&self, state: &PipelineState) -> bool {
        matches!(
            state.status,
            PipelineStatus::Processing | PipelineStatus::Failed
        ) && state.retry_count >= self.max_retries
            && state
                .error_step
                .is_some_and(|s| self.non_critical.contains(&s))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            critical: DEFAULT_CRITICAL_STEPS.into_iter().collect(),
            non_critical: DEFAULT_NON_CRITICAL_STEPS.into_iter().collect(),
            max_retries: 3,
            critical_max_retries: 1,
        }
    }
}

/// Default critical set: legal-data steps whose failure needs a human.
pub const DEFAULT_CRITICAL_STEPS: [PipelineStep; 3] = [
    PipelineStep::DocumentSearch,
    PipelineStep::JudgmentValidation,
    PipelineStep::ChainBuild,
];

/// Default non-critical set: lookups and I/O that usually succeed on retry.
pub const DEFAULT_NON_CRITICAL_STEPS: [PipelineStep; 8] = [
    PipelineStep::Verify,
    PipelineStep::TaxLookup,
    PipelineStep::PermitLookup,
    PipelineStep::MarketLookup,
    PipelineStep::FloodLookup,
    PipelineStep::DocumentDownload,
    PipelineStep::Extraction,
    PipelineStep::Persist,
];
