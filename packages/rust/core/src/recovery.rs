//! Administrative recovery: audit → apply → verify.
//!
//! Recovery only ever touches rows that exhausted their retries on a
//! non-critical step. Critical failures stay put for legal review no matter
//! how often this runs.

use serde::Serialize;
use tracing::{info, warn};

use lienflow_shared::{PipelineState, PipelineStatus, Result, RetryPolicy};
use lienflow_storage::{RecoveryScope, Storage};

use crate::write_queue::{Mutation, WriteAck, WriteQueue, WriteRequest};

/// Outcome of [`verify`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub checked: usize,
    pub recovered: Vec<String>,
    /// Rows that are not back at `processing` with a clean slate.
    pub mismatched: Vec<PipelineState>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty()
    }
}

/// Rows the recovery would reset.
pub async fn audit(reader: &Storage, policy: &RetryPolicy) -> Result<Vec<PipelineState>> {
    let rows = reader
        .recovery_audit(&RecoveryScope::from_policy(policy))
        .await?;
    let (in_scope, out_of_scope): (Vec<_>, Vec<_>) =
        rows.into_iter().partition(|s| policy.is_recoverable(s));
    for state in &out_of_scope {
        warn!(entity = %state.entity_id, "audit returned a row outside the recovery scope");
    }
    info!(rows = in_scope.len(), "recovery audit");
    Ok(in_scope)
}

/// Reset every in-scope row through the single writer.
pub async fn apply(queue: &WriteQueue, policy: &RetryPolicy) -> Result<u64> {
    let ack = queue
        .apply(WriteRequest::new(
            "*",
            Mutation::Recover(RecoveryScope::from_policy(policy)),
        ))
        .await?;
    let updated = match ack {
        WriteAck::Recovered(n) => n,
        _ => 0,
    };
    info!(rows = updated, "recovery applied");
    Ok(updated)
}

/// Confirm the audited rows now read `processing`, zero retries, no error.
pub async fn verify(reader: &Storage, audited: &[PipelineState]) -> Result<RecoveryReport> {
    let ids: Vec<String> = audited.iter().map(|s| s.entity_id.clone()).collect();
    let current = reader.verify_recovery(&ids).await?;

    let mut report = RecoveryReport {
        checked: current.len(),
        ..Default::default()
    };
    for state in current {
        let clean = state.status == PipelineStatus::Processing
            && state.retry_count == 0
            && state.error_step.is_none()
            && state.last_error.is_none();
        if clean {
            report.recovered.push(state.entity_id);
        } else {
            report.mismatched.push(state);
        }
    }
    if !report.is_clean() {
        warn!(mismatched = report.mismatched.len(), "recovery verification found stale rows");
    }
    Ok(report)
}
