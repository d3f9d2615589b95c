//! Run counters shared between entity tasks and progress displays.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use lienflow_shared::SourceKind;

/// Lock-free counters updated by the orchestrator and entity tasks.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    seeded: AtomicU64,
    skipped_existing: AtomicU64,
    rejected: AtomicU64,
    seeds_lost: AtomicU64,
    pending: AtomicU64,
    in_flight: AtomicU64,
    completed: AtomicU64,
    analyzed: AtomicU64,
    gate_skipped: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    manual_review: AtomicU64,
    retries_exhausted: AtomicU64,
    interrupted: AtomicU64,
    errors: AtomicU64,
    source_success: [AtomicU64; 5],
    source_failure: [AtomicU64; 5],
}

/// Point-in-time copy of [`ProgressCounters`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub seeded: u64,
    pub skipped_existing: u64,
    pub rejected: u64,
    /// Seeds whose status row could not be written.
    pub seeds_lost: u64,
    /// Queued for dispatch: seeded or requeued, not yet started.
    pub pending: u64,
    pub in_flight: u64,
    pub completed: u64,
    pub analyzed: u64,
    pub gate_skipped: u64,
    pub failed: u64,
    pub requeued: u64,
    pub manual_review: u64,
    pub retries_exhausted: u64,
    pub interrupted: u64,
    pub errors: u64,
    pub sources: Vec<SourceTally>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceTally {
    pub source: SourceKind,
    pub success: u64,
    pub failure: u64,
}

impl ProgressSnapshot {
    /// Entities that reached a terminal state or were handed back.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.interrupted + self.errors
    }
}

fn slot(kind: SourceKind) -> usize {
    match kind {
        SourceKind::Verifier => 0,
        SourceKind::Tax => 1,
        SourceKind::Permit => 2,
        SourceKind::Market => 3,
        SourceKind::Flood => 4,
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Saturates at zero; a stray call must not wrap.
fn drop_one(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
}

impl ProgressCounters {
    pub fn seeded(&self) {
        bump(&self.seeded);
        bump(&self.pending);
    }
    pub fn skipped_existing(&self) {
        bump(&self.skipped_existing);
    }
    pub fn rejected(&self) {
        bump(&self.rejected);
    }
    pub fn seed_lost(&self) {
        bump(&self.seeds_lost);
    }
    pub fn started(&self) {
        drop_one(&self.pending);
        bump(&self.in_flight);
    }
    /// An entity left its task, whatever the outcome.
    pub fn stopped(&self) {
        drop_one(&self.in_flight);
    }
    pub fn completed(&self, analyzed: bool) {
        bump(&self.completed);
        if analyzed {
            bump(&self.analyzed);
        } else {
            bump(&self.gate_skipped);
        }
    }
    pub fn failed(&self) {
        bump(&self.failed);
    }
    pub fn requeued(&self) {
        bump(&self.requeued);
        bump(&self.pending);
    }
    pub fn manual_review(&self) {
        bump(&self.manual_review);
    }
    pub fn retries_exhausted(&self) {
        bump(&self.retries_exhausted);
    }
    pub fn interrupted(&self) {
        bump(&self.interrupted);
    }
    pub fn error(&self) {
        bump(&self.errors);
    }

    pub fn source(&self, kind: SourceKind, success: bool) {
        let counters = if success {
            &self.source_success
        } else {
            &self.source_failure
        };
        bump(&counters[slot(kind)]);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ProgressSnapshot {
            seeded: load(&self.seeded),
            skipped_existing: load(&self.skipped_existing),
            rejected: load(&self.rejected),
            seeds_lost: load(&self.seeds_lost),
            pending: load(&self.pending),
            in_flight: load(&self.in_flight),
            completed: load(&self.completed),
            analyzed: load(&self.analyzed),
            gate_skipped: load(&self.gate_skipped),
            failed: load(&self.failed),
            requeued: load(&self.requeued),
            manual_review: load(&self.manual_review),
            retries_exhausted: load(&self.retries_exhausted),
            interrupted: load(&self.interrupted),
            errors: load(&self.errors),
            sources: SourceKind::ALL
                .into_iter()
                .map(|kind| SourceTally {
                    source: kind,
                    success: load(&self.source_success[slot(kind)]),
                    failure: load(&self.source_failure[slot(kind)]),
                })
                .collect(),
        }
    }
}
