//! Orchestration core for lienflow.
//!
//! Ties the pieces of a run together: seed ingestion, the concurrency
//! governor, the single-writer queue, per-entity status tracking, the
//! enrichment fan-out, and the gated legal-analysis chain.

pub mod chain;
pub mod collaborators;
pub mod fanout;
pub mod governor;
pub mod legal;
pub mod orchestrator;
pub mod processor;
pub mod progress;
pub mod recovery;
pub mod seeds;
pub mod shutdown;
pub mod status;
pub mod write_queue;

#[cfg(test)]
mod testing;

pub use chain::LedgerChainBuilder;
pub use collaborators::{
    ChainBuilder, DocumentIndex, DocumentStore, EnrichmentServices, EnrichmentSource,
    ExtractionService, LegalServices, SeedPage, SeedSource, Verifier,
};
pub use fanout::EnrichmentFanOut;
pub use governor::{ConcurrencyGovernor, Permit, Scope};
pub use legal::{
    AnalysisGate, EquityGate, GateDecision, LegalAnalysisChain, LegalFailure, LegalOutcome,
};
pub use orchestrator::{Collaborators, Orchestrator, RunSummary};
pub use processor::{EntityProcessor, Outcome};
pub use progress::{ProgressCounters, ProgressSnapshot, SourceTally};
pub use recovery::RecoveryReport;
pub use seeds::{JsonLinesSeedSource, StoredSeedSource};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use status::StatusTracker;
pub use write_queue::{WriteAck, WriteQueue, WriteRequest, WriteTarget, WriterHandle, WriterStats};
