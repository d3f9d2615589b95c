//! Shared types, error model, and configuration for lienflow.
//!
//! This crate is the foundation depended on by all other lienflow crates.
//! It provides:
//! - [`PipelineError`]: the unified error type
//! - Domain types ([`Entity`], [`EnrichmentResultSet`], [`TitleChainResult`], ...)
//! - The pure status state machine ([`PipelineState`], [`RetryPolicy`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod status;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ExtractionConfig, GateConfig, LIMITER_CHAIN_BUILDER, LIMITER_DOCUMENT_INDEX,
    LIMITER_DOCUMENT_STORE, LIMITER_EXTRACTION, LimiterConfig, OrchestratorConfig, RetryConfig,
    ServicesConfig, StorageConfig, TimeoutConfig, WriteQueueConfig, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, required_limiters,
};
pub use error::{PipelineError, Result};
pub use status::{
    Criticality, FailureDisposition, PipelineState, PipelineStatus, PipelineStep, RetryPolicy,
};
pub use types::{
    DateRange, DocumentMetadata, DocumentType, DownloadedDocument, Encumbrance,
    EncumbranceLedger, EnrichmentResultSet, Entity, ExtractedDocument, FloodRecord, Identity,
    JudgmentRecord, MarketRecord, PermitRecord, SourceData, SourceKind, SourceOutcome,
    SourceResult, TaxRecord, TitleChainResult, VerifiedIdentity, normalize_identifier,
};
