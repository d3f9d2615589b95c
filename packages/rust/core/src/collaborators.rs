//! External collaborator seams.
//!
//! Every service the pipeline talks to sits behind one of these traits. HTTP
//! implementations live in `lienflow-sources`; tests use in-process fakes.
//! Implementations do no limiting or timing out of their own: the governor
//! and the caller's timeouts wrap every call.

use std::sync::Arc;

use async_trait::async_trait;

use lienflow_shared::{
    DateRange, DocumentMetadata, DownloadedDocument, Entity, ExtractedDocument, Identity, Result,
    SourceData, SourceKind, TitleChainResult, VerifiedIdentity,
};

/// One page of seed entities.
#[derive(Debug, Clone, Default)]
pub struct SeedPage {
    pub entities: Vec<Entity>,
    /// Opaque cursor for the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

/// Produces the entities to process for an auction-date window.
#[async_trait]
pub trait SeedSource: Send + Sync {
    async fn fetch(
        &self,
        range: &DateRange,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<SeedPage>;
}

/// Confirms or corrects an entity's parcel identity (phase 2, step F1).
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, entity: &Entity) -> Result<VerifiedIdentity>;
}

/// An independent data source queried in step F2.
#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn fetch(&self, identity: &Identity) -> Result<SourceData>;
}

/// Official-records search.
#[async_trait]
pub trait DocumentIndex: Send + Sync {
    async fn search(
        &self,
        entity_id: &str,
        owner_names: &[String],
        legal_description: Option<&str>,
    ) -> Result<Vec<DocumentMetadata>>;
}

/// Fetches document bodies to local storage.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn download(&self, doc: &DocumentMetadata) -> Result<DownloadedDocument>;
}

/// Turns downloaded documents into structured records.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Largest batch the service accepts.
    fn capacity(&self) -> usize;

    async fn extract_batch(&self, docs: &[DownloadedDocument]) -> Result<Vec<ExtractedDocument>>;
}

/// Builds the encumbrance ledger and owner of record from extracted documents.
#[async_trait]
pub trait ChainBuilder: Send + Sync {
    async fn analyze(&self, entity_id: &str, docs: &[ExtractedDocument])
        -> Result<TitleChainResult>;
}

/// The phase-2 services.
#[derive(Clone)]
pub struct EnrichmentServices {
    pub verifier: Arc<dyn Verifier>,
    /// Queried concurrently, results kept in this order.
    pub sources: Vec<Arc<dyn EnrichmentSource>>,
}

/// The phase-3 services.
#[derive(Clone)]
pub struct LegalServices {
    pub index: Arc<dyn DocumentIndex>,
    pub store: Arc<dyn DocumentStore>,
    pub extraction: Arc<dyn ExtractionService>,
    pub chain_builder: Arc<dyn ChainBuilder>,
}
