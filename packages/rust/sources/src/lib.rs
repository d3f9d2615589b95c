//! HTTP implementations of the collaborator traits in `lienflow-core`.
//!
//! - [`client`]: shared reqwest client and error classification
//! - [`enrichment`]: verifier and folio-keyed enrichment sources
//! - [`documents`]: records search, document download, extraction

pub mod client;
pub mod documents;
pub mod enrichment;

use std::sync::Arc;

use tracing::{info, warn};

use lienflow_core::{EnrichmentServices, EnrichmentSource, LedgerChainBuilder, LegalServices};
use lienflow_shared::{AppConfig, PipelineError, Result, SourceKind, expand_home};

pub use client::ServiceClient;
pub use documents::{HttpDocumentIndex, HttpDocumentStore, HttpExtractionService};
pub use enrichment::{HttpEnrichmentSource, HttpVerifier};

/// Build every collaborator from `[services]`.
///
/// The verifier, records index, and extraction service are required. An
/// enrichment source without a URL is left out of the fan-out.
pub fn services_from_config(config: &AppConfig) -> Result<(EnrichmentServices, LegalServices)> {
    let services = &config.services;
    let required = |url: &Option<url::Url>, key: &str| {
        url.clone()
            .ok_or_else(|| PipelineError::config(format!("services.{key} is not set")))
    };

    let verifier = HttpVerifier::new(required(&services.verifier_url, "verifier_url")?)?;

    let mut sources: Vec<Arc<dyn EnrichmentSource>> = Vec::new();
    for kind in SourceKind::ALL.into_iter().filter(|k| *k != SourceKind::Verifier) {
        match services.source_url(kind) {
            Some(url) => sources.push(Arc::new(HttpEnrichmentSource::new(kind, url.clone())?)),
            None => warn!(source = %kind, "no endpoint configured, source disabled"),
        }
    }

    let index_url = required(&services.document_index_url, "document_index_url")?;
    let download_dir = expand_home(&config.storage.download_dir)?;
    let legal = LegalServices {
        index: Arc::new(HttpDocumentIndex::new(index_url.clone())?),
        store: Arc::new(HttpDocumentStore::new(index_url, download_dir)?),
        extraction: Arc::new(HttpExtractionService::new(
            required(&services.extraction_url, "extraction_url")?,
            services.extraction_capacity,
        )?),
        chain_builder: Arc::new(LedgerChainBuilder),
    };

    info!(sources = sources.len(), "collaborators configured");
    Ok((
        EnrichmentServices {
            verifier: Arc::new(verifier),
            sources,
        },
        legal,
    ))
}
