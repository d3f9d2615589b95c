//! Phase-3 collaborators over HTTP: official-records search, document
//! download, and batched extraction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use lienflow_core::{DocumentIndex, DocumentStore, ExtractionService};
use lienflow_shared::{
    DocumentMetadata, DownloadedDocument, ExtractedDocument, PipelineError, Result,
};

use crate::client::ServiceClient;

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SearchRequest<'a> {
    entity_id: &'a str,
    owner_names: &'a [String],
    legal_description: Option<&'a str>,
}

#[derive(Deserialize)]
struct SearchResponse {
    documents: Vec<DocumentMetadata>,
}

/// `POST {base}/search`.
pub struct HttpDocumentIndex {
    client: ServiceClient,
}

impl HttpDocumentIndex {
    pub fn new(base: Url) -> Result<Self> {
        Ok(Self {
            client: ServiceClient::new(base)?,
        })
    }
}

#[async_trait]
impl DocumentIndex for HttpDocumentIndex {
    async fn search(
        &self,
        entity_id: &str,
        owner_names: &[String],
        legal_description: Option<&str>,
    ) -> Result<Vec<DocumentMetadata>> {
        let url = self.client.endpoint(&["search"])?;
        let response: SearchResponse = self
            .client
            .post_json(
                url,
                &SearchRequest {
                    entity_id,
                    owner_names,
                    legal_description,
                },
            )
            .await?;

        // The index does not always echo our id back.
        Ok(response
            .documents
            .into_iter()
            .map(|mut doc| {
                doc.entity_id = entity_id.to_string();
                doc
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// Downloads each document to `{dir}/{entity}/{instrument}.pdf`. Documents
/// without a `download_url` are fetched from `{base}/documents/{instrument}`.
pub struct HttpDocumentStore {
    client: ServiceClient,
    dir: PathBuf,
}

impl HttpDocumentStore {
    pub fn new(base: Url, dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            client: ServiceClient::new(base)?,
            dir: dir.into(),
        })
    }

    fn target_path(&self, doc: &DocumentMetadata) -> PathBuf {
        self.dir
            .join(file_component(&doc.entity_id))
            .join(format!("{}.pdf", file_component(&doc.instrument_number)))
    }

    fn source_url(&self, doc: &DocumentMetadata) -> Result<Url> {
        match &doc.download_url {
            Some(raw) => Url::parse(raw).map_err(|e| {
                PipelineError::validation(format!(
                    "document {} has an invalid download URL: {e}",
                    doc.instrument_number
                ))
            }),
            None => self.client.endpoint(&["documents", &doc.instrument_number]),
        }
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn download(&self, doc: &DocumentMetadata) -> Result<DownloadedDocument> {
        let bytes = self.client.get_bytes(self.source_url(doc)?).await?;
        let path = self.target_path(doc);
        write_file(&path, &bytes).await?;
        debug!(document = %doc.instrument_number, bytes = bytes.len(), "document saved");

        Ok(DownloadedDocument {
            document_id: doc.instrument_number.clone(),
            entity_id: doc.entity_id.clone(),
            doc_type: doc.doc_type,
            path,
            sha256: compute_hash(&bytes),
            size_bytes: bytes.len() as u64,
        })
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::io(parent, e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| PipelineError::io(path, e))
}

/// Replace anything that is not safe in a single path component.
fn file_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "_".into() } else { cleaned }
}

fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ExtractRequest<'a> {
    documents: &'a [DownloadedDocument],
}

#[derive(Deserialize)]
struct ExtractResponse {
    documents: Vec<ExtractedDocument>,
}

/// `POST {base}/extract`, at most `capacity` documents per call.
pub struct HttpExtractionService {
    client: ServiceClient,
    capacity: usize,
}

impl HttpExtractionService {
    pub fn new(base: Url, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::config("services.extraction_capacity must be > 0"));
        }
        Ok(Self {
            client: ServiceClient::new(base)?,
            capacity,
        })
    }
}

#[async_trait]
impl ExtractionService for HttpExtractionService {
    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn extract_batch(&self, docs: &[DownloadedDocument]) -> Result<Vec<ExtractedDocument>> {
        if docs.len() > self.capacity {
            return Err(PipelineError::Capacity(format!(
                "extraction batch of {} exceeds capacity {}",
                docs.len(),
                self.capacity
            )));
        }
        let url = self.client.endpoint(&["extract"])?;
        let response: ExtractResponse = self
            .client
            .post_json(url, &ExtractRequest { documents: docs })
            .await?;

        let requested: HashSet<&str> = docs.iter().map(|d| d.document_id.as_str()).collect();
        if let Some(stray) = response
            .documents
            .iter()
            .find(|d| !requested.contains(d.document_id.as_str()))
        {
            return Err(PipelineError::validation(format!(
                "extraction returned unrequested document {}",
                stray.document_id
            )));
        }
        Ok(response.documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lienflow_shared::DocumentType;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metadata(instrument: &str, url: Option<String>) -> DocumentMetadata {
        DocumentMetadata {
            instrument_number: instrument.into(),
            entity_id: "2024-CA-000123".into(),
            doc_type: DocumentType::Judgment,
            recorded_date: None,
            parties: vec![],
            download_url: url,
        }
    }

    #[tokio::test]
    async fn search_stamps_entity_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "documents": [
                    { "instrument_number": "2023123456", "entity_id": "", "doc_type": "judgment" },
                    { "instrument_number": "2015000111", "entity_id": "", "doc_type": "mortgage" }
                ]
            })))
            .mount(&server)
            .await;

        let index = HttpDocumentIndex::new(Url::parse(&server.uri()).unwrap()).unwrap();
        let docs = index
            .search("2024-CA-000123", &["DOE JOHN".into()], None)
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.entity_id == "2024-CA-000123"));
        assert_eq!(docs[1].doc_type, DocumentType::Mortgage);
    }

    #[tokio::test]
    async fn download_writes_file_and_hashes_it() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/OR%202023%2F123"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7 judgment".to_vec()))
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("lf_test_{}", Uuid::now_v7()));
        let store = HttpDocumentStore::new(Url::parse(&server.uri()).unwrap(), &dir).unwrap();
        let downloaded = store.download(&metadata("OR 2023/123", None)).await.unwrap();

        assert_eq!(downloaded.size_bytes, 17);
        assert_eq!(downloaded.sha256, compute_hash(b"%PDF-1.7 judgment"));
        assert_eq!(downloaded.path, dir.join("2024-CA-000123").join("OR_2023_123.pdf"));
        assert_eq!(std::fs::read(&downloaded.path).unwrap(), b"%PDF-1.7 judgment");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn download_failure_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let dir = std::env::temp_dir().join(format!("lf_test_{}", Uuid::now_v7()));
        let store =
            HttpDocumentStore::new(Url::parse("https://records.example.com/").unwrap(), &dir)
                .unwrap();
        let direct = format!("{}/blob/9", server.uri());
        let err = store.download(&metadata("9", Some(direct))).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn extraction_enforces_capacity_and_rejects_strays() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/extract"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "documents": [
                    { "document_id": "X-1", "entity_id": "2024-CA-000123", "doc_type": "judgment" }
                ]
            })))
            .mount(&server)
            .await;

        let service = HttpExtractionService::new(Url::parse(&server.uri()).unwrap(), 1).unwrap();
        let doc = DownloadedDocument {
            document_id: "J-1".into(),
            entity_id: "2024-CA-000123".into(),
            doc_type: DocumentType::Judgment,
            path: PathBuf::from("/tmp/J-1.pdf"),
            sha256: "0".repeat(64),
            size_bytes: 1,
        };

        let over = service
            .extract_batch(&[doc.clone(), doc.clone()])
            .await
            .unwrap_err();
        assert!(matches!(over, PipelineError::Capacity(_)));

        let stray = service.extract_batch(&[doc]).await.unwrap_err();
        assert!(stray.to_string().contains("X-1"));
    }

    #[test]
    fn file_component_sanitizes() {
        assert_eq!(file_component("../etc/passwd"), "___etc_passwd");
        assert_eq!(file_component(""), "_");
    }
}
