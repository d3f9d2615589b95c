//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding seed properties,
//! per-entity pipeline status, enrichment results, and legal-analysis
//! intermediates.
//!
//! **Access rules:**
//! - The pipeline's single writer task: read-write via [`Storage::open`]
//! - Status queries, resume listing, monitors: read-only via [`Storage::open_readonly`]
//!
//! The engine is not safe for concurrent multi-writer access, so nothing but
//! the write queue's writer task may hold a read-write handle during a run.

mod migrations;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database, params};
use uuid::Uuid;

use lienflow_shared::{
    DocumentMetadata, DownloadedDocument, Entity, ExtractedDocument, JudgmentRecord,
    PipelineError, PipelineState, PipelineStatus, PipelineStep, Result, RetryPolicy,
    SourceResult, TitleChainResult,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Rows eligible for the administrative recovery action.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryScope {
    /// Rows must have `retry_count >= max_retries`.
    pub max_retries: u32,
    /// Rows must have `error_step` in this set.
    pub steps: Vec<PipelineStep>,
}

impl RecoveryScope {
    /// Scope matching the policy's non-critical steps and retry bound.
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self {
            max_retries: policy.max_retries(),
            steps: policy.non_critical_steps().collect(),
        }
    }

    /// SQL predicate for this scope. Step codes are generated from the enum,
    /// never from user input.
    fn predicate(&self) -> String {
        let codes: Vec<String> = self.steps.iter().map(|s| s.code().to_string()).collect();
        format!(
            "pipeline_status IN ('processing', 'failed') AND retry_count >= ?1 AND error_step IN ({})",
            codes.join(", ")
        )
    }
}

/// Stored phase-3 outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct LegalAnalysisRow {
    pub entity_id: String,
    /// `analyzed` or `skipped`.
    pub outcome: String,
    pub reason: Option<String>,
    pub chain: Option<TitleChainResult>,
    pub analyzed_at: DateTime<Utc>,
}

fn db_err(e: libsql::Error) -> PipelineError {
    PipelineError::Storage(e.to_string())
}

fn json_err(e: serde_json::Error) -> PipelineError {
    PipelineError::Storage(format!("invalid stored JSON: {e}"))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PipelineError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PipelineError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Seed ingestion
    // -----------------------------------------------------------------------

    /// Create the property and its `pending` status row together. Existing
    /// rows are left untouched. Returns the entity's current status.
    pub async fn seed_entity(&self, entity: &Entity) -> Result<PipelineState> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(db_err)?;
        tx.execute(
            "INSERT INTO properties (case_number, folio, address, auction_date, judgment_amount, plaintiff, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(case_number) DO NOTHING",
            params![
                entity.case_number.as_str(),
                entity.folio.as_deref(),
                entity.address.as_str(),
                entity.auction_date.to_string(),
                entity.judgment_amount,
                entity.plaintiff.as_deref(),
                now.as_str(),
            ],
        )
        .await
        .map_err(db_err)?;
        tx.execute(
            "INSERT INTO pipeline_status (case_number, pipeline_status, retry_count, updated_at)
             VALUES (?1, 'pending', 0, ?2)
             ON CONFLICT(case_number) DO NOTHING",
            params![entity.case_number.as_str(), now.as_str()],
        )
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        self.get_status(&entity.case_number).await?.ok_or_else(|| {
            PipelineError::Storage(format!(
                "status row for {} missing after seed",
                entity.case_number
            ))
        })
    }

    /// Get a property by case number.
    pub async fn get_entity(&self, case_number: &str) -> Result<Option<Entity>> {
        let mut rows = self
            .conn
            .query(
                "SELECT case_number, folio, address, auction_date, judgment_amount, plaintiff
                 FROM properties WHERE case_number = ?1",
                params![case_number],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_entity(&row, 0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline status
    // -----------------------------------------------------------------------

    /// Get the status row for an entity.
    pub async fn get_status(&self, case_number: &str) -> Result<Option<PipelineState>> {
        let mut rows = self
            .conn
            .query(
                "SELECT case_number, pipeline_status, error_step, retry_count, last_error, updated_at
                 FROM pipeline_status WHERE case_number = ?1",
                params![case_number],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_state(&row, 0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Write a status row (insert or replace all mutable fields).
    pub async fn upsert_status(&self, state: &PipelineState) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO pipeline_status (case_number, pipeline_status, error_step, retry_count, last_error, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(case_number) DO UPDATE SET
                   pipeline_status = excluded.pipeline_status,
                   error_step = excluded.error_step,
                   retry_count = excluded.retry_count,
                   last_error = excluded.last_error,
                   updated_at = excluded.updated_at",
                params![
                    state.entity_id.as_str(),
                    state.status.as_str(),
                    state.error_step.map(|s| s.code()),
                    state.retry_count,
                    state.last_error.as_deref(),
                    state.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// List status rows, optionally filtered by status.
    pub async fn list_status(&self, filter: Option<PipelineStatus>) -> Result<Vec<PipelineState>> {
        let mut rows = match filter {
            Some(status) => self
                .conn
                .query(
                    "SELECT case_number, pipeline_status, error_step, retry_count, last_error, updated_at
                     FROM pipeline_status WHERE pipeline_status = ?1 ORDER BY case_number",
                    params![status.as_str()],
                )
                .await,
            None => self
                .conn
                .query(
                    "SELECT case_number, pipeline_status, error_step, retry_count, last_error, updated_at
                     FROM pipeline_status ORDER BY case_number",
                    params![],
                )
                .await,
        }
        .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_state(&row, 0)?);
        }
        Ok(results)
    }

    /// Count entities per status.
    pub async fn status_counts(&self) -> Result<BTreeMap<String, u64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT pipeline_status, COUNT(*) FROM pipeline_status GROUP BY pipeline_status",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: String = row.get(0).map_err(db_err)?;
            let count: i64 = row.get(1).map_err(db_err)?;
            counts.insert(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    /// Entities left `pending` or `processing` (interrupted or recovered),
    /// ordered by case number. Pages by keyset: pass the last case number of
    /// the previous page as `after`.
    pub async fn list_resumable(
        &self,
        after: Option<&str>,
        limit: u32,
    ) -> Result<Vec<(Entity, PipelineState)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT p.case_number, p.folio, p.address, p.auction_date, p.judgment_amount, p.plaintiff,
                        s.case_number, s.pipeline_status, s.error_step, s.retry_count, s.last_error, s.updated_at
                 FROM properties p
                 JOIN pipeline_status s ON s.case_number = p.case_number
                 WHERE s.pipeline_status IN ('pending', 'processing') AND p.case_number > ?1
                 ORDER BY p.case_number
                 LIMIT ?2",
                params![after.unwrap_or(""), limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push((row_to_entity(&row, 0)?, row_to_state(&row, 6)?));
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Recovery (audit → apply → verify)
    // -----------------------------------------------------------------------

    /// Rows the recovery action would touch.
    pub async fn recovery_audit(&self, scope: &RecoveryScope) -> Result<Vec<PipelineState>> {
        if scope.steps.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT case_number, pipeline_status, error_step, retry_count, last_error, updated_at
             FROM pipeline_status WHERE {} ORDER BY case_number",
            scope.predicate()
        );
        let mut rows = self
            .conn
            .query(&sql, params![scope.max_retries])
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_state(&row, 0)?);
        }
        Ok(results)
    }

    /// Reset in-scope rows to `processing` with `retry_count = 0` and cleared
    /// errors. Returns the number of rows updated.
    pub async fn apply_recovery(&self, scope: &RecoveryScope) -> Result<u64> {
        self.check_writable()?;
        if scope.steps.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE pipeline_status
             SET pipeline_status = 'processing', retry_count = 0, last_error = NULL,
                 error_step = NULL, updated_at = ?2
             WHERE {}",
            scope.predicate()
        );
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn
            .execute(&sql, params![scope.max_retries, now.as_str()])
            .await
            .map_err(db_err)?;
        tracing::info!(rows = updated, "recovery applied");
        Ok(updated)
    }

    /// Current rows for the given case numbers, for post-recovery checks.
    pub async fn verify_recovery(&self, case_numbers: &[String]) -> Result<Vec<PipelineState>> {
        let mut results = Vec::with_capacity(case_numbers.len());
        for case_number in case_numbers {
            if let Some(state) = self.get_status(case_number).await? {
                results.push(state);
            }
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Enrichment results
    // -----------------------------------------------------------------------

    /// Append one source result.
    pub async fn insert_enrichment(&self, entity_id: &str, result: &SourceResult) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let json = serde_json::to_string(result).map_err(json_err)?;
        let (success, timed_out, error) = match &result.outcome {
            lienflow_shared::SourceOutcome::Success { .. } => (1i64, 0i64, None),
            lienflow_shared::SourceOutcome::Failure { reason, timed_out } => {
                (0, i64::from(*timed_out), Some(reason.as_str()))
            }
        };
        self.conn
            .execute(
                "INSERT INTO enrichment_results (id, case_number, source, success, timed_out, error, result_json, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.as_str(),
                    entity_id,
                    result.source.as_str(),
                    success,
                    timed_out,
                    error,
                    json.as_str(),
                    result.recorded_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// All recorded source results for an entity, oldest first.
    pub async fn list_enrichment(&self, entity_id: &str) -> Result<Vec<SourceResult>> {
        let mut rows = self
            .conn
            .query(
                "SELECT result_json FROM enrichment_results WHERE case_number = ?1 ORDER BY id",
                params![entity_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let json: String = row.get(0).map_err(db_err)?;
            results.push(serde_json::from_str(&json).map_err(json_err)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Legal-analysis intermediates
    // -----------------------------------------------------------------------

    /// Upsert a document found by the records index.
    pub async fn upsert_document(&self, doc: &DocumentMetadata) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(doc).map_err(json_err)?;
        self.conn
            .execute(
                "INSERT INTO documents (instrument_number, case_number, doc_type, recorded_date, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(case_number, instrument_number) DO UPDATE SET
                   doc_type = excluded.doc_type,
                   recorded_date = excluded.recorded_date,
                   metadata_json = excluded.metadata_json",
                params![
                    doc.instrument_number.as_str(),
                    doc.entity_id.as_str(),
                    doc.doc_type.as_str(),
                    doc.recorded_date.map(|d| d.to_string()),
                    json.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Attach a downloaded file to its document row.
    pub async fn record_download(&self, file: &DownloadedDocument) -> Result<()> {
        self.check_writable()?;
        let updated = self
            .conn
            .execute(
                "UPDATE documents SET file_path = ?1, sha256 = ?2, size_bytes = ?3
                 WHERE case_number = ?4 AND instrument_number = ?5",
                params![
                    file.path.to_string_lossy().into_owned(),
                    file.sha256.as_str(),
                    file.size_bytes as i64,
                    file.entity_id.as_str(),
                    file.document_id.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(PipelineError::Storage(format!(
                "no document {} for {}",
                file.document_id, file.entity_id
            )));
        }
        Ok(())
    }

    /// Documents recorded for an entity, with download info when present.
    pub async fn list_documents(
        &self,
        entity_id: &str,
    ) -> Result<Vec<(DocumentMetadata, Option<String>)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT metadata_json, sha256 FROM documents WHERE case_number = ?1
                 ORDER BY instrument_number",
                params![entity_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let json: String = row.get(0).map_err(db_err)?;
            let sha: Option<String> = row.get::<String>(1).ok();
            results.push((serde_json::from_str(&json).map_err(json_err)?, sha));
        }
        Ok(results)
    }

    /// Upsert extraction output for a document.
    pub async fn upsert_extracted(&self, doc: &ExtractedDocument) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(doc).map_err(json_err)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO extracted_documents (document_id, case_number, doc_type, extract_json, extracted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(case_number, document_id) DO UPDATE SET
                   doc_type = excluded.doc_type,
                   extract_json = excluded.extract_json,
                   extracted_at = excluded.extracted_at",
                params![
                    doc.document_id.as_str(),
                    doc.entity_id.as_str(),
                    doc.doc_type.as_str(),
                    json.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Upsert the validated judgment for an entity.
    pub async fn upsert_judgment(&self, judgment: &JudgmentRecord) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(judgment).map_err(json_err)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO judgments (case_number, document_id, amount, judgment_json, validated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(case_number) DO UPDATE SET
                   document_id = excluded.document_id,
                   amount = excluded.amount,
                   judgment_json = excluded.judgment_json,
                   validated_at = excluded.validated_at",
                params![
                    judgment.entity_id.as_str(),
                    judgment.document_id.as_str(),
                    judgment.amount,
                    json.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record the phase-3 outcome: a built chain, or a gate skip with reason.
    pub async fn upsert_legal_analysis(
        &self,
        entity_id: &str,
        chain: Option<&TitleChainResult>,
        skip_reason: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let outcome = if chain.is_some() { "analyzed" } else { "skipped" };
        let chain_json = chain
            .map(serde_json::to_string)
            .transpose()
            .map_err(json_err)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO legal_analysis (case_number, outcome, reason, chain_json, analyzed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(case_number) DO UPDATE SET
                   outcome = excluded.outcome,
                   reason = excluded.reason,
                   chain_json = excluded.chain_json,
                   analyzed_at = excluded.analyzed_at",
                params![entity_id, outcome, skip_reason, chain_json, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get the phase-3 outcome for an entity.
    pub async fn get_legal_analysis(&self, entity_id: &str) -> Result<Option<LegalAnalysisRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT case_number, outcome, reason, chain_json, analyzed_at
                 FROM legal_analysis WHERE case_number = ?1",
                params![entity_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let chain = match row.get::<String>(3).ok() {
                    Some(json) => Some(serde_json::from_str(&json).map_err(json_err)?),
                    None => None,
                };
                Ok(Some(LegalAnalysisRow {
                    entity_id: row.get(0).map_err(db_err)?,
                    outcome: row.get(1).map_err(db_err)?,
                    reason: row.get::<String>(2).ok(),
                    chain,
                    analyzed_at: parse_timestamp(&row.get::<String>(4).map_err(db_err)?)?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Storage(format!("invalid date: {e}")))
}

/// Convert six columns starting at `base` to a [`PipelineState`].
fn row_to_state(row: &libsql::Row, base: i32) -> Result<PipelineState> {
    let status: String = row.get(base + 1).map_err(db_err)?;
    let error_step = match row.get::<i64>(base + 2).ok() {
        Some(code) => Some(PipelineStep::from_code(code)?),
        None => None,
    };
    let retry_count: i64 = row.get(base + 3).map_err(db_err)?;
    Ok(PipelineState {
        entity_id: row.get(base).map_err(db_err)?,
        status: PipelineStatus::parse(&status)?,
        error_step,
        retry_count: retry_count.max(0) as u32,
        last_error: row.get::<String>(base + 4).ok(),
        updated_at: parse_timestamp(&row.get::<String>(base + 5).map_err(db_err)?)?,
    })
}

/// Convert six columns starting at `base` to an [`Entity`].
fn row_to_entity(row: &libsql::Row, base: i32) -> Result<Entity> {
    let auction_date: String = row.get(base + 3).map_err(db_err)?;
    Ok(Entity {
        case_number: row.get(base).map_err(db_err)?,
        folio: row.get::<String>(base + 1).ok(),
        address: row.get(base + 2).map_err(db_err)?,
        auction_date: auction_date
            .parse::<NaiveDate>()
            .map_err(|e| PipelineError::Storage(format!("invalid auction date: {e}")))?,
        judgment_amount: row.get::<f64>(base + 4).ok(),
        plaintiff: row.get::<String>(base + 5).ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lienflow_shared::{
        DocumentType, Encumbrance, EncumbranceLedger, PipelineError, SourceData, SourceKind,
        TaxRecord,
    };
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("lf_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn entity(case: &str) -> Entity {
        Entity {
            case_number: case.into(),
            folio: Some("1234560000".into()),
            address: "100 Bayshore Blvd".into(),
            auction_date: NaiveDate::from_ymd_opt(2024, 7, 15).unwrap(),
            judgment_amount: Some(180_500.25),
            plaintiff: Some("First National Bank".into()),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("lf_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn seed_creates_pending_status_once() {
        let storage = test_storage().await;
        let e = entity("2024-CA-000001");

        let state = storage.seed_entity(&e).await.expect("seed");
        assert_eq!(state.status, PipelineStatus::Pending);
        assert_eq!(state.retry_count, 0);

        let stored = storage.get_entity(&e.case_number).await.unwrap().unwrap();
        assert_eq!(stored, e);

        // Re-seeding keeps the existing status.
        let processing = state.begin().unwrap().complete().unwrap();
        storage.upsert_status(&processing).await.unwrap();
        let again = storage.seed_entity(&e).await.expect("re-seed");
        assert_eq!(again.status, PipelineStatus::Completed);
    }

    #[tokio::test]
    async fn status_roundtrip_and_counts() {
        let storage = test_storage().await;
        let state = storage.seed_entity(&entity("c-1")).await.unwrap();
        storage.seed_entity(&entity("c-2")).await.unwrap();

        let failed = state
            .begin()
            .unwrap()
            .fail(PipelineStep::FloodLookup, "HTTP 502")
            .unwrap();
        storage.upsert_status(&failed).await.expect("upsert");

        let found = storage.get_status("c-1").await.unwrap().unwrap();
        assert_eq!(found.status, PipelineStatus::Failed);
        assert_eq!(found.error_step, Some(PipelineStep::FloodLookup));
        assert_eq!(found.retry_count, 1);
        assert_eq!(found.last_error.as_deref(), Some("HTTP 502"));

        let counts = storage.status_counts().await.unwrap();
        assert_eq!(counts.get("failed"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&1));

        let failed_rows = storage.list_status(Some(PipelineStatus::Failed)).await.unwrap();
        assert_eq!(failed_rows.len(), 1);
    }

    #[tokio::test]
    async fn schema_rejects_error_fields_outside_failed() {
        let storage = test_storage().await;
        let mut state = storage.seed_entity(&entity("c-1")).await.unwrap();
        state.error_step = Some(PipelineStep::TaxLookup);
        state.last_error = Some("boom".into());

        let result = storage.upsert_status(&state).await;
        assert!(matches!(result, Err(PipelineError::Storage(_))));
    }

    #[tokio::test]
    async fn unreadable_row_fails_the_listing() {
        let storage = test_storage().await;
        for case in ["a-1", "a-2"] {
            let mut state = storage
                .seed_entity(&entity(case))
                .await
                .unwrap()
                .begin()
                .unwrap()
                .fail(PipelineStep::TaxLookup, "503")
                .unwrap();
            state.retry_count = 3;
            storage.upsert_status(&state).await.unwrap();
        }
        storage
            .conn
            .execute(
                "UPDATE pipeline_status SET updated_at = 'yesterday' WHERE case_number = 'a-2'",
                params![],
            )
            .await
            .unwrap();

        assert!(storage.list_status(None).await.is_err());
        let scope = RecoveryScope::from_policy(&RetryPolicy::default());
        assert!(storage.recovery_audit(&scope).await.is_err());
    }

    #[tokio::test]
    async fn recovery_is_scoped_to_exhausted_non_critical_rows() {
        let storage = test_storage().await;
        let policy = RetryPolicy::default();
        let scope = RecoveryScope::from_policy(&policy);

        // One exhausted failed row per step code.
        for step in PipelineStep::ALL {
            let case = format!("step-{}", step.code());
            let mut state = storage
                .seed_entity(&entity(&case))
                .await
                .unwrap()
                .begin()
                .unwrap()
                .fail(step, "boom")
                .unwrap();
            state.retry_count = 3;
            storage.upsert_status(&state).await.unwrap();
        }
        // A non-critical failure that has not exhausted its retries.
        let mut young = storage
            .seed_entity(&entity("young"))
            .await
            .unwrap()
            .begin()
            .unwrap()
            .fail(PipelineStep::TaxLookup, "503")
            .unwrap();
        young.retry_count = 2;
        storage.upsert_status(&young).await.unwrap();
        // A completed row.
        let done = storage
            .seed_entity(&entity("done"))
            .await
            .unwrap()
            .begin()
            .unwrap()
            .complete()
            .unwrap();
        storage.upsert_status(&done).await.unwrap();

        // Audit
        let audit = storage.recovery_audit(&scope).await.unwrap();
        let audited: Vec<_> = audit.iter().map(|s| s.entity_id.clone()).collect();
        assert_eq!(audit.len(), 8);
        assert!(audit.iter().all(|s| policy.is_recoverable(s)));

        // Apply
        let updated = storage.apply_recovery(&scope).await.unwrap();
        assert_eq!(updated, 8);

        // Verify
        for state in storage.verify_recovery(&audited).await.unwrap() {
            assert_eq!(state.status, PipelineStatus::Processing);
            assert_eq!(state.retry_count, 0);
            assert!(state.error_step.is_none());
            assert!(state.last_error.is_none());
        }
        for step in [
            PipelineStep::DocumentSearch,
            PipelineStep::JudgmentValidation,
            PipelineStep::ChainBuild,
        ] {
            let state = storage
                .get_status(&format!("step-{}", step.code()))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(state.status, PipelineStatus::Failed);
            assert_eq!(state.retry_count, 3);
            assert_eq!(state.error_step, Some(step));
        }
        let young_after = storage.get_status("young").await.unwrap().unwrap();
        assert_eq!(young_after, young);

        // Nothing left in scope.
        assert!(storage.recovery_audit(&scope).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resumable_lists_pending_and_processing() {
        let storage = test_storage().await;
        storage.seed_entity(&entity("a")).await.unwrap();
        let b = storage.seed_entity(&entity("b")).await.unwrap();
        storage.upsert_status(&b.begin().unwrap()).await.unwrap();
        let c = storage.seed_entity(&entity("c")).await.unwrap();
        storage
            .upsert_status(&c.begin().unwrap().complete().unwrap())
            .await
            .unwrap();

        let page = storage.list_resumable(None, 10).await.unwrap();
        let ids: Vec<_> = page.iter().map(|(e, _)| e.case_number.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(page[1].1.status, PipelineStatus::Processing);

        let second = storage.list_resumable(Some("a"), 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0.case_number, "b");
    }

    #[tokio::test]
    async fn enrichment_results_append() {
        let storage = test_storage().await;
        storage.seed_entity(&entity("c-1")).await.unwrap();

        let ok = SourceResult::success(SourceData::Tax(TaxRecord {
            just_value: Some(310_000.0),
            ..Default::default()
        }));
        let failed = SourceResult::failure(
            SourceKind::Permit,
            &PipelineError::timeout("permit", std::time::Duration::from_secs(30)),
        );
        storage.insert_enrichment("c-1", &ok).await.unwrap();
        storage.insert_enrichment("c-1", &failed).await.unwrap();
        storage.insert_enrichment("c-1", &ok).await.unwrap();

        let results = storage.list_enrichment("c-1").await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0], ok);
        assert_eq!(results[1].source, SourceKind::Permit);
        assert!(!results[1].is_success());
    }

    #[tokio::test]
    async fn legal_intermediates() {
        let storage = test_storage().await;
        storage.seed_entity(&entity("c-1")).await.unwrap();

        let doc = DocumentMetadata {
            instrument_number: "2019-0001".into(),
            entity_id: "c-1".into(),
            doc_type: DocumentType::Mortgage,
            recorded_date: NaiveDate::from_ymd_opt(2019, 3, 1),
            parties: vec!["DOE JOHN".into()],
            download_url: None,
        };
        storage.upsert_document(&doc).await.unwrap();
        storage
            .record_download(&DownloadedDocument {
                document_id: "2019-0001".into(),
                entity_id: "c-1".into(),
                doc_type: DocumentType::Mortgage,
                path: "/tmp/2019-0001.pdf".into(),
                sha256: "abc".into(),
                size_bytes: 42,
            })
            .await
            .unwrap();
        let docs = storage.list_documents("c-1").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].0, doc);
        assert_eq!(docs[0].1.as_deref(), Some("abc"));

        let mut ledger = EncumbranceLedger::default();
        ledger.insert(Encumbrance {
            instrument_number: "2019-0001".into(),
            doc_type: DocumentType::Mortgage,
            amount: Some(200_000.0),
            recorded_date: None,
            holder: None,
            satisfied_by: None,
            assignments: vec![],
        });
        let chain = TitleChainResult {
            entity_id: "c-1".into(),
            ledger,
            owner_of_record: Some("DOE JOHN".into()),
            warnings: vec![],
        };
        storage
            .upsert_legal_analysis("c-1", Some(&chain), None)
            .await
            .unwrap();
        let row = storage.get_legal_analysis("c-1").await.unwrap().unwrap();
        assert_eq!(row.outcome, "analyzed");
        assert_eq!(row.chain, Some(chain));

        storage
            .upsert_legal_analysis("c-1", None, Some("equity below threshold"))
            .await
            .unwrap();
        let row = storage.get_legal_analysis("c-1").await.unwrap().unwrap();
        assert_eq!(row.outcome, "skipped");
        assert_eq!(row.reason.as_deref(), Some("equity below threshold"));
        assert!(row.chain.is_none());
    }

    #[tokio::test]
    async fn record_download_requires_document() {
        let storage = test_storage().await;
        let result = storage
            .record_download(&DownloadedDocument {
                document_id: "missing".into(),
                entity_id: "c-1".into(),
                doc_type: DocumentType::Deed,
                path: "/tmp/x".into(),
                sha256: "x".into(),
                size_bytes: 1,
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("lf_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.seed_entity(&entity("c-1")).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.seed_entity(&entity("c-2")).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
        assert!(ro.get_status("c-1").await.unwrap().is_some());
    }
}
