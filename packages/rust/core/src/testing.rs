//! In-process fakes for the collaborator traits and the write target.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Semaphore;

use lienflow_shared::{
    AppConfig, DateRange, DocumentMetadata, DocumentType, DownloadedDocument, EnrichmentResultSet,
    Entity, ExtractedDocument, FloodRecord, Identity, JudgmentRecord, MarketRecord,
    PermitRecord, PipelineError, PipelineState, PipelineStatus, Result, SourceData, SourceKind,
    SourceResult, TaxRecord, TitleChainResult, VerifiedIdentity,
};

use crate::chain::LedgerChainBuilder;
use crate::collaborators::{
    ChainBuilder, DocumentIndex, DocumentStore, EnrichmentSource, ExtractionService, SeedPage,
    SeedSource, Verifier,
};
use crate::governor::ConcurrencyGovernor;
use crate::write_queue::{Mutation, WriteAck, WriteRequest, WriteTarget};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

pub const JUDGMENT_AMOUNT: f64 = 180_000.0;

pub fn entity(case_number: &str, folio: &str) -> Entity {
    Entity {
        case_number: case_number.into(),
        folio: Some(folio.into()),
        address: "100 Bayshore Blvd".into(),
        auction_date: NaiveDate::from_ymd_opt(2024, 7, 15).unwrap(),
        judgment_amount: Some(JUDGMENT_AMOUNT),
        plaintiff: Some("FIRST NATIONAL BANK".into()),
    }
}

pub fn verified(folio: &str) -> VerifiedIdentity {
    VerifiedIdentity {
        folio: folio.into(),
        address: "100 BAYSHORE BLVD".into(),
        owner_names: vec!["DOE JOHN".into()],
        legal_description: Some("LOT 1 BLOCK 2 BAYSHORE ESTATES".into()),
    }
}

/// Governor with every limiter the pipeline uses set to `n`.
pub fn governor(n: usize) -> ConcurrencyGovernor {
    let mut config = AppConfig::default();
    config.orchestrator.global_concurrency = n;
    for limiter in config.limiters.values_mut() {
        limiter.concurrency = n;
    }
    ConcurrencyGovernor::from_config(&config).unwrap()
}

/// A verified, fully enriched result set with the given market value.
pub fn enriched(entity: &Entity, market_value: f64) -> EnrichmentResultSet {
    let identity = Identity::from_verified(&verified(entity.folio.as_deref().unwrap_or("F")));
    EnrichmentResultSet {
        entity_id: entity.case_number.clone(),
        verifier: SourceResult::success(SourceData::Verifier(verified(
            identity.folio.as_deref().unwrap_or("F"),
        ))),
        identity,
        results: vec![SourceResult::success(SourceData::Market(MarketRecord {
            estimated_value: Some(market_value),
            ..Default::default()
        }))],
    }
}

// ---------------------------------------------------------------------------
// MemoryTarget
// ---------------------------------------------------------------------------

type Rule = Box<dyn Fn(&WriteRequest) -> bool + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    entities: HashMap<String, Entity>,
    statuses: HashMap<String, PipelineState>,
    history: HashMap<String, Vec<PipelineState>>,
    enrichment: HashMap<String, Vec<SourceResult>>,
    documents: HashMap<String, Vec<DocumentMetadata>>,
    judgments: HashMap<String, JudgmentRecord>,
    legal: HashMap<String, (Option<TitleChainResult>, Option<String>)>,
    order: Vec<String>,
}

/// Write target backed by maps. Tracks how many applies overlap.
#[derive(Default)]
pub struct MemoryTarget {
    state: Mutex<MemoryState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: AtomicUsize,
    fail_next: AtomicU32,
    reject: Mutex<Option<Rule>>,
    apply_delay: Duration,
    gate: Option<Semaphore>,
}

impl MemoryTarget {
    pub fn with_apply_delay(delay: Duration) -> Self {
        Self {
            apply_delay: delay,
            ..Default::default()
        }
    }

    /// Every apply parks until [`MemoryTarget::open_gate`].
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1_000);
        }
    }

    /// Make the next `n` applies fail with a retryable storage error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Fail every apply matching `rule` with a retryable storage error.
    pub fn reject_when(&self, rule: impl Fn(&WriteRequest) -> bool + Send + Sync + 'static) {
        *self.reject.lock().unwrap() = Some(Box::new(rule));
    }

    /// Preload an entity with an existing status row.
    pub fn insert(&self, entity: &Entity, state: PipelineState) {
        let mut s = self.state.lock().unwrap();
        s.entities.insert(entity.case_number.clone(), entity.clone());
        s.statuses.insert(entity.case_number.clone(), state);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn applied_order(&self) -> Vec<String> {
        self.state.lock().unwrap().order.clone()
    }

    pub fn status(&self, id: &str) -> Option<PipelineState> {
        self.state.lock().unwrap().statuses.get(id).cloned()
    }

    /// Every status written for `id`, oldest first.
    pub fn history(&self, id: &str) -> Vec<PipelineStatus> {
        self.transitions(id).into_iter().map(|s| s.status).collect()
    }

    /// Every status row written for `id`, oldest first.
    pub fn transitions(&self, id: &str) -> Vec<PipelineState> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn enrichment(&self, id: &str) -> Vec<SourceResult> {
        self.state
            .lock()
            .unwrap()
            .enrichment
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn documents(&self, id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .documents
            .get(id)
            .map_or(0, Vec::len)
    }

    pub fn judgment(&self, id: &str) -> Option<JudgmentRecord> {
        self.state.lock().unwrap().judgments.get(id).cloned()
    }

    pub fn legal_analysis(&self, id: &str) -> Option<(Option<TitleChainResult>, Option<String>)> {
        self.state.lock().unwrap().legal.get(id).cloned()
    }

    fn apply_now(&self, request: &WriteRequest) -> Result<WriteAck> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PipelineError::Storage("database is locked".into()));
        }
        if self
            .reject
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|rule| rule(request))
        {
            return Err(PipelineError::Storage("disk I/O error".into()));
        }

        let mut s = self.state.lock().unwrap();
        let id = request.entity_id.clone();
        s.order.push(id.clone());
        match &request.mutation {
            Mutation::SeedEntity(entity) => {
                s.entities.entry(id.clone()).or_insert_with(|| entity.clone());
                let state = s
                    .statuses
                    .entry(id)
                    .or_insert_with(|| PipelineState::pending(entity.case_number.clone()))
                    .clone();
                Ok(WriteAck::Status(state))
            }
            Mutation::Status(state) => {
                if !state.is_consistent() {
                    return Err(PipelineError::validation("inconsistent status row"));
                }
                s.history.entry(id.clone()).or_default().push(state.clone());
                s.statuses.insert(id, state.clone());
                Ok(WriteAck::Applied)
            }
            Mutation::Enrichment(result) => {
                s.enrichment.entry(id).or_default().push(result.clone());
                Ok(WriteAck::Applied)
            }
            Mutation::Document(doc) => {
                s.documents.entry(id).or_default().push(doc.clone());
                Ok(WriteAck::Applied)
            }
            Mutation::Download(_) | Mutation::Extracted(_) => Ok(WriteAck::Applied),
            Mutation::Judgment(judgment) => {
                s.judgments.insert(id, judgment.clone());
                Ok(WriteAck::Applied)
            }
            Mutation::LegalAnalysis { chain, skip_reason } => {
                s.legal.insert(id, (chain.clone(), skip_reason.clone()));
                Ok(WriteAck::Applied)
            }
            Mutation::Recover(scope) => {
                let mut touched = 0;
                for state in s.statuses.values_mut() {
                    let in_scope = matches!(
                        state.status,
                        PipelineStatus::Processing | PipelineStatus::Failed
                    ) && state.retry_count >= scope.max_retries
                        && state.error_step.is_some_and(|st| scope.steps.contains(&st));
                    if in_scope {
                        state.status = PipelineStatus::Processing;
                        state.retry_count = 0;
                        state.error_step = None;
                        state.last_error = None;
                        touched += 1;
                    }
                }
                Ok(WriteAck::Recovered(touched))
            }
        }
    }
}

#[async_trait]
impl WriteTarget for MemoryTarget {
    async fn apply(&self, request: &WriteRequest) -> Result<WriteAck> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        if !self.apply_delay.is_zero() {
            tokio::time::sleep(self.apply_delay).await;
        }
        let result = self.apply_now(request);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// Activity tracking shared by the fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Activity {
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Activity {
    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Phase-2 fakes
// ---------------------------------------------------------------------------

pub struct FakeVerifier {
    identity: Option<VerifiedIdentity>,
    delay: Duration,
    activity: Activity,
}

impl FakeVerifier {
    pub fn ok(identity: VerifiedIdentity) -> Self {
        Self {
            identity: Some(identity),
            delay: Duration::ZERO,
            activity: Activity::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            identity: None,
            delay: Duration::ZERO,
            activity: Activity::default(),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.activity.calls()
    }
}

#[async_trait]
impl Verifier for FakeVerifier {
    async fn verify(&self, _entity: &Entity) -> Result<VerifiedIdentity> {
        self.activity.enter();
        tokio::time::sleep(self.delay).await;
        self.activity.exit();
        self.identity
            .clone()
            .ok_or_else(|| PipelineError::Transient("appraiser returned HTTP 503".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Ok,
    Fail,
    Panic,
}

pub struct FakeSource {
    kind: SourceKind,
    behavior: Behavior,
    fail_first: AtomicU32,
    delay: Duration,
    seen: Mutex<Vec<Option<String>>>,
    activity: Activity,
}

impl FakeSource {
    fn new(kind: SourceKind, behavior: Behavior) -> Self {
        Self {
            kind,
            behavior,
            fail_first: AtomicU32::new(0),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
            activity: Activity::default(),
        }
    }

    pub fn ok(kind: SourceKind) -> Self {
        Self::new(kind, Behavior::Ok)
    }

    pub fn failing(kind: SourceKind) -> Self {
        Self::new(kind, Behavior::Fail)
    }

    pub fn panicking(kind: SourceKind) -> Self {
        Self::new(kind, Behavior::Panic)
    }

    /// Fail the first `n` calls, then succeed.
    pub fn flaky(kind: SourceKind, n: u32) -> Self {
        let source = Self::new(kind, Behavior::Ok);
        source.fail_first.store(n, Ordering::SeqCst);
        source
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.activity.calls()
    }

    pub fn peak(&self) -> usize {
        self.activity.peak()
    }

    pub fn seen_folios(&self) -> Vec<Option<String>> {
        self.seen.lock().unwrap().clone()
    }

    fn data(&self, identity: &Identity) -> SourceData {
        match self.kind {
            SourceKind::Verifier => {
                SourceData::Verifier(verified(identity.folio.as_deref().unwrap_or("F")))
            }
            SourceKind::Tax => SourceData::Tax(TaxRecord {
                owner_name: Some("DOE JOHN".into()),
                just_value: Some(240_000.0),
                legal_description: Some("LOT 1 BLOCK 2 BAYSHORE ESTATES".into()),
                ..Default::default()
            }),
            SourceKind::Permit => SourceData::Permit(PermitRecord::default()),
            SourceKind::Market => SourceData::Market(MarketRecord {
                estimated_value: Some(250_000.0),
                ..Default::default()
            }),
            SourceKind::Flood => SourceData::Flood(FloodRecord {
                zone: Some("X".into()),
                special_hazard_area: false,
            }),
        }
    }
}

#[async_trait]
impl EnrichmentSource for FakeSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, identity: &Identity) -> Result<SourceData> {
        self.activity.enter();
        self.seen.lock().unwrap().push(identity.folio.clone());
        tokio::time::sleep(self.delay).await;
        self.activity.exit();

        let flaky = self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        match self.behavior {
            Behavior::Panic => panic!("{} source exploded", self.kind),
            Behavior::Fail => Err(PipelineError::Transient(format!("{} returned HTTP 502", self.kind))),
            Behavior::Ok if flaky => Err(PipelineError::Transient(format!("{} returned HTTP 503", self.kind))),
            Behavior::Ok => Ok(self.data(identity)),
        }
    }
}

// ---------------------------------------------------------------------------
// Phase-3 fakes
// ---------------------------------------------------------------------------

/// Returns a judgment, a mortgage, and a deed for every entity.
#[derive(Default)]
pub struct FakeDocumentIndex {
    activity: Activity,
}

impl FakeDocumentIndex {
    pub fn calls(&self) -> usize {
        self.activity.calls()
    }
}

#[async_trait]
impl DocumentIndex for FakeDocumentIndex {
    async fn search(
        &self,
        entity_id: &str,
        _owner_names: &[String],
        _legal_description: Option<&str>,
    ) -> Result<Vec<DocumentMetadata>> {
        self.activity.enter();
        self.activity.exit();
        Ok([
            ("J", DocumentType::Judgment),
            ("M", DocumentType::Mortgage),
            ("D", DocumentType::Deed),
        ]
        .into_iter()
        .map(|(prefix, doc_type)| DocumentMetadata {
            instrument_number: format!("{prefix}-{entity_id}"),
            entity_id: entity_id.into(),
            doc_type,
            recorded_date: None,
            parties: vec![],
            download_url: None,
        })
        .collect())
    }
}

#[derive(Default)]
pub struct FakeDocumentStore {
    activity: Activity,
}

impl FakeDocumentStore {
    pub fn calls(&self) -> usize {
        self.activity.calls()
    }
}

#[async_trait]
impl DocumentStore for FakeDocumentStore {
    async fn download(&self, doc: &DocumentMetadata) -> Result<DownloadedDocument> {
        self.activity.enter();
        self.activity.exit();
        Ok(DownloadedDocument {
            document_id: doc.instrument_number.clone(),
            entity_id: doc.entity_id.clone(),
            doc_type: doc.doc_type,
            path: std::env::temp_dir().join(format!("{}.pdf", doc.instrument_number)),
            sha256: "0".repeat(64),
            size_bytes: 0,
        })
    }
}

pub struct FakeExtraction {
    capacity: usize,
    judgment_case: Option<String>,
    batches: Mutex<Vec<usize>>,
}

impl FakeExtraction {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            judgment_case: None,
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Report this case number on judgments instead of the entity's own.
    pub fn judgment_case(mut self, case_number: &str) -> Self {
        self.judgment_case = Some(case_number.into());
        self
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtractionService for FakeExtraction {
    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn extract_batch(&self, docs: &[DownloadedDocument]) -> Result<Vec<ExtractedDocument>> {
        self.batches.lock().unwrap().push(docs.len());
        Ok(docs
            .iter()
            .map(|d| {
                let (case_number, amount, parties) = match d.doc_type {
                    DocumentType::Judgment => (
                        Some(
                            self.judgment_case
                                .clone()
                                .unwrap_or_else(|| d.entity_id.clone()),
                        ),
                        Some(JUDGMENT_AMOUNT),
                        vec!["FIRST NATIONAL BANK".to_string()],
                    ),
                    DocumentType::Mortgage => {
                        (None, Some(150_000.0), vec!["FIRST NATIONAL BANK".to_string()])
                    }
                    _ => (None, None, vec!["SELLER".to_string(), "DOE JOHN".to_string()]),
                };
                ExtractedDocument {
                    document_id: d.document_id.clone(),
                    entity_id: d.entity_id.clone(),
                    doc_type: d.doc_type,
                    case_number,
                    amount,
                    parties,
                    recorded_date: None,
                    references: vec![],
                }
            })
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingChainBuilder {
    activity: Activity,
}

impl RecordingChainBuilder {
    pub fn calls(&self) -> usize {
        self.activity.calls()
    }
}

#[async_trait]
impl ChainBuilder for RecordingChainBuilder {
    async fn analyze(&self, entity_id: &str, docs: &[ExtractedDocument]) -> Result<TitleChainResult> {
        self.activity.enter();
        self.activity.exit();
        LedgerChainBuilder.analyze(entity_id, docs).await
    }
}

// ---------------------------------------------------------------------------
// Seeds
// ---------------------------------------------------------------------------

/// Serves a fixed list, `limit` at a time, using the offset as cursor.
pub struct FakeSeedSource {
    entities: Vec<Entity>,
    fetches: AtomicUsize,
    fail_from: Option<usize>,
}

impl FakeSeedSource {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self {
            entities,
            fetches: AtomicUsize::new(0),
            fail_from: None,
        }
    }

    /// Serve `pages` pages, then fail every fetch.
    pub fn failing_after(mut self, pages: usize) -> Self {
        self.fail_from = Some(pages);
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SeedSource for FakeSeedSource {
    async fn fetch(
        &self,
        range: &DateRange,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<SeedPage> {
        let fetched = self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_from.is_some_and(|n| fetched >= n) {
            return Err(PipelineError::Transient("seed feed unavailable".into()));
        }
        let offset: usize = cursor.as_deref().map_or(Ok(0), str::parse).map_err(|_| {
            PipelineError::validation("bad cursor")
        })?;
        let offset = offset.min(self.entities.len());
        let end = (offset + limit).min(self.entities.len());
        let entities = self.entities[offset..end]
            .iter()
            .filter(|e| range.contains(e.auction_date))
            .cloned()
            .collect();
        Ok(SeedPage {
            entities,
            next_cursor: (end < self.entities.len()).then(|| end.to_string()),
        })
    }
}
