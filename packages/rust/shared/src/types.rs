//! Core domain types: seed entities, enrichment results, and legal-analysis
//! intermediates.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::status::PipelineStep;

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9]").expect("valid regex"));

/// Canonical form used to compare case numbers and folios across sources:
/// alphanumerics only, upper-case.
pub fn normalize_identifier(raw: &str) -> String {
    NON_ALNUM.replace_all(raw, "").to_uppercase()
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// One seed record: a property scheduled for foreclosure auction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Court case number; the entity's unique identifier.
    pub case_number: String,
    /// Parcel folio as listed on the auction, if any.
    #[serde(default)]
    pub folio: Option<String>,
    /// Street address as listed on the auction.
    pub address: String,
    /// Scheduled auction date.
    pub auction_date: NaiveDate,
    /// Final judgment amount from the auction listing.
    #[serde(default)]
    pub judgment_amount: Option<f64>,
    /// Foreclosing plaintiff from the auction listing.
    #[serde(default)]
    pub plaintiff: Option<String>,
}

impl Entity {
    /// Entity identifier used as the key in every collection.
    pub fn id(&self) -> &str {
        &self.case_number
    }

    /// Reject seeds missing required identity fields.
    pub fn validate(&self) -> Result<()> {
        if self.case_number.trim().is_empty() {
            return Err(PipelineError::validation("seed entity has an empty case number"));
        }
        if self.address.trim().is_empty() {
            return Err(PipelineError::validation(format!(
                "seed entity {} has an empty address",
                self.case_number
            )));
        }
        Ok(())
    }
}

/// Inclusive auction-date window for seed fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(PipelineError::validation(format!(
                "date range end {end} precedes start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The working identity handed to enrichment sources.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Identity {
    pub folio: Option<String>,
    pub address: String,
    #[serde(default)]
    pub owner_names: Vec<String>,
    #[serde(default)]
    pub legal_description: Option<String>,
    /// Whether the verifier confirmed this identity.
    #[serde(default)]
    pub verified: bool,
}

impl Identity {
    /// Identity exactly as seeded.
    pub fn from_seed(entity: &Entity) -> Self {
        Self {
            folio: entity.folio.clone(),
            address: entity.address.clone(),
            owner_names: Vec::new(),
            legal_description: None,
            verified: false,
        }
    }

    /// Identity after a successful verification.
    pub fn from_verified(verified: &VerifiedIdentity) -> Self {
        Self {
            folio: Some(verified.folio.clone()),
            address: verified.address.clone(),
            owner_names: verified.owner_names.clone(),
            legal_description: verified.legal_description.clone(),
            verified: true,
        }
    }

    /// Folio, or a validation error for sources that key on it.
    pub fn require_folio(&self) -> Result<&str> {
        self.folio
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| PipelineError::validation("identity has no folio"))
    }
}

// ---------------------------------------------------------------------------
// Enrichment sources
// ---------------------------------------------------------------------------

/// Independent external data sources queried in phase 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Verifier,
    Tax,
    Permit,
    Market,
    Flood,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        Self::Verifier,
        Self::Tax,
        Self::Permit,
        Self::Market,
        Self::Flood,
    ];

    /// Limiter / storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verifier => "verifier",
            Self::Tax => "tax",
            Self::Permit => "permit",
            Self::Market => "market",
            Self::Flood => "flood",
        }
    }

    /// Step recorded when this source's failure fails the entity.
    pub fn step(&self) -> PipelineStep {
        match self {
            Self::Verifier => PipelineStep::Verify,
            Self::Tax => PipelineStep::TaxLookup,
            Self::Permit => PipelineStep::PermitLookup,
            Self::Market => PipelineStep::MarketLookup,
            Self::Flood => PipelineStep::FloodLookup,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| PipelineError::validation(format!("unknown source: {s}")))
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity as confirmed by the property appraiser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub folio: String,
    pub address: String,
    #[serde(default)]
    pub owner_names: Vec<String>,
    #[serde(default)]
    pub legal_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaxRecord {
    #[serde(default)]
    pub owner_name: Option<String>,
    #[serde(default)]
    pub just_value: Option<f64>,
    #[serde(default)]
    pub assessed_value: Option<f64>,
    #[serde(default)]
    pub amount_due: Option<f64>,
    #[serde(default)]
    pub delinquent: bool,
    #[serde(default)]
    pub legal_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PermitRecord {
    #[serde(default)]
    pub open_permits: u32,
    #[serde(default)]
    pub code_violations: u32,
    #[serde(default)]
    pub permits: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketRecord {
    #[serde(default)]
    pub estimated_value: Option<f64>,
    #[serde(default)]
    pub rent_estimate: Option<f64>,
    #[serde(default)]
    pub last_sale_price: Option<f64>,
    #[serde(default)]
    pub last_sale_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FloodRecord {
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub special_hazard_area: bool,
}

/// Typed payload, one variant per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "data", rename_all = "snake_case")]
pub enum SourceData {
    Verifier(VerifiedIdentity),
    Tax(TaxRecord),
    Permit(PermitRecord),
    Market(MarketRecord),
    Flood(FloodRecord),
}

impl SourceData {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Verifier(_) => SourceKind::Verifier,
            Self::Tax(_) => SourceKind::Tax,
            Self::Permit(_) => SourceKind::Permit,
            Self::Market(_) => SourceKind::Market,
            Self::Flood(_) => SourceKind::Flood,
        }
    }
}

/// Success-with-data or failure-with-reason for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SourceOutcome {
    Success { data: SourceData },
    Failure { reason: String, timed_out: bool },
}

/// One slot in the aggregate result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResult {
    pub source: SourceKind,
    pub outcome: SourceOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl SourceResult {
    pub fn success(data: SourceData) -> Self {
        Self {
            source: data.kind(),
            outcome: SourceOutcome::Success { data },
            recorded_at: Utc::now(),
        }
    }

    pub fn failure(source: SourceKind, error: &PipelineError) -> Self {
        Self {
            source,
            outcome: SourceOutcome::Failure {
                reason: error.to_string(),
                timed_out: error.is_timeout(),
            },
            recorded_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, SourceOutcome::Success { .. })
    }

    pub fn data(&self) -> Option<&SourceData> {
        match &self.outcome {
            SourceOutcome::Success { data } => Some(data),
            SourceOutcome::Failure { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match &self.outcome {
            SourceOutcome::Failure { reason, .. } => Some(reason),
            SourceOutcome::Success { .. } => None,
        }
    }
}

/// Aggregated phase-2 results for one entity. No overall verdict is kept
/// here; callers classify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentResultSet {
    pub entity_id: String,
    /// Identity actually used for the fan-out calls.
    pub identity: Identity,
    pub verifier: SourceResult,
    /// Non-verifier sources, in configured order.
    pub results: Vec<SourceResult>,
}

impl EnrichmentResultSet {
    pub fn get(&self, kind: SourceKind) -> Option<&SourceResult> {
        if kind == SourceKind::Verifier {
            return Some(&self.verifier);
        }
        self.results.iter().find(|r| r.source == kind)
    }

    pub fn successes(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SourceResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    pub fn tax(&self) -> Option<&TaxRecord> {
        match self.get(SourceKind::Tax)?.data()? {
            SourceData::Tax(t) => Some(t),
            _ => None,
        }
    }

    pub fn market(&self) -> Option<&MarketRecord> {
        match self.get(SourceKind::Market)?.data()? {
            SourceData::Market(m) => Some(m),
            _ => None,
        }
    }

    /// Best available property value: market estimate, else tax just value.
    pub fn estimated_value(&self) -> Option<f64> {
        self.market()
            .and_then(|m| m.estimated_value)
            .or_else(|| self.tax().and_then(|t| t.just_value))
    }

    /// Owner names known from the identity or the tax roll, deduplicated.
    pub fn owner_names(&self) -> Vec<String> {
        let mut names = self.identity.owner_names.clone();
        if let Some(owner) = self.tax().and_then(|t| t.owner_name.clone()) {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&owner)) {
                names.push(owner);
            }
        }
        names
    }

    /// Legal description from the identity, else from the tax roll.
    pub fn legal_description(&self) -> Option<String> {
        self.identity
            .legal_description
            .clone()
            .or_else(|| self.tax().and_then(|t| t.legal_description.clone()))
    }
}

// ---------------------------------------------------------------------------
// Legal-analysis intermediates
// ---------------------------------------------------------------------------

/// Recorded instrument categories relevant to title analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Deed,
    Mortgage,
    Lien,
    Judgment,
    LisPendens,
    Satisfaction,
    Assignment,
    Other,
}

impl DocumentType {
    /// Instruments that create an encumbrance on title.
    pub fn is_encumbrance(&self) -> bool {
        matches!(
            self,
            Self::Mortgage | Self::Lien | Self::Judgment | Self::LisPendens
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deed => "deed",
            Self::Mortgage => "mortgage",
            Self::Lien => "lien",
            Self::Judgment => "judgment",
            Self::LisPendens => "lis_pendens",
            Self::Satisfaction => "satisfaction",
            Self::Assignment => "assignment",
            Self::Other => "other",
        }
    }
}

/// A document found by the official-records index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Index-assigned instrument number; the document's identifier.
    pub instrument_number: String,
    pub entity_id: String,
    pub doc_type: DocumentType,
    #[serde(default)]
    pub recorded_date: Option<NaiveDate>,
    #[serde(default)]
    pub parties: Vec<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

/// Handle to a downloaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedDocument {
    /// References [`DocumentMetadata::instrument_number`].
    pub document_id: String,
    pub entity_id: String,
    pub doc_type: DocumentType,
    pub path: std::path::PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Structured fields pulled out of a document by the extraction service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    /// References [`DocumentMetadata::instrument_number`].
    pub document_id: String,
    pub entity_id: String,
    pub doc_type: DocumentType,
    #[serde(default)]
    pub case_number: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub parties: Vec<String>,
    #[serde(default)]
    pub recorded_date: Option<NaiveDate>,
    /// Instrument numbers this document refers to (satisfied, assigned, ...).
    #[serde(default)]
    pub references: Vec<String>,
}

/// Validated final-judgment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentRecord {
    pub entity_id: String,
    /// References the judgment's [`ExtractedDocument::document_id`].
    pub document_id: String,
    pub case_number: String,
    pub amount: f64,
    #[serde(default)]
    pub plaintiff: Option<String>,
    #[serde(default)]
    pub judgment_date: Option<NaiveDate>,
}

/// One lien-like record on title. Cross-links are identifiers into the
/// owning [`EncumbranceLedger`], never owned values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encumbrance {
    pub instrument_number: String,
    pub doc_type: DocumentType,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub recorded_date: Option<NaiveDate>,
    #[serde(default)]
    pub holder: Option<String>,
    /// Instrument number of the satisfaction/release discharging this record.
    #[serde(default)]
    pub satisfied_by: Option<String>,
    /// Instrument numbers of assignments, oldest first.
    #[serde(default)]
    pub assignments: Vec<String>,
}

/// Arena of encumbrances keyed by instrument number.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EncumbranceLedger {
    records: BTreeMap<String, Encumbrance>,
}

impl EncumbranceLedger {
    pub fn insert(&mut self, record: Encumbrance) {
        self.records.insert(record.instrument_number.clone(), record);
    }

    pub fn get(&self, instrument_number: &str) -> Option<&Encumbrance> {
        self.records.get(instrument_number)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Encumbrance> {
        self.records.values()
    }

    /// Link a satisfaction to the encumbrance it discharges. Returns `false`
    /// when the target is not in the ledger.
    pub fn mark_satisfied(&mut self, target: &str, satisfaction: &str) -> bool {
        match self.records.get_mut(target) {
            Some(record) => {
                record.satisfied_by = Some(satisfaction.to_string());
                true
            }
            None => false,
        }
    }

    /// Record an assignment of the target encumbrance.
    pub fn add_assignment(&mut self, target: &str, assignment: &str) -> bool {
        match self.records.get_mut(target) {
            Some(record) => {
                record.assignments.push(assignment.to_string());
                true
            }
            None => false,
        }
    }

    /// Encumbrances with no recorded satisfaction.
    pub fn open(&self) -> impl Iterator<Item = &Encumbrance> {
        self.records.values().filter(|r| r.satisfied_by.is_none())
    }
}

/// Result of the chain-builder collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleChainResult {
    pub entity_id: String,
    pub ledger: EncumbranceLedger,
    #[serde(default)]
    pub owner_of_record: Option<String>,
    /// Cross-references that could not be resolved against the ledger.
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> Entity {
        Entity {
            case_number: "2024-CA-000123".into(),
            folio: Some("F1".into()),
            address: "1 Main St".into(),
            auction_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            judgment_amount: Some(150_000.0),
            plaintiff: Some("Bank".into()),
        }
    }

    #[test]
    fn normalize_strips_punctuation() {
        assert_eq!(normalize_identifier("2024-ca-000123 "), "2024CA000123");
        assert_eq!(normalize_identifier("12-3456.789"), "123456789");
    }

    #[test]
    fn entity_validation() {
        assert!(entity().validate().is_ok());
        let mut bad = entity();
        bad.case_number = "  ".into();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn date_range_bounds() {
        let d = |day| NaiveDate::from_ymd_opt(2024, 6, day).unwrap();
        let range = DateRange::new(d(1), d(7)).unwrap();
        assert!(range.contains(d(1)));
        assert!(range.contains(d(7)));
        assert!(!range.contains(d(8)));
        assert!(DateRange::new(d(7), d(1)).is_err());
    }

    #[test]
    fn verified_identity_replaces_seed() {
        let seed = Identity::from_seed(&entity());
        assert_eq!(seed.folio.as_deref(), Some("F1"));
        assert!(!seed.verified);

        let verified = Identity::from_verified(&VerifiedIdentity {
            folio: "F2".into(),
            address: "1 MAIN ST".into(),
            owner_names: vec!["DOE JOHN".into()],
            legal_description: Some("LOT 1 BLOCK 2".into()),
        });
        assert_eq!(verified.require_folio().unwrap(), "F2");
        assert!(verified.verified);
    }

    #[test]
    fn source_data_serializes_tagged() {
        let result = SourceResult::success(SourceData::Flood(FloodRecord {
            zone: Some("AE".into()),
            special_hazard_area: true,
        }));
        let json = serde_json::to_value(&result.outcome).unwrap();
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["data"]["source"], "flood");
        assert_eq!(json["data"]["data"]["zone"], "AE");
    }

    #[test]
    fn result_set_value_prefers_market() {
        let set = EnrichmentResultSet {
            entity_id: "c".into(),
            identity: Identity::default(),
            verifier: SourceResult::failure(
                SourceKind::Verifier,
                &PipelineError::Transient("down".into()),
            ),
            results: vec![
                SourceResult::success(SourceData::Tax(TaxRecord {
                    just_value: Some(200_000.0),
                    owner_name: Some("DOE JOHN".into()),
                    ..Default::default()
                })),
                SourceResult::success(SourceData::Market(MarketRecord {
                    estimated_value: Some(250_000.0),
                    ..Default::default()
                })),
            ],
        };
        assert_eq!(set.estimated_value(), Some(250_000.0));
        assert_eq!(set.owner_names(), vec!["DOE JOHN".to_string()]);
        assert_eq!(set.successes(), 2);
        assert_eq!(set.get(SourceKind::Verifier).map(|r| r.is_success()), Some(false));
    }

    #[test]
    fn ledger_links_by_identifier() {
        let mut ledger = EncumbranceLedger::default();
        ledger.insert(Encumbrance {
            instrument_number: "M-1".into(),
            doc_type: DocumentType::Mortgage,
            amount: Some(100_000.0),
            recorded_date: None,
            holder: Some("Bank A".into()),
            satisfied_by: None,
            assignments: vec![],
        });
        assert!(ledger.add_assignment("M-1", "A-1"));
        assert!(ledger.mark_satisfied("M-1", "S-1"));
        assert!(!ledger.mark_satisfied("M-404", "S-2"));

        let m = ledger.get("M-1").unwrap();
        assert_eq!(m.satisfied_by.as_deref(), Some("S-1"));
        assert_eq!(m.assignments, vec!["A-1".to_string()]);
        assert_eq!(ledger.open().count(), 0);
    }
}
