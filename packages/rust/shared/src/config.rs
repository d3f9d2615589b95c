//! Application configuration for lienflow.
//!
//! User config lives at `~/.lienflow/lienflow.toml`.
//! CLI flags override config file values, which override defaults.
//! Concurrency limits, timeouts, and the retry/criticality sets are all data
//! here so operators can re-tune them without touching pipeline code.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PipelineError, Result};
use crate::status::{
    DEFAULT_CRITICAL_STEPS, DEFAULT_NON_CRITICAL_STEPS, PipelineStep, RetryPolicy,
};
use crate::types::SourceKind;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "lienflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".lienflow";

/// Limiter guarding the official-records search.
pub const LIMITER_DOCUMENT_INDEX: &str = "document_index";
/// Limiter guarding document downloads.
pub const LIMITER_DOCUMENT_STORE: &str = "document_store";
/// Limiter guarding the extraction service (slowest collaborator).
pub const LIMITER_EXTRACTION: &str = "extraction";
/// Limiter guarding the chain builder.
pub const LIMITER_CHAIN_BUILDER: &str = "chain_builder";

// ---------------------------------------------------------------------------
// Config structs (matching lienflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Worker pool sizing.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Single-writer queue.
    #[serde(default)]
    pub write_queue: WriteQueueConfig,

    /// Retry bounds and step classification.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-call timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Extraction batching.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Worth-analyzing gate thresholds.
    #[serde(default)]
    pub gate: GateConfig,

    /// Database and download locations.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Collaborator endpoints.
    #[serde(default)]
    pub services: ServicesConfig,

    /// Named per-source limiters.
    #[serde(default = "default_limiters")]
    pub limiters: BTreeMap<String, LimiterConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            write_queue: WriteQueueConfig::default(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            extraction: ExtractionConfig::default(),
            gate: GateConfig::default(),
            storage: StorageConfig::default(),
            services: ServicesConfig::default(),
            limiters: default_limiters(),
        }
    }
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum entities processed at once; also the worker pool size.
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,

    /// Seeds requested per page from the seed source.
    #[serde(default = "default_seed_page_size")]
    pub seed_page_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            global_concurrency: default_global_concurrency(),
            seed_page_size: default_seed_page_size(),
        }
    }
}

fn default_global_concurrency() -> usize {
    4
}
fn default_seed_page_size() -> usize {
    100
}

/// `[write_queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueueConfig {
    /// Channel capacity; producers suspend when it is full.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Attempts per request before reporting a persistence failure.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles on each further attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    50
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Automatic retries for non-critical steps.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Automatic retries for critical steps.
    #[serde(default = "default_critical_max_retries")]
    pub critical_max_retries: u32,

    /// Steps whose failure needs manual review.
    #[serde(default = "default_critical_steps")]
    pub critical_steps: Vec<PipelineStep>,

    /// Steps retried automatically.
    #[serde(default = "default_non_critical_steps")]
    pub non_critical_steps: Vec<PipelineStep>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            critical_max_retries: default_critical_max_retries(),
            critical_steps: default_critical_steps(),
            non_critical_steps: default_non_critical_steps(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_critical_max_retries() -> u32 {
    1
}
fn default_critical_steps() -> Vec<PipelineStep> {
    DEFAULT_CRITICAL_STEPS.to_vec()
}
fn default_non_critical_steps() -> Vec<PipelineStep> {
    DEFAULT_NON_CRITICAL_STEPS.to_vec()
}

/// `[timeouts]` section. All values in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_verifier_ms")]
    pub verifier_ms: u64,
    #[serde(default = "default_source_ms")]
    pub source_ms: u64,
    #[serde(default = "default_document_search_ms")]
    pub document_search_ms: u64,
    #[serde(default = "default_download_ms")]
    pub download_ms: u64,
    #[serde(default = "default_extraction_ms")]
    pub extraction_ms: u64,
    #[serde(default = "default_chain_build_ms")]
    pub chain_build_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            verifier_ms: default_verifier_ms(),
            source_ms: default_source_ms(),
            document_search_ms: default_document_search_ms(),
            download_ms: default_download_ms(),
            extraction_ms: default_extraction_ms(),
            chain_build_ms: default_chain_build_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn verifier(&self) -> Duration {
        Duration::from_millis(self.verifier_ms)
    }
    pub fn source(&self) -> Duration {
        Duration::from_millis(self.source_ms)
    }
    pub fn document_search(&self) -> Duration {
        Duration::from_millis(self.document_search_ms)
    }
    pub fn download(&self) -> Duration {
        Duration::from_millis(self.download_ms)
    }
    pub fn extraction(&self) -> Duration {
        Duration::from_millis(self.extraction_ms)
    }
    pub fn chain_build(&self) -> Duration {
        Duration::from_millis(self.chain_build_ms)
    }
}

fn default_verifier_ms() -> u64 {
    20_000
}
fn default_source_ms() -> u64 {
    30_000
}
fn default_document_search_ms() -> u64 {
    60_000
}
fn default_download_ms() -> u64 {
    120_000
}
fn default_extraction_ms() -> u64 {
    300_000
}
fn default_chain_build_ms() -> u64 {
    60_000
}

/// `[extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Documents submitted per extraction call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    4
}

/// `[gate]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Skip legal analysis below this estimated value.
    #[serde(default = "default_min_market_value")]
    pub min_market_value: f64,

    /// Skip legal analysis when `value - judgment_amount` is below this.
    #[serde(default)]
    pub min_equity: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_market_value: default_min_market_value(),
            min_equity: 0.0,
        }
    }
}

fn default_min_market_value() -> f64 {
    10_000.0
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// libSQL database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Directory downloaded documents are written to.
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            download_dir: default_download_dir(),
        }
    }
}

fn default_db_path() -> String {
    "~/.lienflow/lienflow.db".into()
}
fn default_download_dir() -> String {
    "~/.lienflow/documents".into()
}

/// `[services]` section. Unset endpoints disable the corresponding source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub verifier_url: Option<Url>,
    #[serde(default)]
    pub tax_url: Option<Url>,
    #[serde(default)]
    pub permit_url: Option<Url>,
    #[serde(default)]
    pub market_url: Option<Url>,
    #[serde(default)]
    pub flood_url: Option<Url>,
    #[serde(default)]
    pub document_index_url: Option<Url>,
    #[serde(default)]
    pub extraction_url: Option<Url>,
    /// Documents accepted per call by the extraction service.
    #[serde(default = "default_extraction_capacity")]
    pub extraction_capacity: usize,
}

fn default_extraction_capacity() -> usize {
    8
}

impl ServicesConfig {
    /// Endpoint configured for a source, if any.
    pub fn source_url(&self, kind: SourceKind) -> Option<&Url> {
        match kind {
            SourceKind::Verifier => self.verifier_url.as_ref(),
            SourceKind::Tax => self.tax_url.as_ref(),
            SourceKind::Permit => self.permit_url.as_ref(),
            SourceKind::Market => self.market_url.as_ref(),
            SourceKind::Flood => self.flood_url.as_ref(),
        }
    }
}

/// `[limiters.<name>]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Concurrent calls allowed.
    pub concurrency: usize,

    /// Minimum ms a holder waits before calling the source.
    #[serde(default)]
    pub min_interval_ms: u64,
}

impl LimiterConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            min_interval_ms: 0,
        }
    }
}

fn default_limiters() -> BTreeMap<String, LimiterConfig> {
    let mut limiters = BTreeMap::new();
    for (name, concurrency) in [
        (SourceKind::Verifier.as_str(), 2),
        (SourceKind::Tax.as_str(), 4),
        (SourceKind::Permit.as_str(), 2),
        (SourceKind::Market.as_str(), 2),
        (SourceKind::Flood.as_str(), 4),
        (LIMITER_DOCUMENT_INDEX, 2),
        (LIMITER_DOCUMENT_STORE, 4),
        (LIMITER_EXTRACTION, 1),
        (LIMITER_CHAIN_BUILDER, 2),
    ] {
        limiters.insert(name.to_string(), LimiterConfig::new(concurrency));
    }
    limiters
}

/// Every limiter the pipeline acquires.
pub fn required_limiters() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = SourceKind::ALL.iter().map(|k| k.as_str()).collect();
    names.extend([
        LIMITER_DOCUMENT_INDEX,
        LIMITER_DOCUMENT_STORE,
        LIMITER_EXTRACTION,
        LIMITER_CHAIN_BUILDER,
    ]);
    names
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Check the config before starting a run. Any error here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.global_concurrency == 0 {
            return Err(PipelineError::config(
                "orchestrator.global_concurrency must be > 0",
            ));
        }
        if self.orchestrator.seed_page_size == 0 {
            return Err(PipelineError::config("orchestrator.seed_page_size must be > 0"));
        }
        if self.write_queue.capacity == 0 {
            return Err(PipelineError::config("write_queue.capacity must be > 0"));
        }
        if self.write_queue.max_attempts == 0 {
            return Err(PipelineError::config("write_queue.max_attempts must be > 0"));
        }
        if self.extraction.batch_size == 0 {
            return Err(PipelineError::config("extraction.batch_size must be > 0"));
        }
        for name in required_limiters() {
            match self.limiters.get(name) {
                None => {
                    return Err(PipelineError::config(format!(
                        "missing [limiters.{name}] section"
                    )));
                }
                Some(limiter) if limiter.concurrency == 0 => {
                    return Err(PipelineError::config(format!(
                        "limiters.{name}.concurrency must be > 0"
                    )));
                }
                Some(_) => {}
            }
        }
        self.retry_policy().map(|_| ())
    }

    /// Build the retry policy from `[retry]`.
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(
            self.retry.critical_steps.iter().copied(),
            self.retry.non_critical_steps.iter().copied(),
            self.retry.max_retries,
            self.retry.critical_max_retries,
        )
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.lienflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PipelineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.lienflow/lienflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| PipelineError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PipelineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PipelineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| PipelineError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
