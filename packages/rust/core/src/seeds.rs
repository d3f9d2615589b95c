//! Seed sources shipped with the pipeline.
//!
//! - [`JsonLinesSeedSource`]: one JSON entity per line, for scraped auction
//!   exports.
//! - [`StoredSeedSource`]: entities already in the database that are still
//!   `pending` or `processing`, for resuming an interrupted run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use lienflow_shared::{DateRange, Entity, PipelineError, Result};
use lienflow_storage::Storage;

use crate::collaborators::{SeedPage, SeedSource};

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

/// Entities parsed from a `.jsonl` file. Blank lines and lines starting with
/// `#` are ignored. The cursor is the index of the next entity.
#[derive(Debug, Clone)]
pub struct JsonLinesSeedSource {
    path: PathBuf,
    entities: Vec<Entity>,
}

impl JsonLinesSeedSource {
    /// Read and parse the whole file. A malformed line fails the load and
    /// names its line number.
    pub async fn open(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::io(path, e))?;
        let entities = parse_lines(&content).map_err(|e| match e {
            PipelineError::Validation { message } => {
                PipelineError::validation(format!("{}: {message}", path.display()))
            }
            other => other,
        })?;
        debug!(path = %path.display(), entities = entities.len(), "seed file loaded");
        Ok(Self {
            path: path.to_path_buf(),
            entities,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

fn parse_lines(content: &str) -> Result<Vec<Entity>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str::<Entity>(line)
                .map_err(|e| PipelineError::validation(format!("line {}: {e}", idx + 1)))
        })
        .collect()
}

#[async_trait]
impl SeedSource for JsonLinesSeedSource {
    async fn fetch(
        &self,
        range: &DateRange,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<SeedPage> {
        let offset = match cursor.as_deref() {
            None => 0,
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| PipelineError::validation(format!("invalid seed cursor {c:?}")))?,
        };
        let offset = offset.min(self.entities.len());
        let end = offset.saturating_add(limit.max(1)).min(self.entities.len());

        Ok(SeedPage {
            entities: self.entities[offset..end]
                .iter()
                .filter(|e| range.contains(e.auction_date))
                .cloned()
                .collect(),
            next_cursor: (end < self.entities.len()).then(|| end.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Resumable entities from the database, paged by case number.
pub struct StoredSeedSource {
    storage: Arc<Storage>,
}

impl StoredSeedSource {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl SeedSource for StoredSeedSource {
    async fn fetch(
        &self,
        range: &DateRange,
        cursor: Option<String>,
        limit: usize,
    ) -> Result<SeedPage> {
        let limit = u32::try_from(limit.max(1)).unwrap_or(u32::MAX);
        let rows = self
            .storage
            .list_resumable(cursor.as_deref(), limit)
            .await?;

        // Keyset on the last case number seen, so rows whose status changes
        // mid-run never shift later pages.
        let next_cursor = if rows.len() as u32 == limit {
            rows.last().map(|(e, _)| e.case_number.clone())
        } else {
            None
        };
        Ok(SeedPage {
            entities: rows
                .into_iter()
                .map(|(entity, _)| entity)
                .filter(|e| range.contains(e.auction_date))
                .collect(),
            next_cursor,
        })
    }
}
