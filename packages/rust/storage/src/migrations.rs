//! SQL migration definitions for the lienflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: properties, pipeline_status, enrichment, documents, legal analysis",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Seed entities (immutable identity fields)
CREATE TABLE IF NOT EXISTS properties (
    case_number     TEXT PRIMARY KEY,
    folio           TEXT,
    address         TEXT NOT NULL,
    auction_date    TEXT NOT NULL,
    judgment_amount REAL,
    plaintiff       TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_properties_auction_date ON properties(auction_date);

-- Per-entity pipeline state. Queried and updated by recovery tooling.
CREATE TABLE IF NOT EXISTS pipeline_status (
    case_number     TEXT PRIMARY KEY REFERENCES properties(case_number) ON DELETE CASCADE,
    pipeline_status TEXT NOT NULL
        CHECK (pipeline_status IN ('pending', 'processing', 'completed', 'failed')),
    error_step      INTEGER,
    retry_count     INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    last_error      TEXT,
    updated_at      TEXT NOT NULL,
    CHECK (pipeline_status = 'failed' OR (error_step IS NULL AND last_error IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_pipeline_status_status ON pipeline_status(pipeline_status);

-- Append-only per-source enrichment results
CREATE TABLE IF NOT EXISTS enrichment_results (
    id          TEXT PRIMARY KEY,
    case_number TEXT NOT NULL REFERENCES properties(case_number) ON DELETE CASCADE,
    source      TEXT NOT NULL,
    success     INTEGER NOT NULL,
    timed_out   INTEGER NOT NULL DEFAULT 0,
    error       TEXT,
    result_json TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_enrichment_case ON enrichment_results(case_number, source);

-- Recorded documents found by the official-records index
CREATE TABLE IF NOT EXISTS documents (
    instrument_number TEXT NOT NULL,
    case_number       TEXT NOT NULL REFERENCES properties(case_number) ON DELETE CASCADE,
    doc_type          TEXT NOT NULL,
    recorded_date     TEXT,
    metadata_json     TEXT NOT NULL,
    file_path         TEXT,
    sha256            TEXT,
    size_bytes        INTEGER,
    PRIMARY KEY (case_number, instrument_number)
);

-- Structured extraction output, keyed by the document it came from
CREATE TABLE IF NOT EXISTS extracted_documents (
    document_id  TEXT NOT NULL,
    case_number  TEXT NOT NULL REFERENCES properties(case_number) ON DELETE CASCADE,
    doc_type     TEXT NOT NULL,
    extract_json TEXT NOT NULL,
    extracted_at TEXT NOT NULL,
    PRIMARY KEY (case_number, document_id)
);

-- Validated final judgments
CREATE TABLE IF NOT EXISTS judgments (
    case_number   TEXT PRIMARY KEY REFERENCES properties(case_number) ON DELETE CASCADE,
    document_id   TEXT NOT NULL,
    amount        REAL NOT NULL,
    judgment_json TEXT NOT NULL,
    validated_at  TEXT NOT NULL
);

-- Phase-3 outcome: analyzed (with title chain) or skipped by the gate
CREATE TABLE IF NOT EXISTS legal_analysis (
    case_number TEXT PRIMARY KEY REFERENCES properties(case_number) ON DELETE CASCADE,
    outcome     TEXT NOT NULL CHECK (outcome IN ('analyzed', 'skipped')),
    reason      TEXT,
    chain_json  TEXT,
    analyzed_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
