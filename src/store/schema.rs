//! SQLite schema for the tracking database

pub const SCHEMA: &str = r#"
-- ============================================
-- TRACKING TABLE
-- ============================================

-- One row per tracked entity (or per project/entity/name in shared tables)
CREATE TABLE IF NOT EXISTS tracking_rows (
    pk TEXT PRIMARY KEY,                   -- JSON array of the primary-key fields
    row_digest TEXT NOT NULL,              -- SHA-256 of the dedup key
    project_id TEXT NOT NULL,
    project_name TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    name TEXT NOT NULL,
    fingerprint TEXT NOT NULL,             -- md5, version number, or 'NA'
    version INTEGER,
    node_type TEXT NOT NULL,
    changed_on INTEGER NOT NULL,           -- epoch millis
    contributor_id TEXT,
    contributor TEXT NOT NULL,
    status TEXT NOT NULL,                  -- 'New', 'Updated', 'Existing'
    annotations TEXT NOT NULL DEFAULT '{}' -- JSON object of projected fields
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tracking_digest ON tracking_rows(row_digest);
CREATE INDEX IF NOT EXISTS idx_tracking_project ON tracking_rows(project_id);
CREATE INDEX IF NOT EXISTS idx_tracking_entity ON tracking_rows(entity_id);
CREATE INDEX IF NOT EXISTS idx_tracking_changed ON tracking_rows(changed_on DESC);

-- Settings the table was created with (key_mode)
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- ============================================
-- RUN LOG
-- ============================================

CREATE TABLE IF NOT EXISTS audit_runs (
    id TEXT PRIMARY KEY,                   -- UUID v4
    started_at INTEGER NOT NULL,           -- epoch millis
    finished_at INTEGER,
    status TEXT NOT NULL DEFAULT 'running', -- 'running', 'ok', 'partial', 'failed'
    dry_run BOOLEAN NOT NULL DEFAULT FALSE,
    projects TEXT NOT NULL,                -- JSON array of requested project ids
    entity_count INTEGER NOT NULL DEFAULT 0,
    new_count INTEGER NOT NULL DEFAULT 0,
    updated_count INTEGER NOT NULL DEFAULT 0,
    inserted INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    failures TEXT NOT NULL DEFAULT '[]',   -- JSON array of failed project ids
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_started ON audit_runs(started_at DESC);

-- ============================================
-- LOCAL CHECKPOINTS
-- ============================================

-- Used when audit.checkpoint_backend is 'local'
CREATE TABLE IF NOT EXISTS checkpoints (
    project_id TEXT PRIMARY KEY,
    value INTEGER NOT NULL,                -- epoch millis
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
"#;
