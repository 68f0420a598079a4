//! SQL migration definitions for the imgdesc database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.
//!
//! The stage tables (`image_urls`, `image_codes`, `image_desc`) are not
//! created here: their names are configurable, so they are created on first
//! write by [`Storage`](crate::Storage).

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
        description: "Initial schema: pipeline_runs, description_cache",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per pipeline run, committed or failed
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id          TEXT PRIMARY KEY,
    state       TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    stats_json  TEXT NOT NULL,
    error       TEXT
);

CREATE INDEX IF NOT EXISTS idx_pipeline_runs_started ON pipeline_runs(started_at);

-- Descriptions of previously seen images
CREATE TABLE IF NOT EXISTS description_cache (
    content_hash TEXT NOT NULL,
    model_id     TEXT NOT NULL,
    prompt_hash  TEXT NOT NULL,
    description  TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (content_hash, model_id, prompt_hash)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
