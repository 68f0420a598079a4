//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`TableStore`] trait is the pipeline's view of a tabular storage
//! backend: schema-typed rows written with append or overwrite semantics.
//! Two implementations ship here:
//! - [`Storage`] wraps a libSQL database (stage tables, run history,
//!   description cache)
//! - [`MemoryStore`] keeps tables in memory for dry runs and tests
//!
//! **Access rules:**
//! - `imgdesc run`: read-write (sole writer) via [`Storage::open`]
//! - `imgdesc show` / `imgdesc runs`: read-only via [`Storage::open_readonly`]

mod memory;
mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use imgdesc_shared::{
    CodeRecord, DescRecord, ImgDescError, Result, Rows, TableNames, TableWrite, UrlRecord,
    WriteMode,
};
use libsql::{Connection, Database, params};

pub use memory::{MemoryStore, WriteLogEntry};

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// A persisted pipeline run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    /// Run identifier (UUID v7).
    pub id: String,
    /// Terminal state, e.g. `COMMITTED` or `FAILED`.
    pub state: String,
    /// RFC 3339 timestamps.
    pub started_at: String,
    pub finished_at: String,
    /// Per-stage status counts.
    pub stats_json: String,
    /// Failure reason for failed runs.
    pub error: Option<String>,
}

/// Tabular storage backend used by the pipeline coordinator.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Write `rows` to `table`, creating it if needed.
    async fn write(&self, table: &str, rows: Rows, mode: WriteMode) -> Result<()>;

    /// Apply several writes so that either all or none become visible.
    ///
    /// The default applies them one by one; backends with transactions
    /// override it.
    async fn commit(&self, writes: Vec<TableWrite>) -> Result<()> {
        for write in writes {
            self.write(&write.table, write.rows, write.mode).await?;
        }
        Ok(())
    }

    /// Persist a run summary.
    async fn record_run(&self, run: &RunRecord) -> Result<()>;
}

// ---------------------------------------------------------------------------
// libSQL storage
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| ImgDescError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;

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
        if !path.exists() {
            return Err(ImgDescError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;

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
                        ImgDescError::Storage(format!(
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
            return Err(ImgDescError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stage tables
    // -----------------------------------------------------------------------

    /// Create `table` with the schema matching `rows` if it does not exist.
    async fn ensure_table(conn: &Connection, table: &str, rows: &Rows) -> Result<()> {
        let columns = match rows {
            Rows::Urls(_) => "id INTEGER NOT NULL, url TEXT NOT NULL",
            Rows::Codes(_) => {
                "id INTEGER NOT NULL, url TEXT NOT NULL, content BLOB, fetch_status TEXT NOT NULL"
            }
            Rows::Descriptions(_) => {
                "id INTEGER NOT NULL, url TEXT NOT NULL, description TEXT, status TEXT NOT NULL"
            }
        };
        conn.execute(
            &format!("CREATE TABLE IF NOT EXISTS \"{table}\" ({columns})"),
            params![],
        )
        .await
        .map_err(|e| ImgDescError::Storage(format!("create table {table}: {e}")))?;
        Ok(())
    }

    /// Write rows on `conn`, which is either the main connection or a
    /// transaction deref'd to one.
    async fn write_on(conn: &Connection, table: &str, rows: &Rows, mode: WriteMode) -> Result<()> {
        validate_table_name(table)?;
        Self::ensure_table(conn, table, rows).await?;

        if mode == WriteMode::Overwrite {
            conn.execute(&format!("DELETE FROM \"{table}\""), params![])
                .await
                .map_err(|e| ImgDescError::Storage(format!("clear {table}: {e}")))?;
        }

        match rows {
            Rows::Urls(records) => {
                let sql = format!("INSERT INTO \"{table}\" (id, url) VALUES (?1, ?2)");
                for r in records {
                    conn.execute(&sql, params![r.id, r.url.as_str()])
                        .await
                        .map_err(|e| ImgDescError::Storage(e.to_string()))?;
                }
            }
            Rows::Codes(records) => {
                let sql = format!(
                    "INSERT INTO \"{table}\" (id, url, content, fetch_status) VALUES (?1, ?2, ?3, ?4)"
                );
                for r in records {
                    conn.execute(
                        &sql,
                        params![r.id, r.url.as_str(), r.content.clone(), r.fetch_status.as_str()],
                    )
                    .await
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?;
                }
            }
            Rows::Descriptions(records) => {
                let sql = format!(
                    "INSERT INTO \"{table}\" (id, url, description, status) VALUES (?1, ?2, ?3, ?4)"
                );
                for r in records {
                    conn.execute(
                        &sql,
                        params![r.id, r.url.as_str(), r.description.as_deref(), r.status.as_str()],
                    )
                    .await
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?;
                }
            }
        }

        tracing::debug!(table, kind = rows.kind(), rows = rows.len(), mode = mode.as_str(), "table write");
        Ok(())
    }

    /// Stage tables only exist once a run has written them.
    async fn table_exists(&self, table: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
            )
            .await
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;
        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(ImgDescError::Storage(e.to_string())),
        }
    }

    /// Read an `image_urls`-shaped table.
    pub async fn read_urls(&self, table: &str) -> Result<Vec<UrlRecord>> {
        validate_table_name(table)?;
        if !self.table_exists(table).await? {
            return Ok(Vec::new());
        }
        let mut rows = self
            .conn
            .query(&format!("SELECT id, url FROM \"{table}\" ORDER BY id"), params![])
            .await
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(UrlRecord {
                id: row
                    .get::<i64>(0)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
                url: row
                    .get::<String>(1)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
            });
        }
        Ok(results)
    }

    /// Read an `image_codes`-shaped table, ordered by id.
    pub async fn read_codes(&self, table: &str) -> Result<Vec<CodeRecord>> {
        validate_table_name(table)?;
        if !self.table_exists(table).await? {
            return Ok(Vec::new());
        }
        let mut rows = self
            .conn
            .query(
                &format!("SELECT id, url, content, fetch_status FROM \"{table}\" ORDER BY id"),
                params![],
            )
            .await
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(CodeRecord {
                id: row
                    .get::<i64>(0)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
                url: row
                    .get::<String>(1)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
                content: row.get::<Vec<u8>>(2).ok(),
                fetch_status: row
                    .get::<String>(3)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
            });
        }
        Ok(results)
    }

    /// Read an `image_desc`-shaped table, ordered by id.
    pub async fn read_descriptions(&self, table: &str) -> Result<Vec<DescRecord>> {
        validate_table_name(table)?;
        if !self.table_exists(table).await? {
            return Ok(Vec::new());
        }
        let mut rows = self
            .conn
            .query(
                &format!("SELECT id, url, description, status FROM \"{table}\" ORDER BY id"),
                params![],
            )
            .await
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(DescRecord {
                id: row
                    .get::<i64>(0)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
                url: row
                    .get::<String>(1)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
                description: row.get::<String>(2).ok(),
                status: row
                    .get::<String>(3)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, state, started_at, finished_at, stats_json, error
                 FROM pipeline_runs ORDER BY started_at DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(RunRecord {
                id: row
                    .get::<String>(0)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
                state: row
                    .get::<String>(1)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
                started_at: row
                    .get::<String>(2)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
                finished_at: row
                    .get::<String>(3)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
                stats_json: row
                    .get::<String>(4)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?,
                error: row.get::<String>(5).ok(),
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Description cache
    // -----------------------------------------------------------------------

    /// Get a cached description.
    pub async fn get_cached_description(
        &self,
        content_hash: &str,
        model_id: &str,
        prompt_hash: &str,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT description FROM description_cache
                 WHERE content_hash = ?1 AND model_id = ?2 AND prompt_hash = ?3",
                params![content_hash, model_id, prompt_hash],
            )
            .await
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let description: String = row
                    .get(0)
                    .map_err(|e| ImgDescError::Storage(e.to_string()))?;
                Ok(Some(description))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ImgDescError::Storage(e.to_string())),
        }
    }

    /// Store a description in the cache (upserts).
    pub async fn set_cached_description(
        &self,
        content_hash: &str,
        model_id: &str,
        prompt_hash: &str,
        description: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO description_cache (content_hash, model_id, prompt_hash, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(content_hash, model_id, prompt_hash) DO UPDATE SET
                   description = excluded.description,
                   created_at = excluded.created_at",
                params![content_hash, model_id, prompt_hash, description, now.as_str()],
            )
            .await
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for Storage {
    async fn write(&self, table: &str, rows: Rows, mode: WriteMode) -> Result<()> {
        self.check_writable()?;
        Self::write_on(&self.conn, table, &rows, mode).await
    }

    async fn commit(&self, writes: Vec<TableWrite>) -> Result<()> {
        self.check_writable()?;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| ImgDescError::Storage(format!("begin transaction: {e}")))?;

        for write in &writes {
            if let Err(e) = Self::write_on(&tx, &write.table, &write.rows, write.mode).await {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                return Err(e);
            }
        }

        tx.commit()
            .await
            .map_err(|e| ImgDescError::Storage(format!("commit: {e}")))?;
        Ok(())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (id, state, started_at, finished_at, stats_json, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.id.as_str(),
                    run.state.as_str(),
                    run.started_at.as_str(),
                    run.finished_at.as_str(),
                    run.stats_json.as_str(),
                    run.error.as_deref(),
                ],
            )
            .await
            .map_err(|e| ImgDescError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= 64 {
        Ok(())
    } else {
        Err(ImgDescError::config(format!(
            "invalid table name '{name}': expected letters, digits and underscores"
        )))
    }
}

/// Check every configured stage table name.
pub fn validate_table_names(tables: &TableNames) -> Result<()> {
    validate_table_name(&tables.urls)?;
    validate_table_name(&tables.codes)?;
    validate_table_name(&tables.descriptions)
}
