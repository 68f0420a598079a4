//! In-memory [`TableStore`], used for dry runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use imgdesc_shared::{ImgDescError, Result, Rows, TableWrite, WriteMode};

use crate::{RunRecord, TableStore};

/// A write that reached the store, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteLogEntry {
    pub table: String,
    pub mode: WriteMode,
    pub rows: usize,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Rows>,
    log: Vec<WriteLogEntry>,
    runs: Vec<RunRecord>,
}

/// Tables held in a process-local map.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Writes to this table fail, for exercising commit failures.
    failing_table: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes to `table` always fail.
    pub fn failing_on(table: impl Into<String>) -> Self {
        Self {
            inner: Mutex::default(),
            failing_table: Some(table.into()),
        }
    }

    /// Snapshot of a table's current rows.
    pub async fn rows(&self, table: &str) -> Option<Rows> {
        self.inner.lock().await.tables.get(table).cloned()
    }

    /// Every successful write, in order.
    pub async fn write_log(&self) -> Vec<WriteLogEntry> {
        self.inner.lock().await.log.clone()
    }

    /// Recorded run summaries, oldest first.
    pub async fn runs(&self) -> Vec<RunRecord> {
        self.inner.lock().await.runs.clone()
    }

    fn check_table(&self, table: &str) -> Result<()> {
        if self.failing_table.as_deref() == Some(table) {
            return Err(ImgDescError::Storage(format!(
                "injected write failure for table {table}"
            )));
        }
        Ok(())
    }
}

/// Apply one write to a table map.
fn apply(tables: &mut HashMap<String, Rows>, table: &str, rows: Rows, mode: WriteMode) -> Result<()> {
    if mode == WriteMode::Append {
        if let Some(existing) = tables.get_mut(table) {
            match (existing, rows) {
                (Rows::Urls(have), Rows::Urls(new)) => have.extend(new),
                (Rows::Codes(have), Rows::Codes(new)) => have.extend(new),
                (Rows::Descriptions(have), Rows::Descriptions(new)) => have.extend(new),
                (have, new) => {
                    return Err(ImgDescError::validation(format!(
                        "cannot append {} rows to {} table {table}",
                        new.kind(),
                        have.kind()
                    )));
                }
            }
            return Ok(());
        }
    }
    tables.insert(table.to_string(), rows);
    Ok(())
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn write(&self, table: &str, rows: Rows, mode: WriteMode) -> Result<()> {
        self.check_table(table)?;
        let mut inner = self.inner.lock().await;
        let count = rows.len();
        apply(&mut inner.tables, table, rows, mode)?;
        inner.log.push(WriteLogEntry {
            table: table.to_string(),
            mode,
            rows: count,
        });
        Ok(())
    }

    async fn commit(&self, writes: Vec<TableWrite>) -> Result<()> {
        for write in &writes {
            self.check_table(&write.table)?;
        }

        let mut inner = self.inner.lock().await;
        // Stage on a copy so a failing write leaves every table untouched.
        let mut staged = inner.tables.clone();
        let mut entries = Vec::with_capacity(writes.len());
        for write in writes {
            entries.push(WriteLogEntry {
                table: write.table.clone(),
                mode: write.mode,
                rows: write.rows.len(),
            });
            apply(&mut staged, &write.table, write.rows, write.mode)?;
        }
        inner.tables = staged;
        inner.log.extend(entries);
        Ok(())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<()> {
        self.inner.lock().await.runs.push(run.clone());
        Ok(())
    }
}
