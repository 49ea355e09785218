//! Trail Export
//!
//! Ordered, read-only views over a scope for evidence bundles. Exports are
//! JSON Lines, one entry per line, in chain order. Nothing is reordered or
//! deduplicated.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::database::models::EntryRow;
use crate::database::Database;
use crate::error::{LedgerError, Result};
use crate::ledger::entry::LedgerEntry;

#[derive(Clone)]
pub struct TrailExporter {
    database: Database,
    page_size: u32,
}

impl TrailExporter {
    pub fn new(database: Database, page_size: u32) -> Self {
        Self {
            database,
            page_size: page_size.max(1),
        }
    }

    /// Entries touching one target, in chain order.
    pub async fn trail(
        &self,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<LedgerEntry>> {
        let Some(tail) = self.database.tail(scope_id).await? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        let mut cursor: Option<u64> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
            let rows = self
                .database
                .target_page(
                    scope_id,
                    target_type,
                    target_id,
                    cursor,
                    tail.sequence,
                    self.page_size,
                )
                .await?;
            if rows.is_empty() {
                break;
            }
            let full_page = rows.len() as u32 == self.page_size;
            cursor = append_rows(&mut entries, rows)?;
            if !full_page {
                break;
            }
        }

        debug!(
            "Collected {} entries for {}/{} in scope {}",
            entries.len(),
            target_type,
            target_id,
            scope_id
        );
        Ok(entries)
    }

    /// Every entry in the scope, in chain order.
    pub async fn scope_entries(
        &self,
        scope_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<LedgerEntry>> {
        let Some(tail) = self.database.tail(scope_id).await? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        let mut cursor: Option<u64> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
            let rows = self
                .database
                .entries_page(scope_id, cursor, tail.sequence, self.page_size)
                .await?;
            if rows.is_empty() {
                break;
            }
            cursor = append_rows(&mut entries, rows)?;
        }
        Ok(entries)
    }

    /// Serialized target trail for an evidence bundle.
    pub async fn export_trail(
        &self,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let entries = self.trail(scope_id, target_type, target_id, cancel).await?;
        let bytes = to_jsonl(&entries)?;
        info!(
            "Exported {} entries ({} bytes) for {}/{} in scope {}",
            entries.len(),
            bytes.len(),
            target_type,
            target_id,
            scope_id
        );
        Ok(bytes)
    }

    /// Serialized full scope. Unlike a target trail this can be re-verified offline.
    pub async fn export_scope(&self, scope_id: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let entries = self.scope_entries(scope_id, cancel).await?;
        to_jsonl(&entries)
    }
}

fn append_rows(entries: &mut Vec<LedgerEntry>, rows: Vec<EntryRow>) -> Result<Option<u64>> {
    let mut last = None;
    for row in rows {
        let entry = LedgerEntry::try_from(row)?;
        last = Some(entry.sequence);
        entries.push(entry);
    }
    Ok(last)
}

pub fn to_jsonl(entries: &[LedgerEntry]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut out, entry)?;
        out.write_all(b"\n")
            .map_err(|e| LedgerError::Storage(format!("Failed to buffer export: {}", e)))?;
    }
    Ok(out)
}

/// Parse a JSON Lines export back into entries. Blank lines are skipped.
pub fn read_jsonl(reader: impl Read) -> Result<Vec<LedgerEntry>> {
    let reader = BufReader::new(reader);
    let mut entries = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line
            .map_err(|e| LedgerError::Storage(format!("Failed to read line {}: {}", line_num + 1, e)))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: LedgerEntry = serde_json::from_str(&line).map_err(|e| {
            LedgerError::integrity(format!("Failed to parse entry at line {}: {}", line_num + 1, e))
        })?;
        entries.push(entry);
    }

    Ok(entries)
}

pub fn load_export_file(path: &Path) -> Result<Vec<LedgerEntry>> {
    let file = std::fs::File::open(path).map_err(|e| {
        LedgerError::NotFound(format!("Failed to open export {}: {}", path.display(), e))
    })?;
    let entries = read_jsonl(file)?;
    debug!("Loaded {} entries from {}", entries.len(), path.display());
    Ok(entries)
}
