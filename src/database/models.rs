use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::ledger::canonical::{canonical_timestamp, CanonicalBytes};
use crate::ledger::entry::LedgerEntry;

/// Raw `ledger_entries` row, exactly as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EntryRow {
    pub id: String,
    pub scope_id: String,
    pub sequence: i64,
    pub actor_id: Option<String>,
    pub actor_role: Option<String>,
    pub action: String,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub before_json: Option<String>,
    pub after_json: Option<String>,
    pub created_at: String,
    pub format_version: i64,
    pub hash: String,
    pub previous_hash: Option<String>,
}

impl EntryRow {
    /// Stored representation of an entry. JSON columns hold canonical text.
    pub fn from_entry(entry: &LedgerEntry) -> Result<Self> {
        Ok(Self {
            id: entry.id.to_string(),
            scope_id: entry.scope_id.clone(),
            sequence: i64::try_from(entry.sequence)
                .map_err(|_| LedgerError::validation("sequence exceeds storage range"))?,
            actor_id: entry.actor_id.clone(),
            actor_role: entry.actor_role.clone(),
            action: entry.action.clone(),
            target_type: entry.target_type.clone(),
            target_id: entry.target_id.clone(),
            before_json: entry.before_state.as_ref().map(canonical_text).transpose()?,
            after_json: entry.after_state.as_ref().map(canonical_text).transpose()?,
            created_at: canonical_timestamp(&entry.created_at),
            format_version: i64::from(entry.format_version),
            hash: entry.hash.clone(),
            previous_hash: entry.previous_hash.clone(),
        })
    }
}

fn canonical_text(value: &serde_json::Value) -> Result<String> {
    let bytes = CanonicalBytes::new(value)?;
    String::from_utf8(bytes.as_bytes().to_vec())
        .map_err(|e| LedgerError::validation(format!("canonical JSON is not UTF-8: {}", e)))
}

fn parse_json(column: &str, text: Option<&str>) -> Result<Option<serde_json::Value>> {
    text.map(|t| {
        serde_json::from_str(t)
            .map_err(|e| LedgerError::integrity(format!("unreadable {} column: {}", column, e)))
    })
    .transpose()
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = LedgerError;

    fn try_from(row: EntryRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| LedgerError::integrity(format!("unreadable entry id {:?}: {}", row.id, e)))?;
        let sequence = u64::try_from(row.sequence)
            .map_err(|_| LedgerError::integrity(format!("negative sequence {}", row.sequence)))?;
        let format_version = u8::try_from(row.format_version).map_err(|_| {
            LedgerError::integrity(format!("format version {} out of range", row.format_version))
        })?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| {
                LedgerError::integrity(format!("unreadable created_at {:?}: {}", row.created_at, e))
            })?
            .with_timezone(&Utc);

        Ok(LedgerEntry {
            id,
            scope_id: row.scope_id,
            sequence,
            actor_id: row.actor_id,
            actor_role: row.actor_role,
            action: row.action,
            target_type: row.target_type,
            target_id: row.target_id,
            before_state: parse_json("before_json", row.before_json.as_deref())?,
            after_state: parse_json("after_json", row.after_json.as_deref())?,
            created_at,
            format_version,
            hash: row.hash,
            previous_hash: row.previous_hash,
        })
    }
}

/// Trusted `(sequence, hash)` pair from a completed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CheckpointRow {
    pub scope_id: String,
    pub sequence: i64,
    pub hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScopeRow {
    pub scope_id: String,
    pub owner_kind: String,
    pub registered_at: String,
}

/// Current end of a scope's chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTail {
    pub sequence: u64,
    pub hash: String,
}

/// Result of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another entry already claims this `(scope, sequence)` or `(scope, previous_hash)`.
    TailMoved,
}
