use chrono::Utc;
use sqlx::SqlitePool;

use crate::database::models::*;
use crate::error::{LedgerError, Result};
use crate::ledger::canonical::canonical_timestamp;

pub struct Queries;

fn to_sequence(raw: i64) -> Result<u64> {
    u64::try_from(raw).map_err(|_| LedgerError::integrity(format!("negative sequence {}", raw)))
}

fn to_sql_sequence(seq: u64) -> Result<i64> {
    i64::try_from(seq).map_err(|_| LedgerError::validation(format!("sequence {} out of range", seq)))
}

impl Queries {
    /// Hash and sequence of the newest entry in `scope_id`.
    pub async fn tail(pool: &SqlitePool, scope_id: &str) -> Result<Option<ChainTail>> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT sequence, hash
            FROM ledger_entries
            WHERE scope_id = ?1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(scope_id)
        .fetch_optional(pool)
        .await?;

        row.map(|(sequence, hash)| {
            Ok(ChainTail {
                sequence: to_sequence(sequence)?,
                hash,
            })
        })
        .transpose()
    }

    /// Insert a sealed entry. A uniqueness conflict means the tail moved.
    pub async fn insert_entry(pool: &SqlitePool, row: &EntryRow) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, scope_id, sequence, actor_id, actor_role, action,
                target_type, target_id, before_json, after_json,
                created_at, format_version, hash, previous_hash
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(&row.id)
        .bind(&row.scope_id)
        .bind(row.sequence)
        .bind(&row.actor_id)
        .bind(&row.actor_role)
        .bind(&row.action)
        .bind(&row.target_type)
        .bind(&row.target_id)
        .bind(&row.before_json)
        .bind(&row.after_json)
        .bind(&row.created_at)
        .bind(row.format_version)
        .bind(&row.hash)
        .bind(&row.previous_hash)
        .execute(pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(InsertOutcome::TailMoved)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Entries with `after < sequence <= upto`, oldest first.
    pub async fn entries_page(
        pool: &SqlitePool,
        scope_id: &str,
        after: Option<u64>,
        upto: u64,
        limit: u32,
    ) -> Result<Vec<EntryRow>> {
        let after = match after {
            Some(seq) => to_sql_sequence(seq)?,
            None => -1,
        };
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT id, scope_id, sequence, actor_id, actor_role, action,
                   target_type, target_id, before_json, after_json,
                   created_at, format_version, hash, previous_hash
            FROM ledger_entries
            WHERE scope_id = ?1 AND sequence > ?2 AND sequence <= ?3
            ORDER BY sequence ASC
            LIMIT ?4
            "#,
        )
        .bind(scope_id)
        .bind(after)
        .bind(to_sql_sequence(upto)?)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    /// Like [`Queries::entries_page`], restricted to one target.
    pub async fn target_page(
        pool: &SqlitePool,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        after: Option<u64>,
        upto: u64,
        limit: u32,
    ) -> Result<Vec<EntryRow>> {
        let after = match after {
            Some(seq) => to_sql_sequence(seq)?,
            None => -1,
        };
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT id, scope_id, sequence, actor_id, actor_role, action,
                   target_type, target_id, before_json, after_json,
                   created_at, format_version, hash, previous_hash
            FROM ledger_entries
            WHERE scope_id = ?1 AND target_type = ?2 AND target_id = ?3
              AND sequence > ?4 AND sequence <= ?5
            ORDER BY sequence ASC
            LIMIT ?6
            "#,
        )
        .bind(scope_id)
        .bind(target_type)
        .bind(target_id)
        .bind(after)
        .bind(to_sql_sequence(upto)?)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;

        Ok(rows)
    }

    /// Number of entries for a target and the sequence of the newest one.
    pub async fn target_span(
        pool: &SqlitePool,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        upto: u64,
    ) -> Result<(u64, Option<u64>)> {
        let (count, last): (i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MAX(sequence)
            FROM ledger_entries
            WHERE scope_id = ?1 AND target_type = ?2 AND target_id = ?3 AND sequence <= ?4
            "#,
        )
        .bind(scope_id)
        .bind(target_type)
        .bind(target_id)
        .bind(to_sql_sequence(upto)?)
        .fetch_one(pool)
        .await?;

        Ok((to_sequence(count)?, last.map(to_sequence).transpose()?))
    }

    pub async fn latest_checkpoint(pool: &SqlitePool, scope_id: &str) -> Result<Option<CheckpointRow>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT scope_id, sequence, hash, created_at
            FROM ledger_checkpoints
            WHERE scope_id = ?1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(scope_id)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    /// Record a checkpoint. Returns false if one already exists at that sequence.
    pub async fn save_checkpoint(
        pool: &SqlitePool,
        scope_id: &str,
        sequence: u64,
        hash: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_checkpoints (scope_id, sequence, hash, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (scope_id, sequence) DO NOTHING
            "#,
        )
        .bind(scope_id)
        .bind(to_sql_sequence(sequence)?)
        .bind(hash)
        .bind(canonical_timestamp(&Utc::now()))
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn scope_exists(pool: &SqlitePool, scope_id: &str) -> Result<bool> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT scope_id FROM ledger_scopes WHERE scope_id = ?1")
                .bind(scope_id)
                .fetch_optional(pool)
                .await?;
        Ok(found.is_some())
    }

    pub async fn register_scope(pool: &SqlitePool, scope_id: &str, owner_kind: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_scopes (scope_id, owner_kind, registered_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (scope_id) DO NOTHING
            "#,
        )
        .bind(scope_id)
        .bind(owner_kind)
        .bind(canonical_timestamp(&Utc::now()))
        .execute(pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn list_scopes(pool: &SqlitePool) -> Result<Vec<ScopeRow>> {
        let rows = sqlx::query_as::<_, ScopeRow>(
            "SELECT scope_id, owner_kind, registered_at FROM ledger_scopes ORDER BY scope_id",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Every scope that has at least one entry.
    pub async fn scopes_with_entries(pool: &SqlitePool) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT scope_id FROM ledger_entries ORDER BY scope_id")
                .fetch_all(pool)
                .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }
}
