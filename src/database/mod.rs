pub mod models;
pub mod queries;
pub mod schema;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::config::LedgerConfig;
use crate::error::Result;
use models::{ChainTail, CheckpointRow, EntryRow, InsertOutcome, ScopeRow};
use queries::Queries;

/// Connection pool over the ledger tables.
///
/// Holds no chain state of its own: every tail read goes to the store, so
/// several processes can share one database file.
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(&LedgerConfig {
            database_url: database_url.to_string(),
            ..LedgerConfig::default()
        })
        .await
    }

    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.acquire_timeout())
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await?;

        info!("Connected to ledger database {}", config.database_url);
        Ok(Database { pool })
    }

    /// Single-connection in-memory database, mainly for tests.
    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;

        let db = Database { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        for (name, sql) in schema::MIGRATIONS {
            sqlx::raw_sql(sql).execute(&self.pool).await?;
            debug!("Applied migration {}", name);
        }
        Ok(())
    }

    pub async fn tail(&self, scope_id: &str) -> Result<Option<ChainTail>> {
        Queries::tail(&self.pool, scope_id).await
    }

    pub async fn insert_entry(&self, row: &EntryRow) -> Result<InsertOutcome> {
        Queries::insert_entry(&self.pool, row).await
    }

    pub async fn entries_page(
        &self,
        scope_id: &str,
        after: Option<u64>,
        upto: u64,
        limit: u32,
    ) -> Result<Vec<EntryRow>> {
        Queries::entries_page(&self.pool, scope_id, after, upto, limit).await
    }

    pub async fn target_page(
        &self,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        after: Option<u64>,
        upto: u64,
        limit: u32,
    ) -> Result<Vec<EntryRow>> {
        Queries::target_page(&self.pool, scope_id, target_type, target_id, after, upto, limit).await
    }

    pub async fn target_span(
        &self,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        upto: u64,
    ) -> Result<(u64, Option<u64>)> {
        Queries::target_span(&self.pool, scope_id, target_type, target_id, upto).await
    }

    pub async fn latest_checkpoint(&self, scope_id: &str) -> Result<Option<CheckpointRow>> {
        Queries::latest_checkpoint(&self.pool, scope_id).await
    }

    pub async fn save_checkpoint(&self, scope_id: &str, sequence: u64, hash: &str) -> Result<bool> {
        Queries::save_checkpoint(&self.pool, scope_id, sequence, hash).await
    }

    pub async fn scope_exists(&self, scope_id: &str) -> Result<bool> {
        Queries::scope_exists(&self.pool, scope_id).await
    }

    pub async fn register_scope(&self, scope_id: &str, owner_kind: &str) -> Result<bool> {
        Queries::register_scope(&self.pool, scope_id, owner_kind).await
    }

    pub async fn list_scopes(&self) -> Result<Vec<ScopeRow>> {
        Queries::list_scopes(&self.pool).await
    }

    pub async fn scopes_with_entries(&self) -> Result<Vec<String>> {
        Queries::scopes_with_entries(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::new_in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        assert!(db.tail("org-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_scope_once() {
        let db = Database::new_in_memory().await.unwrap();
        assert!(!db.scope_exists("org-1").await.unwrap());
        assert!(db.register_scope("org-1", "organization").await.unwrap());
        assert!(!db.register_scope("org-1", "organization").await.unwrap());
        assert!(db.scope_exists("org-1").await.unwrap());
        assert_eq!(db.list_scopes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let db = Database::new_in_memory().await.unwrap();
        let hash = "ab".repeat(32);
        assert!(db.save_checkpoint("org-1", 10, &hash).await.unwrap());
        assert!(!db.save_checkpoint("org-1", 10, &hash).await.unwrap());
        db.save_checkpoint("org-1", 20, &hash).await.unwrap();

        let latest = db.latest_checkpoint("org-1").await.unwrap().unwrap();
        assert_eq!(latest.sequence, 20);
        assert!(db.latest_checkpoint("org-2").await.unwrap().is_none());
    }
}
