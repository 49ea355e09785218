//! Chain Ledger
//!
//! Tamper-evident, append-only record of state changes. Each scope is an
//! independent SHA-256 hash chain: every entry commits to the canonical
//! encoding of its fields and to the hash of the entry before it.

pub mod append;
pub mod canonical;
pub mod entry;
pub mod export;
pub mod hash;
pub mod scope;
pub mod verify;

pub use append::ChainAppender;
pub use canonical::{CanonicalBytes, FormatVersion};
pub use entry::{Actor, AppendReceipt, AppendRequest, LedgerEntry, Target};
pub use export::{load_export_file, read_jsonl, to_jsonl, TrailExporter};
pub use hash::{chain_hash, ChainHash};
pub use scope::{Partition, ScopeId, ScopePolicy, ScopeResolver};
pub use verify::{
    verify_entries, BreakReason, ChainBreak, ChainVerificationResult, ChainVerifier,
    CheckpointOutcome,
};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::LedgerConfig;
use crate::database::Database;
use crate::error::Result;

/// Entry point over one ledger database.
#[derive(Clone)]
pub struct ChainLedger {
    database: Database,
    resolver: ScopeResolver,
    appender: ChainAppender,
    verifier: ChainVerifier,
    exporter: TrailExporter,
}

impl ChainLedger {
    /// Connect to the configured database and apply migrations.
    pub async fn open(config: &LedgerConfig) -> Result<Self> {
        config.validate()?;
        let database = Database::connect(config).await?;
        database.run_migrations().await?;
        Self::with_database(database, config)
    }

    pub fn with_database(database: Database, config: &LedgerConfig) -> Result<Self> {
        let resolver = ScopeResolver::new(database.clone(), config.scope_policy);
        let appender = ChainAppender::new(database.clone(), resolver.clone(), config)?;
        let verifier = ChainVerifier::new(
            database.clone(),
            config.verify_page_size,
            config.checkpoint_interval,
        );
        let exporter = TrailExporter::new(database.clone(), config.verify_page_size);

        info!(
            "Chain ledger ready (policy: {:?}, writing {})",
            resolver.policy(),
            appender.format()
        );
        Ok(Self {
            database,
            resolver,
            appender,
            verifier,
            exporter,
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn resolver(&self) -> &ScopeResolver {
        &self.resolver
    }

    /// Append and return the receipt handed to callers.
    pub async fn append(&self, request: &AppendRequest) -> Result<AppendReceipt> {
        let entry = self.appender.append(request).await?;
        Ok(AppendReceipt::from(&entry))
    }

    /// Append and return the full persisted entry.
    pub async fn append_entry(&self, request: &AppendRequest) -> Result<LedgerEntry> {
        self.appender.append(request).await
    }

    pub async fn register_scope(&self, scope: &ScopeId, owner_kind: &str) -> Result<bool> {
        self.resolver.register(scope, owner_kind).await
    }

    pub async fn verify(
        &self,
        scope_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChainVerificationResult> {
        self.verifier.verify(scope_id, cancel).await
    }

    pub async fn verify_resumed(
        &self,
        scope_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChainVerificationResult> {
        self.verifier.verify_resumed(scope_id, cancel).await
    }

    pub async fn verify_and_checkpoint(
        &self,
        scope_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CheckpointOutcome> {
        self.verifier.verify_and_checkpoint(scope_id, cancel).await
    }

    pub async fn verify_for_target(
        &self,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChainVerificationResult> {
        self.verifier
            .verify_for_target(scope_id, target_type, target_id, cancel)
            .await
    }

    /// Verify every scope that holds entries.
    pub async fn verify_all(&self, cancel: &CancellationToken) -> Result<Vec<ChainVerificationResult>> {
        let mut results = Vec::new();
        for scope_id in self.database.scopes_with_entries().await? {
            results.push(self.verifier.verify(&scope_id, cancel).await?);
        }
        Ok(results)
    }

    pub async fn trail(
        &self,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<LedgerEntry>> {
        self.exporter
            .trail(scope_id, target_type, target_id, cancel)
            .await
    }

    pub async fn export_trail(
        &self,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        self.exporter
            .export_trail(scope_id, target_type, target_id, cancel)
            .await
    }

    pub async fn entries(&self, scope_id: &str, cancel: &CancellationToken) -> Result<Vec<LedgerEntry>> {
        self.exporter.scope_entries(scope_id, cancel).await
    }

    pub async fn export_scope(&self, scope_id: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        self.exporter.export_scope(scope_id, cancel).await
    }

    pub async fn close(&self) {
        self.database.close().await;
    }
}
