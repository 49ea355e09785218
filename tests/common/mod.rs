use chain_ledger::config::LedgerConfig;
use chain_ledger::database::Database;
use chain_ledger::ledger::{Actor, AppendRequest, ChainLedger, ScopeId};
use tempfile::TempDir;

/// Ledger over a file-backed SQLite database that lives as long as the struct.
pub struct TestLedger {
    pub ledger: ChainLedger,
    pub config: LedgerConfig,
    _dir: TempDir,
}

impl TestLedger {
    pub fn database(&self) -> &Database {
        self.ledger.database()
    }

    /// Second ledger handle over the same file, e.g. with a different writer format.
    pub async fn reopen_with(&self, adjust: impl FnOnce(&mut LedgerConfig)) -> ChainLedger {
        let mut config = self.config.clone();
        adjust(&mut config);
        ChainLedger::open(&config)
            .await
            .expect("Failed to reopen test ledger")
    }
}

/// Setup a ledger with default settings on a temporary database file
pub async fn setup_ledger() -> TestLedger {
    setup_ledger_with(|_| {}).await
}

pub async fn setup_ledger_with(adjust: impl FnOnce(&mut LedgerConfig)) -> TestLedger {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("ledger.db");
    let mut config = LedgerConfig {
        database_url: format!("sqlite://{}", path.display()),
        ..LedgerConfig::default()
    };
    adjust(&mut config);

    let ledger = ChainLedger::open(&config)
        .await
        .expect("Failed to open test ledger");
    TestLedger {
        ledger,
        config,
        _dir: dir,
    }
}

pub fn request(scope: &str, action: &str) -> AppendRequest {
    AppendRequest::new(ScopeId::new(scope).expect("valid scope"), action)
        .actor(Actor::new("user-1").with_role("admin"))
}

/// Remove the append-only triggers so tests can tamper with stored rows.
pub async fn drop_append_only_guards(db: &Database) {
    sqlx::raw_sql(
        "DROP TRIGGER IF EXISTS ledger_entries_no_update;
         DROP TRIGGER IF EXISTS ledger_entries_no_delete;",
    )
    .execute(&db.pool)
    .await
    .expect("Failed to drop triggers");
}

pub async fn tamper(db: &Database, sql: &str, id: &str) {
    drop_append_only_guards(db).await;
    sqlx::query(sql)
        .bind(id)
        .execute(&db.pool)
        .await
        .expect("Failed to tamper with entry");
}
