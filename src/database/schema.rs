// Database schema definitions and migrations
// Applied in order by `Database::run_migrations`

pub const LEDGER_SCHEMA: &str = include_str!("../../migrations/001_ledger.sql");

pub const MIGRATIONS: &[(&str, &str)] = &[("001_ledger", LEDGER_SCHEMA)];
