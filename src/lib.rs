pub mod config;
pub mod database;
pub mod error;
pub mod ledger;

pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use ledger::{
    Actor, AppendReceipt, AppendRequest, ChainLedger, ChainVerificationResult, LedgerEntry,
    Partition, ScopeId, Target,
};
