//! Scope Resolution
//!
//! A scope is the partition key of one independent chain. Owners in the
//! different ledgers (audit trail, share ledger, close-period audit) are
//! namespaced so an organization's audit chain never shares links with its
//! share-ledger chain.

use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::{LedgerError, Result};

pub const MAX_SCOPE_LEN: usize = 128;

/// Validated partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopeId(String);

impl ScopeId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(LedgerError::validation("scope id must not be empty"));
        }
        if id.len() > MAX_SCOPE_LEN {
            return Err(LedgerError::validation(format!(
                "scope id exceeds {} bytes",
                MAX_SCOPE_LEN
            )));
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(LedgerError::validation(format!(
                "scope id {:?} contains whitespace or control characters",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ScopeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ScopeId> for String {
    fn from(s: ScopeId) -> Self {
        s.0
    }
}

impl TryFrom<String> for ScopeId {
    type Error = LedgerError;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl std::str::FromStr for ScopeId {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Ledger family an owner's chain belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    AuditTrail,
    ShareLedger,
    ClosePeriod,
}

impl Partition {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::AuditTrail => "audit",
            Self::ShareLedger => "shares",
            Self::ClosePeriod => "close",
        }
    }
}

/// Whether appends require the scope to be registered first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopePolicy {
    #[default]
    Open,
    Registered,
}

/// Maps logical owners to chains and enforces the scope policy.
#[derive(Clone)]
pub struct ScopeResolver {
    database: Database,
    policy: ScopePolicy,
}

impl ScopeResolver {
    pub fn new(database: Database, policy: ScopePolicy) -> Self {
        Self { database, policy }
    }

    pub fn policy(&self) -> ScopePolicy {
        self.policy
    }

    /// Scope id for `owner` within `partition`, e.g. `shares:org-1`.
    pub fn resolve(&self, partition: Partition, owner: &str) -> Result<ScopeId> {
        scope_for(partition, owner)
    }

    /// Confirm `scope` may receive appends.
    pub async fn ensure_writable(&self, scope: &ScopeId) -> Result<()> {
        match self.policy {
            ScopePolicy::Open => Ok(()),
            ScopePolicy::Registered => {
                if self.database.scope_exists(scope.as_str()).await? {
                    Ok(())
                } else {
                    Err(LedgerError::NotFound(format!("scope {} is not registered", scope)))
                }
            }
        }
    }

    /// Register a scope owner. Re-registering is a no-op.
    pub async fn register(&self, scope: &ScopeId, owner_kind: &str) -> Result<bool> {
        self.database.register_scope(scope.as_str(), owner_kind).await
    }
}

pub fn scope_for(partition: Partition, owner: &str) -> Result<ScopeId> {
    if owner.is_empty() {
        return Err(LedgerError::validation("owner id must not be empty"));
    }
    ScopeId::new(format!("{}:{}", partition.prefix(), owner))
}
