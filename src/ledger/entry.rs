//! Ledger Entry
//!
//! Immutable chain records and the append request that produces them.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::ledger::canonical::{encode_payload, CanonicalBytes, FormatVersion};
use crate::ledger::hash::{abbreviate, chain_hash, ChainHash};
use crate::ledger::scope::ScopeId;

pub const MAX_ACTION_LEN: usize = 128;
pub const MAX_FIELD_LEN: usize = 256;

fn action_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$").expect("static action pattern")
    })
}

/// Who performed the action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Option<String>,
    pub role: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn system() -> Self {
        Self::default()
    }
}

/// Domain object affected by an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub target_type: String,
    pub target_id: Option<String>,
}

impl Target {
    pub fn new(target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            target_id: Some(target_id.into()),
        }
    }

    pub fn of_type(target_type: impl Into<String>) -> Self {
        Self {
            target_type: target_type.into(),
            target_id: None,
        }
    }
}

/// Caller input to an append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub scope_id: ScopeId,
    pub actor: Actor,
    pub action: String,
    pub target: Option<Target>,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl AppendRequest {
    pub fn new(scope_id: ScopeId, action: impl Into<String>) -> Self {
        Self {
            scope_id,
            actor: Actor::system(),
            action: action.into(),
            target: None,
            before: None,
            after: None,
        }
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn before(mut self, state: Value) -> Self {
        self.before = Some(state);
        self
    }

    pub fn after(mut self, state: Value) -> Self {
        self.after = Some(state);
        self
    }

    /// Shape checks run before anything is hashed or written.
    pub fn validate(&self, max_state_bytes: usize) -> Result<()> {
        if self.action.is_empty() || self.action.len() > MAX_ACTION_LEN {
            return Err(LedgerError::validation(format!(
                "action must be 1..={} bytes",
                MAX_ACTION_LEN
            )));
        }
        if !action_pattern().is_match(&self.action) {
            return Err(LedgerError::validation(format!(
                "action {:?} is not a dotted lowercase taxonomy name",
                self.action
            )));
        }

        check_text("actor id", self.actor.id.as_deref())?;
        check_text("actor role", self.actor.role.as_deref())?;
        if let Some(target) = &self.target {
            check_text("target type", Some(&target.target_type))?;
            check_text("target id", target.target_id.as_deref())?;
        }

        for (label, state) in [("before", &self.before), ("after", &self.after)] {
            if let Some(state) = state {
                let encoded = CanonicalBytes::new(state)?;
                if encoded.as_bytes().len() > max_state_bytes {
                    return Err(LedgerError::validation(format!(
                        "{} state is {} bytes, limit is {}",
                        label,
                        encoded.as_bytes().len(),
                        max_state_bytes
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_text(label: &str, value: Option<&str>) -> Result<()> {
    match value {
        None => Ok(()),
        Some(v) if v.trim().is_empty() => Err(LedgerError::validation(format!(
            "{} must not be blank when present",
            label
        ))),
        Some(v) if v.len() > MAX_FIELD_LEN => Err(LedgerError::validation(format!(
            "{} exceeds {} bytes",
            label, MAX_FIELD_LEN
        ))),
        Some(v) if v.chars().any(char::is_control) => Err(LedgerError::validation(format!(
            "{} contains control characters",
            label
        ))),
        Some(_) => Ok(()),
    }
}

/// Borrowed view of the fields a payload encoder may draw from.
#[derive(Debug, Clone, Copy)]
pub struct ChainFields<'a> {
    pub scope_id: &'a str,
    pub sequence: u64,
    pub actor_id: Option<&'a str>,
    pub actor_role: Option<&'a str>,
    pub action: &'a str,
    pub target_type: Option<&'a str>,
    pub target_id: Option<&'a str>,
    pub before_state: Option<&'a Value>,
    pub after_state: Option<&'a Value>,
    pub created_at: &'a DateTime<Utc>,
}

/// One immutable chain record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub scope_id: String,
    pub sequence: u64,
    pub actor_id: Option<String>,
    pub actor_role: Option<String>,
    pub action: String,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub format_version: u8,
    pub hash: String,
    pub previous_hash: Option<String>,
}

impl LedgerEntry {
    /// Build the entry that follows `previous` in `request.scope_id`.
    pub fn seal(
        request: &AppendRequest,
        id: Uuid,
        sequence: u64,
        previous: Option<&ChainHash>,
        created_at: DateTime<Utc>,
        format: FormatVersion,
    ) -> Result<Self> {
        let (target_type, target_id) = match &request.target {
            Some(t) => (Some(t.target_type.clone()), t.target_id.clone()),
            None => (None, None),
        };
        let mut entry = Self {
            id,
            scope_id: request.scope_id.to_string(),
            sequence,
            actor_id: request.actor.id.clone(),
            actor_role: request.actor.role.clone(),
            action: request.action.clone(),
            target_type,
            target_id,
            before_state: request.before.clone(),
            after_state: request.after.clone(),
            created_at,
            format_version: format.as_u8(),
            hash: String::new(),
            previous_hash: previous.map(ChainHash::to_hex),
        };
        entry.hash = entry.compute_hash(format, previous)?.to_hex();
        Ok(entry)
    }

    pub fn chain_fields(&self) -> ChainFields<'_> {
        ChainFields {
            scope_id: &self.scope_id,
            sequence: self.sequence,
            actor_id: self.actor_id.as_deref(),
            actor_role: self.actor_role.as_deref(),
            action: &self.action,
            target_type: self.target_type.as_deref(),
            target_id: self.target_id.as_deref(),
            before_state: self.before_state.as_ref(),
            after_state: self.after_state.as_ref(),
            created_at: &self.created_at,
        }
    }

    /// Recompute this entry's digest from its stored fields.
    pub fn compute_hash(
        &self,
        format: FormatVersion,
        previous: Option<&ChainHash>,
    ) -> Result<ChainHash> {
        let payload = encode_payload(format, &self.chain_fields())?;
        Ok(chain_hash(previous, &payload))
    }

    pub fn matches_target(&self, target_type: &str, target_id: &str) -> bool {
        self.target_type.as_deref() == Some(target_type)
            && self.target_id.as_deref() == Some(target_id)
    }

    pub fn summary(&self) -> String {
        format!(
            "#{} {} {}/{} ({})",
            self.sequence,
            self.action,
            self.target_type.as_deref().unwrap_or("-"),
            self.target_id.as_deref().unwrap_or("-"),
            abbreviate(&self.hash)
        )
    }
}

/// What a successful append hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub id: Uuid,
    pub sequence: u64,
    pub hash: String,
    pub previous_hash: Option<String>,
}

impl From<&LedgerEntry> for AppendReceipt {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            id: entry.id,
            sequence: entry.sequence,
            hash: entry.hash.clone(),
            previous_hash: entry.previous_hash.clone(),
        }
    }
}
