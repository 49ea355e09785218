//! Canonical Payload Encoding
//!
//! Produces the exact bytes a ledger entry's hash commits to. Encoding is
//! RFC 8785 (JCS): recursively sorted object keys, compact separators,
//! UTF-8, and ECMAScript number formatting so `1`, `1.0` and `1.00` encode
//! identically.
//!
//! Every entry records the [`FormatVersion`] it was written with, and the
//! version number is itself part of the hashed payload. Verification always
//! re-encodes with the entry's own version, so chains written under an older
//! version stay verifiable after the writer moves on.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LedgerError, Result};
use crate::ledger::entry::ChainFields;

/// Encoding rule set used to build an entry's canonical payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FormatVersion {
    /// `{scope_id, actor_id, action, target_type, target_id, after_state, timestamp}`.
    V1,
    /// V1 plus `actor_role`, `before_state` and `sequence`.
    V2,
}

impl FormatVersion {
    pub const CURRENT: FormatVersion = FormatVersion::V1;

    pub fn as_u8(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

impl From<FormatVersion> for u8 {
    fn from(v: FormatVersion) -> Self {
        v.as_u8()
    }
}

impl TryFrom<u8> for FormatVersion {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        Self::from_u8(v).ok_or_else(|| format!("unknown ledger format version {}", v))
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Bytes produced only by [`CanonicalBytes::new`].
///
/// Hashing functions accept `&CanonicalBytes` rather than `&[u8]`, so no
/// code path can digest a payload that skipped canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalBytes(Vec<u8>);

impl CanonicalBytes {
    /// Canonicalize any serializable value.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` if the value cannot be represented
    /// as JSON (non-string map keys, non-finite numbers surfaced by the
    /// serializer) or if JCS serialization fails.
    pub fn new(value: &impl Serialize) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        check_numbers(&value)?;
        let bytes = serde_jcs::to_vec(&value)
            .map_err(|e| LedgerError::validation(format!("canonical encoding failed: {}", e)))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for CanonicalBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Parse caller-supplied JSON text into a state snapshot.
///
/// `NaN`, `Infinity` and out-of-range literals are not valid JSON and are
/// rejected here, before anything is hashed.
pub fn parse_state(text: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| LedgerError::validation(format!("invalid state JSON: {}", e)))?;
    check_numbers(&value)?;
    Ok(value)
}

fn check_numbers(value: &Value) -> Result<()> {
    match value {
        Value::Number(n) => {
            if n.is_f64() && !n.as_f64().map(f64::is_finite).unwrap_or(false) {
                return Err(LedgerError::validation(format!(
                    "non-finite number {} cannot be hashed",
                    n
                )));
            }
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(check_numbers),
        Value::Object(map) => map.values().try_for_each(check_numbers),
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
    }
}

/// Fixed-precision timestamp text used in payloads and storage.
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Serialize)]
struct PayloadV1<'a> {
    format: u8,
    scope_id: &'a str,
    actor_id: Option<&'a str>,
    action: &'a str,
    target_type: Option<&'a str>,
    target_id: Option<&'a str>,
    after_state: Option<&'a Value>,
    timestamp: String,
}

#[derive(Serialize)]
struct PayloadV2<'a> {
    format: u8,
    scope_id: &'a str,
    sequence: u64,
    actor_id: Option<&'a str>,
    actor_role: Option<&'a str>,
    action: &'a str,
    target_type: Option<&'a str>,
    target_id: Option<&'a str>,
    before_state: Option<&'a Value>,
    after_state: Option<&'a Value>,
    timestamp: String,
}

/// Build the canonical payload for an entry under `version`.
pub fn encode_payload(version: FormatVersion, fields: &ChainFields<'_>) -> Result<CanonicalBytes> {
    let timestamp = canonical_timestamp(fields.created_at);
    match version {
        FormatVersion::V1 => CanonicalBytes::new(&PayloadV1 {
            format: version.as_u8(),
            scope_id: fields.scope_id,
            actor_id: fields.actor_id,
            action: fields.action,
            target_type: fields.target_type,
            target_id: fields.target_id,
            after_state: fields.after_state,
            timestamp,
        }),
        FormatVersion::V2 => CanonicalBytes::new(&PayloadV2 {
            format: version.as_u8(),
            scope_id: fields.scope_id,
            sequence: fields.sequence,
            actor_id: fields.actor_id,
            actor_role: fields.actor_role,
            action: fields.action,
            target_type: fields.target_type,
            target_id: fields.target_id,
            before_state: fields.before_state,
            after_state: fields.after_state,
            timestamp,
        }),
    }
}
