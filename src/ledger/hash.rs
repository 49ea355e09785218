//! Chain Hash
//!
//! SHA-256 over `(previous hash, canonical payload)`:
//!
//! ```text
//! "chain-ledger/entry" 0x00
//! 0x00 <32 zero bytes>          no predecessor
//! 0x01 <32-byte previous hash>  otherwise
//! 0x1e
//! <canonical payload bytes>
//! ```
//!
//! The predecessor field is fixed-width and tagged, so the sentinel can
//! never be confused with a real all-zero digest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LedgerError, Result};
use crate::ledger::canonical::CanonicalBytes;

const DOMAIN_TAG: &[u8] = b"chain-ledger/entry\x00";
const GENESIS_SENTINEL: [u8; 32] = [0u8; 32];
const PAYLOAD_SEPARATOR: u8 = 0x1e;

/// Characters shown by [`ChainHash::short`].
pub const SHORT_HASH_LEN: usize = 12;

/// Full 256-bit entry digest. Rendered as 64 lowercase hex chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainHash([u8; 32]);

impl ChainHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a stored digest. Only the full 64-char lowercase form is accepted;
    /// a truncated display hash is rejected rather than prefix-matched.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(LedgerError::integrity(format!(
                "malformed chain hash {:?}: expected 64 lowercase hex characters",
                s
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| LedgerError::integrity(format!("malformed chain hash: {}", e)))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated form for log lines. Never compare against this.
    pub fn short(&self) -> String {
        abbreviate(&self.to_hex()).to_string()
    }
}

/// Display prefix of a stored hex digest, as used by [`ChainHash::short`].
pub fn abbreviate(hex: &str) -> &str {
    hex.get(..SHORT_HASH_LEN).unwrap_or(hex)
}

impl std::fmt::Display for ChainHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<ChainHash> for String {
    fn from(h: ChainHash) -> Self {
        h.to_hex()
    }
}

impl TryFrom<String> for ChainHash {
    type Error = LedgerError;

    fn try_from(s: String) -> Result<Self> {
        Self::from_hex(&s)
    }
}

/// Compute the digest linking `payload` to `previous`.
pub fn chain_hash(previous: Option<&ChainHash>, payload: &CanonicalBytes) -> ChainHash {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    match previous {
        Some(prev) => {
            hasher.update([0x01]);
            hasher.update(prev.as_bytes());
        }
        None => {
            hasher.update([0x00]);
            hasher.update(GENESIS_SENTINEL);
        }
    }
    hasher.update([PAYLOAD_SEPARATOR]);
    hasher.update(payload.as_bytes());
    ChainHash(hasher.finalize().into())
}
