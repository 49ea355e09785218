//! Chain Verification
//!
//! Replays a scope oldest to newest, checking for every entry that
//! its sequence equals its position, that `previous_hash` equals the hash
//! of the entry before it, and that recomputing the hash from the stored
//! fields (with the entry's own format version) reproduces the stored hash.
//!
//! A run fixes its snapshot (the tail sequence) when it starts and reads in
//! pages up to it, so concurrent appends neither block it nor change its
//! answer. A broken chain is reported in the result, never as an error.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::database::models::{CheckpointRow, EntryRow};
use crate::database::Database;
use crate::error::{LedgerError, Result};
use crate::ledger::canonical::FormatVersion;
use crate::ledger::entry::LedgerEntry;
use crate::ledger::hash::ChainHash;

/// Why verification stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    PreviousHashMismatch,
    HashMismatch,
    UnknownFormatVersion,
    SequenceGap,
    MalformedRecord,
    TruncatedBelowCheckpoint,
}

impl std::fmt::Display for BreakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PreviousHashMismatch => "previous hash mismatch",
            Self::HashMismatch => "hash mismatch",
            Self::UnknownFormatVersion => "unknown format version",
            Self::SequenceGap => "sequence gap",
            Self::MalformedRecord => "malformed record",
            Self::TruncatedBelowCheckpoint => "chain truncated below checkpoint",
        };
        f.write_str(s)
    }
}

/// First failing link found by a verification run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    pub index: u64,
    pub entry_id: Option<String>,
    pub reason: BreakReason,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerificationResult {
    pub scope_id: String,
    pub valid: bool,
    pub total_entries: u64,
    pub broken_at_index: Option<u64>,
    pub broken_entry_id: Option<String>,
    pub reason: Option<BreakReason>,
    pub detail: Option<String>,
    /// Hash of the last entry covered by this run.
    pub tail_hash: Option<String>,
    /// Checkpoint sequence the run trusted instead of replaying.
    pub resumed_from: Option<u64>,
}

impl ChainVerificationResult {
    fn valid(scope_id: &str, total_entries: u64, tail_hash: Option<String>) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            valid: true,
            total_entries,
            broken_at_index: None,
            broken_entry_id: None,
            reason: None,
            detail: None,
            tail_hash,
            resumed_from: None,
        }
    }

    fn broken(scope_id: &str, total_entries: u64, brk: ChainBreak) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            valid: false,
            total_entries,
            broken_at_index: Some(brk.index),
            broken_entry_id: brk.entry_id,
            reason: Some(brk.reason),
            detail: Some(brk.detail),
            tail_hash: None,
            resumed_from: None,
        }
    }

    pub fn summary(&self) -> String {
        if self.valid {
            format!(
                "✅ Scope {} is intact ({} entries)",
                self.scope_id, self.total_entries
            )
        } else {
            format!(
                "❌ Scope {} is broken at index {} ({}): {}",
                self.scope_id,
                self.broken_at_index.unwrap_or_default(),
                self.reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                self.detail.as_deref().unwrap_or("no detail")
            )
        }
    }
}

/// Where a walk begins.
#[derive(Debug, Clone)]
struct WalkStart {
    index: u64,
    expected_previous: Option<ChainHash>,
}

impl WalkStart {
    fn genesis() -> Self {
        Self {
            index: 0,
            expected_previous: None,
        }
    }
}

#[derive(Debug)]
struct WalkOutcome {
    /// Index after the last entry that passed.
    next_index: u64,
    last_hash: Option<ChainHash>,
    broken: Option<ChainBreak>,
}

/// Check one entry at `index` against the running expected predecessor.
pub fn check_entry(
    entry: &LedgerEntry,
    index: u64,
    expected_previous: Option<&ChainHash>,
) -> std::result::Result<ChainHash, ChainBreak> {
    let fail = |reason: BreakReason, detail: String| ChainBreak {
        index,
        entry_id: Some(entry.id.to_string()),
        reason,
        detail,
    };

    if entry.sequence != index {
        return Err(fail(
            BreakReason::SequenceGap,
            format!("expected sequence {}, found {}", index, entry.sequence),
        ));
    }

    let expected_hex = expected_previous.map(ChainHash::to_hex);
    if entry.previous_hash != expected_hex {
        return Err(fail(
            BreakReason::PreviousHashMismatch,
            format!(
                "expected previous hash {}, found {}",
                expected_hex.as_deref().unwrap_or("<none>"),
                entry.previous_hash.as_deref().unwrap_or("<none>")
            ),
        ));
    }

    let format = FormatVersion::from_u8(entry.format_version).ok_or_else(|| {
        fail(
            BreakReason::UnknownFormatVersion,
            format!("format version {} is not recognised", entry.format_version),
        )
    })?;

    let recomputed = entry
        .compute_hash(format, expected_previous)
        .map_err(|e| fail(BreakReason::MalformedRecord, e.to_string()))?;
    if recomputed.to_hex() != entry.hash {
        return Err(fail(
            BreakReason::HashMismatch,
            format!("stored hash {} does not match recomputed {}", entry.hash, recomputed),
        ));
    }

    Ok(recomputed)
}

/// Convert a stored row, classifying unreadable rows as breaks.
fn decode_row(row: EntryRow, index: u64) -> std::result::Result<LedgerEntry, ChainBreak> {
    let known_format = u8::try_from(row.format_version)
        .ok()
        .and_then(FormatVersion::from_u8)
        .is_some();
    if !known_format {
        return Err(ChainBreak {
            index,
            entry_id: Some(row.id.clone()),
            reason: BreakReason::UnknownFormatVersion,
            detail: format!("format version {} is not recognised", row.format_version),
        });
    }
    let id = row.id.clone();
    LedgerEntry::try_from(row).map_err(|e| ChainBreak {
        index,
        entry_id: Some(id),
        reason: BreakReason::MalformedRecord,
        detail: e.to_string(),
    })
}

/// Verify an already-loaded, ordered slice holding a whole scope.
pub fn verify_entries(scope_id: &str, entries: &[LedgerEntry]) -> ChainVerificationResult {
    let mut expected: Option<ChainHash> = None;
    for (i, entry) in entries.iter().enumerate() {
        let index = i as u64;
        if entry.scope_id != scope_id {
            return ChainVerificationResult::broken(
                scope_id,
                entries.len() as u64,
                ChainBreak {
                    index,
                    entry_id: Some(entry.id.to_string()),
                    reason: BreakReason::MalformedRecord,
                    detail: format!("entry belongs to scope {}", entry.scope_id),
                },
            );
        }
        match check_entry(entry, index, expected.as_ref()) {
            Ok(hash) => expected = Some(hash),
            Err(brk) => return ChainVerificationResult::broken(scope_id, entries.len() as u64, brk),
        }
    }
    ChainVerificationResult::valid(
        scope_id,
        entries.len() as u64,
        expected.map(|h| h.to_hex()),
    )
}

/// Outcome of [`ChainVerifier::verify_and_checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointOutcome {
    pub result: ChainVerificationResult,
    /// Sequence of the checkpoint written by this run, if any.
    pub checkpoint: Option<u64>,
}

#[derive(Clone)]
pub struct ChainVerifier {
    database: Database,
    page_size: u32,
    checkpoint_interval: u64,
}

impl ChainVerifier {
    pub fn new(database: Database, page_size: u32, checkpoint_interval: u64) -> Self {
        Self {
            database,
            page_size: page_size.max(1),
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    /// Full replay from genesis.
    pub async fn verify(
        &self,
        scope_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChainVerificationResult> {
        let Some(tail) = self.database.tail(scope_id).await? else {
            debug!("Scope {} has no entries", scope_id);
            return Ok(ChainVerificationResult::valid(scope_id, 0, None));
        };

        let walk = self
            .walk(scope_id, WalkStart::genesis(), tail.sequence, cancel)
            .await?;
        Ok(self.finish(scope_id, tail.sequence + 1, walk, None))
    }

    /// Replay from the newest checkpoint, trusting its hash.
    pub async fn verify_resumed(
        &self,
        scope_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChainVerificationResult> {
        let checkpoint = self.database.latest_checkpoint(scope_id).await?;
        let tail = self.database.tail(scope_id).await?;

        let Some(checkpoint) = checkpoint else {
            return self.verify(scope_id, cancel).await;
        };
        let cp_sequence = u64::try_from(checkpoint.sequence).map_err(|_| {
            LedgerError::integrity(format!("checkpoint for {} has negative sequence", scope_id))
        })?;
        let cp_hash = ChainHash::from_hex(&checkpoint.hash)?;

        let present = tail.as_ref().map(|t| t.sequence + 1).unwrap_or(0);
        let Some(tail) = tail.filter(|t| t.sequence >= cp_sequence) else {
            let result = ChainVerificationResult::broken(
                scope_id,
                present,
                ChainBreak {
                    index: present,
                    entry_id: None,
                    reason: BreakReason::TruncatedBelowCheckpoint,
                    detail: format!(
                        "checkpoint covers sequence {} but the chain holds {} entries",
                        cp_sequence, present
                    ),
                },
            );
            warn!("{}", result.summary());
            return Ok(result);
        };

        if let Some(brk) = self.check_checkpoint_anchor(scope_id, &checkpoint, cp_sequence).await? {
            let mut result = ChainVerificationResult::broken(scope_id, tail.sequence + 1, brk);
            result.resumed_from = Some(cp_sequence);
            warn!("{}", result.summary());
            return Ok(result);
        }

        let start = WalkStart {
            index: cp_sequence + 1,
            expected_previous: Some(cp_hash),
        };
        let walk = self.walk(scope_id, start, tail.sequence, cancel).await?;
        Ok(self.finish(scope_id, tail.sequence + 1, walk, Some(cp_sequence)))
    }

    /// Resumed verification that records a new checkpoint at the snapshot
    /// tail once `checkpoint_interval` entries have passed since the last one.
    pub async fn verify_and_checkpoint(
        &self,
        scope_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CheckpointOutcome> {
        let result = self.verify_resumed(scope_id, cancel).await?;
        if !result.valid || result.total_entries == 0 {
            return Ok(CheckpointOutcome {
                result,
                checkpoint: None,
            });
        }

        let tail_sequence = result.total_entries - 1;
        let since_last = match result.resumed_from {
            Some(cp) => tail_sequence - cp,
            None => result.total_entries,
        };
        if since_last < self.checkpoint_interval {
            return Ok(CheckpointOutcome {
                result,
                checkpoint: None,
            });
        }

        let Some(tail_hash) = result.tail_hash.as_deref() else {
            return Ok(CheckpointOutcome {
                result,
                checkpoint: None,
            });
        };
        self.database
            .save_checkpoint(scope_id, tail_sequence, tail_hash)
            .await?;
        info!("Checkpointed scope {} at #{}", scope_id, tail_sequence);

        Ok(CheckpointOutcome {
            result,
            checkpoint: Some(tail_sequence),
        })
    }

    /// Verify the part of the chain that a target's history depends on:
    /// every entry up to and including the target's newest entry.
    /// `total_entries` counts the target's entries.
    pub async fn verify_for_target(
        &self,
        scope_id: &str,
        target_type: &str,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ChainVerificationResult> {
        let Some(tail) = self.database.tail(scope_id).await? else {
            return Ok(ChainVerificationResult::valid(scope_id, 0, None));
        };
        let (count, last) = self
            .database
            .target_span(scope_id, target_type, target_id, tail.sequence)
            .await?;
        let Some(last) = last else {
            return Ok(ChainVerificationResult::valid(scope_id, 0, None));
        };

        let walk = self.walk(scope_id, WalkStart::genesis(), last, cancel).await?;
        Ok(self.finish(scope_id, count, walk, None))
    }

    async fn check_checkpoint_anchor(
        &self,
        scope_id: &str,
        checkpoint: &CheckpointRow,
        cp_sequence: u64,
    ) -> Result<Option<ChainBreak>> {
        let after = cp_sequence.checked_sub(1);
        let rows = self
            .database
            .entries_page(scope_id, after, cp_sequence, 1)
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(Some(ChainBreak {
                index: cp_sequence,
                entry_id: None,
                reason: BreakReason::SequenceGap,
                detail: format!("checkpointed entry #{} is missing", cp_sequence),
            }));
        };
        if row.hash != checkpoint.hash {
            return Ok(Some(ChainBreak {
                index: cp_sequence,
                entry_id: Some(row.id),
                reason: BreakReason::HashMismatch,
                detail: format!(
                    "stored hash {} differs from checkpointed {}",
                    row.hash, checkpoint.hash
                ),
            }));
        }
        Ok(None)
    }

    async fn walk(
        &self,
        scope_id: &str,
        start: WalkStart,
        upto: u64,
        cancel: &CancellationToken,
    ) -> Result<WalkOutcome> {
        let mut index = start.index;
        let mut expected = start.expected_previous;
        let mut cursor = index.checked_sub(1);

        while index <= upto {
            if cancel.is_cancelled() {
                debug!("Verification of {} cancelled at #{}", scope_id, index);
                return Err(LedgerError::Cancelled);
            }

            let rows = self
                .database
                .entries_page(scope_id, cursor, upto, self.page_size)
                .await?;
            if rows.is_empty() {
                // the snapshot promised more entries than the store returned
                return Ok(WalkOutcome {
                    next_index: index,
                    last_hash: expected,
                    broken: Some(ChainBreak {
                        index,
                        entry_id: None,
                        reason: BreakReason::SequenceGap,
                        detail: format!("entry #{} is missing", index),
                    }),
                });
            }

            for row in rows {
                cursor = u64::try_from(row.sequence).ok().or(cursor);
                let checked = decode_row(row, index)
                    .and_then(|entry| check_entry(&entry, index, expected.as_ref()));
                match checked {
                    Ok(hash) => {
                        expected = Some(hash);
                        index += 1;
                    }
                    Err(brk) => {
                        return Ok(WalkOutcome {
                            next_index: index,
                            last_hash: expected,
                            broken: Some(brk),
                        });
                    }
                }
            }
        }

        Ok(WalkOutcome {
            next_index: index,
            last_hash: expected,
            broken: None,
        })
    }

    fn finish(
        &self,
        scope_id: &str,
        total_entries: u64,
        walk: WalkOutcome,
        resumed_from: Option<u64>,
    ) -> ChainVerificationResult {
        let mut result = match walk.broken {
            None => ChainVerificationResult::valid(
                scope_id,
                total_entries,
                walk.last_hash.map(|h| h.to_hex()),
            ),
            Some(brk) => ChainVerificationResult::broken(scope_id, total_entries, brk),
        };
        result.resumed_from = resumed_from;

        if result.valid {
            info!(
                "Verified scope {}: {} entries intact (checked {})",
                scope_id, result.total_entries, walk.next_index
            );
        } else {
            warn!("{}", result.summary());
        }
        result
    }
}
