//! Chain Append
//!
//! Appends are optimistic: read the scope's tail, seal the next entry
//! against it, then insert. The store's uniqueness constraints on
//! `(scope_id, sequence)` and `(scope_id, previous_hash)` turn a lost race
//! into a `TailMoved` outcome instead of a fork, and the append re-reads
//! the tail and tries again, up to a bounded number of attempts.

use std::time::Duration;

use chrono::{DurationRound, TimeDelta, Utc};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::database::models::{EntryRow, InsertOutcome};
use crate::database::Database;
use crate::error::{LedgerError, Result};
use crate::ledger::canonical::FormatVersion;
use crate::ledger::entry::{AppendRequest, LedgerEntry};
use crate::ledger::hash::ChainHash;
use crate::ledger::scope::ScopeResolver;

#[derive(Clone)]
pub struct ChainAppender {
    database: Database,
    resolver: ScopeResolver,
    format: FormatVersion,
    max_attempts: u32,
    backoff: Duration,
    timeout: Duration,
    max_state_bytes: usize,
}

impl ChainAppender {
    pub fn new(database: Database, resolver: ScopeResolver, config: &LedgerConfig) -> Result<Self> {
        Ok(Self {
            database,
            resolver,
            format: config.writer_format()?,
            max_attempts: config.append_max_retries,
            backoff: config.retry_backoff(),
            timeout: config.append_timeout(),
            max_state_bytes: config.max_state_bytes,
        })
    }

    pub fn format(&self) -> FormatVersion {
        self.format
    }

    /// Validate, resolve and append. Returns the persisted entry.
    ///
    /// `append_timeout` bounds tail reads and retry waits only. Once an
    /// insert is issued it runs to completion, so `Timeout` always means
    /// nothing was written.
    pub async fn append(&self, request: &AppendRequest) -> Result<LedgerEntry> {
        request.validate(self.max_state_bytes)?;
        self.resolver.ensure_writable(&request.scope_id).await?;
        self.append_with_retry(request).await
    }

    async fn append_with_retry(&self, request: &AppendRequest) -> Result<LedgerEntry> {
        let scope = request.scope_id.as_str();
        let id = Uuid::new_v4();
        let deadline = Instant::now() + self.timeout;

        for attempt in 1..=self.max_attempts {
            let tail = match tokio::time::timeout_at(deadline, self.database.tail(scope)).await {
                Ok(tail) => tail?,
                Err(_) => return Err(self.timed_out(scope, attempt)),
            };
            let (sequence, previous) = match tail {
                None => (0, None),
                Some(tail) => {
                    // never extend a chain whose tail we cannot parse
                    let prev = ChainHash::from_hex(&tail.hash)?;
                    (tail.sequence + 1, Some(prev))
                }
            };

            let entry = LedgerEntry::seal(
                request,
                id,
                sequence,
                previous.as_ref(),
                now_millis(),
                self.format,
            )?;
            let row = EntryRow::from_entry(&entry)?;

            if Instant::now() >= deadline {
                return Err(self.timed_out(scope, attempt));
            }

            match self.database.insert_entry(&row).await? {
                InsertOutcome::Inserted => {
                    debug!("Appended {} to scope {}", entry.summary(), scope);
                    return Ok(entry);
                }
                InsertOutcome::TailMoved => {
                    warn!(
                        "Tail of scope {} moved past #{} (attempt {}/{})",
                        scope, sequence, attempt, self.max_attempts
                    );
                    if attempt < self.max_attempts {
                        let delay = retry_delay(self.backoff, attempt);
                        if Instant::now() + delay >= deadline {
                            return Err(self.timed_out(scope, attempt));
                        }
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(LedgerError::Conflict {
            scope: scope.to_string(),
            attempts: self.max_attempts,
        })
    }

    fn timed_out(&self, scope: &str, attempt: u32) -> LedgerError {
        warn!(
            "Append to scope {} timed out after {:?} (attempt {}/{})",
            scope, self.timeout, attempt, self.max_attempts
        );
        LedgerError::Timeout(self.timeout)
    }
}

/// Millisecond-precision now, matching the stored timestamp precision.
fn now_millis() -> chrono::DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now)
}

/// Exponential backoff with up to one base interval of jitter.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    let jitter = if base_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=base_ms)
    };
    Duration::from_millis(exp + jitter)
}
