//! Dedup/idempotency ledger.
//!
//! The ledger is the only state shared between concurrent pipeline runs.
//! `admit` is an atomic check-and-set: for any message id, exactly one
//! caller gets `Admitted` until the run reports back through `complete`
//! or `fail`.
//!
//! An admission carries a lease number (the id's admission count). The
//! holder keeps the claim alive with `renew`; writes made under a lease
//! that has since been reclaimed are ignored.
//!
//! Two implementations share the contract:
//! - [`MemoryLedger`]: single-process, a mutex around a map.
//! - [`LibSqlLedger`]: a libSQL file, survives restarts.

mod libsql_ledger;
mod memory;
mod migrations;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::LedgerConfig;
use crate::error::DatabaseError;
use crate::pipeline::types::{FailureKind, RunOutcome};

pub use self::libsql_ledger::LibSqlLedger;
pub use self::memory::MemoryLedger;

/// Result of asking the ledger for permission to process a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The caller owns the message id until it calls `complete` or `fail`.
    Admitted { lease: u32 },
    /// Another run holds the id.
    DuplicateInProgress,
    /// The id already reached a terminal outcome. Never reprocessed.
    DuplicateCompleted,
    /// The id failed recently and is cooling down.
    RecentlyFailed { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    /// Lease number to present to `renew`, `complete` and `fail`.
    pub fn lease(&self) -> Option<u32> {
        match self {
            Self::Admitted { lease } => Some(*lease),
            _ => None,
        }
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admitted { lease } => write!(f, "ADMITTED (lease {lease})"),
            Self::DuplicateInProgress => write!(f, "DUPLICATE_IN_PROGRESS"),
            Self::DuplicateCompleted => write!(f, "DUPLICATE_COMPLETED"),
            Self::RecentlyFailed { retry_after } => {
                write!(f, "RECENTLY_FAILED (retry in {}s)", retry_after.as_secs())
            }
        }
    }
}

/// Ledger status of a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    InProgress,
    Completed,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the ledger remembers about one message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub message_id: String,
    pub status: LedgerStatus,
    /// Terminal outcome or failure kind, e.g. `DRAFT_SAVED`, `SAVE_FAILED`.
    pub detail: Option<String>,
    /// How many times the id has been admitted.
    pub admissions: u32,
    pub updated_at: DateTime<Utc>,
}

/// Decide whether an existing entry may be claimed again. `None` means
/// reclaimable; otherwise the refusal to report.
///
/// Shared by both implementations so they agree on cooldown and lease
/// arithmetic.
pub(crate) fn decide(
    status: LedgerStatus,
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &LedgerConfig,
) -> Option<Admission> {
    let elapsed = (now - updated_at).to_std().unwrap_or(Duration::ZERO);
    match status {
        LedgerStatus::Completed => Some(Admission::DuplicateCompleted),
        LedgerStatus::InProgress if elapsed >= config.in_progress_lease => None,
        LedgerStatus::InProgress => Some(Admission::DuplicateInProgress),
        LedgerStatus::Failed if elapsed >= config.failed_cooldown => None,
        LedgerStatus::Failed => Some(Admission::RecentlyFailed {
            retry_after: config.failed_cooldown - elapsed,
        }),
    }
}

/// How often a live run renews its claim: a third of the lease, so two
/// missed renewals still leave it held.
pub(crate) fn renew_interval(config: &LedgerConfig) -> Duration {
    (config.in_progress_lease / 3).max(Duration::from_millis(10))
}

/// Dedup ledger contract.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Atomically claim `message_id` for processing.
    async fn admit(&self, message_id: &str) -> Result<Admission, DatabaseError>;

    /// Refresh the claim held under `lease`. Returns `false` when the
    /// claim is no longer held (reclaimed or already terminal).
    async fn renew(&self, message_id: &str, lease: u32) -> Result<bool, DatabaseError>;

    /// Record a terminal success (skipped or saved). The id is never
    /// admitted again. Returns `false`, writing nothing, when `lease` was
    /// superseded.
    async fn complete(
        &self,
        message_id: &str,
        lease: u32,
        outcome: &RunOutcome,
    ) -> Result<bool, DatabaseError>;

    /// Record a failure. The id becomes admittable after the cooldown.
    /// Fenced by `lease` like `complete`.
    async fn fail(
        &self,
        message_id: &str,
        lease: u32,
        kind: FailureKind,
    ) -> Result<bool, DatabaseError>;

    /// How often the holder of a lease should call `renew`.
    fn renew_interval(&self) -> Duration;

    /// Look up the entry for an id.
    async fn entry(&self, message_id: &str) -> Result<Option<LedgerEntry>, DatabaseError>;
}

/// Open the ledger described by `config`: libSQL when a path is set,
/// in-memory otherwise.
pub async fn open(config: &LedgerConfig) -> Result<Arc<dyn Ledger>, DatabaseError> {
    match &config.db_path {
        Some(path) => Ok(Arc::new(LibSqlLedger::open(path, config.clone()).await?)),
        None => {
            info!("Using in-memory ledger; dedup state is lost on restart");
            Ok(Arc::new(MemoryLedger::new(config.clone())))
        }
    }
}
