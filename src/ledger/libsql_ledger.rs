//! libSQL-backed ledger.
//!
//! `admit` is one UPSERT whose conflict branch only fires for reclaimable
//! rows (failed past cooldown, in-progress past lease), so the
//! check-and-set happens inside a single statement. Later writes match on
//! the admission count as well, so a reclaimed run cannot touch the row.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use super::{
    Admission, Ledger, LedgerEntry, LedgerStatus, decide, migrations, renew_interval,
};
use crate::config::LedgerConfig;
use crate::error::DatabaseError;
use crate::pipeline::types::{FailureKind, RunOutcome};

/// Attempts at resolving an admit that raced with a status change.
const ADMIT_ROUNDS: usize = 3;

/// Durable ledger on a local libSQL file.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    config: LedgerConfig,
}

impl LibSqlLedger {
    /// Open (or create) a ledger file and run migrations.
    pub async fn open(path: &Path, config: LedgerConfig) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let ledger = Self::from_database(db, config).await?;
        info!(path = %path.display(), "Ledger database opened");
        Ok(ledger)
    }

    /// In-memory database (for tests).
    pub async fn new_memory(config: LedgerConfig) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, config).await
    }

    async fn from_database(db: LibSqlDatabase, config: LedgerConfig) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            config,
        })
    }

    /// Claim the row, returning the new lease when it was taken.
    async fn try_claim(
        &self,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, DatabaseError> {
        let now_str = timestamp(now);
        let failed_before = timestamp(shift_back(now, self.config.failed_cooldown));
        let leased_before = timestamp(shift_back(now, self.config.in_progress_lease));

        let mut rows = self
            .conn
            .query(
                "INSERT INTO dedup_ledger (message_id, status, detail, admissions, created_at, updated_at)
                 VALUES (?1, 'in_progress', NULL, 1, ?2, ?2)
                 ON CONFLICT(message_id) DO UPDATE SET
                    status = 'in_progress',
                    detail = NULL,
                    admissions = dedup_ledger.admissions + 1,
                    updated_at = excluded.updated_at
                 WHERE (dedup_ledger.status = 'failed' AND dedup_ledger.updated_at <= ?3)
                    OR (dedup_ledger.status = 'in_progress' AND dedup_ledger.updated_at <= ?4)
                 RETURNING admissions",
                params![message_id, now_str, failed_before, leased_before],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("admit: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("admit: {e}")))?
        else {
            return Ok(None);
        };
        let admissions: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("admissions column: {e}")))?;
        u32::try_from(admissions)
            .map(Some)
            .map_err(|_| DatabaseError::Query(format!("admission count out of range: {admissions}")))
    }

    /// Update the row held under `lease`. `status` and `detail` are left
    /// alone when `None`.
    async fn write_held(
        &self,
        message_id: &str,
        lease: u32,
        status: Option<LedgerStatus>,
        detail: Option<String>,
    ) -> Result<bool, DatabaseError> {
        let now = timestamp(Utc::now());
        let affected = self
            .conn
            .execute(
                "UPDATE dedup_ledger SET
                    status = COALESCE(?3, status),
                    detail = COALESCE(?4, detail),
                    updated_at = ?5
                 WHERE message_id = ?1 AND admissions = ?2 AND status = 'in_progress'",
                params![
                    message_id,
                    i64::from(lease),
                    status.map(|s| s.as_str()),
                    detail,
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("write_held: {e}")))?;

        if affected == 0 {
            warn!(message_id, lease, "Ledger write under a superseded lease ignored");
        }
        Ok(affected == 1)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that string comparison orders chronologically.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn shift_back(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_entry(message_id: &str, row: &libsql::Row) -> Result<LedgerEntry, DatabaseError> {
    let status_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("status column: {e}")))?;
    let status = LedgerStatus::parse(&status_str)
        .ok_or_else(|| DatabaseError::Query(format!("unknown ledger status '{status_str}'")))?;
    let detail: Option<String> = row.get(1).ok();
    let admissions: i64 = row.get(2).unwrap_or(0);
    let updated_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("updated_at column: {e}")))?;

    Ok(LedgerEntry {
        message_id: message_id.to_string(),
        status,
        detail,
        admissions: u32::try_from(admissions).unwrap_or(0),
        updated_at: parse_datetime(&updated_str),
    })
}

#[async_trait]
impl Ledger for LibSqlLedger {
    async fn admit(&self, message_id: &str) -> Result<Admission, DatabaseError> {
        for _ in 0..ADMIT_ROUNDS {
            let now = Utc::now();
            if let Some(lease) = self.try_claim(message_id, now).await? {
                let admission = Admission::Admitted { lease };
                debug!(message_id, %admission, "Ledger admit");
                return Ok(admission);
            }

            // Not claimed: report why. A row that became reclaimable between
            // the two statements goes round again.
            let Some(entry) = self.entry(message_id).await? else {
                continue;
            };
            if let Some(refusal) = decide(entry.status, entry.updated_at, Utc::now(), &self.config)
            {
                debug!(message_id, admission = %refusal, "Ledger admit");
                return Ok(refusal);
            }
        }
        Ok(Admission::DuplicateInProgress)
    }

    async fn renew(&self, message_id: &str, lease: u32) -> Result<bool, DatabaseError> {
        self.write_held(message_id, lease, None, None).await
    }

    async fn complete(
        &self,
        message_id: &str,
        lease: u32,
        outcome: &RunOutcome,
    ) -> Result<bool, DatabaseError> {
        self.write_held(
            message_id,
            lease,
            Some(LedgerStatus::Completed),
            Some(outcome.to_string()),
        )
        .await
    }

    async fn fail(
        &self,
        message_id: &str,
        lease: u32,
        kind: FailureKind,
    ) -> Result<bool, DatabaseError> {
        self.write_held(
            message_id,
            lease,
            Some(LedgerStatus::Failed),
            Some(kind.to_string()),
        )
        .await
    }

    fn renew_interval(&self) -> Duration {
        renew_interval(&self.config)
    }

    async fn entry(&self, message_id: &str) -> Result<Option<LedgerEntry>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, detail, admissions, updated_at FROM dedup_ledger WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("entry: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("entry: {e}")))?
        {
            Some(row) => Ok(Some(row_to_entry(message_id, &row)?)),
            None => Ok(None),
        }
    }
}
