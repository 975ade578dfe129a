//! In-memory ledger for single-process deployments and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Admission, Ledger, LedgerEntry, LedgerStatus, decide, renew_interval};
use crate::config::LedgerConfig;
use crate::error::DatabaseError;
use crate::pipeline::types::{FailureKind, RunOutcome};

/// Ledger backed by a mutex-guarded map. The lock is held for the whole
/// check-and-set, never across an await on anything else.
pub struct MemoryLedger {
    config: LedgerConfig,
    entries: Mutex<HashMap<String, LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Apply `update` to the entry if `lease` still holds it.
    async fn with_held(
        &self,
        message_id: &str,
        lease: u32,
        update: impl FnOnce(&mut LedgerEntry),
    ) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(message_id) {
            Some(entry) if entry.status == LedgerStatus::InProgress && entry.admissions == lease => {
                update(entry);
                entry.updated_at = Utc::now();
                true
            }
            _ => {
                warn!(message_id, lease, "Ledger write under a superseded lease ignored");
                false
            }
        }
    }

    async fn set_status(
        &self,
        message_id: &str,
        lease: u32,
        status: LedgerStatus,
        detail: String,
    ) -> bool {
        self.with_held(message_id, lease, |entry| {
            entry.status = status;
            entry.detail = Some(detail);
        })
        .await
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn admit(&self, message_id: &str) -> Result<Admission, DatabaseError> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;

        let refusal = entries
            .get(message_id)
            .and_then(|entry| decide(entry.status, entry.updated_at, now, &self.config));

        let admission = match refusal {
            Some(refusal) => refusal,
            None => {
                let lease = entries.get(message_id).map_or(0, |e| e.admissions) + 1;
                entries.insert(
                    message_id.to_string(),
                    LedgerEntry {
                        message_id: message_id.to_string(),
                        status: LedgerStatus::InProgress,
                        detail: None,
                        admissions: lease,
                        updated_at: now,
                    },
                );
                Admission::Admitted { lease }
            }
        };

        debug!(message_id, %admission, "Ledger admit");
        Ok(admission)
    }

    async fn renew(&self, message_id: &str, lease: u32) -> Result<bool, DatabaseError> {
        Ok(self.with_held(message_id, lease, |_| {}).await)
    }

    async fn complete(
        &self,
        message_id: &str,
        lease: u32,
        outcome: &RunOutcome,
    ) -> Result<bool, DatabaseError> {
        Ok(self
            .set_status(message_id, lease, LedgerStatus::Completed, outcome.to_string())
            .await)
    }

    async fn fail(
        &self,
        message_id: &str,
        lease: u32,
        kind: FailureKind,
    ) -> Result<bool, DatabaseError> {
        Ok(self
            .set_status(message_id, lease, LedgerStatus::Failed, kind.to_string())
            .await)
    }

    fn renew_interval(&self) -> Duration {
        renew_interval(&self.config)
    }

    async fn entry(&self, message_id: &str) -> Result<Option<LedgerEntry>, DatabaseError> {
        Ok(self.entries.lock().await.get(message_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ledger(cooldown: Duration) -> MemoryLedger {
        MemoryLedger::new(LedgerConfig {
            failed_cooldown: cooldown,
            in_progress_lease: Duration::from_secs(600),
            db_path: None,
        })
    }

    #[tokio::test]
    async fn second_admit_is_duplicate_in_progress() {
        let ledger = ledger(Duration::from_secs(60));
        assert_eq!(
            ledger.admit("m1").await.unwrap(),
            Admission::Admitted { lease: 1 }
        );
        assert_eq!(
            ledger.admit("m1").await.unwrap(),
            Admission::DuplicateInProgress
        );
        assert!(ledger.admit("m2").await.unwrap().is_admitted());
    }

    #[tokio::test]
    async fn completed_id_is_never_readmitted() {
        let ledger = ledger(Duration::ZERO);
        ledger.admit("m1").await.unwrap();
        assert!(ledger.complete("m1", 1, &RunOutcome::Skipped).await.unwrap());
        assert_eq!(
            ledger.admit("m1").await.unwrap(),
            Admission::DuplicateCompleted
        );

        let entry = ledger.entry("m1").await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::Completed);
        assert_eq!(entry.detail.as_deref(), Some("SKIPPED"));
    }

    #[tokio::test]
    async fn failed_id_respects_cooldown() {
        let ledger = ledger(Duration::from_secs(60));
        ledger.admit("m1").await.unwrap();
        ledger
            .fail("m1", 1, FailureKind::ContextUnavailable)
            .await
            .unwrap();
        assert!(matches!(
            ledger.admit("m1").await.unwrap(),
            Admission::RecentlyFailed { .. }
        ));
    }

    #[tokio::test]
    async fn failed_id_readmitted_after_cooldown() {
        let ledger = ledger(Duration::ZERO);
        ledger.admit("m1").await.unwrap();
        ledger.fail("m1", 1, FailureKind::SaveFailed).await.unwrap();
        assert_eq!(
            ledger.admit("m1").await.unwrap(),
            Admission::Admitted { lease: 2 }
        );

        let entry = ledger.entry("m1").await.unwrap().unwrap();
        assert_eq!(entry.status, LedgerStatus::InProgress);
        assert_eq!(entry.admissions, 2);
    }

    #[tokio::test]
    async fn concurrent_admits_yield_one_winner() {
        let ledger = Arc::new(ledger(Duration::from_secs(60)));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move { ledger.admit("hot").await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_admitted() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn renewal_keeps_a_short_lease_alive() {
        let ledger = MemoryLedger::new(LedgerConfig {
            in_progress_lease: Duration::from_millis(50),
            ..LedgerConfig::default()
        });
        let lease = ledger.admit("m1").await.unwrap().lease().unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(ledger.renew("m1", lease).await.unwrap());
        }
        assert_eq!(
            ledger.admit("m1").await.unwrap(),
            Admission::DuplicateInProgress
        );
    }

    #[tokio::test]
    async fn superseded_lease_cannot_write() {
        let ledger = MemoryLedger::new(LedgerConfig {
            in_progress_lease: Duration::ZERO,
            ..LedgerConfig::default()
        });
        let stale = ledger.admit("m1").await.unwrap().lease().unwrap();
        let current = ledger.admit("m1").await.unwrap().lease().unwrap();
        assert_eq!((stale, current), (1, 2));

        assert!(!ledger.renew("m1", stale).await.unwrap());
        assert!(
            !ledger
                .fail("m1", stale, FailureKind::SaveFailed)
                .await
                .unwrap()
        );
        assert_eq!(
            ledger.entry("m1").await.unwrap().unwrap().status,
            LedgerStatus::InProgress
        );

        assert!(
            ledger
                .complete("m1", current, &RunOutcome::DraftSaved)
                .await
                .unwrap()
        );
        assert!(
            !ledger
                .complete("m1", current, &RunOutcome::Skipped)
                .await
                .unwrap()
        );
        let entry = ledger.entry("m1").await.unwrap().unwrap();
        assert_eq!(entry.detail.as_deref(), Some("DRAFT_SAVED"));
    }

    #[tokio::test]
    async fn unknown_entry_is_none() {
        let ledger = MemoryLedger::default();
        assert!(ledger.entry("nope").await.unwrap().is_none());
    }
}
