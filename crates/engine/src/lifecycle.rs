//! Reconciliation lifecycle: manual confirmation.
//!
//! `need_review -> matched` is the only transition an external actor may
//! request. The move is a compare-and-swap on the reconciliation's version, so
//! a concurrent change makes the confirmation fail instead of overriding it.

use chrono::{DateTime, Utc};
use tracing::info;

use spend_recon_core::{
    Confirmation, ReconError, ReconStatus, ReconciliationRecord, RecordId, RecordStore, Result,
};

/// Applies manual status changes to reconciliations.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleManager;

impl LifecycleManager {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Moves reconciliation `id` to `target`.
    ///
    /// `expected_version` is the version the caller last saw; without it the
    /// version read here is used, which still guards against a change racing
    /// this call.
    ///
    /// # Errors
    /// * `InvalidTransition` if `target` is not `matched`, or the record is
    ///   already matched, superseded, or lacks a counterpart.
    /// * `NotFound` for an unknown id.
    /// * `Conflict` on a version mismatch or when a counterpart was matched elsewhere.
    pub async fn confirm(
        &self,
        store: &dyn RecordStore,
        id: RecordId,
        target: ReconStatus,
        expected_version: Option<i64>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationRecord> {
        if target != ReconStatus::Matched {
            return Err(ReconError::invalid_transition(format!(
                "reconciliations can only be confirmed to matched, not {target}"
            )));
        }

        let expected_version = match expected_version {
            Some(version) => version,
            None => {
                let current = store.reconciliation(id).await?;
                if current.status == ReconStatus::Matched {
                    return Err(ReconError::invalid_transition(format!(
                        "reconciliation {id} is already matched"
                    )));
                }
                current.version
            }
        };

        let confirmed = store
            .confirm(&Confirmation {
                reconciliation_id: id,
                expected_version,
                actor: actor.to_string(),
                at: now,
            })
            .await?;

        info!(
            reconciliation_id = confirmed.id,
            ad_spend_id = ?confirmed.ad_spend_id,
            ledger_id = ?confirmed.ledger_id,
            actor,
            "Reconciliation confirmed"
        );
        Ok(confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use spend_recon_core::{
        Direction, NewAdSpend, NewLedgerTransaction, ReconDraft, RecordStatus, VersionRef,
    };
    use spend_recon_data::MemoryStore;

    async fn review_record(store: &MemoryStore) -> ReconciliationRecord {
        let now = Utc::now();
        let date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let ad = store
            .append_ad_spend(
                NewAdSpend {
                    spend_date: date,
                    project_id: 1,
                    channel_id: 1,
                    operator_id: 1,
                    country: None,
                    platform: "tiktok".to_string(),
                    amount: dec!(100),
                    memo: None,
                },
                now,
            )
            .await
            .unwrap();
        let ledger = store
            .append_ledger(
                NewLedgerTransaction {
                    tx_date: date,
                    direction: Direction::Expense,
                    amount: dec!(95),
                    currency: "USD".to_string(),
                    account_name: "card".to_string(),
                    fee_amount: dec!(0),
                    project_id: None,
                    operator_id: None,
                    description: None,
                },
                dec!(95),
                now,
            )
            .await
            .unwrap();
        store
            .commit(
                &ReconDraft {
                    ad_spend: Some(VersionRef::new(ad.id, ad.version)),
                    ledger: Some(VersionRef::new(ledger.id, ledger.version)),
                    amount_diff: dec!(-5),
                    date_diff: 0,
                    match_score: Some(dec!(87)),
                    status: ReconStatus::NeedReview,
                    reason: Some("score below auto-match threshold".to_string()),
                },
                now,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_confirm_without_version_reads_current() {
        let store = MemoryStore::new();
        let record = review_record(&store).await;
        let confirmed = LifecycleManager::new()
            .confirm(&store, record.id, ReconStatus::Matched, None, "finance-1", Utc::now())
            .await
            .unwrap();
        assert_eq!(confirmed.status, ReconStatus::Matched);
        assert_eq!(confirmed.confirmed_by.as_deref(), Some("finance-1"));
        let ad = store.ad_spend(record.ad_spend_id.unwrap()).await.unwrap();
        assert_eq!(ad.status, RecordStatus::Matched);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let store = MemoryStore::new();
        let record = review_record(&store).await;
        let err = LifecycleManager::new()
            .confirm(
                &store,
                record.id,
                ReconStatus::Matched,
                Some(record.version + 1),
                "finance-1",
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_confirming_twice_is_invalid() {
        let store = MemoryStore::new();
        let record = review_record(&store).await;
        let manager = LifecycleManager::new();
        manager
            .confirm(&store, record.id, ReconStatus::Matched, None, "a", Utc::now())
            .await
            .unwrap();
        let err = manager
            .confirm(&store, record.id, ReconStatus::Matched, None, "a", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_only_matched_is_a_valid_target() {
        let store = MemoryStore::new();
        let record = review_record(&store).await;
        let err = LifecycleManager::new()
            .confirm(&store, record.id, ReconStatus::NeedReview, None, "a", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let store = MemoryStore::new();
        let err = LifecycleManager::new()
            .confirm(&store, 404, ReconStatus::Matched, None, "a", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::NotFound { .. }));
    }
}
