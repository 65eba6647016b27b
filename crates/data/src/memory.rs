//! In-memory record store.
//!
//! All tables sit behind one lock, so every commit and confirmation is atomic
//! with respect to concurrent callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::debug;

use spend_recon_core::reconciliation::REASON_MANUALLY_CONFIRMED;
use spend_recon_core::{
    AdSpendFilter, AdSpendRecord, CandidateWindow, Confirmation, LedgerFilter, LedgerTransaction,
    NewAdSpend, NewLedgerTransaction, PageRequest, PendingQuery, ReconDraft, ReconError,
    ReconFilter, ReconStatus, ReconciliationRecord, RecordId, RecordKind, RecordStatus,
    RecordStore, Result,
};

#[derive(Debug, Default)]
struct Tables {
    ad_spends: BTreeMap<RecordId, AdSpendRecord>,
    ledgers: BTreeMap<RecordId, LedgerTransaction>,
    reconciliations: BTreeMap<RecordId, ReconciliationRecord>,
    last_ad_spend_id: RecordId,
    last_ledger_id: RecordId,
    last_reconciliation_id: RecordId,
}

impl Tables {
    /// Supersedes active "no candidate" records of a ledger.
    fn supersede_ledger_orphans(
        &mut self,
        ledger_id: RecordId,
        replaced_by: RecordId,
        now: DateTime<Utc>,
    ) {
        for record in self.reconciliations.values_mut() {
            if record.is_active()
                && record.is_ledger_orphan()
                && record.ledger_id == Some(ledger_id)
                && record.id != replaced_by
            {
                record.supersede(now);
                record.superseded_by = Some(replaced_by);
            }
        }
    }
}

/// A [`RecordStore`] kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reconciliation rows, superseded ones included.
    #[must_use]
    pub fn reconciliation_count(&self) -> usize {
        self.tables.read().reconciliations.len()
    }
}

fn page_of<T: Clone>(rows: &[T], page: PageRequest) -> Vec<T> {
    rows.iter()
        .skip(page.skip as usize)
        .take(page.limit as usize)
        .cloned()
        .collect()
}

fn check_transition(
    kind: RecordKind,
    id: RecordId,
    from: RecordStatus,
    to: RecordStatus,
) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ReconError::invalid_transition(format!(
            "{kind} {id}: {from} -> {to} is not allowed"
        )))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn append_ad_spend(
        &self,
        new: NewAdSpend,
        now: DateTime<Utc>,
    ) -> Result<AdSpendRecord> {
        new.validate()?;
        let mut tables = self.tables.write();
        tables.last_ad_spend_id += 1;
        let record = AdSpendRecord::from_new(tables.last_ad_spend_id, new, now);
        tables.ad_spends.insert(record.id, record.clone());
        Ok(record)
    }

    async fn append_ledger(
        &self,
        new: NewLedgerTransaction,
        amount_usdt: Decimal,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction> {
        new.validate()?;
        let mut tables = self.tables.write();
        tables.last_ledger_id += 1;
        let record = LedgerTransaction::from_new(tables.last_ledger_id, new, amount_usdt, now);
        tables.ledgers.insert(record.id, record.clone());
        Ok(record)
    }

    async fn ad_spend(&self, id: RecordId) -> Result<AdSpendRecord> {
        self.tables
            .read()
            .ad_spends
            .get(&id)
            .cloned()
            .ok_or_else(|| ReconError::not_found(RecordKind::AdSpend, id))
    }

    async fn ledger(&self, id: RecordId) -> Result<LedgerTransaction> {
        self.tables
            .read()
            .ledgers
            .get(&id)
            .cloned()
            .ok_or_else(|| ReconError::not_found(RecordKind::Ledger, id))
    }

    async fn ad_spends_by_ids(&self, ids: &[RecordId]) -> Result<Vec<AdSpendRecord>> {
        let tables = self.tables.read();
        Ok(ids
            .iter()
            .filter_map(|id| tables.ad_spends.get(id).cloned())
            .collect())
    }

    async fn ledgers_by_ids(&self, ids: &[RecordId]) -> Result<Vec<LedgerTransaction>> {
        let tables = self.tables.read();
        Ok(ids
            .iter()
            .filter_map(|id| tables.ledgers.get(id).cloned())
            .collect())
    }

    async fn unmatched_ad_spends(&self, query: &PendingQuery) -> Result<Vec<AdSpendRecord>> {
        Ok(self
            .tables
            .read()
            .ad_spends
            .values()
            .filter(|r| query.admits(r.id, r.status, r.created_at))
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn unmatched_ledgers(&self, query: &PendingQuery) -> Result<Vec<LedgerTransaction>> {
        Ok(self
            .tables
            .read()
            .ledgers
            .values()
            .filter(|r| query.admits(r.id, r.status, r.created_at))
            .take(query.limit as usize)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        kind: RecordKind,
        id: RecordId,
        status: RecordStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        match kind {
            RecordKind::AdSpend => {
                let record = tables
                    .ad_spends
                    .get_mut(&id)
                    .ok_or_else(|| ReconError::not_found(kind, id))?;
                check_transition(kind, id, record.status, status)?;
                record.status = status;
                record.version += 1;
                record.updated_at = now;
            }
            RecordKind::Ledger => {
                let record = tables
                    .ledgers
                    .get_mut(&id)
                    .ok_or_else(|| ReconError::not_found(kind, id))?;
                check_transition(kind, id, record.status, status)?;
                record.status = status;
                record.version += 1;
                record.updated_at = now;
            }
            RecordKind::Reconciliation => {
                return Err(ReconError::validation(
                    "reconciliation status changes go through confirmation",
                ));
            }
        }
        Ok(())
    }

    async fn ledger_candidates(&self, window: &CandidateWindow) -> Result<Vec<LedgerTransaction>> {
        let tables = self.tables.read();
        let mut rows: Vec<LedgerTransaction> = tables
            .ledgers
            .values()
            .filter(|l| {
                l.status.is_open()
                    && l.is_reconcilable()
                    && window.contains(l.tx_date, l.amount_usdt)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            window
                .closeness(a.amount_usdt)
                .cmp(&window.closeness(b.amount_usdt))
                .then(a.id.cmp(&b.id))
        });
        rows.truncate(window.limit as usize);
        Ok(rows)
    }

    async fn ad_spend_candidates(&self, window: &CandidateWindow) -> Result<Vec<AdSpendRecord>> {
        let tables = self.tables.read();
        let mut rows: Vec<AdSpendRecord> = tables
            .ad_spends
            .values()
            .filter(|a| a.status.is_open() && window.contains(a.spend_date, a.amount))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            window
                .closeness(a.amount)
                .cmp(&window.closeness(b.amount))
                .then(a.id.cmp(&b.id))
        });
        rows.truncate(window.limit as usize);
        Ok(rows)
    }

    async fn active_reconciliation_for_ad_spend(
        &self,
        ad_spend_id: RecordId,
    ) -> Result<Option<ReconciliationRecord>> {
        Ok(self
            .tables
            .read()
            .reconciliations
            .values()
            .find(|r| r.is_active() && r.ad_spend_id == Some(ad_spend_id))
            .cloned())
    }

    async fn active_reconciliation_for_ledger(
        &self,
        ledger_id: RecordId,
    ) -> Result<Option<ReconciliationRecord>> {
        Ok(self
            .tables
            .read()
            .reconciliations
            .values()
            .filter(|r| r.is_active() && r.ledger_id == Some(ledger_id))
            .max_by_key(|r| (r.status == ReconStatus::Matched, r.id))
            .cloned())
    }

    async fn reconciliation(&self, id: RecordId) -> Result<ReconciliationRecord> {
        self.tables
            .read()
            .reconciliations
            .get(&id)
            .cloned()
            .ok_or_else(|| ReconError::not_found(RecordKind::Reconciliation, id))
    }

    async fn commit(&self, draft: &ReconDraft, now: DateTime<Utc>) -> Result<ReconciliationRecord> {
        draft.check_shape()?;
        let mut tables = self.tables.write();

        if let Some(expected) = draft.ad_spend {
            let ad = tables
                .ad_spends
                .get(&expected.id)
                .ok_or_else(|| ReconError::not_found(RecordKind::AdSpend, expected.id))?;
            if ad.version != expected.version {
                return Err(ReconError::conflict(format!(
                    "ad_spend {} changed (version {} != {})",
                    ad.id, ad.version, expected.version
                )));
            }
            if !ad.status.is_open() {
                return Err(ReconError::conflict(format!(
                    "ad_spend {} is already matched",
                    ad.id
                )));
            }
        }
        let writes_ledger = draft.writes_ledger_status();
        if let Some(expected) = draft.ledger {
            let ledger = tables
                .ledgers
                .get(&expected.id)
                .ok_or_else(|| ReconError::not_found(RecordKind::Ledger, expected.id))?;
            if !ledger.status.is_open() {
                return Err(ReconError::conflict(format!(
                    "ledger {} is already matched",
                    ledger.id
                )));
            }
            if writes_ledger && ledger.version != expected.version {
                return Err(ReconError::conflict(format!(
                    "ledger {} changed (version {} != {})",
                    ledger.id, ledger.version, expected.version
                )));
            }
        }

        tables.last_reconciliation_id += 1;
        let new_id = tables.last_reconciliation_id;
        let record_status = match draft.status {
            ReconStatus::Matched => RecordStatus::Matched,
            _ => RecordStatus::NeedReview,
        };

        if let Some(expected) = draft.ad_spend {
            for previous in tables.reconciliations.values_mut() {
                if previous.is_active() && previous.ad_spend_id == Some(expected.id) {
                    previous.supersede(now);
                    previous.superseded_by = Some(new_id);
                }
            }
            if let Some(ad) = tables.ad_spends.get_mut(&expected.id) {
                ad.status = record_status;
                ad.version += 1;
                ad.updated_at = now;
            }
        }
        if let Some(expected) = draft.ledger {
            // Any row naming the ledger replaces its "no candidate" orphan.
            tables.supersede_ledger_orphans(expected.id, new_id, now);
            if writes_ledger {
                if let Some(ledger) = tables.ledgers.get_mut(&expected.id) {
                    ledger.status = record_status;
                    ledger.version += 1;
                    ledger.updated_at = now;
                }
            }
        }

        let record = ReconciliationRecord::from_draft(new_id, draft, now);
        tables.reconciliations.insert(new_id, record.clone());
        debug!(
            reconciliation_id = new_id,
            ad_spend_id = ?record.ad_spend_id,
            ledger_id = ?record.ledger_id,
            status = %record.status,
            "Committed reconciliation"
        );
        Ok(record)
    }

    async fn confirm(&self, confirmation: &Confirmation) -> Result<ReconciliationRecord> {
        let mut tables = self.tables.write();
        let id = confirmation.reconciliation_id;
        let record = tables
            .reconciliations
            .get(&id)
            .ok_or_else(|| ReconError::not_found(RecordKind::Reconciliation, id))?;

        if !record.is_active() {
            return Err(ReconError::invalid_transition(format!(
                "reconciliation {id} has been superseded"
            )));
        }
        if !record.status.can_transition_to(ReconStatus::Matched) {
            return Err(ReconError::invalid_transition(format!(
                "reconciliation {id} is already {}",
                record.status
            )));
        }
        if record.version != confirmation.expected_version {
            return Err(ReconError::conflict(format!(
                "reconciliation {id} changed (version {} != {})",
                record.version, confirmation.expected_version
            )));
        }
        let (Some(ad_id), Some(ledger_id)) = (record.ad_spend_id, record.ledger_id) else {
            return Err(ReconError::invalid_transition(
                "matched requires both ad_spend_id and ledger_id",
            ));
        };

        let ad_open = tables
            .ad_spends
            .get(&ad_id)
            .ok_or_else(|| ReconError::not_found(RecordKind::AdSpend, ad_id))?
            .status
            .is_open();
        let ledger_open = tables
            .ledgers
            .get(&ledger_id)
            .ok_or_else(|| ReconError::not_found(RecordKind::Ledger, ledger_id))?
            .status
            .is_open();
        if !ad_open || !ledger_open {
            return Err(ReconError::conflict(format!(
                "reconciliation {id}: a referenced record is already matched elsewhere"
            )));
        }

        let at = confirmation.at;
        if let Some(ad) = tables.ad_spends.get_mut(&ad_id) {
            ad.status = RecordStatus::Matched;
            ad.version += 1;
            ad.updated_at = at;
        }
        if let Some(ledger) = tables.ledgers.get_mut(&ledger_id) {
            ledger.status = RecordStatus::Matched;
            ledger.version += 1;
            ledger.updated_at = at;
        }
        tables.supersede_ledger_orphans(ledger_id, id, at);

        let record = tables
            .reconciliations
            .get_mut(&id)
            .ok_or_else(|| ReconError::not_found(RecordKind::Reconciliation, id))?;
        record.status = ReconStatus::Matched;
        record.confirmed_by = Some(confirmation.actor.clone());
        record.reason = Some(REASON_MANUALLY_CONFIRMED.to_string());
        record.version += 1;
        record.updated_at = at;
        Ok(record.clone())
    }

    async fn list_reconciliations(
        &self,
        filter: &ReconFilter,
        page: PageRequest,
    ) -> Result<(Vec<ReconciliationRecord>, u64)> {
        let tables = self.tables.read();
        let mut rows: Vec<ReconciliationRecord> = tables
            .reconciliations
            .values()
            .filter(|r| filter.admits(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok((page_of(&rows, page), rows.len() as u64))
    }

    async fn list_ad_spends(
        &self,
        filter: &AdSpendFilter,
        page: PageRequest,
    ) -> Result<(Vec<AdSpendRecord>, u64)> {
        let tables = self.tables.read();
        let mut rows: Vec<AdSpendRecord> = tables
            .ad_spends
            .values()
            .filter(|r| filter.admits(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.spend_date
                .cmp(&a.spend_date)
                .then(b.created_at.cmp(&a.created_at))
                .then(b.id.cmp(&a.id))
        });
        Ok((page_of(&rows, page), rows.len() as u64))
    }

    async fn list_ledgers(
        &self,
        filter: &LedgerFilter,
        page: PageRequest,
    ) -> Result<(Vec<LedgerTransaction>, u64)> {
        let tables = self.tables.read();
        let mut rows: Vec<LedgerTransaction> = tables
            .ledgers
            .values()
            .filter(|r| filter.admits(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.tx_date
                .cmp(&a.tx_date)
                .then(b.created_at.cmp(&a.created_at))
                .then(b.id.cmp(&a.id))
        });
        Ok((page_of(&rows, page), rows.len() as u64))
    }

    async fn latest_ad_spend_for_operator(
        &self,
        operator_id: i64,
    ) -> Result<Option<AdSpendRecord>> {
        Ok(self
            .tables
            .read()
            .ad_spends
            .values()
            .filter(|r| r.operator_id == operator_id)
            .max_by(|a, b| {
                a.spend_date
                    .cmp(&b.spend_date)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use spend_recon_core::reconciliation::REASON_NO_CANDIDATE;
    use spend_recon_core::{Direction, VersionRef};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn new_ad(amount: Decimal, day: u32) -> NewAdSpend {
        NewAdSpend {
            spend_date: date(day),
            project_id: 1,
            channel_id: 1,
            operator_id: 1,
            country: None,
            platform: "facebook".to_string(),
            amount,
            memo: None,
        }
    }

    fn new_ledger(amount: Decimal, day: u32, direction: Direction) -> NewLedgerTransaction {
        NewLedgerTransaction {
            tx_date: date(day),
            direction,
            amount,
            currency: "USD".to_string(),
            account_name: "main".to_string(),
            fee_amount: Decimal::ZERO,
            project_id: Some(1),
            operator_id: None,
            description: None,
        }
    }

    fn matched_draft(ad: &AdSpendRecord, ledger: &LedgerTransaction) -> ReconDraft {
        ReconDraft {
            ad_spend: Some(VersionRef::new(ad.id, ad.version)),
            ledger: Some(VersionRef::new(ledger.id, ledger.version)),
            amount_diff: ledger.amount_usdt - ad.amount,
            date_diff: 0,
            match_score: Some(dec!(100)),
            status: ReconStatus::Matched,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_append_rejects_invalid_amount() {
        let store = MemoryStore::new();
        let err = store
            .append_ad_spend(new_ad(Decimal::ZERO, 10), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unmatched_is_oldest_first_and_paged() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for day in 1..=5 {
            store.append_ad_spend(new_ad(dec!(10), day), now).await.unwrap();
        }
        let first = store
            .unmatched_ad_spends(&PendingQuery::unmatched(2))
            .await
            .unwrap();
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);

        let next = store
            .unmatched_ad_spends(&PendingQuery::unmatched(2).after(2))
            .await
            .unwrap();
        assert_eq!(next.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_update_status_state_machine() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ad = store.append_ad_spend(new_ad(dec!(10), 1), now).await.unwrap();

        store
            .update_status(RecordKind::AdSpend, ad.id, RecordStatus::NeedReview, now)
            .await
            .unwrap();
        store
            .update_status(RecordKind::AdSpend, ad.id, RecordStatus::Matched, now)
            .await
            .unwrap();
        let err = store
            .update_status(RecordKind::AdSpend, ad.id, RecordStatus::Unmatched, now)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::InvalidTransition(_)));

        let err = store
            .update_status(RecordKind::Ledger, 99, RecordStatus::Matched, now)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_ledger_candidates_skip_income_and_matched() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .append_ledger(new_ledger(dec!(100), 10, Direction::Income), dec!(100), now)
            .await
            .unwrap();
        let far = store
            .append_ledger(new_ledger(dec!(108), 10, Direction::Expense), dec!(108), now)
            .await
            .unwrap();
        let close = store
            .append_ledger(new_ledger(dec!(99), 11, Direction::Expense), dec!(99), now)
            .await
            .unwrap();

        let window = CandidateWindow {
            date_from: date(5),
            date_to: date(15),
            amount_min: dec!(90),
            amount_max: dec!(110),
            target_amount: dec!(100),
            limit: 20,
        };
        let found = store.ledger_candidates(&window).await.unwrap();
        assert_eq!(
            found.iter().map(|l| l.id).collect::<Vec<_>>(),
            vec![close.id, far.id]
        );
    }

    #[tokio::test]
    async fn test_commit_matches_both_sides_and_rejects_stale_versions() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ad = store.append_ad_spend(new_ad(dec!(100), 10), now).await.unwrap();
        let ledger = store
            .append_ledger(new_ledger(dec!(100), 10, Direction::Expense), dec!(100), now)
            .await
            .unwrap();

        let draft = matched_draft(&ad, &ledger);
        let record = store.commit(&draft, now).await.unwrap();
        assert_eq!(record.status, ReconStatus::Matched);
        assert_eq!(store.ad_spend(ad.id).await.unwrap().status, RecordStatus::Matched);
        assert_eq!(store.ledger(ledger.id).await.unwrap().status, RecordStatus::Matched);

        let err = store.commit(&draft, now).await.unwrap_err();
        assert!(matches!(err, ReconError::Conflict(_)));
        assert_eq!(store.reconciliation_count(), 1);
    }

    #[tokio::test]
    async fn test_recommit_supersedes_previous_record() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ad = store.append_ad_spend(new_ad(dec!(100), 10), now).await.unwrap();
        let first = store
            .commit(
                &ReconDraft {
                    ad_spend: Some(VersionRef::new(ad.id, ad.version)),
                    ledger: None,
                    amount_diff: -ad.amount,
                    date_diff: 0,
                    match_score: None,
                    status: ReconStatus::NeedReview,
                    reason: Some(REASON_NO_CANDIDATE.to_string()),
                },
                now,
            )
            .await
            .unwrap();

        let ad = store.ad_spend(ad.id).await.unwrap();
        let ledger = store
            .append_ledger(new_ledger(dec!(100), 10, Direction::Expense), dec!(100), now)
            .await
            .unwrap();
        let second = store.commit(&matched_draft(&ad, &ledger), now).await.unwrap();

        let old = store.reconciliation(first.id).await.unwrap();
        assert!(!old.is_active());
        assert_eq!(old.superseded_by, Some(second.id));
        let active = store
            .active_reconciliation_for_ad_spend(ad.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, second.id);

        let (visible, total) = store
            .list_reconciliations(&ReconFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(visible[0].id, second.id);

        let history = ReconFilter {
            include_history: true,
            ..ReconFilter::default()
        };
        let (_, total) = store
            .list_reconciliations(&history, PageRequest::default())
            .await
            .unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_review_row_replaces_ledger_orphan() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ledger = store
            .append_ledger(new_ledger(dec!(95), 12, Direction::Expense), dec!(95), now)
            .await
            .unwrap();
        let orphan = store
            .commit(
                &ReconDraft {
                    ad_spend: None,
                    ledger: Some(VersionRef::new(ledger.id, ledger.version)),
                    amount_diff: ledger.amount_usdt,
                    date_diff: 0,
                    match_score: None,
                    status: ReconStatus::NeedReview,
                    reason: Some(REASON_NO_CANDIDATE.to_string()),
                },
                now,
            )
            .await
            .unwrap();

        let ledger = store.ledger(ledger.id).await.unwrap();
        let ad = store.append_ad_spend(new_ad(dec!(100), 10), now).await.unwrap();
        let review = store
            .commit(
                &ReconDraft {
                    status: ReconStatus::NeedReview,
                    match_score: Some(dec!(75)),
                    ..matched_draft(&ad, &ledger)
                },
                now,
            )
            .await
            .unwrap();

        let old = store.reconciliation(orphan.id).await.unwrap();
        assert!(!old.is_active());
        assert_eq!(old.superseded_by, Some(review.id));
        let (visible, total) = store
            .list_reconciliations(&ReconFilter::default(), PageRequest::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(visible[0].id, review.id);
        assert_eq!(store.ledger(ledger.id).await.unwrap().version, ledger.version);
    }

    #[tokio::test]
    async fn test_confirm_is_compare_and_swap() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ad = store.append_ad_spend(new_ad(dec!(100), 10), now).await.unwrap();
        let ledger = store
            .append_ledger(new_ledger(dec!(95), 12, Direction::Expense), dec!(95), now)
            .await
            .unwrap();
        let review = store
            .commit(
                &ReconDraft {
                    status: ReconStatus::NeedReview,
                    match_score: Some(dec!(75)),
                    ..matched_draft(&ad, &ledger)
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(store.ledger(ledger.id).await.unwrap().status, RecordStatus::Unmatched);

        let stale = Confirmation {
            reconciliation_id: review.id,
            expected_version: review.version + 1,
            actor: "finance".to_string(),
            at: now,
        };
        assert!(matches!(
            store.confirm(&stale).await,
            Err(ReconError::Conflict(_))
        ));

        let ok = Confirmation {
            expected_version: review.version,
            ..stale.clone()
        };
        let confirmed = store.confirm(&ok).await.unwrap();
        assert_eq!(confirmed.status, ReconStatus::Matched);
        assert_eq!(confirmed.confirmed_by.as_deref(), Some("finance"));
        assert_eq!(store.ledger(ledger.id).await.unwrap().status, RecordStatus::Matched);

        let again = Confirmation {
            expected_version: confirmed.version,
            ..stale
        };
        assert!(matches!(
            store.confirm(&again).await,
            Err(ReconError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_confirm_unknown_id() {
        let store = MemoryStore::new();
        let err = store
            .confirm(&Confirmation {
                reconciliation_id: 42,
                expected_version: 0,
                actor: "finance".to_string(),
                at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReconError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_latest_ad_spend_for_operator() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.append_ad_spend(new_ad(dec!(10), 12), now).await.unwrap();
        store.append_ad_spend(new_ad(dec!(20), 9), now).await.unwrap();

        let latest = store.latest_ad_spend_for_operator(1).await.unwrap().unwrap();
        assert_eq!(latest.amount, dec!(10));
        assert!(store.latest_ad_spend_for_operator(2).await.unwrap().is_none());
    }
}
