//! The record store contract.
//!
//! Implementations own all persistence. Filtering, windowing and paging are
//! pushed down to the store so the engine never loads a full stream.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reconciliation::{Confirmation, ReconDraft, ReconStatus, ReconciliationRecord};
use crate::records::{
    AdSpendRecord, Direction, LedgerTransaction, NewAdSpend, NewLedgerTransaction, RecordId,
    RecordKind, RecordStatus,
};

/// Default page size of list queries.
pub const DEFAULT_PAGE_LIMIT: u32 = 100;
/// Largest page a caller may request.
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Cursor over open records, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingQuery {
    /// Only records created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Also return `need_review` records.
    pub include_review: bool,
    /// Resume after this id.
    pub after_id: Option<RecordId>,
    pub limit: u32,
}

impl PendingQuery {
    /// Unmatched records only, first page.
    #[must_use]
    pub fn unmatched(limit: u32) -> Self {
        Self {
            since: None,
            include_review: false,
            after_id: None,
            limit,
        }
    }

    /// Unmatched and `need_review` records, first page.
    #[must_use]
    pub fn open(limit: u32) -> Self {
        Self {
            include_review: true,
            ..Self::unmatched(limit)
        }
    }

    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn after(mut self, id: RecordId) -> Self {
        self.after_id = Some(id);
        self
    }

    /// Returns true if a record with these attributes is selected.
    #[must_use]
    pub fn admits(&self, id: RecordId, status: RecordStatus, created_at: DateTime<Utc>) -> bool {
        let status_ok = match status {
            RecordStatus::Unmatched => true,
            RecordStatus::NeedReview => self.include_review,
            RecordStatus::Matched => false,
        };
        status_ok
            && self.after_id.map_or(true, |after| id > after)
            && self.since.map_or(true, |since| created_at >= since)
    }
}

/// Coarse date and amount window around a record, in USDT.
///
/// Stores return open counterparts inside the window ordered by
/// `|amount - target_amount|`, then id, at most `limit` of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateWindow {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub amount_min: Decimal,
    pub amount_max: Decimal,
    pub target_amount: Decimal,
    pub limit: u32,
}

impl CandidateWindow {
    #[must_use]
    pub fn contains(&self, date: NaiveDate, amount: Decimal) -> bool {
        date >= self.date_from
            && date <= self.date_to
            && amount >= self.amount_min
            && amount <= self.amount_max
    }

    /// Distance used for ordering.
    #[must_use]
    pub fn closeness(&self, amount: Decimal) -> Decimal {
        amount
            .checked_sub(self.target_amount)
            .map_or(Decimal::MAX, |d| d.abs())
    }
}

/// Offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub skip: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl PageRequest {
    /// Builds a page, defaulting and clamping the limit to `1..=MAX_PAGE_LIMIT`.
    #[must_use]
    pub fn new(skip: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            skip: skip.unwrap_or(0),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

/// Filters of the reconciliation listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconFilter {
    pub status: Option<ReconStatus>,
    /// Inclusive bounds on the UTC date of `created_at`.
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Also return superseded records.
    pub include_history: bool,
}

impl ReconFilter {
    #[must_use]
    pub fn admits(&self, record: &ReconciliationRecord) -> bool {
        let created = record.created_at.date_naive();
        self.status.map_or(true, |s| s == record.status)
            && (self.include_history || record.is_active())
            && self.date_from.map_or(true, |from| created >= from)
            && self.date_to.map_or(true, |to| created <= to)
    }
}

/// Filters of the raw ad-spend listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdSpendFilter {
    pub project_id: Option<i64>,
    pub operator_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl AdSpendFilter {
    #[must_use]
    pub fn admits(&self, record: &AdSpendRecord) -> bool {
        self.project_id.map_or(true, |id| id == record.project_id)
            && self.operator_id.map_or(true, |id| id == record.operator_id)
            && self.channel_id.map_or(true, |id| id == record.channel_id)
            && self.date_from.map_or(true, |from| record.spend_date >= from)
            && self.date_to.map_or(true, |to| record.spend_date <= to)
    }
}

/// Filters of the raw ledger listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerFilter {
    pub project_id: Option<i64>,
    pub operator_id: Option<i64>,
    pub direction: Option<Direction>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl LedgerFilter {
    #[must_use]
    pub fn admits(&self, record: &LedgerTransaction) -> bool {
        self.project_id.map_or(true, |id| record.project_id == Some(id))
            && self.operator_id.map_or(true, |id| record.operator_id == Some(id))
            && self.direction.map_or(true, |d| d == record.direction)
            && self.date_from.map_or(true, |from| record.tx_date >= from)
            && self.date_to.map_or(true, |to| record.tx_date <= to)
    }
}

/// Persistence of both record streams and of reconciliations.
///
/// Reconciliations are written only through [`RecordStore::commit`] and
/// [`RecordStore::confirm`], both atomic compare-and-swap operations.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Validates and stores a report with status `unmatched`.
    async fn append_ad_spend(&self, new: NewAdSpend, now: DateTime<Utc>)
        -> Result<AdSpendRecord>;

    /// Validates and stores a transaction with its USDT-normalized amount.
    async fn append_ledger(
        &self,
        new: NewLedgerTransaction,
        amount_usdt: Decimal,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction>;

    async fn ad_spend(&self, id: RecordId) -> Result<AdSpendRecord>;

    async fn ledger(&self, id: RecordId) -> Result<LedgerTransaction>;

    /// Records with the given ids; unknown ids are skipped.
    async fn ad_spends_by_ids(&self, ids: &[RecordId]) -> Result<Vec<AdSpendRecord>>;

    /// Records with the given ids; unknown ids are skipped.
    async fn ledgers_by_ids(&self, ids: &[RecordId]) -> Result<Vec<LedgerTransaction>>;

    /// Open ad-spend reports in creation order.
    async fn unmatched_ad_spends(&self, query: &PendingQuery) -> Result<Vec<AdSpendRecord>>;

    /// Open ledger transactions of either direction in creation order.
    async fn unmatched_ledgers(&self, query: &PendingQuery) -> Result<Vec<LedgerTransaction>>;

    /// Moves a record along its status machine.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, `InvalidTransition` for a disallowed move.
    async fn update_status(
        &self,
        kind: RecordKind,
        id: RecordId,
        status: RecordStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Open expense transactions inside the window.
    async fn ledger_candidates(&self, window: &CandidateWindow) -> Result<Vec<LedgerTransaction>>;

    /// Open ad-spend reports inside the window.
    async fn ad_spend_candidates(&self, window: &CandidateWindow) -> Result<Vec<AdSpendRecord>>;

    async fn active_reconciliation_for_ad_spend(
        &self,
        ad_spend_id: RecordId,
    ) -> Result<Option<ReconciliationRecord>>;

    /// The ledger's active reconciliation: the matched one if any, else the newest.
    async fn active_reconciliation_for_ledger(
        &self,
        ledger_id: RecordId,
    ) -> Result<Option<ReconciliationRecord>>;

    async fn reconciliation(&self, id: RecordId) -> Result<ReconciliationRecord>;

    /// Atomically writes a draft following the rules documented on [`ReconDraft`].
    ///
    /// # Errors
    /// `Conflict` if a referenced record changed version or is already matched.
    async fn commit(&self, draft: &ReconDraft, now: DateTime<Utc>) -> Result<ReconciliationRecord>;

    /// Atomically moves a `need_review` reconciliation and both its records to `matched`.
    ///
    /// # Errors
    /// `NotFound`, `Conflict` on a version mismatch or when a counterpart is
    /// matched elsewhere, `InvalidTransition` for matched, superseded or
    /// half-empty reconciliations.
    async fn confirm(&self, confirmation: &Confirmation) -> Result<ReconciliationRecord>;

    /// Newest first, with the total count before paging.
    async fn list_reconciliations(
        &self,
        filter: &ReconFilter,
        page: PageRequest,
    ) -> Result<(Vec<ReconciliationRecord>, u64)>;

    /// Newest first, with the total count before paging.
    async fn list_ad_spends(
        &self,
        filter: &AdSpendFilter,
        page: PageRequest,
    ) -> Result<(Vec<AdSpendRecord>, u64)>;

    /// Newest first, with the total count before paging.
    async fn list_ledgers(
        &self,
        filter: &LedgerFilter,
        page: PageRequest,
    ) -> Result<(Vec<LedgerTransaction>, u64)>;

    /// The operator's report with the latest `spend_date` (latest created on ties).
    async fn latest_ad_spend_for_operator(
        &self,
        operator_id: i64,
    ) -> Result<Option<AdSpendRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn test_page_request_clamps_limit() {
        assert_eq!(PageRequest::new(None, None).limit, DEFAULT_PAGE_LIMIT);
        assert_eq!(PageRequest::new(Some(5), Some(5000)).limit, MAX_PAGE_LIMIT);
        assert_eq!(PageRequest::new(None, Some(0)).limit, 1);
        assert_eq!(PageRequest::new(Some(5), None).skip, 5);
    }

    #[test]
    fn test_pending_query_admits() {
        let now = Utc::now();
        let unmatched = PendingQuery::unmatched(10);
        assert!(unmatched.admits(1, RecordStatus::Unmatched, now));
        assert!(!unmatched.admits(1, RecordStatus::NeedReview, now));
        assert!(!unmatched.admits(1, RecordStatus::Matched, now));

        let open = PendingQuery::open(10).after(3);
        assert!(open.admits(4, RecordStatus::NeedReview, now));
        assert!(!open.admits(3, RecordStatus::Unmatched, now));

        let later = PendingQuery::unmatched(10).since(now + chrono::Duration::seconds(1));
        assert!(!later.admits(9, RecordStatus::Unmatched, now));
    }

    #[test]
    fn test_candidate_window_bounds_are_inclusive() {
        let window = CandidateWindow {
            date_from: date(5),
            date_to: date(15),
            amount_min: dec!(90),
            amount_max: dec!(110),
            target_amount: dec!(100),
            limit: 20,
        };
        assert!(window.contains(date(5), dec!(90)));
        assert!(window.contains(date(15), dec!(110)));
        assert!(!window.contains(date(16), dec!(100)));
        assert!(!window.contains(date(10), dec!(110.01)));
        assert_eq!(window.closeness(dec!(95)), dec!(5));
    }
}
