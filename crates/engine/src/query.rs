//! Read-only projections for display.
//!
//! Reconciliations are joined with summaries of the records they reference.
//! Joins are batched per page: one lookup per stream, never one per row.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use spend_recon_core::{
    AdSpendFilter, AdSpendRecord, Direction, LedgerFilter, LedgerTransaction, PageRequest,
    ReconFilter, ReconciliationRecord, RecordId, RecordStatus, RecordStore, Result,
};

/// Display fields of an ad-spend report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdSpendSummary {
    pub id: RecordId,
    pub spend_date: NaiveDate,
    pub project_id: i64,
    pub channel_id: i64,
    pub operator_id: i64,
    pub platform: String,
    pub amount: Decimal,
    pub status: RecordStatus,
}

impl From<&AdSpendRecord> for AdSpendSummary {
    fn from(r: &AdSpendRecord) -> Self {
        Self {
            id: r.id,
            spend_date: r.spend_date,
            project_id: r.project_id,
            channel_id: r.channel_id,
            operator_id: r.operator_id,
            platform: r.platform.clone(),
            amount: r.amount,
            status: r.status,
        }
    }
}

/// Display fields of a ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub id: RecordId,
    pub tx_date: NaiveDate,
    pub direction: Direction,
    pub amount: Decimal,
    pub currency: String,
    pub amount_usdt: Decimal,
    pub account_name: String,
    pub project_id: Option<i64>,
    pub status: RecordStatus,
}

impl From<&LedgerTransaction> for LedgerSummary {
    fn from(r: &LedgerTransaction) -> Self {
        Self {
            id: r.id,
            tx_date: r.tx_date,
            direction: r.direction,
            amount: r.amount,
            currency: r.currency.clone(),
            amount_usdt: r.amount_usdt,
            account_name: r.account_name.clone(),
            project_id: r.project_id,
            status: r.status,
        }
    }
}

/// A reconciliation with the summaries of both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationView {
    #[serde(flatten)]
    pub record: ReconciliationRecord,
    pub ad_spend: Option<AdSpendSummary>,
    pub ledger_transaction: Option<LedgerSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub total: u64,
    pub skip: u32,
    pub limit: u32,
    pub has_more: bool,
}

impl PageMeta {
    #[must_use]
    pub fn new(page: PageRequest, returned: usize, total: u64) -> Self {
        let seen = u64::from(page.skip) + returned as u64;
        Self {
            total,
            skip: page.skip,
            limit: page.limit,
            has_more: seen < total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub meta: PageMeta,
}

impl<T> Page<T> {
    fn new(items: Vec<T>, page: PageRequest, total: u64) -> Self {
        let meta = PageMeta::new(page, items.len(), total);
        Self { items, meta }
    }
}

/// Paginated listings. Never mutates the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryService;

impl QueryService {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Reconciliations, newest first, joined with record summaries.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn reconciliations(
        &self,
        store: &dyn RecordStore,
        filter: &ReconFilter,
        page: PageRequest,
    ) -> Result<Page<ReconciliationView>> {
        let (records, total) = store.list_reconciliations(filter, page).await?;

        let ad_ids: Vec<RecordId> = records.iter().filter_map(|r| r.ad_spend_id).collect();
        let ledger_ids: Vec<RecordId> = records.iter().filter_map(|r| r.ledger_id).collect();

        let ads: HashMap<RecordId, AdSpendSummary> = store
            .ad_spends_by_ids(&ad_ids)
            .await?
            .iter()
            .map(|r| (r.id, AdSpendSummary::from(r)))
            .collect();
        let ledgers: HashMap<RecordId, LedgerSummary> = store
            .ledgers_by_ids(&ledger_ids)
            .await?
            .iter()
            .map(|r| (r.id, LedgerSummary::from(r)))
            .collect();

        let views = records
            .into_iter()
            .map(|record| ReconciliationView {
                ad_spend: record.ad_spend_id.and_then(|id| ads.get(&id).cloned()),
                ledger_transaction: record.ledger_id.and_then(|id| ledgers.get(&id).cloned()),
                record,
            })
            .collect();
        Ok(Page::new(views, page, total))
    }

    /// Raw ad-spend reports, newest first.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn ad_spends(
        &self,
        store: &dyn RecordStore,
        filter: &AdSpendFilter,
        page: PageRequest,
    ) -> Result<Page<AdSpendRecord>> {
        let (items, total) = store.list_ad_spends(filter, page).await?;
        Ok(Page::new(items, page, total))
    }

    /// Raw ledger transactions, newest first.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn ledgers(
        &self,
        store: &dyn RecordStore,
        filter: &LedgerFilter,
        page: PageRequest,
    ) -> Result<Page<LedgerTransaction>> {
        let (items, total) = store.list_ledgers(filter, page).await?;
        Ok(Page::new(items, page, total))
    }
}
