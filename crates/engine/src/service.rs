//! `ReconService`: the transport-independent facade.
//!
//! Every entry point takes the calling [`Principal`] and checks its
//! permissions before touching the store. HTTP handlers, the scheduler and the
//! CLI all go through this type.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use spend_recon_core::reconciliation::REASON_NO_CANDIDATE;
use spend_recon_core::{
    AdSpendFilter, AdSpendRecord, AppConfig, CurrencyTable, LedgerFilter, LedgerTransaction,
    NewAdSpend, NewLedgerTransaction, PageRequest, PendingQuery, Permission, Principal,
    ReconDraft, ReconFilter, ReconStatus, ReconciliationRecord, RecordId, RecordStore, Result,
    VersionRef,
};

use crate::lifecycle::LifecycleManager;
use crate::matcher::{Matcher, PassReport};
use crate::query::{Page, QueryService, ReconciliationView};
use crate::report::{self, MonthlySummary};

/// Warning attached to an ad-spend report that moved sharply.
pub const WARNING_AMOUNT_JUMP: &str = "amount_diff_gt_30";

/// Relative change against the operator's previous report that triggers the warning.
const AMOUNT_JUMP_RATIO: Decimal = dec!(0.3);

/// Result of ingesting one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ingested<T> {
    /// The record as stored after matching.
    pub record: T,
    /// Its active reconciliation, if matching produced or kept one.
    pub reconciliation: Option<ReconciliationRecord>,
    pub warning: Option<&'static str>,
    pub report: PassReport,
}

/// Returns the warning for a report of `amount` following one of `previous`.
#[must_use]
pub fn amount_jump_warning(previous: Decimal, amount: Decimal) -> Option<&'static str> {
    if previous <= Decimal::ZERO {
        return None;
    }
    ((amount - previous).abs() / previous > AMOUNT_JUMP_RATIO).then_some(WARNING_AMOUNT_JUMP)
}

pub struct ReconService {
    store: Arc<dyn RecordStore>,
    currency: CurrencyTable,
    matcher: Matcher,
    lifecycle: LifecycleManager,
    query: QueryService,
    batch_size: u32,
}

impl ReconService {
    /// Builds the service, validating the matching and currency settings.
    ///
    /// # Errors
    /// Returns `ReconError::Configuration` for invalid settings.
    pub fn new(store: Arc<dyn RecordStore>, config: &AppConfig) -> Result<Self> {
        config.matching.validate()?;
        let currency = CurrencyTable::from_config(&config.currency)?;
        Ok(Self {
            store,
            currency,
            matcher: Matcher::from_config(&config.matching),
            lifecycle: LifecycleManager::new(),
            query: QueryService::new(),
            batch_size: config.matching.batch_size,
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    #[must_use]
    pub fn currency(&self) -> &CurrencyTable {
        &self.currency
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Stores an ad-spend report and matches it against open ledger transactions.
    ///
    /// # Errors
    /// `Forbidden` for a principal that may not report for the operator,
    /// `Validation` for a malformed report, or a store failure. A failed
    /// matching attempt is logged and counted in the report instead.
    pub async fn ingest_ad_spend(
        &self,
        principal: &Principal,
        new: NewAdSpend,
    ) -> Result<Ingested<AdSpendRecord>> {
        principal.require(Permission::SubmitAdSpend)?;
        principal.require_operator(new.operator_id)?;
        new.validate()?;

        let previous = self.store.latest_ad_spend_for_operator(new.operator_id).await?;
        let warning = previous.and_then(|p| amount_jump_warning(p.amount, new.amount));

        let record = self.store.append_ad_spend(new, Utc::now()).await?;
        info!(
            ad_spend_id = record.id,
            operator_id = record.operator_id,
            amount = %record.amount,
            user_id = %principal.user_id,
            warning = warning.unwrap_or(""),
            "Ad spend recorded"
        );

        let report = self
            .matcher
            .run_pass(self.store.as_ref(), vec![record.clone()], Utc::now())
            .await;

        let record = self.store.ad_spend(record.id).await?;
        let reconciliation = self.store.active_reconciliation_for_ad_spend(record.id).await?;
        Ok(Ingested {
            record,
            reconciliation,
            warning,
            report,
        })
    }

    /// Stores a ledger transaction, normalizing its amount to USDT, and
    /// matches expense transactions against open ad-spend reports.
    ///
    /// # Errors
    /// `Forbidden`, `Validation` (including an unknown currency) or a store failure.
    pub async fn ingest_ledger(
        &self,
        principal: &Principal,
        new: NewLedgerTransaction,
    ) -> Result<Ingested<LedgerTransaction>> {
        principal.require(Permission::RecordLedger)?;
        new.validate()?;
        let amount_usdt = self.currency.to_usdt(new.amount, &new.currency)?;

        let ledger = self.store.append_ledger(new, amount_usdt, Utc::now()).await?;
        info!(
            ledger_id = ledger.id,
            direction = %ledger.direction,
            amount = %ledger.amount,
            currency = %ledger.currency,
            amount_usdt = %ledger.amount_usdt,
            user_id = %principal.user_id,
            "Ledger transaction recorded"
        );

        if !ledger.is_reconcilable() {
            return Ok(Ingested {
                record: ledger,
                reconciliation: None,
                warning: None,
                report: PassReport::default(),
            });
        }

        let (reconciliation, report) = match self.match_ledger(&ledger).await {
            Ok(result) => result,
            Err(e) => {
                warn!(ledger_id = ledger.id, error = %e, "Matching new ledger transaction failed");
                (
                    None,
                    PassReport {
                        processed: 1,
                        failed: 1,
                        ..PassReport::default()
                    },
                )
            }
        };

        let record = self.store.ledger(ledger.id).await?;
        Ok(Ingested {
            record,
            reconciliation,
            warning: None,
            report,
        })
    }

    /// Runs a pass anchored on the ad-spends the ledger could pair with, or
    /// records the ledger as having no candidate.
    async fn match_ledger(
        &self,
        ledger: &LedgerTransaction,
    ) -> Result<(Option<ReconciliationRecord>, PassReport)> {
        let anchors = self
            .matcher
            .candidates()
            .ad_spends_for(self.store.as_ref(), ledger)
            .await?;

        if anchors.is_empty() {
            let draft = ReconDraft {
                ad_spend: None,
                ledger: Some(VersionRef::new(ledger.id, ledger.version)),
                amount_diff: ledger.amount_usdt,
                date_diff: 0,
                match_score: None,
                status: ReconStatus::NeedReview,
                reason: Some(REASON_NO_CANDIDATE.to_string()),
            };
            let record = self.store.commit(&draft, Utc::now()).await?;
            debug!(ledger_id = ledger.id, reconciliation_id = record.id, "No ad-spend candidate");
            let report = PassReport {
                processed: 1,
                need_review: 1,
                ..PassReport::default()
            };
            return Ok((Some(record), report));
        }

        let report = self
            .matcher
            .run_pass(self.store.as_ref(), anchors, Utc::now())
            .await;
        let reconciliation = self.store.active_reconciliation_for_ledger(ledger.id).await?;
        Ok((reconciliation, report))
    }

    // =========================================================================
    // Matching passes
    // =========================================================================

    /// Re-examines every open ad-spend report, oldest first, page by page.
    ///
    /// # Errors
    /// Only a failure to load a page aborts the sweep; per-record failures
    /// are counted in the report.
    pub async fn sweep(&self) -> Result<PassReport> {
        let mut total = PassReport::default();
        let mut cursor: Option<RecordId> = None;

        loop {
            let mut query = PendingQuery::open(self.batch_size);
            if let Some(after) = cursor {
                query = query.after(after);
            }
            let page = self.store.unmatched_ad_spends(&query).await?;
            let fetched = page.len();
            cursor = page.iter().map(|r| r.id).max().or(cursor);

            let report = self
                .matcher
                .run_pass(self.store.as_ref(), page, Utc::now())
                .await;
            total.merge(&report);

            if fetched < self.batch_size as usize {
                break;
            }
        }

        info!(
            processed = total.processed,
            matched = total.matched,
            need_review = total.need_review,
            failed = total.failed,
            success_rate = %total.success_rate(),
            "Sweep complete"
        );
        Ok(total)
    }

    /// Runs a sweep on behalf of a caller.
    ///
    /// # Errors
    /// `Forbidden` unless the principal may run reconciliation.
    pub async fn run_reconciliation(&self, principal: &Principal) -> Result<PassReport> {
        principal.require(Permission::RunReconciliation)?;
        info!(user_id = %principal.user_id, "Reconciliation run requested");
        self.sweep().await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Applies a manual status change to a reconciliation.
    ///
    /// # Errors
    /// `Forbidden`, `NotFound`, `InvalidTransition` or `Conflict`.
    pub async fn confirm(
        &self,
        principal: &Principal,
        id: RecordId,
        target: ReconStatus,
        expected_version: Option<i64>,
    ) -> Result<ReconciliationRecord> {
        principal.require(Permission::ConfirmReconciliation)?;
        self.lifecycle
            .confirm(
                self.store.as_ref(),
                id,
                target,
                expected_version,
                &principal.user_id,
                Utc::now(),
            )
            .await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// # Errors
    /// `Forbidden` or a store failure.
    pub async fn list_reconciliations(
        &self,
        principal: &Principal,
        filter: &ReconFilter,
        page: PageRequest,
    ) -> Result<Page<ReconciliationView>> {
        principal.require(Permission::ViewRecords)?;
        self.query
            .reconciliations(self.store.as_ref(), filter, page)
            .await
    }

    /// # Errors
    /// `Forbidden` or a store failure.
    pub async fn list_ad_spends(
        &self,
        principal: &Principal,
        filter: &AdSpendFilter,
        page: PageRequest,
    ) -> Result<Page<AdSpendRecord>> {
        principal.require(Permission::ViewRecords)?;
        self.query.ad_spends(self.store.as_ref(), filter, page).await
    }

    /// # Errors
    /// `Forbidden` or a store failure.
    pub async fn list_ledgers(
        &self,
        principal: &Principal,
        filter: &LedgerFilter,
        page: PageRequest,
    ) -> Result<Page<LedgerTransaction>> {
        principal.require(Permission::ViewRecords)?;
        self.query.ledgers(self.store.as_ref(), filter, page).await
    }

    /// Matched spend per project and operator, and USDT income per project,
    /// for one calendar month.
    ///
    /// # Errors
    /// `Forbidden`, `Validation` for a month outside 2000-01..=2100-12, or a
    /// store failure.
    pub async fn monthly_summary(
        &self,
        principal: &Principal,
        year: i32,
        month: u32,
    ) -> Result<MonthlySummary> {
        principal.require(Permission::ViewRecords)?;
        let summary = report::monthly_summary(self.store.as_ref(), year, month).await?;
        debug!(
            year,
            month,
            projects = summary.projects.len(),
            total_spend_usdt = %summary.total_spend_usdt,
            "Monthly summary built"
        );
        Ok(summary)
    }
}
