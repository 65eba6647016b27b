//! Candidate generation.
//!
//! Turns one record into a bounded, ordered list of plausible counterparts
//! from the opposite stream. The coarse window is evaluated by the store;
//! project tagging never excludes a candidate, it only feeds the score.

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::debug;

use spend_recon_core::{
    AdSpendRecord, CandidateWindow, LedgerTransaction, Matchable, MatchingConfig, RecordId,
    RecordStore, Result,
};

/// Builds candidate windows and fetches counterparts through the store.
#[derive(Debug, Clone)]
pub struct CandidateGenerator {
    max_date_window_days: i64,
    max_amount_tolerance: Decimal,
    max_relative_tolerance: Decimal,
    max_candidates: usize,
}

impl CandidateGenerator {
    #[must_use]
    pub fn from_config(config: &MatchingConfig) -> Self {
        Self {
            max_date_window_days: config.max_date_window_days,
            max_amount_tolerance: config.max_amount_tolerance,
            max_relative_tolerance: config.max_relative_tolerance,
            max_candidates: config.max_candidates,
        }
    }

    /// Largest allowed |amount_diff| around `amount`.
    #[must_use]
    pub fn amount_tolerance(&self, amount: Decimal) -> Decimal {
        let relative = self
            .max_relative_tolerance
            .checked_mul(amount.abs())
            .unwrap_or(Decimal::MAX);
        self.max_amount_tolerance.max(relative)
    }

    /// The window around `record`, fetching up to `limit` rows.
    ///
    /// Amount bounds saturate at the `Decimal` range.
    #[must_use]
    pub fn window_for(&self, record: &dyn Matchable, limit: usize) -> CandidateWindow {
        let amount = record.match_amount();
        let tolerance = self.amount_tolerance(amount);
        let (date_from, date_to) = date_range(record.match_date(), self.max_date_window_days);
        CandidateWindow {
            date_from,
            date_to,
            amount_min: amount.checked_sub(tolerance).unwrap_or(Decimal::MIN),
            amount_max: amount.checked_add(tolerance).unwrap_or(Decimal::MAX),
            target_amount: amount,
            limit: u32::try_from(limit).unwrap_or(u32::MAX),
        }
    }

    /// Open expense transactions that could pair with `ad`, skipping `exclude`.
    ///
    /// # Errors
    /// Propagates store failures. An empty result is not an error.
    pub async fn ledgers_for(
        &self,
        store: &dyn RecordStore,
        ad: &AdSpendRecord,
        exclude: &HashSet<RecordId>,
    ) -> Result<Vec<LedgerTransaction>> {
        let window = self.window_for(ad, self.max_candidates + exclude.len());
        let mut found = store.ledger_candidates(&window).await?;
        found.retain(|l| !exclude.contains(&l.id));
        found.truncate(self.max_candidates);
        debug!(
            ad_spend_id = ad.id,
            candidates = found.len(),
            excluded = exclude.len(),
            "Generated ledger candidates"
        );
        Ok(found)
    }

    /// Open ad-spend reports that could pair with `ledger`.
    ///
    /// # Errors
    /// Propagates store failures. An empty result is not an error.
    pub async fn ad_spends_for(
        &self,
        store: &dyn RecordStore,
        ledger: &LedgerTransaction,
    ) -> Result<Vec<AdSpendRecord>> {
        let window = self.window_for(ledger, self.max_candidates);
        let found = store.ad_spend_candidates(&window).await?;
        debug!(
            ledger_id = ledger.id,
            candidates = found.len(),
            "Generated ad-spend candidates"
        );
        Ok(found)
    }
}

fn date_range(date: NaiveDate, days: i64) -> (NaiveDate, NaiveDate) {
    let span = Duration::days(days);
    (
        date.checked_sub_signed(span).unwrap_or(NaiveDate::MIN),
        date.checked_add_signed(span).unwrap_or(NaiveDate::MAX),
    )
}
