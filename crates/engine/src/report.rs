//! Monthly spend and income summary.
//!
//! Spend counts only reports that ended `matched`, grouped by the month of
//! `spend_date`. Income counts `income` ledger transactions booked in USDT,
//! grouped by the month of `tx_date`. Nothing is persisted.

use chrono::{Months, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use spend_recon_core::store::MAX_PAGE_LIMIT;
use spend_recon_core::{
    AdSpendFilter, Direction, LedgerFilter, PageRequest, ReconError, RecordStatus, RecordStore,
    Result, SETTLEMENT_CURRENCY,
};

const MIN_YEAR: i32 = 2000;
const MAX_YEAR: i32 = 2100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectMonth {
    /// `None` collects income booked without a project.
    pub project_id: Option<i64>,
    pub spend_usdt: Decimal,
    pub income_usdt: Decimal,
    pub net_usdt: Decimal,
    /// `net / income` as a percentage; absent without income.
    pub profit_margin: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorMonth {
    pub operator_id: i64,
    pub spend_usdt: Decimal,
}

/// Matched spend and USDT income of one calendar month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlySummary {
    pub year: i32,
    pub month: u32,
    pub projects: Vec<ProjectMonth>,
    pub operators: Vec<OperatorMonth>,
    pub total_spend_usdt: Decimal,
    pub total_income_usdt: Decimal,
}

/// First and last day of a month, for years 2000 to 2100.
///
/// # Errors
/// Returns `ReconError::Validation` outside that range.
pub fn month_bounds(year: i32, month: u32) -> Result<(NaiveDate, NaiveDate)> {
    if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
        return Err(ReconError::validation(format!(
            "year must be between {MIN_YEAR} and {MAX_YEAR}"
        )));
    }
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| ReconError::validation("month must be between 1 and 12"))?;
    let last = first
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .ok_or_else(|| ReconError::validation("month is out of range"))?;
    Ok((first, last))
}

fn profit_margin(net: Decimal, income: Decimal) -> Option<Decimal> {
    (income > Decimal::ZERO).then(|| (net / income * Decimal::ONE_HUNDRED).round_dp(2))
}

/// Builds the summary by paging through both listings.
///
/// # Errors
/// `Validation` for an invalid month, otherwise store failures.
pub async fn monthly_summary(store: &dyn RecordStore, year: i32, month: u32) -> Result<MonthlySummary> {
    let (first, last) = month_bounds(year, month)?;

    let mut spend_by_project: BTreeMap<Option<i64>, Decimal> = BTreeMap::new();
    let mut spend_by_operator: BTreeMap<i64, Decimal> = BTreeMap::new();
    let mut income_by_project: BTreeMap<Option<i64>, Decimal> = BTreeMap::new();

    let ad_filter = AdSpendFilter {
        date_from: Some(first),
        date_to: Some(last),
        ..AdSpendFilter::default()
    };
    let mut page = PageRequest::new(None, Some(MAX_PAGE_LIMIT));
    loop {
        let (items, total) = store.list_ad_spends(&ad_filter, page).await?;
        let fetched = items.len();
        for ad in items.into_iter().filter(|a| a.status == RecordStatus::Matched) {
            *spend_by_project.entry(Some(ad.project_id)).or_default() += ad.amount;
            *spend_by_operator.entry(ad.operator_id).or_default() += ad.amount;
        }
        page.skip = page.skip.saturating_add(page.limit);
        if fetched == 0 || u64::from(page.skip) >= total {
            break;
        }
    }

    let ledger_filter = LedgerFilter {
        direction: Some(Direction::Income),
        date_from: Some(first),
        date_to: Some(last),
        ..LedgerFilter::default()
    };
    let mut page = PageRequest::new(None, Some(MAX_PAGE_LIMIT));
    loop {
        let (items, total) = store.list_ledgers(&ledger_filter, page).await?;
        let fetched = items.len();
        for tx in items
            .into_iter()
            .filter(|t| t.currency.eq_ignore_ascii_case(SETTLEMENT_CURRENCY))
        {
            *income_by_project.entry(tx.project_id).or_default() += tx.amount;
        }
        page.skip = page.skip.saturating_add(page.limit);
        if fetched == 0 || u64::from(page.skip) >= total {
            break;
        }
    }

    let mut project_ids: Vec<Option<i64>> = spend_by_project
        .keys()
        .chain(income_by_project.keys())
        .copied()
        .collect();
    project_ids.sort_unstable();
    project_ids.dedup();

    let projects: Vec<ProjectMonth> = project_ids
        .into_iter()
        .map(|project_id| {
            let spend = spend_by_project.get(&project_id).copied().unwrap_or_default();
            let income = income_by_project.get(&project_id).copied().unwrap_or_default();
            let net = income - spend;
            ProjectMonth {
                project_id,
                spend_usdt: spend,
                income_usdt: income,
                net_usdt: net,
                profit_margin: profit_margin(net, income),
            }
        })
        .collect();

    Ok(MonthlySummary {
        year,
        month,
        total_spend_usdt: projects.iter().map(|p| p.spend_usdt).sum(),
        total_income_usdt: projects.iter().map(|p| p.income_usdt).sum(),
        operators: spend_by_operator
            .into_iter()
            .map(|(operator_id, spend_usdt)| OperatorMonth {
                operator_id,
                spend_usdt,
            })
            .collect(),
        projects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_month_bounds() {
        let (first, last) = month_bounds(2024, 2).unwrap();
        assert_eq!(first, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(last, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());

        let (_, december) = month_bounds(2023, 12).unwrap();
        assert_eq!(december, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());

        assert!(matches!(month_bounds(2024, 13), Err(ReconError::Validation(_))));
        assert!(matches!(month_bounds(2024, 0), Err(ReconError::Validation(_))));
        assert!(matches!(month_bounds(1999, 5), Err(ReconError::Validation(_))));
    }

    #[test]
    fn test_profit_margin() {
        assert_eq!(profit_margin(dec!(25), dec!(100)), Some(dec!(25)));
        assert_eq!(profit_margin(dec!(-50), dec!(150)), Some(dec!(-33.33)));
        assert_eq!(profit_margin(dec!(-10), Decimal::ZERO), None);
    }
}
