use chrono::NaiveDate;
use proptest::prelude::*;
use proptest::test_runner::Config;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;

use spend_recon_core::store::MAX_PAGE_LIMIT;
use spend_recon_core::{
    AppConfig, Direction, NewAdSpend, NewLedgerTransaction, PageRequest, Principal, ReconFilter,
    ReconStatus, Role,
};
use spend_recon_data::MemoryStore;
use spend_recon_engine::ReconService;

#[derive(Debug, Clone)]
enum Step {
    Report { amount: Decimal, day: u32, project_id: i64 },
    Ledger { amount: Decimal, day: u32, project_id: Option<i64> },
    Sweep,
}

fn amount_strategy() -> impl Strategy<Value = Decimal> {
    // A narrow set so reports and ledgers contend for the same counterparts.
    prop::sample::select(vec![dec!(100), dec!(100.50), dec!(95), dec!(250), dec!(40)])
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (amount_strategy(), 8u32..=13, 1i64..=2)
            .prop_map(|(amount, day, project_id)| Step::Report { amount, day, project_id }),
        3 => (amount_strategy(), 8u32..=13, prop::option::of(1i64..=2))
            .prop_map(|(amount, day, project_id)| Step::Ledger { amount, day, project_id }),
        1 => Just(Step::Sweep),
    ]
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn report(amount: Decimal, day: u32, project_id: i64) -> NewAdSpend {
    NewAdSpend {
        spend_date: date(day),
        project_id,
        channel_id: 1,
        operator_id: 7,
        country: None,
        platform: "facebook".to_string(),
        amount,
        memo: None,
    }
}

fn ledger(amount: Decimal, day: u32, project_id: Option<i64>) -> NewLedgerTransaction {
    NewLedgerTransaction {
        tx_date: date(day),
        direction: Direction::Expense,
        amount,
        currency: "USDT".to_string(),
        account_name: "ops wallet".to_string(),
        fee_amount: Decimal::ZERO,
        project_id,
        operator_id: None,
        description: None,
    }
}

fn operator() -> Principal {
    Principal::new("pitcher-7", Role::Operator).with_operator(7)
}

fn finance() -> Principal {
    Principal::new("finance-1", Role::Finance)
}

fn everything() -> PageRequest {
    PageRequest::new(None, Some(MAX_PAGE_LIMIT))
}

/// Replays `steps`, settles with a sweep, and checks the active rows.
async fn replay(steps: Vec<Step>) -> Result<(), TestCaseError> {
    let service = ReconService::new(Arc::new(MemoryStore::new()), &AppConfig::default())
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    for step in steps {
        match step {
            Step::Report { amount, day, project_id } => {
                service
                    .ingest_ad_spend(&operator(), report(amount, day, project_id))
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            Step::Ledger { amount, day, project_id } => {
                service
                    .ingest_ledger(&finance(), ledger(amount, day, project_id))
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            Step::Sweep => {
                let report = service
                    .sweep()
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                prop_assert_eq!(report.failed, 0);
            }
        }
    }
    service
        .sweep()
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    let active = service
        .list_reconciliations(&finance(), &ReconFilter::default(), everything())
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert!(!active.meta.has_more);

    let mut matched_ads = HashSet::new();
    let mut matched_ledgers = HashSet::new();
    for view in active.items.iter().filter(|v| v.record.status == ReconStatus::Matched) {
        let record = &view.record;
        prop_assert!(record.ad_spend_id.is_some() && record.ledger_id.is_some());
        prop_assert!(matched_ads.insert(record.ad_spend_id), "report matched twice: {:?}", record);
        prop_assert!(matched_ledgers.insert(record.ledger_id), "ledger matched twice: {:?}", record);
    }

    let with_history = ReconFilter {
        include_history: true,
        ..ReconFilter::default()
    };
    let before = service
        .list_reconciliations(&finance(), &with_history, PageRequest::new(None, Some(1)))
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    let rerun = service
        .sweep()
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    let after = service
        .list_reconciliations(&finance(), &with_history, PageRequest::new(None, Some(1)))
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(rerun.matched + rerun.need_review, 0);
    prop_assert_eq!(before.meta.total, after.meta.total);
    Ok(())
}

proptest! {
    #![proptest_config(Config::with_cases(48))]

    #[test]
    fn active_rows_pair_each_record_once(steps in prop::collection::vec(step_strategy(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(replay(steps))?;
    }
}
