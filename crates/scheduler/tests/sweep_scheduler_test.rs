use chrono::{NaiveDate, Utc};
use rust_decimal_macros::dec;
use std::sync::Arc;

use spend_recon_core::{
    AppConfig, Direction, NewAdSpend, NewLedgerTransaction, RecordStatus, RecordStore, SweepConfig,
};
use spend_recon_data::MemoryStore;
use spend_recon_engine::ReconService;
use spend_recon_scheduler::SweepScheduler;

fn scheduler(store: Arc<MemoryStore>, sweep: SweepConfig) -> SweepScheduler {
    let service = ReconService::new(store, &AppConfig::default()).unwrap();
    SweepScheduler::new(sweep, Arc::new(service))
}

#[tokio::test]
async fn test_run_once_matches_late_counterparts() {
    let store = Arc::new(MemoryStore::new());
    let day = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
    let ad = store
        .append_ad_spend(
            NewAdSpend {
                spend_date: day,
                project_id: 5,
                channel_id: 1,
                operator_id: 1,
                country: None,
                platform: "tiktok".to_string(),
                amount: dec!(42.50),
                memo: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    store
        .append_ledger(
            NewLedgerTransaction {
                tx_date: day,
                direction: Direction::Expense,
                amount: dec!(42.50),
                currency: "USDT".to_string(),
                account_name: "wallet".to_string(),
                fee_amount: dec!(0),
                project_id: Some(5),
                operator_id: None,
                description: None,
            },
            dec!(42.50),
            Utc::now(),
        )
        .await
        .unwrap();

    let report = scheduler(store.clone(), SweepConfig::default())
        .run_once()
        .await
        .unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(store.ad_spend(ad.id).await.unwrap().status, RecordStatus::Matched);
}

#[tokio::test]
async fn test_disabled_sweep_does_not_start() {
    let sweep = SweepConfig {
        enabled: false,
        ..SweepConfig::default()
    };
    let started = scheduler(Arc::new(MemoryStore::new()), sweep).start().await.unwrap();
    assert!(started.is_none());
}

#[tokio::test]
async fn test_invalid_cron_is_rejected() {
    let sweep = SweepConfig {
        enabled: true,
        cron_schedule: "every fifteen minutes".to_string(),
    };
    let err = scheduler(Arc::new(MemoryStore::new()), sweep)
        .start()
        .await
        .map(|_| ())
        .unwrap_err();
    assert!(err.to_string().contains("invalid sweep cron schedule"));
}
