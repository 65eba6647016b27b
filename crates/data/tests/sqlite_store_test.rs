use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use spend_recon_core::reconciliation::REASON_NO_CANDIDATE;
use spend_recon_core::{
    AdSpendFilter, CandidateWindow, Confirmation, Direction, LedgerFilter, NewAdSpend,
    NewLedgerTransaction, PageRequest, PendingQuery, ReconDraft, ReconError, ReconFilter,
    ReconStatus, RecordKind, RecordStatus, RecordStore, VersionRef,
};
use spend_recon_data::SqliteStore;

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
}

fn new_ad(operator_id: i64, amount: Decimal, day: u32) -> NewAdSpend {
    NewAdSpend {
        spend_date: date(day),
        project_id: 1,
        channel_id: 2,
        operator_id,
        country: Some("IN".to_string()),
        platform: "facebook".to_string(),
        amount,
        memo: Some("daily".to_string()),
    }
}

fn new_ledger(amount: Decimal, currency: &str, day: u32) -> NewLedgerTransaction {
    NewLedgerTransaction {
        tx_date: date(day),
        direction: Direction::Expense,
        amount,
        currency: currency.to_string(),
        account_name: "ops wallet".to_string(),
        fee_amount: dec!(0.5),
        project_id: Some(1),
        operator_id: None,
        description: None,
    }
}

#[tokio::test]
async fn test_round_trips_records_exactly() {
    let store = SqliteStore::in_memory().await.unwrap();
    let now = Utc::now();

    let ad = store
        .append_ad_spend(new_ad(3, dec!(123.45), 10), now)
        .await
        .unwrap();
    assert_eq!(ad.id, 1);
    assert_eq!(ad.amount, dec!(123.45));
    assert_eq!(ad.status, RecordStatus::Unmatched);
    assert_eq!(ad.memo.as_deref(), Some("daily"));

    let ledger = store
        .append_ledger(new_ledger(dec!(1000), "inr", 10), dec!(12.05), now)
        .await
        .unwrap();
    assert_eq!(ledger.currency, "INR");
    assert_eq!(ledger.amount_usdt, dec!(12.05));
    assert_eq!(ledger.fee_amount, dec!(0.5));
    assert_eq!(store.ledger(ledger.id).await.unwrap(), ledger);
}

#[tokio::test]
async fn test_validation_and_not_found() {
    let store = SqliteStore::in_memory().await.unwrap();
    let err = store
        .append_ad_spend(new_ad(3, dec!(-1), 10), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::Validation(_)));

    let err = store.ad_spend(77).await.unwrap_err();
    assert_eq!(err, ReconError::not_found(RecordKind::AdSpend, 77));
}

#[tokio::test]
async fn test_update_status_rejects_backwards_moves() {
    let store = SqliteStore::in_memory().await.unwrap();
    let now = Utc::now();
    let ledger = store
        .append_ledger(new_ledger(dec!(50), "USD", 3), dec!(50), now)
        .await
        .unwrap();

    store
        .update_status(RecordKind::Ledger, ledger.id, RecordStatus::Matched, now)
        .await
        .unwrap();
    let err = store
        .update_status(RecordKind::Ledger, ledger.id, RecordStatus::NeedReview, now)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_pending_pages_in_creation_order() {
    let store = SqliteStore::in_memory().await.unwrap();
    let now = Utc::now();
    for day in [9, 3, 7] {
        store.append_ad_spend(new_ad(1, dec!(10), day), now).await.unwrap();
    }
    store
        .update_status(RecordKind::AdSpend, 2, RecordStatus::NeedReview, now)
        .await
        .unwrap();

    let unmatched = store
        .unmatched_ad_spends(&PendingQuery::unmatched(10))
        .await
        .unwrap();
    assert_eq!(unmatched.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);

    let open = store
        .unmatched_ad_spends(&PendingQuery::open(10).after(1))
        .await
        .unwrap();
    assert_eq!(open.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);
}

#[tokio::test]
async fn test_candidates_are_windowed_and_ordered() {
    let store = SqliteStore::in_memory().await.unwrap();
    let now = Utc::now();
    let exact = store
        .append_ledger(new_ledger(dec!(100), "USD", 12), dec!(100), now)
        .await
        .unwrap();
    let near = store
        .append_ledger(new_ledger(dec!(97), "USD", 10), dec!(97), now)
        .await
        .unwrap();
    store
        .append_ledger(new_ledger(dec!(100), "USD", 20), dec!(100), now)
        .await
        .unwrap();
    store
        .append_ledger(new_ledger(dec!(200), "USD", 10), dec!(200), now)
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
        vec![exact.id, near.id]
    );
}

#[tokio::test]
async fn test_candidate_limit_counts_only_exact_hits() {
    let store = SqliteStore::in_memory().await.unwrap();
    let now = Utc::now();
    // Inside the REAL slack but below the exact lower bound.
    store
        .append_ledger(new_ledger(dec!(100.00), "USD", 10), dec!(100.00), now)
        .await
        .unwrap();
    let inside = store
        .append_ledger(new_ledger(dec!(100.01), "USD", 10), dec!(100.01), now)
        .await
        .unwrap();
    store
        .append_ad_spend(new_ad(1, dec!(100.00), 10), now)
        .await
        .unwrap();
    let report = store
        .append_ad_spend(new_ad(1, dec!(100.01), 10), now)
        .await
        .unwrap();

    let window = CandidateWindow {
        date_from: date(5),
        date_to: date(15),
        amount_min: dec!(100.004),
        amount_max: dec!(110),
        target_amount: dec!(100.004),
        limit: 1,
    };
    let ledgers = store.ledger_candidates(&window).await.unwrap();
    assert_eq!(ledgers.iter().map(|l| l.id).collect::<Vec<_>>(), vec![inside.id]);
    let reports = store.ad_spend_candidates(&window).await.unwrap();
    assert_eq!(reports.iter().map(|r| r.id).collect::<Vec<_>>(), vec![report.id]);
}

#[tokio::test]
async fn test_commit_supersedes_and_guards_versions() {
    let store = SqliteStore::in_memory().await.unwrap();
    let now = Utc::now();
    let ad = store.append_ad_spend(new_ad(1, dec!(100), 10), now).await.unwrap();

    let orphan = store
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
    assert!(orphan.match_score.is_none());

    let ledger = store
        .append_ledger(new_ledger(dec!(100), "USD", 10), dec!(100), now)
        .await
        .unwrap();
    let stale = ReconDraft {
        ad_spend: Some(VersionRef::new(ad.id, ad.version)),
        ledger: Some(VersionRef::new(ledger.id, ledger.version)),
        amount_diff: Decimal::ZERO,
        date_diff: 0,
        match_score: Some(dec!(100)),
        status: ReconStatus::Matched,
        reason: None,
    };
    let err = store.commit(&stale, now).await.unwrap_err();
    assert!(err.is_retryable());

    let fresh = store.ad_spend(ad.id).await.unwrap();
    let matched = store
        .commit(
            &ReconDraft {
                ad_spend: Some(VersionRef::new(fresh.id, fresh.version)),
                ..stale
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(matched.match_score, Some(dec!(100)));

    let old = store.reconciliation(orphan.id).await.unwrap();
    assert_eq!(old.superseded_by, Some(matched.id));
    assert_eq!(
        store
            .active_reconciliation_for_ad_spend(ad.id)
            .await
            .unwrap()
            .map(|r| r.id),
        Some(matched.id)
    );
    assert_eq!(store.ledger(ledger.id).await.unwrap().status, RecordStatus::Matched);
}

#[tokio::test]
async fn test_review_row_replaces_ledger_orphan() {
    let store = SqliteStore::in_memory().await.unwrap();
    let now = Utc::now();
    let ledger = store
        .append_ledger(new_ledger(dec!(95), "USD", 12), dec!(95), now)
        .await
        .unwrap();
    let orphan = store
        .commit(
            &ReconDraft {
                ad_spend: None,
                ledger: Some(VersionRef::new(ledger.id, ledger.version)),
                amount_diff: dec!(95),
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
    let ad = store.append_ad_spend(new_ad(1, dec!(100), 10), now).await.unwrap();
    let review = store
        .commit(
            &ReconDraft {
                ad_spend: Some(VersionRef::new(ad.id, ad.version)),
                ledger: Some(VersionRef::new(ledger.id, ledger.version)),
                amount_diff: dec!(-5),
                date_diff: 2,
                match_score: Some(dec!(75)),
                status: ReconStatus::NeedReview,
                reason: None,
            },
            now,
        )
        .await
        .unwrap();

    let old = store.reconciliation(orphan.id).await.unwrap();
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
async fn test_confirm_review_record() {
    let store = SqliteStore::in_memory().await.unwrap();
    let now = Utc::now();
    let ad = store.append_ad_spend(new_ad(1, dec!(100), 10), now).await.unwrap();
    let ledger = store
        .append_ledger(new_ledger(dec!(95), "USD", 12), dec!(95), now)
        .await
        .unwrap();
    let review = store
        .commit(
            &ReconDraft {
                ad_spend: Some(VersionRef::new(ad.id, ad.version)),
                ledger: Some(VersionRef::new(ledger.id, ledger.version)),
                amount_diff: dec!(-5),
                date_diff: 2,
                match_score: Some(dec!(75)),
                status: ReconStatus::NeedReview,
                reason: Some("score below auto-match threshold".to_string()),
            },
            now,
        )
        .await
        .unwrap();

    let confirmation = Confirmation {
        reconciliation_id: review.id,
        expected_version: review.version,
        actor: "alice".to_string(),
        at: now,
    };
    let confirmed = store.confirm(&confirmation).await.unwrap();
    assert_eq!(confirmed.status, ReconStatus::Matched);
    assert_eq!(confirmed.confirmed_by.as_deref(), Some("alice"));
    assert_eq!(confirmed.reason.as_deref(), Some("manually confirmed"));
    assert_eq!(store.ad_spend(ad.id).await.unwrap().status, RecordStatus::Matched);

    let err = store.confirm(&confirmation).await.unwrap_err();
    assert!(matches!(err, ReconError::InvalidTransition(_)));
}

#[tokio::test]
async fn test_listings_filter_and_page() {
    let store = SqliteStore::in_memory().await.unwrap();
    let now = Utc::now();
    for (operator, day) in [(1, 1), (2, 2), (1, 3), (1, 4)] {
        store
            .append_ad_spend(new_ad(operator, dec!(10), day), now)
            .await
            .unwrap();
    }
    let mut income = new_ledger(dec!(10), "USD", 5);
    income.direction = Direction::Income;
    store.append_ledger(income, dec!(10), now).await.unwrap();
    store
        .append_ledger(new_ledger(dec!(10), "USD", 6), dec!(10), now)
        .await
        .unwrap();

    let filter = AdSpendFilter {
        operator_id: Some(1),
        ..AdSpendFilter::default()
    };
    let (rows, total) = store
        .list_ad_spends(&filter, PageRequest::new(Some(1), Some(1)))
        .await
        .unwrap();
    assert_eq!(total, 3);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].spend_date, date(3));

    let expenses = LedgerFilter {
        direction: Some(Direction::Expense),
        ..LedgerFilter::default()
    };
    let (rows, total) = store
        .list_ledgers(&expenses, PageRequest::default())
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].tx_date, date(6));

    let latest = store.latest_ad_spend_for_operator(1).await.unwrap().unwrap();
    assert_eq!(latest.spend_date, date(4));

    let pending_only = ReconFilter {
        status: Some(ReconStatus::Pending),
        ..ReconFilter::default()
    };
    let (rows, total) = store
        .list_reconciliations(&pending_only, PageRequest::default())
        .await
        .unwrap();
    assert!(rows.is_empty());
    assert_eq!(total, 0);
}
