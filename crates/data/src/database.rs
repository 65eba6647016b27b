use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

use spend_recon_core::{
    AdSpendFilter, AdSpendRecord, CandidateWindow, Confirmation, LedgerFilter, LedgerTransaction,
    NewAdSpend, NewLedgerTransaction, PageRequest, PendingQuery, ReconDraft, ReconError,
    ReconFilter, ReconciliationRecord, RecordId, RecordKind, RecordStatus, RecordStore, Result,
};

use crate::models::map_sqlx;
use crate::repositories::Repositories;

/// `SQLite`-backed [`RecordStore`].
///
/// Schema migrations are embedded and applied on connect.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    repos: Repositories,
}

impl SqliteStore {
    /// Connects to `database_url` and runs migrations.
    ///
    /// # Arguments
    ///
    /// * `database_url` - `SQLite` URL (e.g., `sqlite://data/recon.db?mode=rwc`)
    /// * `max_connections` - Pool size
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the connection or a migration fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_sqlx)?;

        let store = Self::with_pool(pool).await?;
        info!(database_url, "Connected record store");
        Ok(store)
    }

    /// Creates a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the connection or a migration fails.
    pub async fn in_memory() -> Result<Self> {
        // Every connection to `sqlite::memory:` is a separate database, so the
        // pool holds exactly one that never expires.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(map_sqlx)?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| ReconError::storage(format!("migration failed: {e}")))?;

        Ok(Self {
            repos: Repositories::new(pool.clone()),
            pool,
        })
    }

    /// Closes the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn append_ad_spend(
        &self,
        new: NewAdSpend,
        now: DateTime<Utc>,
    ) -> Result<AdSpendRecord> {
        self.repos.ad_spend.insert(new, now).await
    }

    async fn append_ledger(
        &self,
        new: NewLedgerTransaction,
        amount_usdt: Decimal,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction> {
        self.repos.ledger.insert(new, amount_usdt, now).await
    }

    async fn ad_spend(&self, id: RecordId) -> Result<AdSpendRecord> {
        self.repos.ad_spend.get(id).await
    }

    async fn ledger(&self, id: RecordId) -> Result<LedgerTransaction> {
        self.repos.ledger.get(id).await
    }

    async fn ad_spends_by_ids(&self, ids: &[RecordId]) -> Result<Vec<AdSpendRecord>> {
        self.repos.ad_spend.get_many(ids).await
    }

    async fn ledgers_by_ids(&self, ids: &[RecordId]) -> Result<Vec<LedgerTransaction>> {
        self.repos.ledger.get_many(ids).await
    }

    async fn unmatched_ad_spends(&self, query: &PendingQuery) -> Result<Vec<AdSpendRecord>> {
        self.repos.ad_spend.pending(query).await
    }

    async fn unmatched_ledgers(&self, query: &PendingQuery) -> Result<Vec<LedgerTransaction>> {
        self.repos.ledger.pending(query).await
    }

    async fn update_status(
        &self,
        kind: RecordKind,
        id: RecordId,
        status: RecordStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match kind {
            RecordKind::AdSpend => self.repos.ad_spend.update_status(id, status, now).await,
            RecordKind::Ledger => self.repos.ledger.update_status(id, status, now).await,
            RecordKind::Reconciliation => Err(ReconError::validation(
                "reconciliation status changes go through confirmation",
            )),
        }
    }

    async fn ledger_candidates(&self, window: &CandidateWindow) -> Result<Vec<LedgerTransaction>> {
        self.repos.ledger.candidates(window).await
    }

    async fn ad_spend_candidates(&self, window: &CandidateWindow) -> Result<Vec<AdSpendRecord>> {
        self.repos.ad_spend.candidates(window).await
    }

    async fn active_reconciliation_for_ad_spend(
        &self,
        ad_spend_id: RecordId,
    ) -> Result<Option<ReconciliationRecord>> {
        self.repos.reconciliation.active_for_ad_spend(ad_spend_id).await
    }

    async fn active_reconciliation_for_ledger(
        &self,
        ledger_id: RecordId,
    ) -> Result<Option<ReconciliationRecord>> {
        self.repos.reconciliation.active_for_ledger(ledger_id).await
    }

    async fn reconciliation(&self, id: RecordId) -> Result<ReconciliationRecord> {
        self.repos.reconciliation.get(id).await
    }

    async fn commit(&self, draft: &ReconDraft, now: DateTime<Utc>) -> Result<ReconciliationRecord> {
        self.repos.reconciliation.commit(draft, now).await
    }

    async fn confirm(&self, confirmation: &Confirmation) -> Result<ReconciliationRecord> {
        self.repos.reconciliation.confirm(confirmation).await
    }

    async fn list_reconciliations(
        &self,
        filter: &ReconFilter,
        page: PageRequest,
    ) -> Result<(Vec<ReconciliationRecord>, u64)> {
        self.repos.reconciliation.list(filter, page).await
    }

    async fn list_ad_spends(
        &self,
        filter: &AdSpendFilter,
        page: PageRequest,
    ) -> Result<(Vec<AdSpendRecord>, u64)> {
        self.repos.ad_spend.list(filter, page).await
    }

    async fn list_ledgers(
        &self,
        filter: &LedgerFilter,
        page: PageRequest,
    ) -> Result<(Vec<LedgerTransaction>, u64)> {
        self.repos.ledger.list(filter, page).await
    }

    async fn latest_ad_spend_for_operator(
        &self,
        operator_id: i64,
    ) -> Result<Option<AdSpendRecord>> {
        self.repos.ad_spend.latest_for_operator(operator_id).await
    }
}
