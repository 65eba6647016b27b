//! Ledger transaction repository.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;

use spend_recon_core::{
    CandidateWindow, LedgerFilter, LedgerTransaction, NewLedgerTransaction, PageRequest,
    PendingQuery, ReconError, RecordId, RecordKind, RecordStatus, Result,
};

use super::ad_spend_repo::WINDOW_SLACK;
use crate::models::{approx, convert_all, map_sqlx, to_millis, LedgerRow, LEDGER_COLUMNS};

/// Repository for `ledger_transactions`.
#[derive(Debug, Clone)]
pub struct LedgerRepository {
    pool: SqlitePool,
}

impl LedgerRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validates and inserts a transaction with its normalized amount.
    ///
    /// # Errors
    /// Returns `Validation` for bad input or `Storage` if the insert fails.
    pub async fn insert(
        &self,
        new: NewLedgerTransaction,
        amount_usdt: Decimal,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction> {
        new.validate()?;
        let ts = to_millis(now);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO ledger_transactions
                (tx_date, direction, amount, currency, amount_usdt, amount_usdt_num,
                 account_name, fee_amount, project_id, operator_id, description,
                 status, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'unmatched', 0, ?12, ?12)
            RETURNING id
            ",
        )
        .bind(new.tx_date)
        .bind(new.direction.as_str())
        .bind(new.amount.to_string())
        .bind(new.currency.trim().to_ascii_uppercase())
        .bind(amount_usdt.to_string())
        .bind(approx(amount_usdt))
        .bind(&new.account_name)
        .bind(new.fee_amount.to_string())
        .bind(new.project_id)
        .bind(new.operator_id)
        .bind(&new.description)
        .bind(ts)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        self.get(id).await
    }

    /// Gets a transaction by id.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn get(&self, id: RecordId) -> Result<LedgerTransaction> {
        let sql = format!("SELECT {LEDGER_COLUMNS} FROM ledger_transactions WHERE id = ?1");
        sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| ReconError::not_found(RecordKind::Ledger, id))?
            .into_record()
    }

    /// Gets the transactions with the given ids, skipping unknown ones.
    ///
    /// # Errors
    /// Returns `Storage` if a query fails.
    pub async fn get_many(&self, ids: &[RecordId]) -> Result<Vec<LedgerTransaction>> {
        let mut records = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.get(id).await {
                Ok(record) => records.push(record),
                Err(ReconError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Open transactions in creation order.
    ///
    /// # Errors
    /// Returns `Storage` if the query fails.
    pub async fn pending(&self, query: &PendingQuery) -> Result<Vec<LedgerTransaction>> {
        let sql = format!(
            r"
            SELECT {LEDGER_COLUMNS} FROM ledger_transactions
            WHERE (status = 'unmatched' OR (?1 AND status = 'need_review'))
              AND (?2 IS NULL OR id > ?2)
              AND (?3 IS NULL OR created_at >= ?3)
            ORDER BY id ASC
            LIMIT ?4
            "
        );
        let rows = sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(query.include_review)
            .bind(query.after_id)
            .bind(query.since.map(to_millis))
            .bind(i64::from(query.limit))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        convert_all(rows, LedgerRow::into_record)
    }

    /// Moves a transaction along its status machine.
    ///
    /// # Errors
    /// Returns `NotFound` or `InvalidTransition`.
    pub async fn update_status(
        &self,
        id: RecordId,
        status: RecordStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let current = self.get(id).await?;
        if !current.status.can_transition_to(status) {
            return Err(ReconError::invalid_transition(format!(
                "ledger {id}: {} -> {status} is not allowed",
                current.status
            )));
        }
        let result = sqlx::query(
            r"
            UPDATE ledger_transactions
            SET status = ?1, version = version + 1, updated_at = ?2
            WHERE id = ?3 AND version = ?4
            ",
        )
        .bind(status.as_str())
        .bind(to_millis(now))
        .bind(id)
        .bind(current.version)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(ReconError::conflict(format!("ledger {id} changed concurrently")));
        }
        Ok(())
    }

    /// Open expense transactions inside a candidate window, closest amount first.
    ///
    /// The SQL filter runs on a widened `REAL` copy of the amount, so the
    /// fetch grows until `limit` rows survive the exact check or the table
    /// has no more rows to give.
    ///
    /// # Errors
    /// Returns `Storage` if the query fails.
    pub async fn candidates(&self, window: &CandidateWindow) -> Result<Vec<LedgerTransaction>> {
        let wanted = window.limit as usize;
        let mut fetch = window.limit.max(1);
        loop {
            let rows = self.window_rows(window, fetch).await?;
            let exhausted = rows.len() < fetch as usize || fetch == u32::MAX;
            let mut records: Vec<LedgerTransaction> = rows
                .into_iter()
                .filter(|r| window.contains(r.tx_date, r.amount_usdt))
                .collect();
            if records.len() >= wanted || exhausted {
                records.sort_by(|a, b| {
                    window
                        .closeness(a.amount_usdt)
                        .cmp(&window.closeness(b.amount_usdt))
                        .then(a.id.cmp(&b.id))
                });
                records.truncate(wanted);
                return Ok(records);
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    async fn window_rows(&self, window: &CandidateWindow, fetch: u32) -> Result<Vec<LedgerTransaction>> {
        let sql = format!(
            r"
            SELECT {LEDGER_COLUMNS} FROM ledger_transactions
            WHERE status <> 'matched'
              AND direction = 'expense'
              AND tx_date BETWEEN ?1 AND ?2
              AND amount_usdt_num BETWEEN ?3 AND ?4
            ORDER BY ABS(amount_usdt_num - ?5) ASC, id ASC
            LIMIT ?6
            "
        );
        let rows = sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(window.date_from)
            .bind(window.date_to)
            .bind(approx(window.amount_min) - WINDOW_SLACK)
            .bind(approx(window.amount_max) + WINDOW_SLACK)
            .bind(approx(window.target_amount))
            .bind(i64::from(fetch))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        convert_all(rows, LedgerRow::into_record)
    }

    /// Filtered listing, newest first, with the unpaged total.
    ///
    /// # Errors
    /// Returns `Storage` if the query fails.
    pub async fn list(
        &self,
        filter: &LedgerFilter,
        page: PageRequest,
    ) -> Result<(Vec<LedgerTransaction>, u64)> {
        const WHERE: &str = r"
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR operator_id = ?2)
              AND (?3 IS NULL OR direction = ?3)
              AND (?4 IS NULL OR tx_date >= ?4)
              AND (?5 IS NULL OR tx_date <= ?5)
            ";
        let direction = filter.direction.map(|d| d.as_str());

        let count_sql = format!("SELECT COUNT(*) FROM ledger_transactions {WHERE}");
        let (total,): (i64,) = sqlx::query_as(&count_sql)
            .bind(filter.project_id)
            .bind(filter.operator_id)
            .bind(direction)
            .bind(filter.date_from)
            .bind(filter.date_to)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_transactions {WHERE} \
             ORDER BY tx_date DESC, created_at DESC, id DESC LIMIT ?6 OFFSET ?7"
        );
        let rows = sqlx::query_as::<_, LedgerRow>(&sql)
            .bind(filter.project_id)
            .bind(filter.operator_id)
            .bind(direction)
            .bind(filter.date_from)
            .bind(filter.date_to)
            .bind(i64::from(page.limit))
            .bind(i64::from(page.skip))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok((
            convert_all(rows, LedgerRow::into_record)?,
            u64::try_from(total).unwrap_or_default(),
        ))
    }
}
