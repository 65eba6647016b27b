//! Ad-spend report repository.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use spend_recon_core::{
    AdSpendFilter, AdSpendRecord, CandidateWindow, NewAdSpend, PageRequest, PendingQuery,
    ReconError, RecordId, RecordKind, RecordStatus, Result,
};

use crate::models::{approx, convert_all, map_sqlx, to_millis, AdSpendRow, AD_SPEND_COLUMNS};

/// Repository for `ad_spend_daily`.
#[derive(Debug, Clone)]
pub struct AdSpendRepository {
    pool: SqlitePool,
}

impl AdSpendRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Validates and inserts a report.
    ///
    /// # Errors
    /// Returns `Validation` for bad input or `Storage` if the insert fails.
    pub async fn insert(&self, new: NewAdSpend, now: DateTime<Utc>) -> Result<AdSpendRecord> {
        new.validate()?;
        let ts = to_millis(now);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO ad_spend_daily
                (spend_date, project_id, channel_id, operator_id, country, platform,
                 amount, amount_num, memo, status, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'unmatched', 0, ?10, ?10)
            RETURNING id
            ",
        )
        .bind(new.spend_date)
        .bind(new.project_id)
        .bind(new.channel_id)
        .bind(new.operator_id)
        .bind(&new.country)
        .bind(&new.platform)
        .bind(new.amount.to_string())
        .bind(approx(new.amount))
        .bind(&new.memo)
        .bind(ts)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        self.get(id).await
    }

    /// Gets a report by id.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn get(&self, id: RecordId) -> Result<AdSpendRecord> {
        let sql = format!("SELECT {AD_SPEND_COLUMNS} FROM ad_spend_daily WHERE id = ?1");
        sqlx::query_as::<_, AdSpendRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| ReconError::not_found(RecordKind::AdSpend, id))?
            .into_record()
    }

    /// Gets the reports with the given ids, in id order.
    ///
    /// # Errors
    /// Returns `Storage` if the query fails.
    pub async fn get_many(&self, ids: &[RecordId]) -> Result<Vec<AdSpendRecord>> {
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

    /// Open reports in creation order.
    ///
    /// # Errors
    /// Returns `Storage` if the query fails.
    pub async fn pending(&self, query: &PendingQuery) -> Result<Vec<AdSpendRecord>> {
        let sql = format!(
            r"
            SELECT {AD_SPEND_COLUMNS} FROM ad_spend_daily
            WHERE (status = 'unmatched' OR (?1 AND status = 'need_review'))
              AND (?2 IS NULL OR id > ?2)
              AND (?3 IS NULL OR created_at >= ?3)
            ORDER BY id ASC
            LIMIT ?4
            "
        );
        let rows = sqlx::query_as::<_, AdSpendRow>(&sql)
            .bind(query.include_review)
            .bind(query.after_id)
            .bind(query.since.map(to_millis))
            .bind(i64::from(query.limit))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        convert_all(rows, AdSpendRow::into_record)
    }

    /// Moves a report along its status machine.
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
                "ad_spend {id}: {} -> {status} is not allowed",
                current.status
            )));
        }
        let result = sqlx::query(
            r"
            UPDATE ad_spend_daily
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
            return Err(ReconError::conflict(format!(
                "ad_spend {id} changed concurrently"
            )));
        }
        Ok(())
    }

    /// Open reports inside a candidate window, closest amount first.
    ///
    /// The SQL filter runs on a widened `REAL` copy of the amount, so the
    /// fetch grows until `limit` rows survive the exact check or the table
    /// has no more rows to give.
    ///
    /// # Errors
    /// Returns `Storage` if the query fails.
    pub async fn candidates(&self, window: &CandidateWindow) -> Result<Vec<AdSpendRecord>> {
        let wanted = window.limit as usize;
        let mut fetch = window.limit.max(1);
        loop {
            let rows = self.window_rows(window, fetch).await?;
            let exhausted = rows.len() < fetch as usize || fetch == u32::MAX;
            let mut records: Vec<AdSpendRecord> = rows
                .into_iter()
                .filter(|r| window.contains(r.spend_date, r.amount))
                .collect();
            if records.len() >= wanted || exhausted {
                records.sort_by(|a, b| {
                    window
                        .closeness(a.amount)
                        .cmp(&window.closeness(b.amount))
                        .then(a.id.cmp(&b.id))
                });
                records.truncate(wanted);
                return Ok(records);
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    async fn window_rows(&self, window: &CandidateWindow, fetch: u32) -> Result<Vec<AdSpendRecord>> {
        let sql = format!(
            r"
            SELECT {AD_SPEND_COLUMNS} FROM ad_spend_daily
            WHERE status <> 'matched'
              AND spend_date BETWEEN ?1 AND ?2
              AND amount_num BETWEEN ?3 AND ?4
            ORDER BY ABS(amount_num - ?5) ASC, id ASC
            LIMIT ?6
            "
        );
        let rows = sqlx::query_as::<_, AdSpendRow>(&sql)
            .bind(window.date_from)
            .bind(window.date_to)
            .bind(approx(window.amount_min) - WINDOW_SLACK)
            .bind(approx(window.amount_max) + WINDOW_SLACK)
            .bind(approx(window.target_amount))
            .bind(i64::from(fetch))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        convert_all(rows, AdSpendRow::into_record)
    }

    /// Filtered listing, newest first, with the unpaged total.
    ///
    /// # Errors
    /// Returns `Storage` if the query fails.
    pub async fn list(
        &self,
        filter: &AdSpendFilter,
        page: PageRequest,
    ) -> Result<(Vec<AdSpendRecord>, u64)> {
        const WHERE: &str = r"
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR operator_id = ?2)
              AND (?3 IS NULL OR channel_id = ?3)
              AND (?4 IS NULL OR spend_date >= ?4)
              AND (?5 IS NULL OR spend_date <= ?5)
            ";

        let count_sql = format!("SELECT COUNT(*) FROM ad_spend_daily {WHERE}");
        let (total,): (i64,) = sqlx::query_as(&count_sql)
            .bind(filter.project_id)
            .bind(filter.operator_id)
            .bind(filter.channel_id)
            .bind(filter.date_from)
            .bind(filter.date_to)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let sql = format!(
            "SELECT {AD_SPEND_COLUMNS} FROM ad_spend_daily {WHERE} \
             ORDER BY spend_date DESC, created_at DESC, id DESC LIMIT ?6 OFFSET ?7"
        );
        let rows = sqlx::query_as::<_, AdSpendRow>(&sql)
            .bind(filter.project_id)
            .bind(filter.operator_id)
            .bind(filter.channel_id)
            .bind(filter.date_from)
            .bind(filter.date_to)
            .bind(i64::from(page.limit))
            .bind(i64::from(page.skip))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok((
            convert_all(rows, AdSpendRow::into_record)?,
            u64::try_from(total).unwrap_or_default(),
        ))
    }

    /// The operator's report with the latest spend date.
    ///
    /// # Errors
    /// Returns `Storage` if the query fails.
    pub async fn latest_for_operator(&self, operator_id: i64) -> Result<Option<AdSpendRecord>> {
        let sql = format!(
            "SELECT {AD_SPEND_COLUMNS} FROM ad_spend_daily WHERE operator_id = ?1 \
             ORDER BY spend_date DESC, created_at DESC, id DESC LIMIT 1"
        );
        sqlx::query_as::<_, AdSpendRow>(&sql)
            .bind(operator_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(AdSpendRow::into_record)
            .transpose()
    }
}

/// Widening of the REAL window so float rounding never drops a boundary row.
pub(crate) const WINDOW_SLACK: f64 = 0.005;
