//! Reconciliation repository.
//!
//! Commits and confirmations run in one transaction each. Record rows are
//! updated with `WHERE version = ?` guards; zero affected rows means the
//! compare-and-swap was lost.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::debug;

use spend_recon_core::reconciliation::REASON_MANUALLY_CONFIRMED;
use spend_recon_core::{
    Confirmation, PageRequest, ReconDraft, ReconError, ReconFilter, ReconStatus,
    ReconciliationRecord, RecordId, RecordKind, Result, VersionRef,
};

use crate::models::{
    convert_all, map_sqlx, to_millis, ReconciliationRow, RECONCILIATION_COLUMNS,
};

/// Repository for `reconciliations`.
#[derive(Debug, Clone)]
pub struct ReconciliationRepository {
    pool: SqlitePool,
}

fn table_of(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::AdSpend => "ad_spend_daily",
        RecordKind::Ledger => "ledger_transactions",
        RecordKind::Reconciliation => "reconciliations",
    }
}

fn map_insert(err: sqlx::Error) -> ReconError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => {
            ReconError::conflict(format!("duplicate active pairing: {db}"))
        }
        _ => map_sqlx(err),
    }
}

fn day_start_millis(date: NaiveDate) -> i64 {
    to_millis(date.and_time(NaiveTime::MIN).and_utc())
}

/// Reads `(version, status)` of a record inside the transaction.
async fn record_state(
    tx: &mut Transaction<'_, Sqlite>,
    kind: RecordKind,
    id: RecordId,
) -> Result<(i64, String)> {
    let sql = format!("SELECT version, status FROM {} WHERE id = ?1", table_of(kind));
    sqlx::query_as::<_, (i64, String)>(&sql)
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx)?
        .ok_or_else(|| ReconError::not_found(kind, id))
}

/// Writes a record's status guarded by its expected version.
async fn swap_status(
    tx: &mut Transaction<'_, Sqlite>,
    kind: RecordKind,
    expected: VersionRef,
    status: &str,
    now: i64,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET status = ?1, version = version + 1, updated_at = ?2 \
         WHERE id = ?3 AND version = ?4 AND status <> 'matched'",
        table_of(kind)
    );
    let result = sqlx::query(&sql)
        .bind(status)
        .bind(now)
        .bind(expected.id)
        .bind(expected.version)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    if result.rows_affected() == 1 {
        return Ok(());
    }

    let (version, current) = record_state(tx, kind, expected.id).await?;
    if current == "matched" {
        Err(ReconError::conflict(format!(
            "{kind} {} is already matched",
            expected.id
        )))
    } else {
        Err(ReconError::conflict(format!(
            "{kind} {} changed (version {version} != {})",
            expected.id, expected.version
        )))
    }
}

/// Marks rows historical; returns their ids.
async fn supersede_where(
    tx: &mut Transaction<'_, Sqlite>,
    condition: &str,
    id: RecordId,
    now: i64,
) -> Result<Vec<RecordId>> {
    let select = format!(
        "SELECT id FROM reconciliations WHERE superseded_at IS NULL AND {condition}"
    );
    let ids: Vec<(i64,)> = sqlx::query_as(&select)
        .bind(id)
        .fetch_all(&mut **tx)
        .await
        .map_err(map_sqlx)?;

    for (row_id,) in &ids {
        sqlx::query(
            r"
            UPDATE reconciliations
            SET superseded_at = ?1, version = version + 1, updated_at = ?1
            WHERE id = ?2
            ",
        )
        .bind(now)
        .bind(*row_id)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx)?;
    }
    Ok(ids.into_iter().map(|(row_id,)| row_id).collect())
}

async fn link_superseded(
    tx: &mut Transaction<'_, Sqlite>,
    ids: &[RecordId],
    replaced_by: RecordId,
) -> Result<()> {
    for &id in ids {
        sqlx::query("UPDATE reconciliations SET superseded_by = ?1 WHERE id = ?2")
            .bind(replaced_by)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx)?;
    }
    Ok(())
}

const AD_SPEND_ACTIVE: &str = "ad_spend_id = ?1";
const LEDGER_ORPHAN: &str = "ad_spend_id IS NULL AND ledger_id = ?1";

impl ReconciliationRepository {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Gets a reconciliation by id.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub async fn get(&self, id: RecordId) -> Result<ReconciliationRecord> {
        let sql = format!("SELECT {RECONCILIATION_COLUMNS} FROM reconciliations WHERE id = ?1");
        sqlx::query_as::<_, ReconciliationRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| ReconError::not_found(RecordKind::Reconciliation, id))?
            .into_record()
    }

    /// The non-superseded reconciliation of an ad-spend report, if any.
    ///
    /// # Errors
    /// Returns `Storage` if the query fails.
    pub async fn active_for_ad_spend(
        &self,
        ad_spend_id: RecordId,
    ) -> Result<Option<ReconciliationRecord>> {
        let sql = format!(
            "SELECT {RECONCILIATION_COLUMNS} FROM reconciliations \
             WHERE ad_spend_id = ?1 AND superseded_at IS NULL"
        );
        sqlx::query_as::<_, ReconciliationRow>(&sql)
            .bind(ad_spend_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(ReconciliationRow::into_record)
            .transpose()
    }

    /// The matched active record of a ledger, else its newest active one.
    pub async fn active_for_ledger(
        &self,
        ledger_id: RecordId,
    ) -> Result<Option<ReconciliationRecord>> {
        let sql = format!(
            "SELECT {RECONCILIATION_COLUMNS} FROM reconciliations \
             WHERE ledger_id = ?1 AND superseded_at IS NULL \
             ORDER BY (status = 'matched') DESC, id DESC LIMIT 1"
        );
        sqlx::query_as::<_, ReconciliationRow>(&sql)
            .bind(ledger_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .map(ReconciliationRow::into_record)
            .transpose()
    }

    /// Writes a draft atomically.
    ///
    /// # Errors
    /// Returns `Conflict` when a guarded record changed or is already matched.
    pub async fn commit(
        &self,
        draft: &ReconDraft,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationRecord> {
        draft.check_shape()?;
        let ts = to_millis(now);
        let record_status = match draft.status {
            ReconStatus::Matched => "matched",
            _ => "need_review",
        };
        let writes_ledger = draft.writes_ledger_status();

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        if let Some(ad) = draft.ad_spend {
            swap_status(&mut tx, RecordKind::AdSpend, ad, record_status, ts).await?;
        }
        if let Some(ledger) = draft.ledger {
            if writes_ledger {
                swap_status(&mut tx, RecordKind::Ledger, ledger, record_status, ts).await?;
            } else {
                let (_, status) = record_state(&mut tx, RecordKind::Ledger, ledger.id).await?;
                if status == "matched" {
                    return Err(ReconError::conflict(format!(
                        "ledger {} is already matched",
                        ledger.id
                    )));
                }
            }
        }

        let mut superseded = Vec::new();
        if let Some(ad) = draft.ad_spend {
            superseded.extend(supersede_where(&mut tx, AD_SPEND_ACTIVE, ad.id, ts).await?);
        }
        if let Some(ledger) = draft.ledger {
            superseded.extend(supersede_where(&mut tx, LEDGER_ORPHAN, ledger.id, ts).await?);
        }

        let (new_id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO reconciliations
                (ad_spend_id, ledger_id, amount_diff, date_diff, match_score, status, reason,
                 version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
            RETURNING id
            ",
        )
        .bind(draft.ad_spend.map(|r| r.id))
        .bind(draft.ledger.map(|r| r.id))
        .bind(draft.amount_diff.to_string())
        .bind(draft.date_diff)
        .bind(draft.match_score.map(|s| s.to_string()))
        .bind(draft.status.as_str())
        .bind(&draft.reason)
        .bind(ts)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_insert)?;

        link_superseded(&mut tx, &superseded, new_id).await?;
        tx.commit().await.map_err(map_sqlx)?;

        debug!(
            reconciliation_id = new_id,
            superseded = superseded.len(),
            status = %draft.status,
            "Committed reconciliation"
        );
        self.get(new_id).await
    }

    /// Confirms a `need_review` reconciliation atomically.
    ///
    /// # Errors
    /// `NotFound`, `Conflict` or `InvalidTransition` as documented on the store trait.
    pub async fn confirm(&self, confirmation: &Confirmation) -> Result<ReconciliationRecord> {
        let id = confirmation.reconciliation_id;
        let ts = to_millis(confirmation.at);
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let sql = format!("SELECT {RECONCILIATION_COLUMNS} FROM reconciliations WHERE id = ?1");
        let record = sqlx::query_as::<_, ReconciliationRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| ReconError::not_found(RecordKind::Reconciliation, id))?
            .into_record()?;

        if !record.is_active() {
            return Err(ReconError::invalid_transition(format!(
                "reconciliation {id} has been superseded"
            )));
        }
        if !record.status.can_transition_to(ReconStatus::Matched) {
            return Err(ReconError::invalid_transition(format!(
                "reconciliation {id} is already {}",
                record.status
            )));
        }
        if record.version != confirmation.expected_version {
            return Err(ReconError::conflict(format!(
                "reconciliation {id} changed (version {} != {})",
                record.version, confirmation.expected_version
            )));
        }
        let (Some(ad_id), Some(ledger_id)) = (record.ad_spend_id, record.ledger_id) else {
            return Err(ReconError::invalid_transition(
                "matched requires both ad_spend_id and ledger_id",
            ));
        };

        let (ad_version, ad_status) = record_state(&mut tx, RecordKind::AdSpend, ad_id).await?;
        let (ledger_version, ledger_status) =
            record_state(&mut tx, RecordKind::Ledger, ledger_id).await?;
        if ad_status == "matched" || ledger_status == "matched" {
            return Err(ReconError::conflict(format!(
                "reconciliation {id}: a referenced record is already matched elsewhere"
            )));
        }
        swap_status(
            &mut tx,
            RecordKind::AdSpend,
            VersionRef::new(ad_id, ad_version),
            "matched",
            ts,
        )
        .await?;
        swap_status(
            &mut tx,
            RecordKind::Ledger,
            VersionRef::new(ledger_id, ledger_version),
            "matched",
            ts,
        )
        .await?;

        let result = sqlx::query(
            r"
            UPDATE reconciliations
            SET status = 'matched', confirmed_by = ?1, reason = ?2,
                version = version + 1, updated_at = ?3
            WHERE id = ?4 AND version = ?5 AND superseded_at IS NULL
            ",
        )
        .bind(&confirmation.actor)
        .bind(REASON_MANUALLY_CONFIRMED)
        .bind(ts)
        .bind(id)
        .bind(confirmation.expected_version)
        .execute(&mut *tx)
        .await
        .map_err(map_insert)?;
        if result.rows_affected() == 0 {
            return Err(ReconError::conflict(format!(
                "reconciliation {id} changed concurrently"
            )));
        }

        let orphans = supersede_where(&mut tx, LEDGER_ORPHAN, ledger_id, ts).await?;
        link_superseded(&mut tx, &orphans, id).await?;
        tx.commit().await.map_err(map_sqlx)?;

        self.get(id).await
    }

    /// Filtered listing, newest first, with the unpaged total.
    ///
    /// # Errors
    /// Returns `Storage` if the query fails.
    pub async fn list(
        &self,
        filter: &ReconFilter,
        page: PageRequest,
    ) -> Result<(Vec<ReconciliationRecord>, u64)> {
        const WHERE: &str = r"
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 OR superseded_at IS NULL)
              AND (?3 IS NULL OR created_at >= ?3)
              AND (?4 IS NULL OR created_at < ?4)
            ";
        let status = filter.status.map(|s| s.as_str());
        let from = filter.date_from.map(day_start_millis);
        let until = filter
            .date_to
            .map(|to| to.succ_opt().map_or(i64::MAX, day_start_millis));

        let count_sql = format!("SELECT COUNT(*) FROM reconciliations {WHERE}");
        let (total,): (i64,) = sqlx::query_as(&count_sql)
            .bind(status)
            .bind(filter.include_history)
            .bind(from)
            .bind(until)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let sql = format!(
            "SELECT {RECONCILIATION_COLUMNS} FROM reconciliations {WHERE} \
             ORDER BY created_at DESC, id DESC LIMIT ?5 OFFSET ?6"
        );
        let rows = sqlx::query_as::<_, ReconciliationRow>(&sql)
            .bind(status)
            .bind(filter.include_history)
            .bind(from)
            .bind(until)
            .bind(i64::from(page.limit))
            .bind(i64::from(page.skip))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        Ok((
            convert_all(rows, ReconciliationRow::into_record)?,
            u64::try_from(total).unwrap_or_default(),
        ))
    }
}
