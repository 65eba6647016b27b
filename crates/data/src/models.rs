//! Row types of the SQLite schema and their conversion into domain records.
//!
//! Decimal columns are stored as TEXT to keep them exact and parsed here;
//! timestamps are epoch milliseconds.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

use spend_recon_core::{
    AdSpendRecord, Direction, LedgerTransaction, ReconError, ReconStatus, ReconciliationRecord,
    RecordStatus, Result,
};

pub(crate) const AD_SPEND_COLUMNS: &str = "id, spend_date, project_id, channel_id, operator_id, \
     country, platform, amount, memo, status, version, created_at, updated_at";

pub(crate) const LEDGER_COLUMNS: &str = "id, tx_date, direction, amount, currency, amount_usdt, \
     account_name, fee_amount, project_id, operator_id, description, status, version, \
     created_at, updated_at";

pub(crate) const RECONCILIATION_COLUMNS: &str = "id, ad_spend_id, ledger_id, amount_diff, \
     date_diff, match_score, status, reason, confirmed_by, superseded_by, superseded_at, \
     version, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AdSpendRow {
    pub id: i64,
    pub spend_date: NaiveDate,
    pub project_id: i64,
    pub channel_id: i64,
    pub operator_id: i64,
    pub country: Option<String>,
    pub platform: String,
    pub amount: String,
    pub memo: Option<String>,
    pub status: String,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AdSpendRow {
    pub(crate) fn into_record(self) -> Result<AdSpendRecord> {
        Ok(AdSpendRecord {
            id: self.id,
            spend_date: self.spend_date,
            project_id: self.project_id,
            channel_id: self.channel_id,
            operator_id: self.operator_id,
            country: self.country,
            platform: self.platform,
            amount: parse_decimal("amount", &self.amount)?,
            memo: self.memo,
            status: parse_status(&self.status)?,
            version: self.version,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LedgerRow {
    pub id: i64,
    pub tx_date: NaiveDate,
    pub direction: String,
    pub amount: String,
    pub currency: String,
    pub amount_usdt: String,
    pub account_name: String,
    pub fee_amount: String,
    pub project_id: Option<i64>,
    pub operator_id: Option<i64>,
    pub description: Option<String>,
    pub status: String,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl LedgerRow {
    pub(crate) fn into_record(self) -> Result<LedgerTransaction> {
        Ok(LedgerTransaction {
            id: self.id,
            tx_date: self.tx_date,
            direction: Direction::from_str(&self.direction).map_err(corrupt)?,
            amount: parse_decimal("amount", &self.amount)?,
            currency: self.currency,
            amount_usdt: parse_decimal("amount_usdt", &self.amount_usdt)?,
            account_name: self.account_name,
            fee_amount: parse_decimal("fee_amount", &self.fee_amount)?,
            project_id: self.project_id,
            operator_id: self.operator_id,
            description: self.description,
            status: parse_status(&self.status)?,
            version: self.version,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ReconciliationRow {
    pub id: i64,
    pub ad_spend_id: Option<i64>,
    pub ledger_id: Option<i64>,
    pub amount_diff: String,
    pub date_diff: i64,
    pub match_score: Option<String>,
    pub status: String,
    pub reason: Option<String>,
    pub confirmed_by: Option<String>,
    pub superseded_by: Option<i64>,
    pub superseded_at: Option<i64>,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ReconciliationRow {
    pub(crate) fn into_record(self) -> Result<ReconciliationRecord> {
        Ok(ReconciliationRecord {
            id: self.id,
            ad_spend_id: self.ad_spend_id,
            ledger_id: self.ledger_id,
            amount_diff: parse_decimal("amount_diff", &self.amount_diff)?,
            date_diff: self.date_diff,
            match_score: self
                .match_score
                .as_deref()
                .map(|s| parse_decimal("match_score", s))
                .transpose()?,
            status: ReconStatus::from_str(&self.status).map_err(corrupt)?,
            reason: self.reason,
            confirmed_by: self.confirmed_by,
            superseded_by: self.superseded_by,
            superseded_at: self.superseded_at.map(from_millis).transpose()?,
            version: self.version,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

/// Converts all rows, failing on the first corrupt one.
pub(crate) fn convert_all<R, T>(
    rows: Vec<R>,
    convert: impl Fn(R) -> Result<T>,
) -> Result<Vec<T>> {
    rows.into_iter().map(convert).collect()
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Approximation written to the REAL shadow columns.
pub(crate) fn approx(amount: Decimal) -> f64 {
    amount.to_f64().unwrap_or(0.0)
}

pub(crate) fn map_sqlx(err: sqlx::Error) -> ReconError {
    ReconError::storage(err.to_string())
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ReconError::storage(format!("timestamp {ms} out of range")))
}

fn parse_decimal(column: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| ReconError::storage(format!("column {column} holds '{raw}': {e}")))
}

fn parse_status(raw: &str) -> Result<RecordStatus> {
    RecordStatus::from_str(raw).map_err(corrupt)
}

fn corrupt(err: ReconError) -> ReconError {
    ReconError::storage(format!("corrupt row: {err}"))
}
