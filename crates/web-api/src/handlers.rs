use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use spend_recon_core::{
    AdSpendFilter, AdSpendRecord, Direction, LedgerFilter, LedgerTransaction, NewAdSpend,
    NewLedgerTransaction, PageRequest, ReconError, ReconFilter, ReconStatus,
    ReconciliationRecord, RecordId,
};
use spend_recon_engine::{Ingested, MonthlySummary, PassReport, ReconciliationView};

use crate::auth::Authenticated;
use crate::response::{ApiError, ApiResponse, ApiResult, Envelope};
use crate::server::AppState;

// =============================================================================
// Request and response shapes
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ReconListQuery {
    pub status: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub skip: Option<u32>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub include_history: bool,
}

#[derive(Debug, Deserialize)]
pub struct AdSpendListQuery {
    pub project_id: Option<i64>,
    pub operator_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LedgerListQuery {
    pub project_id: Option<i64>,
    pub operator_id: Option<i64>,
    pub direction: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct MonthlyReportQuery {
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateReconciliationRequest {
    pub status: ReconStatus,
    /// The version the caller last saw.
    pub version: Option<i64>,
}

/// A stored record with the reconciliation matching produced for it.
#[derive(Debug, Serialize)]
pub struct IngestedBody<T> {
    #[serde(flatten)]
    pub record: T,
    pub reconciliation: Option<ReconciliationRecord>,
}

fn ingest_response<T: Serialize>(ingested: Ingested<T>) -> ApiResponse<IngestedBody<T>> {
    let mut envelope = Envelope::ok(IngestedBody {
        record: ingested.record,
        reconciliation: ingested.reconciliation,
    })
    .with_meta("report", json!(ingested.report));
    if let Some(warning) = ingested.warning {
        envelope = envelope.with_meta("warning", warning);
    }
    ApiResponse(StatusCode::CREATED, envelope)
}

fn rejected(message: String) -> ApiError {
    ApiError(ReconError::Validation(message))
}

fn parse_status(raw: Option<&str>) -> Result<Option<ReconStatus>, ApiError> {
    raw.filter(|s| !s.is_empty())
        .map(str::parse::<ReconStatus>)
        .transpose()
        .map_err(ApiError)
}

fn parse_direction(raw: Option<&str>) -> Result<Option<Direction>, ApiError> {
    raw.filter(|s| !s.is_empty())
        .map(str::parse::<Direction>)
        .transpose()
        .map_err(ApiError)
}

/// `matched / processed` as a percentage string.
fn success_rate(report: &PassReport) -> String {
    format!("{:.2}%", report.success_rate() * Decimal::ONE_HUNDRED)
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "data": { "status": "ok" }, "error": null, "meta": {} }))
}

/// Stores an ad-spend report and matches it.
///
/// # Errors
/// 400 for malformed input, 401/403 for authentication and authorization failures.
pub async fn create_ad_spend(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    body: Result<Json<NewAdSpend>, JsonRejection>,
) -> ApiResult<IngestedBody<AdSpendRecord>> {
    let Json(new) = body.map_err(|e| rejected(e.body_text()))?;
    let ingested = state.service.ingest_ad_spend(&principal, new).await?;
    Ok(ingest_response(ingested))
}

/// Stores a ledger transaction and matches it.
///
/// # Errors
/// 400 for malformed input or an unknown currency, 401/403 for auth failures.
pub async fn create_ledger(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    body: Result<Json<NewLedgerTransaction>, JsonRejection>,
) -> ApiResult<IngestedBody<LedgerTransaction>> {
    let Json(new) = body.map_err(|e| rejected(e.body_text()))?;
    let ingested = state.service.ingest_ledger(&principal, new).await?;
    Ok(ingest_response(ingested))
}

/// Lists raw ad-spend reports.
///
/// # Errors
/// 400 for malformed query parameters.
pub async fn list_ad_spend(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    query: Result<Query<AdSpendListQuery>, QueryRejection>,
) -> ApiResult<Vec<AdSpendRecord>> {
    let Query(q) = query.map_err(|e| rejected(e.body_text()))?;
    let filter = AdSpendFilter {
        project_id: q.project_id,
        operator_id: q.operator_id,
        channel_id: q.channel_id,
        date_from: q.start_date,
        date_to: q.end_date,
    };
    let page = state
        .service
        .list_ad_spends(&principal, &filter, PageRequest::new(q.skip, q.limit))
        .await?;
    let envelope = Envelope::ok(page.items).with_meta_fields(&page.meta);
    Ok(ApiResponse(StatusCode::OK, envelope))
}

/// Lists raw ledger transactions.
///
/// # Errors
/// 400 for malformed query parameters.
pub async fn list_ledger(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    query: Result<Query<LedgerListQuery>, QueryRejection>,
) -> ApiResult<Vec<LedgerTransaction>> {
    let Query(q) = query.map_err(|e| rejected(e.body_text()))?;
    let filter = LedgerFilter {
        project_id: q.project_id,
        operator_id: q.operator_id,
        direction: parse_direction(q.direction.as_deref())?,
        date_from: q.start_date,
        date_to: q.end_date,
    };
    let page = state
        .service
        .list_ledgers(&principal, &filter, PageRequest::new(q.skip, q.limit))
        .await?;
    let envelope = Envelope::ok(page.items).with_meta_fields(&page.meta);
    Ok(ApiResponse(StatusCode::OK, envelope))
}

/// Lists reconciliations with both sides' summaries, newest first.
///
/// # Errors
/// 400 for an unknown status or malformed dates.
pub async fn list_reconciliations(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    query: Result<Query<ReconListQuery>, QueryRejection>,
) -> ApiResult<Vec<ReconciliationView>> {
    let Query(q) = query.map_err(|e| rejected(e.body_text()))?;
    let filter = ReconFilter {
        status: parse_status(q.status.as_deref())?,
        date_from: q.start_date,
        date_to: q.end_date,
        include_history: q.include_history,
    };
    let page = state
        .service
        .list_reconciliations(&principal, &filter, PageRequest::new(q.skip, q.limit))
        .await?;
    let envelope = Envelope::ok(page.items).with_meta_fields(&page.meta);
    Ok(ApiResponse(StatusCode::OK, envelope))
}

/// Manually confirms a reconciliation.
///
/// # Errors
/// 404 unknown id, 409 stale version or counterpart matched elsewhere,
/// 422 disallowed transition.
pub async fn update_reconciliation(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    id: Result<Path<RecordId>, PathRejection>,
    body: Result<Json<UpdateReconciliationRequest>, JsonRejection>,
) -> ApiResult<ReconciliationRecord> {
    let Path(id) = id.map_err(|e| rejected(e.body_text()))?;
    let Json(req) = body.map_err(|e| rejected(e.body_text()))?;
    let record = state
        .service
        .confirm(&principal, id, req.status, req.version)
        .await?;
    Ok(ApiResponse(StatusCode::OK, Envelope::ok(record)))
}

/// Runs a reconciliation sweep now.
///
/// # Errors
/// 403 unless the caller may run reconciliation.
pub async fn run_reconciliation(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> ApiResult<PassReport> {
    let report = state.service.run_reconciliation(&principal).await?;
    let envelope = Envelope::ok(report).with_meta("success_rate", success_rate(&report));
    Ok(ApiResponse(StatusCode::OK, envelope))
}

/// Summarizes matched spend and USDT income of one month.
///
/// # Errors
/// 400 for a missing or out-of-range year or month.
pub async fn monthly_report(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    query: Result<Query<MonthlyReportQuery>, QueryRejection>,
) -> ApiResult<MonthlySummary> {
    let Query(q) = query.map_err(|e| rejected(e.body_text()))?;
    let summary = state
        .service
        .monthly_summary(&principal, q.year, q.month)
        .await?;
    Ok(ApiResponse(StatusCode::OK, Envelope::ok(summary)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_formatting() {
        let report = PassReport {
            processed: 3,
            matched: 2,
            ..PassReport::default()
        };
        assert_eq!(success_rate(&report), "66.67%");
        assert_eq!(success_rate(&PassReport::default()), "0.00%");
    }

    #[test]
    fn test_unknown_status_is_a_validation_error() {
        let err = parse_status(Some("done")).unwrap_err();
        assert!(matches!(err.0, ReconError::Validation(_)));
        assert_eq!(parse_status(Some("")).unwrap(), None);
        assert_eq!(
            parse_status(Some("need_review")).unwrap(),
            Some(ReconStatus::NeedReview)
        );
    }
}
