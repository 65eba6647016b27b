//! Ad-spend reports and ledger transactions.
//!
//! Both streams are immutable once stored except for their reconciliation
//! `status` (and the `version` counter bumped with it). They are never deleted.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ReconError, Result};

/// Database identifier of any stored record.
pub type RecordId = i64;

const MAX_PLATFORM_LEN: usize = 50;
const MAX_COUNTRY_LEN: usize = 50;
const MAX_MEMO_LEN: usize = 1000;
const MAX_ACCOUNT_LEN: usize = 100;
const MAX_CURRENCY_LEN: usize = 10;

/// Largest amount a report or transaction may carry (a `NUMERIC(15, 2)` column).
pub const MAX_AMOUNT: Decimal = dec!(9999999999999.99);
/// Decimal places accepted on amounts.
pub const MAX_AMOUNT_SCALE: u32 = 2;

// =============================================================================
// Enums
// =============================================================================

/// The kinds of record the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    AdSpend,
    Ledger,
    Reconciliation,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdSpend => "ad_spend",
            Self::Ledger => "ledger",
            Self::Reconciliation => "reconciliation",
        }
    }

    /// The stream a record of this kind is matched against.
    #[must_use]
    pub fn counterpart(self) -> Option<Self> {
        match self {
            Self::AdSpend => Some(Self::Ledger),
            Self::Ledger => Some(Self::AdSpend),
            Self::Reconciliation => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record-level reconciliation state of an ad-spend report or ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Unmatched,
    NeedReview,
    Matched,
}

impl RecordStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::NeedReview => "need_review",
            Self::Matched => "matched",
        }
    }

    /// Returns true if the store allows moving from `self` to `next`.
    ///
    /// `matched` is terminal; a record can only move forward.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unmatched, Self::NeedReview)
                | (Self::Unmatched, Self::Matched)
                | (Self::NeedReview, Self::Matched)
        )
    }

    /// Returns true if the record can still be paired.
    #[must_use]
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Matched)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unmatched" => Ok(Self::Unmatched),
            "need_review" => Ok(Self::NeedReview),
            "matched" => Ok(Self::Matched),
            other => Err(ReconError::validation(format!(
                "unknown record status '{other}'"
            ))),
        }
    }
}

/// Direction of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Income,
    Expense,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            other => Err(ReconError::validation(format!(
                "direction must be 'income' or 'expense', got '{other}'"
            ))),
        }
    }
}

// =============================================================================
// Matchable
// =============================================================================

/// The view of a record the candidate generator and scorer work on.
///
/// Amounts are USDT-normalized.
pub trait Matchable {
    fn kind(&self) -> RecordKind;
    fn record_id(&self) -> RecordId;
    fn match_date(&self) -> NaiveDate;
    fn match_amount(&self) -> Decimal;
    fn match_project(&self) -> Option<i64>;
}

// =============================================================================
// Ad spend
// =============================================================================

/// An operator's daily ad-spend report as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAdSpend {
    pub spend_date: NaiveDate,
    pub project_id: i64,
    pub channel_id: i64,
    pub operator_id: i64,
    #[serde(default)]
    pub country: Option<String>,
    pub platform: String,
    /// Spend in USDT.
    pub amount: Decimal,
    #[serde(default)]
    pub memo: Option<String>,
}

impl NewAdSpend {
    /// Checks required fields and bounds.
    ///
    /// # Errors
    /// Returns `ReconError::Validation` naming every offending field.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        positive_id("project_id", self.project_id, &mut problems);
        positive_id("channel_id", self.channel_id, &mut problems);
        positive_id("operator_id", self.operator_id, &mut problems);
        required_text("platform", &self.platform, MAX_PLATFORM_LEN, &mut problems);
        optional_text("country", self.country.as_deref(), MAX_COUNTRY_LEN, &mut problems);
        optional_text("memo", self.memo.as_deref(), MAX_MEMO_LEN, &mut problems);
        if self.amount <= Decimal::ZERO {
            problems.push("amount must be greater than 0".to_string());
        }
        bounded_amount("amount", self.amount, &mut problems);

        finish(problems)
    }
}

/// A stored ad-spend report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdSpendRecord {
    pub id: RecordId,
    pub spend_date: NaiveDate,
    pub project_id: i64,
    pub channel_id: i64,
    pub operator_id: i64,
    pub country: Option<String>,
    pub platform: String,
    pub amount: Decimal,
    pub memo: Option<String>,
    pub status: RecordStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdSpendRecord {
    /// Builds the stored form of a new report.
    #[must_use]
    pub fn from_new(id: RecordId, new: NewAdSpend, now: DateTime<Utc>) -> Self {
        Self {
            id,
            spend_date: new.spend_date,
            project_id: new.project_id,
            channel_id: new.channel_id,
            operator_id: new.operator_id,
            country: new.country,
            platform: new.platform,
            amount: new.amount,
            memo: new.memo,
            status: RecordStatus::Unmatched,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Matchable for AdSpendRecord {
    fn kind(&self) -> RecordKind {
        RecordKind::AdSpend
    }

    fn record_id(&self) -> RecordId {
        self.id
    }

    fn match_date(&self) -> NaiveDate {
        self.spend_date
    }

    fn match_amount(&self) -> Decimal {
        self.amount
    }

    fn match_project(&self) -> Option<i64> {
        Some(self.project_id)
    }
}

// =============================================================================
// Ledger
// =============================================================================

/// A finance ledger entry as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLedgerTransaction {
    pub tx_date: NaiveDate,
    pub direction: Direction,
    pub amount: Decimal,
    pub currency: String,
    pub account_name: String,
    #[serde(default)]
    pub fee_amount: Decimal,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub operator_id: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewLedgerTransaction {
    /// Checks required fields and bounds.
    ///
    /// # Errors
    /// Returns `ReconError::Validation` naming every offending field.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.amount <= Decimal::ZERO {
            problems.push("amount must be greater than 0".to_string());
        }
        bounded_amount("amount", self.amount, &mut problems);
        if self.fee_amount < Decimal::ZERO {
            problems.push("fee_amount must not be negative".to_string());
        }
        bounded_amount("fee_amount", self.fee_amount, &mut problems);
        required_text("currency", &self.currency, MAX_CURRENCY_LEN, &mut problems);
        required_text("account_name", &self.account_name, MAX_ACCOUNT_LEN, &mut problems);
        optional_text(
            "description",
            self.description.as_deref(),
            MAX_MEMO_LEN,
            &mut problems,
        );
        if let Some(project_id) = self.project_id {
            positive_id("project_id", project_id, &mut problems);
        }
        if let Some(operator_id) = self.operator_id {
            positive_id("operator_id", operator_id, &mut problems);
        }

        finish(problems)
    }
}

/// A stored ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: RecordId,
    pub tx_date: NaiveDate,
    pub direction: Direction,
    /// Amount in `currency`.
    pub amount: Decimal,
    pub currency: String,
    /// `amount` converted to USDT at ingestion.
    pub amount_usdt: Decimal,
    pub account_name: String,
    pub fee_amount: Decimal,
    pub project_id: Option<i64>,
    pub operator_id: Option<i64>,
    pub description: Option<String>,
    pub status: RecordStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerTransaction {
    /// Builds the stored form of a new transaction.
    #[must_use]
    pub fn from_new(
        id: RecordId,
        new: NewLedgerTransaction,
        amount_usdt: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tx_date: new.tx_date,
            direction: new.direction,
            amount: new.amount,
            currency: new.currency.trim().to_ascii_uppercase(),
            amount_usdt,
            account_name: new.account_name,
            fee_amount: new.fee_amount,
            project_id: new.project_id,
            operator_id: new.operator_id,
            description: new.description,
            status: RecordStatus::Unmatched,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Only expense transactions are reconciled against ad spend.
    #[must_use]
    pub fn is_reconcilable(&self) -> bool {
        self.direction == Direction::Expense
    }
}

impl Matchable for LedgerTransaction {
    fn kind(&self) -> RecordKind {
        RecordKind::Ledger
    }

    fn record_id(&self) -> RecordId {
        self.id
    }

    fn match_date(&self) -> NaiveDate {
        self.tx_date
    }

    fn match_amount(&self) -> Decimal {
        self.amount_usdt
    }

    fn match_project(&self) -> Option<i64> {
        self.project_id
    }
}

// =============================================================================
// Validation helpers
// =============================================================================

fn positive_id(field: &str, value: i64, problems: &mut Vec<String>) {
    if value <= 0 {
        problems.push(format!("{field} must be a positive id"));
    }
}

fn bounded_amount(field: &str, value: Decimal, problems: &mut Vec<String>) {
    if value.abs() > MAX_AMOUNT {
        problems.push(format!("{field} must be at most {MAX_AMOUNT}"));
    }
    if value.normalize().scale() > MAX_AMOUNT_SCALE {
        problems.push(format!(
            "{field} must have at most {MAX_AMOUNT_SCALE} decimal places"
        ));
    }
}

fn required_text(field: &str, value: &str, max_len: usize, problems: &mut Vec<String>) {
    if value.trim().is_empty() {
        problems.push(format!("{field} is required"));
    } else if value.chars().count() > max_len {
        problems.push(format!("{field} must be at most {max_len} characters"));
    }
}

fn optional_text(field: &str, value: Option<&str>, max_len: usize, problems: &mut Vec<String>) {
    if let Some(value) = value {
        if value.chars().count() > max_len {
            problems.push(format!("{field} must be at most {max_len} characters"));
        }
    }
}

fn finish(problems: Vec<String>) -> Result<()> {
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ReconError::Validation(problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ad_spend() -> NewAdSpend {
        NewAdSpend {
            spend_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            project_id: 1,
            channel_id: 2,
            operator_id: 3,
            country: Some("IN".to_string()),
            platform: "facebook".to_string(),
            amount: dec!(100.00),
            memo: None,
        }
    }

    fn ledger() -> NewLedgerTransaction {
        NewLedgerTransaction {
            tx_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            direction: Direction::Expense,
            amount: dec!(100.00),
            currency: "usd".to_string(),
            account_name: "ops wallet".to_string(),
            fee_amount: dec!(1.5),
            project_id: Some(1),
            operator_id: None,
            description: None,
        }
    }

    #[test]
    fn test_valid_ad_spend_passes() {
        assert!(ad_spend().validate().is_ok());
    }

    #[test]
    fn test_ad_spend_rejects_non_positive_amount() {
        let mut new = ad_spend();
        new.amount = Decimal::ZERO;
        let err = new.validate().unwrap_err();
        assert!(matches!(err, ReconError::Validation(ref m) if m.contains("amount")));
    }

    #[test]
    fn test_amounts_are_bounded() {
        let mut huge = ad_spend();
        huge.amount = Decimal::MAX;
        let err = huge.validate().unwrap_err().to_string();
        assert!(err.contains("amount must be at most"));

        let mut fractional = ad_spend();
        fractional.amount = dec!(10.005);
        assert!(fractional.validate().is_err());

        let mut padded = ad_spend();
        padded.amount = dec!(10.500);
        assert!(padded.validate().is_ok());

        let mut at_limit = ad_spend();
        at_limit.amount = MAX_AMOUNT;
        assert!(at_limit.validate().is_ok());

        let mut ledger_huge = ledger();
        ledger_huge.amount = Decimal::MAX;
        assert!(matches!(ledger_huge.validate(), Err(ReconError::Validation(_))));

        let mut fee_huge = ledger();
        fee_huge.fee_amount = Decimal::MAX;
        assert!(fee_huge.validate().unwrap_err().to_string().contains("fee_amount"));
    }

    #[test]
    fn test_ad_spend_reports_every_problem() {
        let mut new = ad_spend();
        new.platform = "  ".to_string();
        new.project_id = 0;
        let err = new.validate().unwrap_err().to_string();
        assert!(err.contains("platform is required"));
        assert!(err.contains("project_id"));
    }

    #[test]
    fn test_ledger_validation() {
        assert!(ledger().validate().is_ok());

        let mut negative_fee = ledger();
        negative_fee.fee_amount = dec!(-1);
        assert!(negative_fee.validate().is_err());

        let mut no_account = ledger();
        no_account.account_name = String::new();
        assert!(no_account.validate().is_err());

        let mut bad_project = ledger();
        bad_project.project_id = Some(-4);
        assert!(bad_project.validate().is_err());
    }

    #[test]
    fn test_ledger_from_new_uppercases_currency() {
        let now = Utc::now();
        let stored = LedgerTransaction::from_new(9, ledger(), dec!(100.00), now);
        assert_eq!(stored.currency, "USD");
        assert_eq!(stored.status, RecordStatus::Unmatched);
        assert_eq!(stored.version, 0);
        assert!(stored.is_reconcilable());
    }

    #[test]
    fn test_record_status_transitions() {
        use RecordStatus::*;
        assert!(Unmatched.can_transition_to(NeedReview));
        assert!(Unmatched.can_transition_to(Matched));
        assert!(NeedReview.can_transition_to(Matched));
        assert!(!Matched.can_transition_to(Unmatched));
        assert!(!Matched.can_transition_to(NeedReview));
        assert!(!NeedReview.can_transition_to(Unmatched));
        assert!(!Unmatched.can_transition_to(Unmatched));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            RecordStatus::Unmatched,
            RecordStatus::NeedReview,
            RecordStatus::Matched,
        ] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("approved".parse::<RecordStatus>().is_err());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("expense".parse::<Direction>().unwrap(), Direction::Expense);
        assert!("refund".parse::<Direction>().is_err());
    }

    #[test]
    fn test_new_ad_spend_deserializes_without_optional_fields() {
        let json = r#"{
            "spend_date": "2024-01-10",
            "project_id": 1,
            "channel_id": 2,
            "operator_id": 3,
            "platform": "tiktok",
            "amount": "250.50"
        }"#;
        let new: NewAdSpend = serde_json::from_str(json).unwrap();
        assert_eq!(new.amount, dec!(250.50));
        assert!(new.memo.is_none());
    }
}
