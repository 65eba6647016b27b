//! Reconciliation records: the derived pairing of one ad-spend report with one
//! ledger transaction (or the documented absence of one).
//!
//! Records are never deleted. A re-match creates a new record and marks the
//! previous one superseded, so the audit trail stays intact.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ReconError, Result};
use crate::records::RecordId;

/// Reason written when the candidate generator finds nothing.
pub const REASON_NO_CANDIDATE: &str = "no candidate found";
/// Reason written when the best candidate scores in the review band.
pub const REASON_BELOW_AUTO_MATCH: &str = "score below auto-match threshold";
/// Reason written when every candidate went to a higher-scoring match.
pub const REASON_CANDIDATES_CLAIMED: &str = "candidates claimed by higher-scoring matches";
/// Reason written on automatic matches.
pub const REASON_AUTO_MATCHED: &str = "auto matched";
/// Reason written on manual confirmation.
pub const REASON_MANUALLY_CONFIRMED: &str = "manually confirmed";

/// Lifecycle state of a reconciliation.
///
/// `Pending` is the implicit state before any record exists; it is part of the
/// wire contract but never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconStatus {
    Pending,
    NeedReview,
    Matched,
}

impl ReconStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::NeedReview => "need_review",
            Self::Matched => "matched",
        }
    }

    /// Allowed lifecycle moves. `Matched` is terminal.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::NeedReview)
                | (Self::Pending, Self::Matched)
                | (Self::NeedReview, Self::Matched)
        )
    }
}

impl fmt::Display for ReconStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReconStatus {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "need_review" => Ok(Self::NeedReview),
            "matched" => Ok(Self::Matched),
            other => Err(ReconError::validation(format!(
                "status must be one of pending, matched, need_review; got '{other}'"
            ))),
        }
    }
}

/// A stored reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub id: RecordId,
    pub ad_spend_id: Option<RecordId>,
    pub ledger_id: Option<RecordId>,
    /// Ledger amount minus ad-spend amount, in USDT.
    pub amount_diff: Decimal,
    /// Ledger date minus ad-spend date, in days.
    pub date_diff: i64,
    /// 0-100, absent when no counterpart exists.
    pub match_score: Option<Decimal>,
    pub status: ReconStatus,
    pub reason: Option<String>,
    pub confirmed_by: Option<String>,
    pub superseded_by: Option<RecordId>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationRecord {
    /// Builds the stored form of a draft.
    #[must_use]
    pub fn from_draft(id: RecordId, draft: &ReconDraft, now: DateTime<Utc>) -> Self {
        Self {
            id,
            ad_spend_id: draft.ad_spend.map(|r| r.id),
            ledger_id: draft.ledger.map(|r| r.id),
            amount_diff: draft.amount_diff,
            date_diff: draft.date_diff,
            match_score: draft.match_score,
            status: draft.status,
            reason: draft.reason.clone(),
            confirmed_by: None,
            superseded_by: None,
            superseded_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true while the record has not been superseded.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }

    /// Returns true if this is a ledger's own "no candidate" record.
    #[must_use]
    pub fn is_ledger_orphan(&self) -> bool {
        self.ad_spend_id.is_none() && self.ledger_id.is_some()
    }

    /// Marks the record historical.
    pub fn supersede(&mut self, now: DateTime<Utc>) {
        self.superseded_at = Some(now);
        self.updated_at = now;
        self.version += 1;
    }
}

/// Identity plus the version the caller last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRef {
    pub id: RecordId,
    pub version: i64,
}

impl VersionRef {
    #[must_use]
    pub const fn new(id: RecordId, version: i64) -> Self {
        Self { id, version }
    }
}

/// A reconciliation the matcher wants to write.
///
/// Store commit rules:
/// * `ad_spend`, when present, is compared on version, must still be open, and
///   becomes `matched` or `need_review` with the draft.
/// * `ledger` is compared on version and has its status written when the draft
///   is `matched` (becomes `matched`) or has no ad-spend (becomes
///   `need_review`). Otherwise it only has to be still open.
/// * The previous active record of the ad-spend is superseded; so is the
///   ledger's own "no candidate" record when the ledger's status is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconDraft {
    pub ad_spend: Option<VersionRef>,
    pub ledger: Option<VersionRef>,
    pub amount_diff: Decimal,
    pub date_diff: i64,
    pub match_score: Option<Decimal>,
    pub status: ReconStatus,
    pub reason: Option<String>,
}

impl ReconDraft {
    /// Checks that the draft is structurally writable.
    ///
    /// # Errors
    /// Returns `ReconError::InvalidTransition` for a `pending` or half-empty
    /// `matched` draft, `ReconError::Validation` when neither side is present.
    pub fn check_shape(&self) -> Result<()> {
        if self.ad_spend.is_none() && self.ledger.is_none() {
            return Err(ReconError::validation(
                "a reconciliation must reference an ad-spend or a ledger record",
            ));
        }
        match self.status {
            ReconStatus::Pending => Err(ReconError::invalid_transition(
                "pending is implicit and cannot be stored",
            )),
            ReconStatus::Matched if self.ad_spend.is_none() || self.ledger.is_none() => {
                Err(ReconError::invalid_transition(
                    "matched requires both ad_spend_id and ledger_id",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Returns true if the store must write the ledger's status.
    #[must_use]
    pub fn writes_ledger_status(&self) -> bool {
        self.ledger.is_some() && (self.status == ReconStatus::Matched || self.ad_spend.is_none())
    }
}

/// A manual confirmation request, applied as a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub reconciliation_id: RecordId,
    pub expected_version: i64,
    pub actor: String,
    pub at: DateTime<Utc>,
}
