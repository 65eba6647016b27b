//! Matching engine for ad-spend reconciliation.
//!
//! - `candidates`: bounded counterpart lookup through the store
//! - `scorer`: pure weighted match score
//! - `matcher`: per-pass claim board and compare-and-swap commits
//! - `lifecycle`: manual confirmation
//! - `query`: joined, paginated read models
//! - `report`: monthly matched-spend and income summary
//! - `service`: the authorized facade used by every transport

pub mod candidates;
pub mod lifecycle;
pub mod matcher;
pub mod query;
pub mod report;
pub mod scorer;
pub mod service;

pub use candidates::CandidateGenerator;
pub use lifecycle::LifecycleManager;
pub use matcher::{ClaimBoard, ClaimState, Matcher, Outcome, PassReport};
pub use query::{AdSpendSummary, LedgerSummary, Page, PageMeta, QueryService, ReconciliationView};
pub use report::{MonthlySummary, OperatorMonth, ProjectMonth};
pub use scorer::{ScoreBreakdown, Scorer};
pub use service::{Ingested, ReconService, WARNING_AMOUNT_JUMP};
