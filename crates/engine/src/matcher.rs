//! The matching pass.
//!
//! A pass takes a batch of open ad-spend reports (anchors), scores every
//! candidate ledger transaction, and resolves contested counterparts through a
//! claim board before anything is written:
//!
//! 1. Every anchor/candidate pair scoring at or above the auto-match threshold
//!    becomes a proposal. Proposals are granted greedily in rank order, so a
//!    counterpart is claimed by at most one anchor per pass.
//! 2. Each anchor then commits its outcome through the store's compare-and-swap.
//!    A lost swap releases the claim and the anchor re-runs candidate selection
//!    without the counterparts other anchors hold.
//!
//! A failure on one anchor is logged and counted; it never aborts the batch.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use spend_recon_core::reconciliation::{
    REASON_AUTO_MATCHED, REASON_BELOW_AUTO_MATCH, REASON_CANDIDATES_CLAIMED, REASON_NO_CANDIDATE,
};
use spend_recon_core::{
    AdSpendRecord, LedgerTransaction, MatchingConfig, ReconDraft, ReconError, ReconStatus,
    ReconciliationRecord, RecordId, RecordStore, Result, VersionRef,
};

use crate::candidates::CandidateGenerator;
use crate::scorer::{ScoreBreakdown, Scorer};

// =============================================================================
// Pass report
// =============================================================================

/// Counters of one matching pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Anchors examined.
    pub processed: u32,
    /// New `matched` reconciliations.
    pub matched: u32,
    /// New `need_review` reconciliations.
    pub need_review: u32,
    /// Anchors whose active reconciliation already described the outcome.
    pub unchanged: u32,
    /// Anchors left without a (new) reconciliation because every score was too low.
    pub left_unmatched: u32,
    /// Anchors skipped after an error.
    pub failed: u32,
    /// Compare-and-swap commits lost and retried.
    pub conflicts: u32,
}

impl PassReport {
    /// Adds the counters of `other`.
    pub fn merge(&mut self, other: &Self) {
        self.processed += other.processed;
        self.matched += other.matched;
        self.need_review += other.need_review;
        self.unchanged += other.unchanged;
        self.left_unmatched += other.left_unmatched;
        self.failed += other.failed;
        self.conflicts += other.conflicts;
    }

    /// Share of processed anchors that ended matched, in `[0, 1]`.
    #[must_use]
    pub fn success_rate(&self) -> Decimal {
        if self.processed == 0 {
            Decimal::ZERO
        } else {
            (Decimal::from(self.matched) / Decimal::from(self.processed)).round_dp(4)
        }
    }
}

// =============================================================================
// Claim board
// =============================================================================

/// State of a counterpart reservation within one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    /// Reserved for `anchor`, not yet written.
    Claimed { anchor: RecordId },
    /// Written through the store.
    Committed { anchor: RecordId },
}

impl ClaimState {
    #[must_use]
    pub fn anchor(self) -> RecordId {
        match self {
            Self::Claimed { anchor } | Self::Committed { anchor } => anchor,
        }
    }
}

/// Exclusive per-pass reservations of ledger transactions.
#[derive(Debug, Default)]
pub struct ClaimBoard {
    claims: HashMap<RecordId, ClaimState>,
}

impl ClaimBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `ledger` for `anchor`. Returns false if another anchor holds it.
    pub fn try_claim(&mut self, ledger: RecordId, anchor: RecordId) -> bool {
        match self.claims.get(&ledger) {
            Some(state) => state.anchor() == anchor,
            None => {
                self.claims.insert(ledger, ClaimState::Claimed { anchor });
                true
            }
        }
    }

    /// Marks a claim as written.
    pub fn commit(&mut self, ledger: RecordId) {
        if let Some(state) = self.claims.get_mut(&ledger) {
            *state = ClaimState::Committed {
                anchor: state.anchor(),
            };
        }
    }

    /// Drops a claim that could not be written.
    pub fn release(&mut self, ledger: RecordId) {
        if let Some(ClaimState::Claimed { .. }) = self.claims.get(&ledger) {
            self.claims.remove(&ledger);
        }
    }

    #[must_use]
    pub fn state(&self, ledger: RecordId) -> Option<ClaimState> {
        self.claims.get(&ledger).copied()
    }

    /// The ledger currently reserved for `anchor`, if any.
    #[must_use]
    pub fn claim_of(&self, anchor: RecordId) -> Option<RecordId> {
        self.claims
            .iter()
            .find(|(_, state)| state.anchor() == anchor)
            .map(|(ledger, _)| *ledger)
    }

    /// Ledgers held by anchors other than `anchor`.
    #[must_use]
    pub fn held_by_others(&self, anchor: RecordId) -> HashSet<RecordId> {
        self.claims
            .iter()
            .filter(|(_, state)| state.anchor() != anchor)
            .map(|(ledger, _)| *ledger)
            .collect()
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// A scored candidate.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub ledger: LedgerTransaction,
    pub score: ScoreBreakdown,
}

/// What the matcher decided for one anchor.
#[derive(Debug, Clone)]
pub enum Outcome {
    AutoMatch(ScoredCandidate),
    NeedReview(ScoredCandidate),
    NoCandidate,
    CandidatesClaimed,
    /// Best score below the review threshold; nothing is written.
    LeaveUnmatched { best_score: Decimal },
}

impl Outcome {
    /// The reconciliation to write, or `None` for `LeaveUnmatched`.
    #[must_use]
    pub fn draft(&self, anchor: &AdSpendRecord) -> Option<ReconDraft> {
        let ad_ref = Some(VersionRef::new(anchor.id, anchor.version));
        let scored = |c: &ScoredCandidate, status: ReconStatus, reason: &str| ReconDraft {
            ad_spend: ad_ref,
            ledger: Some(VersionRef::new(c.ledger.id, c.ledger.version)),
            amount_diff: c.score.amount_diff,
            date_diff: c.score.date_diff,
            match_score: Some(c.score.match_score),
            status,
            reason: Some(reason.to_string()),
        };
        let unpaired = |reason: &str| ReconDraft {
            ad_spend: ad_ref,
            ledger: None,
            amount_diff: -anchor.amount,
            date_diff: 0,
            match_score: None,
            status: ReconStatus::NeedReview,
            reason: Some(reason.to_string()),
        };

        match self {
            Self::AutoMatch(c) => Some(scored(c, ReconStatus::Matched, REASON_AUTO_MATCHED)),
            Self::NeedReview(c) => Some(scored(c, ReconStatus::NeedReview, REASON_BELOW_AUTO_MATCH)),
            Self::NoCandidate => Some(unpaired(REASON_NO_CANDIDATE)),
            Self::CandidatesClaimed => Some(unpaired(REASON_CANDIDATES_CLAIMED)),
            Self::LeaveUnmatched { .. } => None,
        }
    }
}

/// Returns true if `active` already records what `draft` would write.
#[must_use]
///
/// Two unpaired rows are the same outcome whatever their reason, so a report
/// that lost its only ledger to a match is not rewritten on every sweep.
pub fn same_outcome(active: &ReconciliationRecord, draft: &ReconDraft) -> bool {
    if active.ledger_id.is_none() && draft.ledger.is_none() {
        return active.status == draft.status && active.amount_diff == draft.amount_diff;
    }
    active.ledger_id == draft.ledger.map(|r| r.id)
        && active.status == draft.status
        && active.match_score == draft.match_score
        && active.amount_diff == draft.amount_diff
        && active.date_diff == draft.date_diff
        && active.reason == draft.reason
}

/// Ranking of candidates for one anchor: score desc, |amount_diff| asc,
/// |date_diff| asc, ledger id asc.
fn rank_candidates(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .match_score
        .cmp(&a.score.match_score)
        .then(a.score.amount_diff.abs().cmp(&b.score.amount_diff.abs()))
        .then(a.score.date_diff.abs().cmp(&b.score.date_diff.abs()))
        .then(a.ledger.id.cmp(&b.ledger.id))
}

// =============================================================================
// Matcher
// =============================================================================

struct Evaluation {
    anchor: AdSpendRecord,
    had_candidates: bool,
    ranked: Vec<ScoredCandidate>,
}

struct Proposal {
    anchor_index: usize,
    candidate_index: usize,
}

/// Resolves open ad-spend reports against ledger transactions.
#[derive(Debug, Clone)]
pub struct Matcher {
    candidates: CandidateGenerator,
    scorer: Scorer,
    auto_match_threshold: Decimal,
    review_threshold: Decimal,
    max_claim_retries: u32,
}

impl Matcher {
    #[must_use]
    pub fn from_config(config: &MatchingConfig) -> Self {
        Self {
            candidates: CandidateGenerator::from_config(config),
            scorer: Scorer::from_config(config),
            auto_match_threshold: config.auto_match_threshold,
            review_threshold: config.review_threshold,
            max_claim_retries: config.max_claim_retries,
        }
    }

    #[must_use]
    pub fn candidates(&self) -> &CandidateGenerator {
        &self.candidates
    }

    #[must_use]
    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    /// Scores and ranks the candidates of `anchor`.
    async fn evaluate(
        &self,
        store: &dyn RecordStore,
        anchor: &AdSpendRecord,
        exclude: &HashSet<RecordId>,
    ) -> Result<(bool, Vec<ScoredCandidate>)> {
        let found = self.candidates.ledgers_for(store, anchor, exclude).await?;
        let had_candidates = !found.is_empty();
        let mut ranked: Vec<ScoredCandidate> = found
            .into_iter()
            .map(|ledger| ScoredCandidate {
                score: self.scorer.score(anchor, &ledger),
                ledger,
            })
            .collect();
        ranked.sort_by(rank_candidates);
        Ok((had_candidates, ranked))
    }

    /// Picks the outcome of an anchor from its ranked candidates, claiming the
    /// winner on the board when it clears the auto-match threshold.
    fn decide(
        &self,
        anchor: &AdSpendRecord,
        had_candidates: bool,
        ranked: &[ScoredCandidate],
        board: &mut ClaimBoard,
    ) -> Outcome {
        if !had_candidates {
            return Outcome::NoCandidate;
        }
        let held = board.held_by_others(anchor.id);
        let Some(best) = ranked.iter().find(|c| !held.contains(&c.ledger.id)) else {
            return Outcome::CandidatesClaimed;
        };
        let score = best.score.match_score;

        if score >= self.auto_match_threshold && board.try_claim(best.ledger.id, anchor.id) {
            Outcome::AutoMatch(best.clone())
        } else if score >= self.review_threshold {
            Outcome::NeedReview(best.clone())
        } else {
            Outcome::LeaveUnmatched { best_score: score }
        }
    }

    /// Runs one pass over `anchors`.
    ///
    /// Anchors are processed oldest first. Matched anchors are ignored.
    pub async fn run_pass(
        &self,
        store: &dyn RecordStore,
        mut anchors: Vec<AdSpendRecord>,
        now: DateTime<Utc>,
    ) -> PassReport {
        let mut report = PassReport::default();
        anchors.retain(|a| a.status.is_open());
        anchors.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut evaluations = Vec::with_capacity(anchors.len());
        for anchor in anchors {
            report.processed += 1;
            match self.evaluate(store, &anchor, &HashSet::new()).await {
                Ok((had_candidates, ranked)) => evaluations.push(Evaluation {
                    anchor,
                    had_candidates,
                    ranked,
                }),
                Err(e) => {
                    warn!(ad_spend_id = anchor.id, error = %e, "Candidate generation failed, skipping");
                    report.failed += 1;
                }
            }
        }

        let mut board = ClaimBoard::new();
        self.grant_claims(&evaluations, &mut board);

        for evaluation in evaluations {
            self.settle(store, evaluation, &mut board, now, &mut report)
                .await;
        }

        info!(
            processed = report.processed,
            matched = report.matched,
            need_review = report.need_review,
            unchanged = report.unchanged,
            left_unmatched = report.left_unmatched,
            failed = report.failed,
            conflicts = report.conflicts,
            "Matching pass complete"
        );
        report
    }

    /// Grants auto-match claims greedily in global rank order.
    fn grant_claims(&self, evaluations: &[Evaluation], board: &mut ClaimBoard) {
        let mut proposals: Vec<Proposal> = evaluations
            .iter()
            .enumerate()
            .flat_map(|(anchor_index, e)| {
                e.ranked
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.score.match_score >= self.auto_match_threshold)
                    .map(move |(candidate_index, _)| Proposal {
                        anchor_index,
                        candidate_index,
                    })
            })
            .collect();

        proposals.sort_by(|x, y| {
            let (ax, cx) = (
                &evaluations[x.anchor_index].anchor,
                &evaluations[x.anchor_index].ranked[x.candidate_index],
            );
            let (ay, cy) = (
                &evaluations[y.anchor_index].anchor,
                &evaluations[y.anchor_index].ranked[y.candidate_index],
            );
            cy.score
                .match_score
                .cmp(&cx.score.match_score)
                .then(cx.score.amount_diff.abs().cmp(&cy.score.amount_diff.abs()))
                .then(cx.score.date_diff.abs().cmp(&cy.score.date_diff.abs()))
                .then(ax.created_at.cmp(&ay.created_at))
                .then(ax.id.cmp(&ay.id))
                .then(cx.ledger.id.cmp(&cy.ledger.id))
        });

        let mut satisfied = HashSet::new();
        for proposal in proposals {
            let evaluation = &evaluations[proposal.anchor_index];
            let anchor = evaluation.anchor.id;
            if satisfied.contains(&anchor) {
                continue;
            }
            let ledger = evaluation.ranked[proposal.candidate_index].ledger.id;
            if board.state(ledger).is_none() && board.try_claim(ledger, anchor) {
                satisfied.insert(anchor);
                debug!(ad_spend_id = anchor, ledger_id = ledger, "Claim granted");
            }
        }
    }

    /// Decides and writes the outcome of one anchor, retrying lost swaps.
    async fn settle(
        &self,
        store: &dyn RecordStore,
        evaluation: Evaluation,
        board: &mut ClaimBoard,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) {
        let Evaluation {
            mut anchor,
            mut had_candidates,
            mut ranked,
        } = evaluation;
        let mut attempts = 0;

        loop {
            // The ranked list is capped, so ledgers held elsewhere may hide
            // free candidates past the cap.
            if board.claim_of(anchor.id).is_none() {
                let held = board.held_by_others(anchor.id);
                if ranked.iter().any(|c| held.contains(&c.ledger.id)) {
                    match self.evaluate(store, &anchor, &held).await {
                        Ok((had, fresh_ranked)) => {
                            had_candidates = had_candidates || had;
                            ranked = fresh_ranked;
                        }
                        Err(e) => {
                            warn!(ad_spend_id = anchor.id, error = %e, "Candidate generation failed, skipping");
                            report.failed += 1;
                            return;
                        }
                    }
                }
            }

            let outcome = match board.claim_of(anchor.id) {
                Some(ledger) => ranked
                    .iter()
                    .find(|c| c.ledger.id == ledger)
                    .cloned()
                    .map_or_else(
                        || self.decide(&anchor, had_candidates, &ranked, board),
                        Outcome::AutoMatch,
                    ),
                None => self.decide(&anchor, had_candidates, &ranked, board),
            };

            match self.write(store, &anchor, &outcome, now).await {
                Ok(Written::Matched) => {
                    if let Outcome::AutoMatch(c) = &outcome {
                        board.commit(c.ledger.id);
                    }
                    report.matched += 1;
                    return;
                }
                Ok(Written::NeedReview) => {
                    report.need_review += 1;
                    return;
                }
                Ok(Written::Unchanged) => {
                    report.unchanged += 1;
                    return;
                }
                Ok(Written::Nothing) => {
                    report.left_unmatched += 1;
                    return;
                }
                Err(e) if e.is_retryable() && attempts < self.max_claim_retries => {
                    attempts += 1;
                    report.conflicts += 1;
                    if let Outcome::AutoMatch(c) = &outcome {
                        board.release(c.ledger.id);
                    }
                    debug!(ad_spend_id = anchor.id, attempt = attempts, error = %e, "Claim lost, retrying");

                    let refreshed = async {
                        let fresh = store.ad_spend(anchor.id).await?;
                        let exclude = board.held_by_others(anchor.id);
                        let (had, ranked) = self.evaluate(store, &fresh, &exclude).await?;
                        Ok::<_, ReconError>((fresh, had, ranked))
                    }
                    .await;
                    match refreshed {
                        Ok((fresh, _, _)) if !fresh.status.is_open() => {
                            report.unchanged += 1;
                            return;
                        }
                        Ok((fresh, had, fresh_ranked)) => {
                            anchor = fresh;
                            had_candidates = had_candidates || had;
                            ranked = fresh_ranked;
                        }
                        Err(e) => {
                            warn!(ad_spend_id = anchor.id, error = %e, "Refreshing anchor failed, skipping");
                            report.failed += 1;
                            return;
                        }
                    }
                }
                Err(e) => {
                    if let Outcome::AutoMatch(c) = &outcome {
                        board.release(c.ledger.id);
                    }
                    warn!(ad_spend_id = anchor.id, error = %e, "Matching failed, skipping");
                    report.failed += 1;
                    return;
                }
            }
        }
    }

    /// Writes an outcome unless the active reconciliation already holds it.
    async fn write(
        &self,
        store: &dyn RecordStore,
        anchor: &AdSpendRecord,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<Written> {
        let Some(draft) = outcome.draft(anchor) else {
            debug!(ad_spend_id = anchor.id, ?outcome, "Score below review threshold");
            return Ok(Written::Nothing);
        };
        if let Some(active) = store.active_reconciliation_for_ad_spend(anchor.id).await? {
            if same_outcome(&active, &draft) {
                return Ok(Written::Unchanged);
            }
        }

        let record = store.commit(&draft, now).await?;
        info!(
            reconciliation_id = record.id,
            ad_spend_id = anchor.id,
            ledger_id = ?record.ledger_id,
            match_score = ?record.match_score,
            status = %record.status,
            "Reconciliation written"
        );
        Ok(match record.status {
            ReconStatus::Matched => Written::Matched,
            _ => Written::NeedReview,
        })
    }
}

enum Written {
    Matched,
    NeedReview,
    Unchanged,
    Nothing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[test]
    fn test_claim_board_is_exclusive() {
        let mut board = ClaimBoard::new();
        assert!(board.try_claim(10, 1));
        assert!(board.try_claim(10, 1));
        assert!(!board.try_claim(10, 2));
        assert_eq!(board.claim_of(1), Some(10));
        assert_eq!(board.held_by_others(2), [10].into_iter().collect());
        assert!(board.held_by_others(1).is_empty());
    }

    #[test]
    fn test_release_only_drops_uncommitted_claims() {
        let mut board = ClaimBoard::new();
        board.try_claim(10, 1);
        board.release(10);
        assert!(board.state(10).is_none());

        board.try_claim(11, 1);
        board.commit(11);
        board.release(11);
        assert_eq!(board.state(11), Some(ClaimState::Committed { anchor: 1 }));
    }

    #[test]
    fn test_report_merge_and_success_rate() {
        let mut total = PassReport {
            processed: 3,
            matched: 1,
            ..PassReport::default()
        };
        total.merge(&PassReport {
            processed: 1,
            matched: 1,
            conflicts: 2,
            ..PassReport::default()
        });
        assert_eq!(total.processed, 4);
        assert_eq!(total.conflicts, 2);
        assert_eq!(total.success_rate(), dec!(0.5));
        assert_eq!(PassReport::default().success_rate(), Decimal::ZERO);
    }

    #[test]
    fn test_unpaired_draft_shapes() {
        let anchor = AdSpendRecord::from_new(
            4,
            spend_recon_core::NewAdSpend {
                spend_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
                project_id: 1,
                channel_id: 1,
                operator_id: 1,
                country: None,
                platform: "meta".to_string(),
                amount: dec!(100.00),
                memo: None,
            },
            Utc::now(),
        );
        let draft = Outcome::NoCandidate.draft(&anchor).unwrap();
        assert_eq!(draft.ledger, None);
        assert_eq!(draft.match_score, None);
        assert_eq!(draft.amount_diff, dec!(-100.00));
        assert_eq!(draft.status, ReconStatus::NeedReview);
        assert_eq!(draft.reason.as_deref(), Some(REASON_NO_CANDIDATE));
        assert!(Outcome::LeaveUnmatched { best_score: dec!(40) }
            .draft(&anchor)
            .is_none());

        let claimed = Outcome::CandidatesClaimed.draft(&anchor).unwrap();
        let active = ReconciliationRecord::from_draft(9, &claimed, Utc::now());
        assert!(same_outcome(&active, &draft));
        assert_eq!(draft.reason.as_deref(), Some(REASON_NO_CANDIDATE));
    }
}
