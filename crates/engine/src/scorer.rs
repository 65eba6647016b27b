//! Match scoring.
//!
//! The scorer is a pure function over two records: no I/O, no clock, no
//! shared state. It is safe to call from any number of tasks at once.

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use spend_recon_core::{Matchable, MatchingConfig};

/// The outcome of scoring one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreBreakdown {
    /// Weighted score in `[0, 100]`, two decimal places.
    pub match_score: Decimal,
    /// `b.amount - a.amount`, USDT.
    pub amount_diff: Decimal,
    /// `b.date - a.date`, days.
    pub date_diff: i64,
    /// In `[0, 1]`.
    pub amount_similarity: Decimal,
    /// In `[0, 1]`.
    pub date_similarity: Decimal,
    /// 0 or 1.
    pub project_bonus: Decimal,
}

/// Weights and normalizers of the match score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scorer {
    w_amount: Decimal,
    w_date: Decimal,
    w_project: Decimal,
    max_date_window_days: i64,
    amount_epsilon: Decimal,
}

impl Default for Scorer {
    fn default() -> Self {
        Self::from_config(&MatchingConfig::default())
    }
}

impl Scorer {
    #[must_use]
    pub fn from_config(config: &MatchingConfig) -> Self {
        Self {
            w_amount: config.w_amount,
            w_date: config.w_date,
            w_project: config.w_project,
            max_date_window_days: config.max_date_window_days.max(1),
            amount_epsilon: config.amount_epsilon,
        }
    }

    /// Scores `b` as a counterpart of `a`.
    ///
    /// Pass the ad-spend report as `a` and the ledger transaction as `b` so
    /// that the diffs read "ledger minus ad-spend".
    #[must_use]
    pub fn score(&self, a: &dyn Matchable, b: &dyn Matchable) -> ScoreBreakdown {
        self.score_parts(
            (a.match_amount(), a.match_date(), a.match_project()),
            (b.match_amount(), b.match_date(), b.match_project()),
        )
    }

    /// Scores raw `(amount, date, project)` triples.
    #[must_use]
    pub fn score_parts(
        &self,
        a: (Decimal, NaiveDate, Option<i64>),
        b: (Decimal, NaiveDate, Option<i64>),
    ) -> ScoreBreakdown {
        let (a_amount, a_date, a_project) = a;
        let (b_amount, b_date, b_project) = b;

        let amount_diff = b_amount - a_amount;
        let date_diff = (b_date - a_date).num_days();

        let reference = a_amount.abs().max(b_amount.abs()).max(self.amount_epsilon);
        let amount_similarity = unit(Decimal::ONE - amount_diff.abs() / reference);

        let window = Decimal::from(self.max_date_window_days);
        let date_similarity = unit(Decimal::ONE - Decimal::from(date_diff.abs()) / window);

        let project_bonus = match (a_project, b_project) {
            (Some(x), Some(y)) if x == y => Decimal::ONE,
            _ => Decimal::ZERO,
        };

        let weighted = self.w_amount * amount_similarity
            + self.w_date * date_similarity
            + self.w_project * project_bonus;
        let match_score = (Decimal::ONE_HUNDRED * weighted)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
            .clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);

        ScoreBreakdown {
            match_score,
            amount_diff,
            date_diff,
            amount_similarity,
            date_similarity,
            project_bonus,
        }
    }
}

fn unit(value: Decimal) -> Decimal {
    value.clamp(Decimal::ZERO, Decimal::ONE)
}
