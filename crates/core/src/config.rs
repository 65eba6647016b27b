use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::authz::Role;
use crate::currency::CurrencyTable;
use crate::error::{ReconError, Result};

const WEIGHT_SUM_TOLERANCE: Decimal = dec!(0.0001);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub matching: MatchingConfig,
    pub currency: CurrencyConfig,
    pub sweep: SweepConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `memory` or a `sqlite:` connection URL.
    pub url: String,
    pub max_connections: u32,
}

/// Candidate windows, scoring weights and thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Largest |date_diff| a candidate may have.
    pub max_date_window_days: i64,
    /// Absolute amount tolerance in USDT.
    pub max_amount_tolerance: Decimal,
    /// Relative amount tolerance (0.02 = 2%).
    pub max_relative_tolerance: Decimal,
    /// Upper bound on candidates scored per record.
    pub max_candidates: usize,
    pub w_amount: Decimal,
    pub w_date: Decimal,
    pub w_project: Decimal,
    /// Scores at or above this are matched automatically.
    pub auto_match_threshold: Decimal,
    /// Scores at or above this (and below auto-match) go to review.
    pub review_threshold: Decimal,
    /// Floor for the reference amount in the amount similarity.
    pub amount_epsilon: Decimal,
    /// Records loaded per sweep page.
    pub batch_size: u32,
    /// Times an anchor re-runs selection after losing a claim.
    pub max_claim_retries: u32,
}

/// Units of each currency per 1 USDT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrencyConfig {
    pub rates: BTreeMap<String, Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub enabled: bool,
    /// Six-field cron expression (seconds first).
    pub cron_schedule: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<ApiToken>,
}

/// A bearer token and the principal it authenticates.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub token: String,
    pub user_id: String,
    pub role: Role,
    /// Binds an operator token to the operator it may report for.
    #[serde(default)]
    pub operator_id: Option<i64>,
}

impl fmt::Debug for ApiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiToken")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("operator_id", &self.operator_id)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/recon.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_date_window_days: 5,
            max_amount_tolerance: dec!(10),
            max_relative_tolerance: dec!(0.02),
            max_candidates: 20,
            w_amount: dec!(0.6),
            w_date: dec!(0.3),
            w_project: dec!(0.1),
            auto_match_threshold: dec!(90),
            review_threshold: dec!(60),
            amount_epsilon: dec!(0.01),
            batch_size: 200,
            max_claim_retries: 3,
        }
    }
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        let rates = [
            ("USDT", dec!(1)),
            ("USD", dec!(1)),
            ("CNY", dec!(7)),
            ("INR", dec!(83)),
        ]
        .into_iter()
        .map(|(code, rate)| (code.to_string(), rate))
        .collect();
        Self { rates }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron_schedule: "0 */15 * * * *".to_string(),
        }
    }
}

impl MatchingConfig {
    /// Checks weights, thresholds and bounds.
    ///
    /// # Errors
    /// Returns `ReconError::Configuration` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        for (name, weight) in [
            ("w_amount", self.w_amount),
            ("w_date", self.w_date),
            ("w_project", self.w_project),
        ] {
            if weight < Decimal::ZERO || weight > Decimal::ONE {
                return Err(ReconError::configuration(format!(
                    "{name} must be within [0, 1], got {weight}"
                )));
            }
        }
        let sum = self.w_amount + self.w_date + self.w_project;
        if (sum - Decimal::ONE).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ReconError::configuration(format!(
                "scoring weights must sum to 1, got {sum}"
            )));
        }

        let hundred = Decimal::ONE_HUNDRED;
        for (name, threshold) in [
            ("auto_match_threshold", self.auto_match_threshold),
            ("review_threshold", self.review_threshold),
        ] {
            if threshold < Decimal::ZERO || threshold > hundred {
                return Err(ReconError::configuration(format!(
                    "{name} must be within [0, 100], got {threshold}"
                )));
            }
        }
        if self.review_threshold > self.auto_match_threshold {
            return Err(ReconError::configuration(format!(
                "review_threshold ({}) must not exceed auto_match_threshold ({})",
                self.review_threshold, self.auto_match_threshold
            )));
        }

        if self.max_date_window_days < 1 {
            return Err(ReconError::configuration(
                "max_date_window_days must be at least 1",
            ));
        }
        if self.max_candidates < 1 {
            return Err(ReconError::configuration("max_candidates must be at least 1"));
        }
        if self.max_amount_tolerance < Decimal::ZERO || self.max_relative_tolerance < Decimal::ZERO
        {
            return Err(ReconError::configuration("amount tolerances must not be negative"));
        }
        if self.amount_epsilon <= Decimal::ZERO {
            return Err(ReconError::configuration("amount_epsilon must be positive"));
        }
        if self.batch_size < 1 {
            return Err(ReconError::configuration("batch_size must be at least 1"));
        }
        Ok(())
    }
}

impl AuthConfig {
    /// Rejects empty or duplicated tokens and operator tokens with no operator.
    ///
    /// # Errors
    /// Returns `ReconError::Configuration` naming the offending user.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for token in &self.tokens {
            if token.token.trim().is_empty() {
                return Err(ReconError::configuration(format!(
                    "empty token for user {}",
                    token.user_id
                )));
            }
            if !seen.insert(token.token.as_str()) {
                return Err(ReconError::configuration(format!(
                    "duplicate token for user {}",
                    token.user_id
                )));
            }
            if token.role == Role::Operator && token.operator_id.is_none() {
                return Err(ReconError::configuration(format!(
                    "operator token for user {} needs an operator_id",
                    token.user_id
                )));
            }
        }
        Ok(())
    }
}

impl AppConfig {
    /// Validates every section. Startup must abort on error.
    ///
    /// # Errors
    /// Returns `ReconError::Configuration` for the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.matching.validate()?;
        CurrencyTable::from_config(&self.currency)?;
        self.auth.validate()?;
        if self.database.url.trim().is_empty() {
            return Err(ReconError::configuration("database.url is required"));
        }
        if self.database.max_connections < 1 {
            return Err(ReconError::configuration(
                "database.max_connections must be at least 1",
            ));
        }
        if self.sweep.enabled && self.sweep.cron_schedule.trim().is_empty() {
            return Err(ReconError::configuration(
                "sweep.cron_schedule is required when the sweep is enabled",
            ));
        }
        Ok(())
    }
}
