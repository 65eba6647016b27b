//! Currency normalization to USDT.
//!
//! Ledger transactions arrive in USD, INR, CNY and others; ad spend is always
//! reported in USDT. Amounts are converted before any difference is computed.

use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;

use crate::config::CurrencyConfig;
use crate::error::{ReconError, Result};

/// The settlement currency every comparison happens in.
pub const SETTLEMENT_CURRENCY: &str = "USDT";

/// Conversion rates expressed as units of a currency per 1 USDT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyTable {
    rates: BTreeMap<String, Decimal>,
}

impl CurrencyTable {
    /// Builds a table from configuration, upper-casing codes.
    ///
    /// # Errors
    /// Returns `ReconError::Configuration` if a rate is not positive or USDT is missing.
    pub fn from_config(config: &CurrencyConfig) -> Result<Self> {
        let mut rates = BTreeMap::new();
        for (code, rate) in &config.rates {
            if *rate <= Decimal::ZERO {
                return Err(ReconError::configuration(format!(
                    "currency rate for {code} must be positive, got {rate}"
                )));
            }
            rates.insert(normalize_code(code), *rate);
        }
        if !rates.contains_key(SETTLEMENT_CURRENCY) {
            return Err(ReconError::configuration(
                "currency rates must include USDT",
            ));
        }
        Ok(Self { rates })
    }

    /// Returns true if the currency can be normalized.
    #[must_use]
    pub fn supports(&self, code: &str) -> bool {
        self.rates.contains_key(&normalize_code(code))
    }

    /// Converts `amount` in `code` to USDT, rounded half-away-from-zero to cents.
    ///
    /// # Errors
    /// Returns `ReconError::Validation` for an unknown currency.
    pub fn to_usdt(&self, amount: Decimal, code: &str) -> Result<Decimal> {
        let code = normalize_code(code);
        let rate = self.rates.get(&code).ok_or_else(|| {
            ReconError::validation(format!("unsupported currency '{code}'"))
        })?;
        Ok((amount / rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }

    /// Configured codes, sorted.
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.rates.keys().map(String::as_str)
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
