//! Server-side authorization.
//!
//! Route guards in the admin console are cosmetic; every mutating operation is
//! checked here against the caller's role before it touches the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ReconError, Result};

/// Staff roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Pitcher reporting daily ad spend.
    Operator,
    /// Finance staff recording ledger transactions.
    Finance,
    /// Full access.
    Manager,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Finance => "finance",
            Self::Manager => "manager",
        }
    }

    /// Returns true if the role carries `permission`.
    #[must_use]
    pub fn allows(self, permission: Permission) -> bool {
        match permission {
            Permission::ViewRecords => true,
            Permission::SubmitAdSpend => matches!(self, Self::Operator | Self::Manager),
            Permission::RecordLedger
            | Permission::ConfirmReconciliation
            | Permission::RunReconciliation => matches!(self, Self::Finance | Self::Manager),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "operator" => Ok(Self::Operator),
            "finance" => Ok(Self::Finance),
            "manager" => Ok(Self::Manager),
            other => Err(ReconError::validation(format!("unknown role '{other}'"))),
        }
    }
}

/// Operations subject to authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ViewRecords,
    SubmitAdSpend,
    RecordLedger,
    ConfirmReconciliation,
    RunReconciliation,
}

impl Permission {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewRecords => "view_records",
            Self::SubmitAdSpend => "submit_ad_spend",
            Self::RecordLedger => "record_ledger",
            Self::ConfirmReconciliation => "confirm_reconciliation",
            Self::RunReconciliation => "run_reconciliation",
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
    /// Set for operator accounts bound to a single pitcher.
    pub operator_id: Option<i64>,
}

impl Principal {
    #[must_use]
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            operator_id: None,
        }
    }

    #[must_use]
    pub fn with_operator(mut self, operator_id: i64) -> Self {
        self.operator_id = Some(operator_id);
        self
    }

    /// The identity background jobs act as.
    #[must_use]
    pub fn system() -> Self {
        Self::new("system", Role::Manager)
    }

    /// Fails unless the principal's role grants `permission`.
    ///
    /// # Errors
    /// Returns `ReconError::Forbidden`.
    pub fn require(&self, permission: Permission) -> Result<()> {
        if self.role.allows(permission) {
            Ok(())
        } else {
            tracing::warn!(
                user_id = %self.user_id,
                role = %self.role,
                permission = permission.as_str(),
                "Access denied"
            );
            Err(ReconError::Forbidden(format!(
                "role {} may not {}",
                self.role,
                permission.as_str()
            )))
        }
    }

    /// Fails unless an operator principal is bound to `operator_id`.
    ///
    /// # Errors
    /// Returns `ReconError::Forbidden`.
    pub fn require_operator(&self, operator_id: i64) -> Result<()> {
        match (self.role, self.operator_id) {
            (Role::Operator, None) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    requested_operator = operator_id,
                    "Operator without a bound operator_id attempted to report"
                );
                Err(ReconError::Forbidden(format!(
                    "user {} is not bound to an operator",
                    self.user_id
                )))
            }
            (Role::Operator, Some(own)) if own != operator_id => {
                tracing::warn!(
                    user_id = %self.user_id,
                    own_operator = own,
                    requested_operator = operator_id,
                    "Operator attempted to report for another operator"
                );
                Err(ReconError::Forbidden(format!(
                    "operator {own} may not report for operator {operator_id}"
                )))
            }
            _ => Ok(()),
        }
    }
}
