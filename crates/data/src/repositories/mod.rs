//! SQLite repositories, one per table.

pub mod ad_spend_repo;
pub mod ledger_repo;
pub mod reconciliation_repo;

pub use ad_spend_repo::AdSpendRepository;
pub use ledger_repo::LedgerRepository;
pub use reconciliation_repo::ReconciliationRepository;

use sqlx::SqlitePool;

/// All repositories over a single pool.
#[derive(Debug, Clone)]
pub struct Repositories {
    pub ad_spend: AdSpendRepository,
    pub ledger: LedgerRepository,
    pub reconciliation: ReconciliationRepository,
}

impl Repositories {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            ad_spend: AdSpendRepository::new(pool.clone()),
            ledger: LedgerRepository::new(pool.clone()),
            reconciliation: ReconciliationRepository::new(pool),
        }
    }
}
